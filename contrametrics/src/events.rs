// contrametrics/src/events.rs
//
// Shared domain types flowing through contrametrics.
//
//   EventSubmission  — raw payload from the detection pipeline (may be malformed)
//   DetectionEvent   — validated, immutable fact owned by the EventStore
//   Category         — open tagged set; unknown labels survive as Custom(..)
//
// Wire field names are camelCase to match the dashboard contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IngestError;

// ── Category ──────────────────────────────────────────────────────────────────

/// Contradiction category. Aggregation treats this as an opaque key, so new
/// labels flow through as `Custom` without touching any counting code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Category {
    Political,
    PersonalPreference,
    Factual,
    Opinion,
    Lifestyle,
    Relationship,
    Other,
    Custom(String),
}

impl Category {
    pub fn label(&self) -> &str {
        match self {
            Self::Political          => "Political",
            Self::PersonalPreference => "Personal Preference",
            Self::Factual            => "Factual",
            Self::Opinion            => "Opinion",
            Self::Lifestyle          => "Lifestyle",
            Self::Relationship       => "Relationship",
            Self::Other              => "Other",
            Self::Custom(s)          => s,
        }
    }
}

impl From<&str> for Category {
    fn from(raw: &str) -> Self {
        let trimmed = raw.trim();
        // "Personal Preference", "personal_preference" and "PersonalPreference" are one tag
        let key: String = trimmed
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect();
        match key.as_str() {
            "political"          => Self::Political,
            "personalpreference" => Self::PersonalPreference,
            "factual"            => Self::Factual,
            "opinion"            => Self::Opinion,
            "lifestyle"          => Self::Lifestyle,
            "relationship"       => Self::Relationship,
            "" | "other"         => Self::Other,
            _                    => Self::Custom(trimmed.to_string()),
        }
    }
}

impl From<String> for Category {
    fn from(raw: String) -> Self { Self::from(raw.as_str()) }
}

impl From<Category> for String {
    fn from(c: Category) -> Self { c.label().to_string() }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Detection event ───────────────────────────────────────────────────────────

/// One recorded detection. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    pub id:               String,
    pub timestamp:        DateTime<Utc>,
    pub category:         Category,
    pub source:           String,
    pub accuracy_score:   f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id:          Option<String>,
    #[serde(default = "one")]
    pub comments_scanned: u32,
}

fn one() -> u32 { 1 }

impl DetectionEvent {
    pub fn new(
        id:       impl Into<String>,
        ts:       DateTime<Utc>,
        category: Category,
        source:   impl Into<String>,
        accuracy: f64,
    ) -> Self {
        Self {
            id:               id.into(),
            timestamp:        ts,
            category,
            source:           source.into(),
            accuracy_score:   accuracy,
            user_id:          None,
            comments_scanned: 1,
        }
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user_id = Some(user.into());
        self
    }

    pub fn with_comments_scanned(mut self, n: u32) -> Self {
        self.comments_scanned = n;
        self
    }

    /// Re-check the invariants a stored event must satisfy.
    /// Used for events that arrive already typed (journal replay, library callers).
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.id.trim().is_empty() {
            return Err(IngestError::InvalidEvent("empty id".into()));
        }
        check_accuracy(self.accuracy_score)?;
        if self.source.trim().is_empty() {
            return Err(IngestError::InvalidEvent("empty source".into()));
        }
        Ok(())
    }
}

fn check_accuracy(score: f64) -> Result<(), IngestError> {
    if !score.is_finite() || !(0.0..=1.0).contains(&score) {
        return Err(IngestError::InvalidEvent(format!(
            "accuracyScore {} outside [0,1]", score
        )));
    }
    Ok(())
}

// ── Ingestion payload ─────────────────────────────────────────────────────────

/// Untrusted append payload. Every field the pipeline might forget is optional
/// here so the boundary can report *what* is wrong instead of a serde error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSubmission {
    pub id:               Option<String>,
    pub timestamp:        Option<DateTime<Utc>>,
    pub category:         Option<Category>,
    pub source:           Option<String>,
    pub accuracy_score:   Option<f64>,
    pub user_id:          Option<String>,
    pub comments_scanned: Option<u32>,
}

impl EventSubmission {
    /// Validate and freeze into a `DetectionEvent`. Nothing is clamped.
    pub fn into_event(self) -> Result<DetectionEvent, IngestError> {
        let timestamp = self.timestamp
            .ok_or_else(|| IngestError::InvalidEvent("timestamp is unset".into()))?;
        let accuracy = self.accuracy_score
            .ok_or_else(|| IngestError::InvalidEvent("accuracyScore is unset".into()))?;
        check_accuracy(accuracy)?;

        let source = self.source.map(|s| s.trim().to_string()).unwrap_or_default();
        if source.is_empty() {
            return Err(IngestError::InvalidEvent("source is unset".into()));
        }
        let category = self.category.unwrap_or(Category::Other);
        let user_id  = self.user_id.filter(|u| !u.trim().is_empty());

        let id = match self.id.filter(|i| !i.trim().is_empty()) {
            Some(id) => id,
            None     => derive_id(timestamp, &category, &source, accuracy, user_id.as_deref()),
        };

        Ok(DetectionEvent {
            id,
            timestamp,
            category,
            source,
            accuracy_score:   accuracy,
            user_id,
            comments_scanned: self.comments_scanned.unwrap_or(1),
        })
    }
}

impl From<DetectionEvent> for EventSubmission {
    fn from(e: DetectionEvent) -> Self {
        Self {
            id:               Some(e.id),
            timestamp:        Some(e.timestamp),
            category:         Some(e.category),
            source:           Some(e.source),
            accuracy_score:   Some(e.accuracy_score),
            user_id:          e.user_id,
            comments_scanned: Some(e.comments_scanned),
        }
    }
}

/// Stable content id for payloads that arrive without one: SHA256[:8] over
/// the canonical field rendering, hex encoded.
pub fn derive_id(
    ts:       DateTime<Utc>,
    category: &Category,
    source:   &str,
    accuracy: f64,
    user:     Option<&str>,
) -> String {
    use sha2::{Digest, Sha256};
    let canonical = format!(
        "{}|{}|{}|{:.6}|{}",
        ts.timestamp_nanos_opt().unwrap_or_else(|| ts.timestamp_micros()),
        category.label(),
        source,
        accuracy,
        user.unwrap_or(""),
    );
    let mut h = Sha256::new();
    h.update(canonical.as_bytes());
    hex::encode(&h.finalize()[..8])
}
