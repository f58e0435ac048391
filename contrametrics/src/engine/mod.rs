// contrametrics/src/engine/mod.rs
//
// Result shapes and window resolution shared by the aggregation engine and
// the query facade. AggregateResult is the only thing that crosses the wire.

pub mod aggregate;
pub mod facade;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{DEFAULT_TOP_N, MAX_TOP_N, MIN_TOP_N};
use crate::error::QueryError;
use crate::state::Granularity;

pub use aggregate::AggregationEngine;
pub use facade::{Period, QueryFacade, QueryKind, QueryRequest};

// ── Window ────────────────────────────────────────────────────────────────────

/// A concrete `[start, end)` range plus the bucket granularity to read it at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowQuery {
    pub granularity: Granularity,
    pub start:       DateTime<Utc>,
    pub end:         DateTime<Utc>,
    pub top_n:       Option<TopN>,
}

impl WindowQuery {
    pub fn between(granularity: Granularity, start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { granularity, start, end, top_n: None }
    }

    pub fn with_top_n(mut self, top_n: TopN) -> Self {
        self.top_n = Some(top_n);
        self
    }

    /// The window of the same number of buckets ending where this one starts.
    pub fn previous(&self) -> WindowQuery {
        let g = self.granularity;
        let n = g.boundaries(self.start, self.end).len() as u32;
        let start = g.floor(self.start);
        WindowQuery { granularity: g, start: g.back(start, n), end: start, top_n: self.top_n }
    }
}

// ── topN ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopNBounds {
    pub min:     usize,
    pub max:     usize,
    pub default: usize,
}

impl Default for TopNBounds {
    fn default() -> Self {
        Self { min: MIN_TOP_N, max: MAX_TOP_N, default: DEFAULT_TOP_N }
    }
}

/// Leaderboard length, always within its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct TopN(usize);

impl TopN {
    /// Strict: out-of-range values are an error.
    pub fn new(n: i64, bounds: TopNBounds) -> Result<Self, QueryError> {
        if n < bounds.min as i64 || n > bounds.max as i64 {
            return Err(QueryError::InvalidTopN(n));
        }
        Ok(Self(n as usize))
    }

    /// Lenient: topN is a display hint, so out-of-range values are pulled to
    /// the nearest bound instead of failing the query.
    pub fn clamped(n: i64, bounds: TopNBounds) -> Self {
        Self(n.clamp(bounds.min as i64, bounds.max as i64) as usize)
    }

    pub fn get(self) -> usize { self.0 }
}

// ── Results ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendPoint {
    pub bucket_label:          String,
    pub count:                 u64,
    pub mean_accuracy_percent: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryShare {
    pub category:         String,
    pub percent_of_total: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRank {
    pub source: String,
    pub count:  u64,
}

/// Current window against the one before it. A field is None when the
/// previous window has nothing to compare against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodChange {
    pub users_percent:      Option<f64>,
    pub detections_percent: Option<f64>,
    /// Difference of the two windows' accuracy rates, in percentage points.
    pub accuracy_points:    Option<f64>,
    pub comments_percent:   Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveCounters {
    pub total_users:           u64,
    pub total_detections:      u64,
    pub accuracy_rate_percent: f64,
    pub comments_analyzed:     u64,
    /// Distinct users with an event in the current or previous hour.
    pub active_users:          u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_at:         Option<DateTime<Utc>>,
    #[serde(default)]
    pub change:                PeriodChange,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AggregateResult {
    TrendSeries          { entries: Vec<TrendPoint> },
    CategoryDistribution { entries: Vec<CategoryShare> },
    Leaderboard          { entries: Vec<SourceRank> },
    LiveCounters(LiveCounters),
}

impl AggregateResult {
    /// True when the result carries no events at all ("no data yet").
    pub fn is_empty(&self) -> bool {
        match self {
            Self::TrendSeries { entries }          => entries.iter().all(|p| p.count == 0),
            Self::CategoryDistribution { entries } => entries.is_empty(),
            Self::Leaderboard { entries }          => entries.is_empty(),
            Self::LiveCounters(c)                  => c.total_detections == 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_top_n_rejects_out_of_range() {
        let b = TopNBounds::default();
        assert_eq!(TopN::new(0, b), Err(QueryError::InvalidTopN(0)));
        assert_eq!(TopN::new(-3, b), Err(QueryError::InvalidTopN(-3)));
        assert_eq!(TopN::new(1_000, b), Err(QueryError::InvalidTopN(1_000)));
        assert_eq!(TopN::new(5, b).map(TopN::get), Ok(5));
    }

    #[test]
    fn lenient_top_n_clamps() {
        let b = TopNBounds::default();
        assert_eq!(TopN::clamped(0, b).get(), MIN_TOP_N);
        assert_eq!(TopN::clamped(i64::MAX, b).get(), MAX_TOP_N);
        assert_eq!(TopN::clamped(7, b).get(), 7);
    }

    #[test]
    fn result_serialises_with_stable_field_names() {
        let r = AggregateResult::TrendSeries {
            entries: vec![TrendPoint { bucket_label: "2024-01".into(), count: 0, mean_accuracy_percent: None }],
        };
        let v = serde_json::to_value(&r).unwrap();
        assert_eq!(v["type"], "trendSeries");
        assert_eq!(v["entries"][0]["bucketLabel"], "2024-01");
        assert!(v["entries"][0]["meanAccuracyPercent"].is_null());

        let live = AggregateResult::LiveCounters(LiveCounters {
            total_users: 1, total_detections: 2, accuracy_rate_percent: 87.3, comments_analyzed: 3,
            active_users: 1, last_event_at: None,
            change: PeriodChange { detections_percent: Some(23.0), ..Default::default() },
        });
        let v = serde_json::to_value(&live).unwrap();
        assert_eq!(v["type"], "liveCounters");
        assert_eq!(v["totalUsers"], 1);
        assert_eq!(v["accuracyRatePercent"], 87.3);
        assert_eq!(v["commentsAnalyzed"], 3);
        assert_eq!(v["activeUsers"], 1);
        assert!(v.get("lastEventAt").is_none());
        assert_eq!(v["change"]["detectionsPercent"], 23.0);
        assert!(v["change"]["usersPercent"].is_null());
    }

    #[test]
    fn previous_window_has_the_same_length() {
        use chrono::TimeZone;
        let at = |y, m, d| Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap();

        let week = WindowQuery::between(Granularity::Day, at(2024, 6, 9), at(2024, 6, 16));
        let prev = week.previous();
        assert_eq!((prev.start, prev.end), (at(2024, 6, 2), at(2024, 6, 9)));

        let year = WindowQuery::between(Granularity::Month, at(2023, 7, 1), at(2024, 7, 1));
        let prev = year.previous();
        assert_eq!((prev.start, prev.end), (at(2022, 7, 1), at(2023, 7, 1)));
    }
}
