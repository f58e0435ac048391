// contrametrics/src/store/mod.rs
//
// Event store — append-only record of every accepted DetectionEvent.
//
// Design:
//   - Events keyed by (timestamp, arrival seq) in a BTreeMap so streaming is
//     timestamp-ordered even when events arrive out of order
//   - Id registry (DashSet) reserves an id before the durable write so two
//     concurrent appends of the same id cannot both land
//   - Optional JSONL journal; append returns only after the line is fsync'd
//
// Nothing is ever removed. Retention is a bucket-level policy (state::index).

pub mod journal;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashSet;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::error::IngestError;
use crate::events::DetectionEvent;
use journal::Journal;

type EventKey = (DateTime<Utc>, u64);

pub struct EventStore {
    events:  RwLock<BTreeMap<EventKey, DetectionEvent>>,
    ids:     DashSet<String>,
    seq:     AtomicU64,
    journal: Option<Journal>,
}

impl EventStore {
    pub fn in_memory() -> Self {
        Self {
            events:  RwLock::new(BTreeMap::new()),
            ids:     DashSet::new(),
            seq:     AtomicU64::new(0),
            journal: None,
        }
    }

    /// Open a journal-backed store, loading every event already on disk.
    pub async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let (journal, existing) = Journal::open(path).await?;
        let mut store = Self::in_memory();
        for ev in existing {
            if !store.insert_loaded(ev) {
                debug!("Journal replay skipped a repeated id");
            }
        }
        store.journal = Some(journal);
        Ok(store)
    }

    fn insert_loaded(&mut self, event: DetectionEvent) -> bool {
        if !self.ids.insert(event.id.clone()) {
            return false;
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.events.get_mut().insert((event.timestamp, seq), event);
        true
    }

    /// Validate, durably record, then make the event visible to streams.
    pub async fn append(&self, event: DetectionEvent) -> Result<(), IngestError> {
        event.validate()?;

        if !self.ids.insert(event.id.clone()) {
            return Err(IngestError::DuplicateEvent(event.id));
        }

        if let Some(ref j) = self.journal {
            if let Err(e) = j.append(&event).await {
                // Release the id so the caller may retry the same event.
                self.ids.remove(&event.id);
                warn!("Journal append failed for {}: {}", event.id, e);
                return Err(IngestError::Journal(e));
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.events.write().insert((event.timestamp, seq), event);
        Ok(())
    }

    /// Lazy, timestamp-ordered cursor over events at or after `since`.
    /// Each call starts a fresh cursor; events appended behind the cursor's
    /// position are not revisited.
    pub fn stream_since(&self, since: DateTime<Utc>) -> EventCursor<'_> {
        EventCursor { store: self, from: Bound::Included((since, 0)) }
    }

    pub fn contains(&self, id: &str) -> bool { self.ids.contains(id) }

    pub fn len(&self) -> usize { self.events.read().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn earliest(&self) -> Option<DateTime<Utc>> {
        self.events.read().keys().next().map(|(ts, _)| *ts)
    }

    pub fn is_durable(&self) -> bool { self.journal.is_some() }
}

// ── Cursor ────────────────────────────────────────────────────────────────────

/// Pulls one event per `next()` under a short read lock, so a long scan never
/// holds the store against concurrent appends.
pub struct EventCursor<'a> {
    store: &'a EventStore,
    from:  Bound<EventKey>,
}

impl Iterator for EventCursor<'_> {
    type Item = DetectionEvent;

    fn next(&mut self) -> Option<Self::Item> {
        let events = self.store.events.read();
        let (key, ev) = events.range((self.from, Bound::Unbounded)).next()?;
        self.from = Bound::Excluded(*key);
        Some(ev.clone())
    }
}
