// contrametrics/src/analytics.rs
//
// Analytics — wires event store, bucket index and query facade together.
//
// Data flow:
//   submission → validate → EventStore (durable) → BucketIndex::apply → visible to queries
//
// append() resolves only after both steps, so a caller that awaits it is
// guaranteed the event shows up in the next query.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::engine::{AggregateResult, Period, QueryFacade, QueryKind, QueryRequest, TopNBounds};
use crate::error::{IngestError, QueryError};
use crate::events::{DetectionEvent, EventSubmission};
use crate::state::{BucketIndex, CompactionReport, Granularity};
use crate::store::EventStore;

pub struct Analytics {
    pub store:  Arc<EventStore>,
    pub index:  Arc<BucketIndex>,
    facade:     QueryFacade,
    config:     EngineConfig,
}

impl Analytics {
    /// Open the configured store and rebuild the index from every stored event.
    pub async fn open(config: EngineConfig) -> std::io::Result<Self> {
        let store = match config.journal_path {
            Some(ref path) => EventStore::open(path).await?,
            None           => EventStore::in_memory(),
        };
        let analytics = Self::with_store(store, config);
        analytics.rebuild_index();
        Ok(analytics)
    }

    pub fn in_memory(config: EngineConfig) -> Self {
        Self::with_store(EventStore::in_memory(), config)
    }

    fn with_store(store: EventStore, config: EngineConfig) -> Self {
        let index  = Arc::new(BucketIndex::new());
        let bounds = TopNBounds {
            min:     config.min_top_n,
            max:     config.max_top_n,
            default: config.default_top_n,
        };
        Self {
            store:  Arc::new(store),
            facade: QueryFacade::new(Arc::clone(&index), bounds),
            index,
            config,
        }
    }

    fn rebuild_index(&self) {
        let Some(earliest) = self.store.earliest() else { return };
        let mut n = 0u64;
        for ev in self.store.stream_since(earliest) {
            self.index.apply(&ev);
            n += 1;
        }
        info!(
            events = n,
            days   = self.index.bucket_count(Granularity::Day),
            "Bucket index rebuilt from store"
        );
    }

    // ── Ingestion ─────────────────────────────────────────────────────────────

    pub async fn append(&self, event: DetectionEvent) -> Result<(), IngestError> {
        let id = event.id.clone();
        match self.store.append(event.clone()).await {
            Ok(()) => {
                self.index.apply(&event);
                debug!("Accepted {} ({} / {})", id, event.category, event.source);
                Ok(())
            }
            Err(e) => {
                warn!("Rejected {}: {}", id, e);
                Err(e)
            }
        }
    }

    /// Validate a raw payload, then append it.
    pub async fn submit(&self, submission: EventSubmission) -> Result<DetectionEvent, IngestError> {
        let event = submission.into_event().map_err(|e| {
            warn!("Rejected submission: {}", e);
            e
        })?;
        self.append(event.clone()).await?;
        Ok(event)
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub fn query(&self, req: &QueryRequest) -> Result<AggregateResult, QueryError> {
        self.facade.execute(req)
    }

    pub fn query_at(&self, req: &QueryRequest, now: DateTime<Utc>) -> Result<AggregateResult, QueryError> {
        self.facade.execute_at(req, now)
    }

    pub fn dashboard_at(&self, period: Period, now: DateTime<Utc>) -> Vec<(QueryKind, AggregateResult)> {
        self.facade.dashboard_at(period, now)
    }

    // ── Housekeeping ──────────────────────────────────────────────────────────

    pub fn compact_at(&self, now: DateTime<Utc>) -> CompactionReport {
        self.index.compact(now, self.config.hour_retention_days)
    }

    pub async fn housekeeping_loop(self: Arc<Self>) {
        let interval = Duration::from_secs(self.config.compaction_interval_secs.max(1));
        loop {
            tokio::time::sleep(interval).await;
            self.compact_at(Utc::now());
            let t = self.index.totals();
            info!(
                events  = self.store.len(),
                hours   = self.index.bucket_count(Granularity::Hour),
                days    = self.index.bucket_count(Granularity::Day),
                users   = t.users,
                "Housekeeping pass complete"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Category;
    use chrono::TimeZone;

    fn ts(d: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 6, d, 10, 0, 0).unwrap() }

    #[tokio::test]
    async fn appended_event_is_visible_to_next_query() {
        let a = Analytics::in_memory(EngineConfig::default());
        a.append(DetectionEvent::new("x", ts(14), Category::Opinion, "food", 0.5)).await.unwrap();
        let r = a.query_at(&QueryRequest::new(Period::SevenDays, QueryKind::Leaderboard), ts(15)).unwrap();
        assert!(!r.is_empty());
    }

    #[tokio::test]
    async fn rejected_event_leaves_index_untouched() {
        let a = Analytics::in_memory(EngineConfig::default());
        a.append(DetectionEvent::new("x", ts(14), Category::Opinion, "food", 0.5)).await.unwrap();
        assert!(a.append(DetectionEvent::new("x", ts(14), Category::Opinion, "food", 0.5)).await.is_err());
        assert_eq!(a.index.totals().detections, 1);

        let bad = EventSubmission { source: Some("food".into()), accuracy_score: Some(0.3), ..Default::default() };
        assert!(matches!(a.submit(bad).await, Err(IngestError::InvalidEvent(_))));
        assert_eq!(a.index.totals().detections, 1);
    }

    #[tokio::test]
    async fn reopen_rebuilds_index_from_journal() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EngineConfig { journal_path: Some(dir.path().join("events.jsonl")), ..Default::default() };
        {
            let a = Analytics::open(cfg.clone()).await.unwrap();
            a.append(DetectionEvent::new("a", ts(3), Category::Factual, "politics", 0.7)).await.unwrap();
            a.append(DetectionEvent::new("b", ts(1), Category::Factual, "politics", 0.9)).await.unwrap();
        }
        let a = Analytics::open(cfg).await.unwrap();
        assert_eq!(a.index.totals().detections, 2);
        let r = a.query_at(&QueryRequest::new(Period::OneYear, QueryKind::Trend), ts(20)).unwrap();
        let AggregateResult::TrendSeries { entries } = r else { panic!() };
        let june = entries.last().unwrap();
        assert_eq!(june.bucket_label, "2024-06");
        assert_eq!(june.count, 2);
        assert_eq!(june.mean_accuracy_percent, Some(80));
    }
}
