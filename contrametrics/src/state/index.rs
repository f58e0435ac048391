// contrametrics/src/state/index.rs
//
// Time-bucket index — incremental rollups keyed by (granularity, bucket start).
// DashMap = sharded concurrent HashMap; each bucket sits behind its own RwLock
// so ingestion into one bucket never contends with reads of another.
//
// Design:
//   - apply(): the only mutation path. One bucket per granularity is touched
//     per event (month, day, hour — coarsest first), counts only increase
//   - snapshot(): clones each bucket under its read lock, zero-fills gaps.
//     Per-bucket consistency only; two buckets in one snapshot may reflect
//     different "as of" instants under concurrent ingestion
//   - Live totals: all-time counters maintained alongside bucket updates
//   - compact(): hour buckets past retention are rolled into their day bucket
//     and dropped. Category/source breakdown below day resolution is lost
//     for that range; hour-granularity snapshots there read as zero

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::{DashMap, DashSet};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::events::DetectionEvent;
use crate::state::bucket::{Granularity, TimeBucket};

/// Upper bound on buckets materialised by a single snapshot (~11 years of hours).
pub const MAX_SNAPSHOT_BUCKETS: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketKey {
    pub granularity: Granularity,
    pub start:       DateTime<Utc>,
}

impl BucketKey {
    pub fn covering(granularity: Granularity, ts: DateTime<Utc>) -> Self {
        Self { granularity, start: granularity.floor(ts) }
    }
}

// ── Live totals ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TotalsSnapshot {
    pub detections:    u64,
    pub comments:      u64,
    pub users:         u64,
    pub sum_accuracy:  f64,
    pub last_event_at: Option<DateTime<Utc>>,
}

struct LiveTotals {
    detections:    AtomicU64,
    comments:      AtomicU64,
    users:         DashSet<String>,
    sum_accuracy:  Mutex<f64>,
    last_event_at: Mutex<Option<DateTime<Utc>>>,
}

impl LiveTotals {
    fn new() -> Self {
        Self {
            detections:    AtomicU64::new(0),
            comments:      AtomicU64::new(0),
            users:         DashSet::new(),
            sum_accuracy:  Mutex::new(0.0),
            last_event_at: Mutex::new(None),
        }
    }

    fn record(&self, event: &DetectionEvent) {
        self.detections.fetch_add(1, Ordering::Relaxed);
        self.comments.fetch_add(event.comments_scanned as u64, Ordering::Relaxed);
        if let Some(ref user) = event.user_id {
            if !self.users.contains(user) {
                self.users.insert(user.clone());
            }
        }
        *self.sum_accuracy.lock() += event.accuracy_score;

        let mut last = self.last_event_at.lock();
        if last.map_or(true, |t| event.timestamp > t) {
            *last = Some(event.timestamp);
        }
    }

    fn snapshot(&self) -> TotalsSnapshot {
        TotalsSnapshot {
            detections:    self.detections.load(Ordering::Relaxed),
            comments:      self.comments.load(Ordering::Relaxed),
            users:         self.users.len() as u64,
            sum_accuracy:  *self.sum_accuracy.lock(),
            last_event_at: *self.last_event_at.lock(),
        }
    }
}

// ── Compaction report ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CompactionReport {
    pub hour_buckets_removed: usize,
    pub days_touched:         usize,
    pub events_rolled_up:     u64,
    pub sum_accuracy:         f64,
}

// ── Index ─────────────────────────────────────────────────────────────────────

pub struct BucketIndex {
    buckets: DashMap<BucketKey, Arc<RwLock<TimeBucket>>>,
    totals:  LiveTotals,
}

impl BucketIndex {
    pub fn new() -> Self {
        Self { buckets: DashMap::new(), totals: LiveTotals::new() }
    }

    /// Fold one event into the bucket covering its timestamp at every granularity.
    pub fn apply(&self, event: &DetectionEvent) {
        for g in Granularity::ALL {
            let key = BucketKey::covering(g, event.timestamp);
            let bucket = self.buckets
                .entry(key)
                .or_insert_with(|| Arc::new(RwLock::new(TimeBucket::empty(g, key.start))))
                .clone();
            bucket.write().record(event);
        }
        self.totals.record(event);
    }

    /// Chronological buckets overlapping `[start, end)`. Buckets with no events
    /// are synthesised as zero-valued so callers never see gaps.
    pub fn snapshot(
        &self,
        granularity: Granularity,
        start:       DateTime<Utc>,
        end:         DateTime<Utc>,
    ) -> Vec<TimeBucket> {
        let mut bounds = granularity.boundaries(start, end);
        if bounds.len() > MAX_SNAPSHOT_BUCKETS {
            warn!(
                requested = bounds.len(),
                "Snapshot range truncated to the most recent {} {} buckets",
                MAX_SNAPSHOT_BUCKETS, granularity
            );
            bounds.drain(..bounds.len() - MAX_SNAPSHOT_BUCKETS);
        }

        bounds.into_iter()
            .map(|b| self.bucket(BucketKey { granularity, start: b })
                         .unwrap_or_else(|| TimeBucket::empty(granularity, b)))
            .collect()
    }

    /// Consistent copy of one bucket, if it exists.
    pub fn bucket(&self, key: BucketKey) -> Option<TimeBucket> {
        // Clone the Arc first so the shard lock is released before the bucket lock is taken.
        let handle = self.buckets.get(&key).map(|b| Arc::clone(&b))?;
        let copy = handle.read().clone();
        Some(copy)
    }

    pub fn totals(&self) -> TotalsSnapshot { self.totals.snapshot() }

    pub fn bucket_count(&self, granularity: Granularity) -> usize {
        self.buckets.iter().filter(|e| e.key().granularity == granularity).count()
    }

    /// Roll hour buckets that ended before `retention_days` ago (aligned to a
    /// day boundary) into their day bucket and discard them.
    pub fn compact(&self, now: DateTime<Utc>, retention_days: i64) -> CompactionReport {
        let Some(cutoff) = Duration::try_days(retention_days)
            .and_then(|d| now.checked_sub_signed(d))
            .map(|t| Granularity::Day.floor(t))
        else {
            warn!(retention_days, "Retention outside the representable range; compaction skipped");
            return CompactionReport::default();
        };

        let expired: Vec<BucketKey> = self.buckets.iter()
            .map(|e| *e.key())
            .filter(|k| k.granularity == Granularity::Hour && k.start < cutoff)
            .collect();
        if expired.is_empty() {
            return CompactionReport::default();
        }

        // Group by containing day; BTreeMap keeps the log output chronological.
        let mut by_day: BTreeMap<DateTime<Utc>, TimeBucket> = BTreeMap::new();
        let mut report = CompactionReport::default();

        for key in expired {
            let Some((_, handle)) = self.buckets.remove(&key) else { continue };
            let hour = handle.read().clone();
            let day_start = Granularity::Day.floor(hour.start);
            by_day.entry(day_start)
                .or_insert_with(|| TimeBucket::empty(Granularity::Day, day_start))
                .absorb(&hour);
            report.hour_buckets_removed += 1;
            report.events_rolled_up     += hour.total_count;
            report.sum_accuracy         += hour.sum_accuracy;
        }

        let mut repaired: HashSet<DateTime<Utc>> = HashSet::new();
        for (day_start, rollup) in &by_day {
            let key = BucketKey { granularity: Granularity::Day, start: *day_start };
            let day = self.buckets
                .entry(key)
                .or_insert_with(|| {
                    repaired.insert(*day_start);
                    Arc::new(RwLock::new(TimeBucket::empty(Granularity::Day, *day_start)))
                })
                .clone();

            let mut day = day.write();
            if repaired.contains(day_start) {
                day.absorb(rollup);
            } else if day.total_count < rollup.total_count {
                // Day buckets are written before hour buckets, so this means the
                // index was built without day rollups. Top up the difference.
                warn!(
                    day = %Granularity::Day.label(*day_start),
                    day_count = day.total_count, hours = rollup.total_count,
                    "Day bucket behind its hours during compaction"
                );
                *day = rollup.clone();
                repaired.insert(*day_start);
            }
        }
        report.days_touched = by_day.len();

        if !repaired.is_empty() {
            debug!("Compaction rebuilt {} day buckets from hour rollups", repaired.len());
        }
        info!(
            removed = report.hour_buckets_removed,
            days    = report.days_touched,
            events  = report.events_rolled_up,
            "Hour buckets compacted"
        );
        report
    }
}

impl Default for BucketIndex { fn default() -> Self { Self::new() } }

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Category;
    use chrono::TimeZone;

    fn t(m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, m, d, h, 0, 0).unwrap()
    }

    fn ev(id: &str, ts: DateTime<Utc>, cat: Category, src: &str, acc: f64) -> DetectionEvent {
        DetectionEvent::new(id, ts, cat, src, acc)
    }

    #[test]
    fn conservation_at_every_granularity() {
        let idx = BucketIndex::new();
        let stamps = [t(1, 1, 0), t(1, 1, 23), t(1, 31, 12), t(2, 29, 6), t(3, 15, 9)];
        for (i, ts) in stamps.iter().enumerate() {
            idx.apply(&ev(&i.to_string(), *ts, Category::Factual, "food", 0.5));
        }
        for g in Granularity::ALL {
            let total: u64 = idx.snapshot(g, t(1, 1, 0), t(4, 1, 0))
                .iter().map(|b| b.total_count).sum();
            assert_eq!(total, stamps.len() as u64, "granularity {}", g);
        }
    }

    #[test]
    fn apply_touches_exactly_one_bucket_per_granularity() {
        let idx = BucketIndex::new();
        idx.apply(&ev("a", t(1, 10, 4), Category::Opinion, "food", 0.2));
        let before = idx.snapshot(Granularity::Day, t(1, 1, 0), t(2, 1, 0));

        idx.apply(&ev("b", t(1, 12, 8), Category::Opinion, "food", 0.2));
        let after = idx.snapshot(Granularity::Day, t(1, 1, 0), t(2, 1, 0));

        let changed: Vec<_> = before.iter().zip(&after)
            .filter(|(b, a)| b != a)
            .map(|(b, a)| (b.label(), a.total_count - b.total_count))
            .collect();
        assert_eq!(changed, vec![("2024-01-12".to_string(), 1)]);
    }

    #[test]
    fn snapshot_zero_fills_gaps() {
        let idx = BucketIndex::new();
        idx.apply(&ev("a", t(1, 3, 0), Category::Political, "politics", 0.9));
        let snap = idx.snapshot(Granularity::Day, t(1, 1, 0), t(1, 6, 0));
        assert_eq!(snap.len(), 5);
        let counts: Vec<u64> = snap.iter().map(|b| b.total_count).collect();
        assert_eq!(counts, vec![0, 0, 1, 0, 0]);
        assert!(snap.windows(2).all(|w| w[0].start < w[1].start));
    }

    #[test]
    fn buckets_stay_consistent_and_bounded() {
        let idx = BucketIndex::new();
        let cats = [Category::Political, Category::Lifestyle, Category::Custom("Sports".into())];
        for i in 0..60u32 {
            let cat = cats[(i % 3) as usize].clone();
            let src = if i % 2 == 0 { "politics" } else { "food" };
            idx.apply(&ev(&i.to_string(), t(1, 1 + i % 28, i % 24), cat, src, (i % 11) as f64 / 10.0));
        }
        for b in idx.snapshot(Granularity::Hour, t(1, 1, 0), t(2, 1, 0)) {
            assert!(b.is_consistent());
            if let Some(m) = b.mean_accuracy() {
                assert!((0.0..=1.0).contains(&m));
            }
        }
    }

    #[test]
    fn totals_track_users_and_comments() {
        let idx = BucketIndex::new();
        idx.apply(&ev("a", t(1, 1, 0), Category::Factual, "x", 0.8).with_user("u1").with_comments_scanned(12));
        idx.apply(&ev("b", t(1, 2, 0), Category::Factual, "x", 0.6).with_user("u1"));
        idx.apply(&ev("c", t(1, 3, 0), Category::Factual, "x", 1.0).with_user("u2"));
        let tot = idx.totals();
        assert_eq!(tot.detections, 3);
        assert_eq!(tot.users, 2);
        assert_eq!(tot.comments, 14);
        assert!((tot.sum_accuracy - 2.4).abs() < 1e-9);
        assert_eq!(tot.last_event_at, Some(t(1, 3, 0)));
    }

    #[test]
    fn last_event_at_ignores_late_arrivals() {
        let idx = BucketIndex::new();
        idx.apply(&ev("new", t(3, 1, 9), Category::Opinion, "x", 0.5));
        idx.apply(&ev("old", t(1, 1, 9), Category::Opinion, "x", 0.5));
        assert_eq!(idx.totals().last_event_at, Some(t(3, 1, 9)));
    }

    #[test]
    fn huge_retention_does_not_panic() {
        let idx = BucketIndex::new();
        idx.apply(&ev("a", t(1, 1, 0), Category::Opinion, "x", 0.5));
        assert_eq!(idx.compact(t(6, 1, 0), 10_000_000_000), CompactionReport::default());
        assert_eq!(idx.compact(t(6, 1, 0), i64::MAX), CompactionReport::default());
        assert_eq!(idx.bucket_count(Granularity::Hour), 1);
    }

    #[test]
    fn compaction_preserves_day_totals() {
        let idx = BucketIndex::new();
        idx.apply(&ev("old1", t(1, 2, 3), Category::Political, "politics", 0.9));
        idx.apply(&ev("old2", t(1, 2, 17), Category::Factual, "food", 0.3));
        idx.apply(&ev("new", t(6, 1, 10), Category::Factual, "food", 0.5));

        let day_key = BucketKey::covering(Granularity::Day, t(1, 2, 0));
        let before  = idx.bucket(day_key).unwrap();

        let report = idx.compact(t(6, 2, 0), 90);
        assert_eq!(report.hour_buckets_removed, 2);
        assert_eq!(report.events_rolled_up, 2);
        assert!((report.sum_accuracy - 1.2).abs() < 1e-9);

        let after = idx.bucket(day_key).unwrap();
        assert_eq!(after.total_count, before.total_count);
        assert_eq!(after.sum_accuracy, before.sum_accuracy);
        assert_eq!(after.count_by_category, before.count_by_category);

        // Recent hour bucket untouched; expired range reads as zero at hour level.
        assert_eq!(idx.bucket_count(Granularity::Hour), 1);
        let hours: u64 = idx.snapshot(Granularity::Hour, t(1, 2, 0), t(1, 3, 0))
            .iter().map(|b| b.total_count).sum();
        assert_eq!(hours, 0);
    }

    #[test]
    fn compaction_with_nothing_expired_is_a_no_op() {
        let idx = BucketIndex::new();
        idx.apply(&ev("a", t(5, 1, 0), Category::Opinion, "x", 0.5));
        assert_eq!(idx.compact(t(5, 2, 0), 90), CompactionReport::default());
        assert_eq!(idx.bucket_count(Granularity::Hour), 1);
    }

    #[test]
    fn concurrent_apply_conserves_counts() {
        let idx = Arc::new(BucketIndex::new());
        let handles: Vec<_> = (0..8).map(|w| {
            let idx = Arc::clone(&idx);
            std::thread::spawn(move || {
                for i in 0..250u32 {
                    let id = format!("{}-{}", w, i);
                    idx.apply(&ev(&id, t(2, 1 + i % 20, i % 24), Category::Opinion, "food", 0.5));
                }
            })
        }).collect();
        for h in handles { h.join().unwrap(); }

        let total: u64 = idx.snapshot(Granularity::Month, t(1, 1, 0), t(4, 1, 0))
            .iter().map(|b| b.total_count).sum();
        assert_eq!(total, 2000);
        assert_eq!(idx.totals().detections, 2000);
    }
}
