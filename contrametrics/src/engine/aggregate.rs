// contrametrics/src/engine/aggregate.rs
//
// Aggregation engine — pure functions of (index snapshot, WindowQuery).
//
//   trend                 one point per bucket in range, zero-filled, chronological
//   category_distribution integer percentages summing to exactly 100; empty
//                         categories omitted; rounding drift absorbed by the
//                         largest category
//   leaderboard           count desc, source name asc (ordinal), truncated to topN
//   live_counters         all-time totals, plus the current window compared
//                         with the equally long window before it
//
// No state is kept here; repeated calls on an unchanged index give identical output.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::engine::{
    AggregateResult, CategoryShare, LiveCounters, PeriodChange, SourceRank, TopN, TrendPoint,
    WindowQuery,
};
use crate::events::Category;
use crate::state::{BucketIndex, Granularity, TimeBucket};

#[derive(Debug, Clone, Copy)]
pub struct AggregationEngine {
    default_top_n: usize,
}

impl AggregationEngine {
    pub fn new(default_top_n: usize) -> Self {
        Self { default_top_n: default_top_n.max(1) }
    }

    fn buckets(index: &BucketIndex, q: &WindowQuery) -> Vec<TimeBucket> {
        index.snapshot(q.granularity, q.start, q.end)
    }

    pub fn trend(&self, index: &BucketIndex, q: &WindowQuery) -> AggregateResult {
        let entries = Self::buckets(index, q).iter()
            .map(|b| TrendPoint {
                bucket_label:          b.label(),
                count:                 b.total_count,
                mean_accuracy_percent: b.mean_accuracy().map(|m| (m * 100.0).round() as u32),
            })
            .collect();
        AggregateResult::TrendSeries { entries }
    }

    pub fn category_distribution(&self, index: &BucketIndex, q: &WindowQuery) -> AggregateResult {
        let mut counts: HashMap<Category, u64> = HashMap::new();
        for b in Self::buckets(index, q) {
            for (cat, n) in b.count_by_category {
                *counts.entry(cat).or_default() += n;
            }
        }
        counts.retain(|_, n| *n > 0);
        let total: u64 = counts.values().sum();
        if total == 0 {
            return AggregateResult::CategoryDistribution { entries: Vec::new() };
        }

        // Largest first; label breaks ties so the absorbing category is deterministic.
        let mut ranked: Vec<(Category, u64)> = counts.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.label().cmp(b.0.label())));

        let mut percents: Vec<i64> = ranked.iter()
            .map(|(_, n)| (100.0 * *n as f64 / total as f64).round() as i64)
            .collect();
        absorb_rounding(&mut percents);

        let entries = ranked.into_iter().zip(percents)
            .map(|((cat, _), pct)| CategoryShare {
                category:         cat.label().to_string(),
                percent_of_total: pct as u32,
            })
            .collect();
        AggregateResult::CategoryDistribution { entries }
    }

    pub fn leaderboard(&self, index: &BucketIndex, q: &WindowQuery) -> AggregateResult {
        let mut counts: HashMap<String, u64> = HashMap::new();
        for b in Self::buckets(index, q) {
            for (src, n) in b.count_by_source {
                *counts.entry(src).or_default() += n;
            }
        }

        let mut entries: Vec<SourceRank> = counts.into_iter()
            .filter(|(_, n)| *n > 0)
            .map(|(source, count)| SourceRank { source, count })
            .collect();
        entries.sort_by(rank_order);
        entries.truncate(q.top_n.map(TopN::get).unwrap_or(self.default_top_n));
        AggregateResult::Leaderboard { entries }
    }

    /// All-time totals as of `now`; `q` only selects the windows the change
    /// figures compare.
    pub fn live_counters(&self, index: &BucketIndex, q: &WindowQuery, now: DateTime<Utc>) -> AggregateResult {
        let t = index.totals();

        let current  = WindowTotals::collect(Self::buckets(index, q));
        let previous = WindowTotals::collect(Self::buckets(index, &q.previous()));

        let hour   = Granularity::Hour;
        let recent = index.snapshot(hour, hour.back(now, 1), hour.next(hour.floor(now)));
        let active = WindowTotals::collect(recent).users.len() as u64;

        AggregateResult::LiveCounters(LiveCounters {
            total_users:           t.users,
            total_detections:      t.detections,
            accuracy_rate_percent: rate_percent(t.sum_accuracy, t.detections).unwrap_or(0.0),
            comments_analyzed:     t.comments,
            active_users:          active,
            last_event_at:         t.last_event_at,
            change:                current.change_from(&previous),
        })
    }
}

/// Sums over every bucket of one window.
#[derive(Default)]
struct WindowTotals {
    detections:   u64,
    comments:     u64,
    sum_accuracy: f64,
    users:        HashSet<String>,
}

impl WindowTotals {
    fn collect(buckets: Vec<TimeBucket>) -> Self {
        buckets.into_iter().fold(Self::default(), |mut w, b| {
            w.detections   += b.total_count;
            w.comments     += b.comments_scanned;
            w.sum_accuracy += b.sum_accuracy;
            w.users.extend(b.users);
            w
        })
    }

    fn change_from(&self, prev: &WindowTotals) -> PeriodChange {
        let accuracy_points = rate_percent(self.sum_accuracy, self.detections)
            .zip(rate_percent(prev.sum_accuracy, prev.detections))
            .map(|(cur, old)| round1(cur - old));
        PeriodChange {
            users_percent:      percent_change(self.users.len() as u64, prev.users.len() as u64),
            detections_percent: percent_change(self.detections, prev.detections),
            accuracy_points,
            comments_percent:   percent_change(self.comments, prev.comments),
        }
    }
}

/// Mean accuracy ×100 to one decimal; None with no events.
fn rate_percent(sum_accuracy: f64, n: u64) -> Option<f64> {
    if n == 0 { return None; }
    let mean = (sum_accuracy / n as f64).clamp(0.0, 1.0);
    Some((mean * 1000.0).round() / 10.0)
}

fn percent_change(current: u64, previous: u64) -> Option<f64> {
    if previous == 0 { return None; }
    Some(round1((current as f64 - previous as f64) / previous as f64 * 100.0))
}

fn round1(x: f64) -> f64 { (x * 10.0).round() / 10.0 }

impl Default for AggregationEngine {
    fn default() -> Self { Self::new(crate::config::DEFAULT_TOP_N) }
}

fn rank_order(a: &SourceRank, b: &SourceRank) -> Ordering {
    b.count.cmp(&a.count).then_with(|| a.source.cmp(&b.source))
}

/// Push the rounded percentages back to a sum of exactly 100. `percents` is
/// ordered largest category first; the largest takes the whole correction
/// unless that would drive it negative (only possible with many tiny shares),
/// in which case the remainder moves down the ranking.
fn absorb_rounding(percents: &mut [i64]) {
    let mut diff = 100 - percents.iter().sum::<i64>();
    for p in percents.iter_mut() {
        if diff == 0 { break; }
        let applied = diff.max(-*p);
        *p   += applied;
        diff -= applied;
    }
}
