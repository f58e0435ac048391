// contrametrics/src/state/bucket.rs
//
// Calendar bucketing. All boundaries are UTC.
//
//   Hour  — [HH:00, HH+1:00)
//   Day   — [00:00, next 00:00)
//   Month — [1st 00:00, next 1st 00:00)   (variable length, not a 30-day approximation)

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{Category, DetectionEvent};

// ── Granularity ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Month,
}

impl Granularity {
    /// Coarsest first. Ingestion updates in this order so a day bucket is never
    /// observed behind the hour buckets it contains (compaction relies on it).
    pub const ALL: [Granularity; 3] = [Granularity::Month, Granularity::Day, Granularity::Hour];

    /// Start of the bucket containing `ts`.
    pub fn floor(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let date = ts.date_naive();
        match self {
            Self::Hour  => at_midnight(date) + Duration::hours(ts.hour() as i64),
            Self::Day   => at_midnight(date),
            Self::Month => at_midnight(first_of_month(date)),
        }
    }

    /// Start of the bucket following the one starting at `start`.
    pub fn next(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Hour  => self.floor(start) + Duration::hours(1),
            Self::Day   => self.floor(start) + Duration::days(1),
            Self::Month => {
                let probe = first_of_month(start.date_naive()) + Duration::days(32);
                at_midnight(first_of_month(probe))
            }
        }
    }

    /// Start of the bucket `n` steps before the one containing `ts`.
    pub fn back(&self, ts: DateTime<Utc>, n: u32) -> DateTime<Utc> {
        let mut cur = self.floor(ts);
        for _ in 0..n {
            cur = self.floor(cur - Duration::seconds(1));
        }
        cur
    }

    /// Starts of every bucket overlapping `[start, end)`, chronological.
    pub fn boundaries(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        let mut cur = self.floor(start);
        while cur < end {
            out.push(cur);
            cur = self.next(cur);
        }
        out
    }

    pub fn label(&self, start: DateTime<Utc>) -> String {
        match self {
            Self::Hour  => start.format("%Y-%m-%dT%H:00").to_string(),
            Self::Day   => start.format("%Y-%m-%d").to_string(),
            Self::Month => start.format("%Y-%m").to_string(),
        }
    }
}

impl std::fmt::Display for Granularity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Hour  => write!(f, "hour"),
            Self::Day   => write!(f, "day"),
            Self::Month => write!(f, "month"),
        }
    }
}

fn at_midnight(date: NaiveDate) -> DateTime<Utc> {
    Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN))
}

fn first_of_month(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.day0() as i64)
}

// ── Time bucket ───────────────────────────────────────────────────────────────

/// Rollup of every event whose timestamp falls in [start, granularity.next(start)).
/// Invariant: total_count == Σ count_by_category == Σ count_by_source.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeBucket {
    pub start:             DateTime<Utc>,
    pub granularity:       Granularity,
    pub total_count:       u64,
    pub sum_accuracy:      f64,
    pub comments_scanned:  u64,
    pub count_by_category: HashMap<Category, u64>,
    pub count_by_source:   HashMap<String, u64>,
    pub users:             HashSet<String>,
}

impl TimeBucket {
    pub fn empty(granularity: Granularity, start: DateTime<Utc>) -> Self {
        Self {
            start:             granularity.floor(start),
            granularity,
            total_count:       0,
            sum_accuracy:      0.0,
            comments_scanned:  0,
            count_by_category: HashMap::new(),
            count_by_source:   HashMap::new(),
            users:             HashSet::new(),
        }
    }

    pub fn record(&mut self, event: &DetectionEvent) {
        self.total_count  += 1;
        self.sum_accuracy += event.accuracy_score;
        self.comments_scanned += event.comments_scanned as u64;
        *self.count_by_category.entry(event.category.clone()).or_default() += 1;
        *self.count_by_source.entry(event.source.clone()).or_default() += 1;
        if let Some(ref user) = event.user_id {
            if !self.users.contains(user) {
                self.users.insert(user.clone());
            }
        }
    }

    /// Fold another bucket's counters into this one (compaction roll-up).
    pub fn absorb(&mut self, other: &TimeBucket) {
        self.total_count  += other.total_count;
        self.sum_accuracy += other.sum_accuracy;
        self.comments_scanned += other.comments_scanned;
        self.users.extend(other.users.iter().cloned());
        for (c, n) in &other.count_by_category {
            *self.count_by_category.entry(c.clone()).or_default() += n;
        }
        for (s, n) in &other.count_by_source {
            *self.count_by_source.entry(s.clone()).or_default() += n;
        }
    }

    pub fn end(&self) -> DateTime<Utc> { self.granularity.next(self.start) }

    pub fn label(&self) -> String { self.granularity.label(self.start) }

    pub fn is_empty(&self) -> bool { self.total_count == 0 }

    /// Mean accuracy in [0,1]; None for an empty bucket.
    pub fn mean_accuracy(&self) -> Option<f64> {
        if self.total_count == 0 { return None; }
        Some((self.sum_accuracy / self.total_count as f64).clamp(0.0, 1.0))
    }

    pub fn is_consistent(&self) -> bool {
        let by_cat: u64 = self.count_by_category.values().sum();
        let by_src: u64 = self.count_by_source.values().sum();
        by_cat == self.total_count && by_src == self.total_count
    }
}
