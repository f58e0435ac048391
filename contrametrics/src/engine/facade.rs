// contrametrics/src/engine/facade.rs
//
// Query facade — the single entry point consumers call.
//
// Request:  { period: "7d"|"30d"|"90d"|"1y", query: "trend"|"categories"|"leaderboard"|"live", topN? }
// Response: one AggregateResult variant.
//
// Both tokens are parsed before the index is touched; a bad token never
// produces partial computation. topN is lenient (clamped), tokens are strict.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::engine::{AggregateResult, AggregationEngine, TopN, TopNBounds, WindowQuery};
use crate::error::QueryError;
use crate::state::{BucketIndex, Granularity};

// ── Period ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    SevenDays,
    ThirtyDays,
    NinetyDays,
    OneYear,
}

impl Period {
    pub const ALL: [Period; 4] = [Period::SevenDays, Period::ThirtyDays, Period::NinetyDays, Period::OneYear];

    pub fn token(&self) -> &'static str {
        match self {
            Self::SevenDays  => "7d",
            Self::ThirtyDays => "30d",
            Self::NinetyDays => "90d",
            Self::OneYear    => "1y",
        }
    }

    pub fn granularity(&self) -> Granularity {
        match self {
            Self::OneYear => Granularity::Month,
            _             => Granularity::Day,
        }
    }

    /// Number of buckets the period spans at its granularity.
    pub fn buckets(&self) -> u32 {
        match self {
            Self::SevenDays  => 7,
            Self::ThirtyDays => 30,
            Self::NinetyDays => 90,
            Self::OneYear    => 12,
        }
    }

    /// Anchor at `now`: the last `buckets()` buckets, ending with the one that
    /// contains `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> WindowQuery {
        let g     = self.granularity();
        let end   = g.next(g.floor(now));
        let start = g.back(now, self.buckets() - 1);
        WindowQuery::between(g, start, end)
    }
}

impl FromStr for Period {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "7d"  => Ok(Self::SevenDays),
            "30d" => Ok(Self::ThirtyDays),
            "90d" => Ok(Self::NinetyDays),
            "1y"  => Ok(Self::OneYear),
            _     => Err(QueryError::UnknownPeriod(s.to_string())),
        }
    }
}

impl std::fmt::Display for Period {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

// ── Query kind ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryKind {
    Trend,
    Categories,
    Leaderboard,
    Live,
}

impl QueryKind {
    pub const ALL: [QueryKind; 4] = [QueryKind::Trend, QueryKind::Categories, QueryKind::Leaderboard, QueryKind::Live];

    pub fn token(&self) -> &'static str {
        match self {
            Self::Trend       => "trend",
            Self::Categories  => "categories",
            Self::Leaderboard => "leaderboard",
            Self::Live        => "live",
        }
    }
}

impl FromStr for QueryKind {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trend"       => Ok(Self::Trend),
            "categories"  => Ok(Self::Categories),
            "leaderboard" => Ok(Self::Leaderboard),
            "live"        => Ok(Self::Live),
            _             => Err(QueryError::UnknownQueryType(s.to_string())),
        }
    }
}

impl std::fmt::Display for QueryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.token())
    }
}

// ── Request ───────────────────────────────────────────────────────────────────

/// Raw request as it arrives from a consumer. Tokens stay strings here so an
/// unknown value is reported as a typed QueryError rather than a decode failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    pub period: String,
    pub query:  String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_n:  Option<i64>,
}

impl QueryRequest {
    pub fn new(period: Period, kind: QueryKind) -> Self {
        Self { period: period.token().into(), query: kind.token().into(), top_n: None }
    }

    pub fn top_n(mut self, n: i64) -> Self {
        self.top_n = Some(n);
        self
    }
}

// ── Facade ────────────────────────────────────────────────────────────────────

pub struct QueryFacade {
    index:  Arc<BucketIndex>,
    engine: AggregationEngine,
    bounds: TopNBounds,
}

impl QueryFacade {
    pub fn new(index: Arc<BucketIndex>, bounds: TopNBounds) -> Self {
        Self { index, engine: AggregationEngine::new(bounds.default), bounds }
    }

    pub fn execute(&self, req: &QueryRequest) -> Result<AggregateResult, QueryError> {
        self.execute_at(req, Utc::now())
    }

    /// Same as `execute`, with the anchor instant supplied by the caller.
    pub fn execute_at(&self, req: &QueryRequest, now: DateTime<Utc>) -> Result<AggregateResult, QueryError> {
        let period: Period    = req.period.parse()?;
        let kind:   QueryKind = req.query.parse()?;

        let mut window = period.resolve(now);
        if let Some(n) = req.top_n {
            let top = TopN::clamped(n, self.bounds);
            if top.get() as i64 != n {
                debug!("{}; clamped to {}", QueryError::InvalidTopN(n), top.get());
            }
            window = window.with_top_n(top);
        }

        debug!(period = %period, query = %kind, "Dispatching query");
        Ok(self.dispatch(kind, &window, now))
    }

    pub fn dispatch(&self, kind: QueryKind, window: &WindowQuery, now: DateTime<Utc>) -> AggregateResult {
        match kind {
            QueryKind::Trend       => self.engine.trend(&self.index, window),
            QueryKind::Categories  => self.engine.category_distribution(&self.index, window),
            QueryKind::Leaderboard => self.engine.leaderboard(&self.index, window),
            QueryKind::Live        => self.engine.live_counters(&self.index, window, now),
        }
    }

    /// Every query kind for one period, in dashboard order.
    pub fn dashboard_at(&self, period: Period, now: DateTime<Utc>) -> Vec<(QueryKind, AggregateResult)> {
        let window = period.resolve(now);
        QueryKind::ALL.iter().map(|k| (*k, self.dispatch(*k, &window, now))).collect()
    }
}
