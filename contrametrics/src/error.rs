// contrametrics/src/error.rs
//
// Typed errors at the two boundaries: ingestion and query.
// Neither is fatal; callers get the error back and the engine keeps serving.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("invalid event: {0}")]
    InvalidEvent(String),

    #[error("duplicate event id: {0}")]
    DuplicateEvent(String),

    #[error("journal write failed: {0}")]
    Journal(#[from] std::io::Error),
}

impl IngestError {
    /// Short machine-readable kind for wire responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidEvent(_)   => "invalid_event",
            Self::DuplicateEvent(_) => "duplicate_event",
            Self::Journal(_)        => "journal",
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueryError {
    #[error("unknown period '{0}' (expected 7d, 30d, 90d or 1y)")]
    UnknownPeriod(String),

    #[error("unknown query type '{0}' (expected trend, categories, leaderboard or live)")]
    UnknownQueryType(String),

    #[error("topN {0} outside accepted range")]
    InvalidTopN(i64),
}

impl QueryError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownPeriod(_)    => "unknown_period",
            Self::UnknownQueryType(_) => "unknown_query_type",
            Self::InvalidTopN(_)      => "invalid_top_n",
        }
    }
}
