//! contrametrics — windowed metrics aggregation for contradiction detection.
//!
//! Detection events are appended to an [`store::EventStore`], rolled up
//! incrementally into hour/day/month buckets by [`state::BucketIndex`], and
//! answered on demand by the [`engine::QueryFacade`] as trend series,
//! category distributions, source leaderboards and live counters.

pub mod analytics;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod feed;
pub mod server;
pub mod state;
pub mod store;

pub use analytics::Analytics;
pub use config::EngineConfig;
pub use engine::{AggregateResult, Period, QueryKind, QueryRequest};
pub use error::{IngestError, QueryError};
pub use events::{Category, DetectionEvent, EventSubmission};
