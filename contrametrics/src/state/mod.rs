pub mod bucket;
pub mod index;

pub use bucket::{Granularity, TimeBucket};
pub use index::{BucketIndex, BucketKey, CompactionReport, TotalsSnapshot};
