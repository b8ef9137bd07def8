//! Staging of raw points destined for lower-resolution tiers.
//!
//! Points are appended to per-interval text files off the write path, sorted
//! by metric id once their interval went quiet, grouped per metric and
//! aggregated into the destination tier.

pub mod file;
pub mod file_set;
pub mod files;
pub mod interval;
pub mod pipeline;
pub mod record;
pub mod sort;
pub mod sorted;

pub use file::StagingFile;
pub use file_set::{FileSetId, Sequences};
pub use files::{CollectIdle, StagingFiles};
pub use interval::{
    IntervalOptions, IntervalProcessor, IntervalProcessors, IntervalStats, IntervalValues,
    PointSink,
};
pub use pipeline::{FileStats, StagingPipeline, StagingStats};
pub use record::StagingRecord;
pub use sort::{ExternalSort, InMemorySort, Sorter};
pub use sorted::SortedStagingFile;
