//! Tier storage.
//!
//! One [`Archive`] per retention policy, opened on demand by the
//! [`ArchiveFactory`], and the [`Store`] that routes writes and reads across
//! them.

pub mod archive;
pub mod cache;
pub mod disposal;
pub mod engine;
pub mod factory;
pub mod record;
pub mod store;

// Re-export commonly used types
pub use archive::{Archive, ArchiveOptions, ArchiveStats};
pub use cache::{QueryCachePolicy, SeriesCache, SeriesKey};
pub use disposal::{DisposalQueue, DisposalStats};
pub use engine::{KvEngine, LogEngine, WriteBatch};
pub use factory::ArchiveFactory;
pub use record::KeyCodec;
pub use store::{Store, StoreBuilder, StoreStats};
