//! tierdb - tiered, Graphite-compatible time-series storage.
//!
//! Points are written into the finest tier of their metric's retention chain
//! and downsampled into each coarser tier through a file-based staging area.
//! Reads pick the finest tier still covering the requested window.
//!
//! # Architecture
//!
//! - `core`: errors, configuration, clock, shared types, metric index seam
//! - `retention`: retention policies and their registry
//! - `aggregation`: downsampling methods and per-metric rules
//! - `storage`: key codec, engines, archives, the store
//! - `staging`: unsorted/sorted staging files and interval aggregation
//! - `query`: admission control and batched series reads
//! - `cli`: administrative command line
//!
//! # Example
//!
//! ```no_run
//! use tierdb_lib::core::{ConfigBuilder, DataPoint};
//! use tierdb_lib::storage::Store;
//!
//! fn main() -> tierdb_lib::Result<()> {
//!     let config = ConfigBuilder::new()
//!         .retention(["60s:24h", "5m:7d"])
//!         .build()?;
//!     let store = Store::builder(config).open()?;
//!     store.insert(vec![DataPoint::new("pod1.cpu.user", 0.5, 1_700_000_000)])?;
//!     store.close();
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod aggregation;
pub mod cli;
pub mod core;
pub mod query;
pub mod retention;
pub mod staging;
pub mod storage;

// Re-export core types for convenience
pub use crate::core::{Config, Result, TierError};
