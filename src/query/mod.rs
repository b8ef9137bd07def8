//! Series queries.
//!
//! [`QueryScheduler`] costs each query against the tier that would serve it,
//! rejects the ones above the point ceiling and fans the rest out in metric
//! batches to a light or a heavy [`BoundedExecutor`].

pub mod executor;
pub mod scheduler;
pub mod sink;
pub mod stats;

pub use executor::{BoundedExecutor, ExecutorStats, TaskFailure, TaskHandle};
pub use scheduler::{Query, QueryScheduler, SchedulerStats, SeriesReader};
pub use sink::{CollectingSink, JsonLinesSink, SeriesSink};
pub use stats::{BatchStats, QueryStats, Summary};
