//! Downsampling methods and the rules that pick them per metric.

pub mod method;
pub mod rules;
pub mod watcher;

pub use method::AggregationMethod;
pub use rules::{AggregationPolicy, AggregationPolicySource, AggregationRule, AggregationRules};
pub use watcher::RulesWatcher;
