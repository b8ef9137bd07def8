//! Retention tiers.
//!
//! A [`RetentionPolicy`] describes one resolution/retention tier; the
//! [`PolicyRegistry`] interns them so every component shares one instance per
//! tier.

pub mod policy;
pub mod registry;

pub use policy::{parse_span, RetentionPolicy};
pub use registry::PolicyRegistry;
