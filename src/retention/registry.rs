//! Process-wide set of retention policies, owned by whoever builds the store.

use super::RetentionPolicy;
use crate::core::{Result, TierError, Timestamp};
use dashmap::DashMap;
use std::sync::Arc;

/// Interns policies so each name maps to exactly one shared instance.
#[derive(Debug, Default)]
pub struct PolicyRegistry {
    by_name: DashMap<String, Arc<RetentionPolicy>>,
    by_db_name: DashMap<String, Arc<RetentionPolicy>>,
}

impl PolicyRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-populated with a retention chain.
    pub fn with_chain<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let registry = Self::new();
        let list: Vec<&str> = names.iter().map(|s| s.as_ref()).collect();
        registry.chain(&list.join(","))?;
        Ok(registry)
    }

    /// The shared instance for `name`, created on first use.
    pub fn get_or_create(&self, name: &str) -> Result<Arc<RetentionPolicy>> {
        let name = name.trim();
        if let Some(p) = self.by_name.get(name) {
            return Ok(Arc::clone(p.value()));
        }
        let parsed = Arc::new(RetentionPolicy::parse(name)?);
        let policy = Arc::clone(
            self.by_name
                .entry(name.to_string())
                .or_insert(parsed)
                .value(),
        );
        self.by_db_name
            .entry(policy.db_name().to_string())
            .or_insert_with(|| Arc::clone(&policy));
        Ok(policy)
    }

    /// Shared instances for a comma separated chain.
    pub fn chain(&self, list: &str) -> Result<Vec<Arc<RetentionPolicy>>> {
        RetentionPolicy::parse_list(list)?
            .iter()
            .map(|p| self.get_or_create(p.name()))
            .collect()
    }

    /// Policy backing the archive `db_name`.
    pub fn for_db_name(&self, db_name: &str) -> Result<Arc<RetentionPolicy>> {
        self.by_db_name
            .get(db_name)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| TierError::UnknownPolicy(db_name.to_string()))
    }

    /// All known policies, finest first.
    pub fn all(&self) -> Vec<Arc<RetentionPolicy>> {
        let mut all: Vec<_> = self.by_name.iter().map(|e| Arc::clone(e.value())).collect();
        all.sort();
        all
    }

    /// Finest known policy covering `[from, until]`.
    pub fn pick_archive_for_query(
        &self,
        from: Timestamp,
        until: Timestamp,
        now: Timestamp,
    ) -> Option<Arc<RetentionPolicy>> {
        let all = self.all();
        RetentionPolicy::pick_for_query(&all, from, until, now).cloned()
    }
}
