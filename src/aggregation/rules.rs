//! Per-metric aggregation method selection.
//!
//! Rules are `method = regex` lines evaluated top to bottom; `*` matches every
//! name. Each reload bumps a revision so cached per-metric policies resolved
//! against older rules get re-resolved on their next use.

use super::AggregationMethod;
use crate::core::{Result, TierError};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use regex::Regex;
use std::path::Path;
use std::sync::Arc;

/// One `method = pattern` line.
#[derive(Debug, Clone)]
pub struct AggregationRule {
    method: AggregationMethod,
    pattern: Option<Regex>,
}

impl AggregationRule {
    /// Parse `sum = \.count$` or `avg = *`.
    pub fn parse(line: &str) -> Result<Self> {
        let (method, pattern) = line
            .split_once('=')
            .ok_or_else(|| TierError::config(format!("aggregation rule without '=': {line:?}")))?;
        let method: AggregationMethod = method.parse()?;
        let pattern = pattern.trim();
        let pattern = if pattern == "*" {
            None
        } else {
            Some(Regex::new(pattern).map_err(|e| {
                TierError::config(format!("bad aggregation pattern {pattern:?}: {e}"))
            })?)
        };
        Ok(Self { method, pattern })
    }

    /// Method if this rule applies to `name`.
    pub fn apply(&self, name: &str) -> Option<AggregationMethod> {
        match &self.pattern {
            None => Some(self.method),
            Some(re) if re.is_match(name) => Some(self.method),
            Some(_) => None,
        }
    }
}

/// An ordered rule list at a given revision.
#[derive(Debug, Clone, Default)]
pub struct AggregationRules {
    revision: u64,
    rules: Vec<AggregationRule>,
}

impl AggregationRules {
    /// Parse rule lines; blank lines and `#` comments are skipped.
    pub fn parse<I, S>(lines: I, revision: u64) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rules = lines
            .into_iter()
            .filter_map(|l| {
                let l = l.as_ref().trim();
                (!l.is_empty() && !l.starts_with('#')).then(|| AggregationRule::parse(l))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { revision, rules })
    }

    /// First matching method.
    pub fn method_for(&self, name: &str) -> Option<AggregationMethod> {
        self.rules.iter().find_map(|r| r.apply(name))
    }

    /// Revision these rules were loaded at.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Number of rules.
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rule is configured.
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// A resolved method tagged with the rules revision it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregationPolicy {
    /// Resolved method
    pub method: AggregationMethod,
    /// Rules revision at resolution time
    pub revision: u64,
}

/// Hands out aggregation policies per metric name and caches them until the
/// rules change.
#[derive(Debug)]
pub struct AggregationPolicySource {
    rules: ArcSwap<AggregationRules>,
    cache: DashMap<String, (u64, Option<AggregationMethod>)>,
}

impl AggregationPolicySource {
    /// Source at revision 1.
    pub fn from_lines<I, S>(lines: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Ok(Self {
            rules: ArcSwap::from_pointee(AggregationRules::parse(lines, 1)?),
            cache: DashMap::new(),
        })
    }

    /// Current rules revision.
    pub fn revision(&self) -> u64 {
        self.rules.load().revision()
    }

    /// Policy for `metric_name`, `None` when no rule matches.
    pub fn policy_for(&self, metric_name: &str) -> Option<AggregationPolicy> {
        let rules = self.rules.load();
        let revision = rules.revision();
        let cached = self.cache.get(metric_name).map(|e| *e.value());
        let method = match cached {
            Some((rev, method)) if rev == revision => method,
            _ => {
                let method = rules.method_for(metric_name);
                if method.is_none() {
                    tracing::debug!("no aggregation rule matches {}", metric_name);
                }
                self.cache.insert(metric_name.to_string(), (revision, method));
                method
            },
        };
        method.map(|method| AggregationPolicy { method, revision })
    }

    /// Replace the rules; returns the new revision.
    pub fn reload<I, S>(&self, lines: I) -> Result<u64>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let next = self.revision() + 1;
        let rules = AggregationRules::parse(lines, next)?;
        tracing::info!("Loaded {} aggregation rules, revision {}", rules.len(), next);
        self.rules.store(Arc::new(rules));
        Ok(next)
    }

    /// Replace the rules from a file.
    pub fn reload_file(&self, path: &Path) -> Result<u64> {
        let content = std::fs::read_to_string(path)?;
        self.reload(content.lines())
    }

    /// Number of cached per-metric entries.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}
