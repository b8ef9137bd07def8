//! Hot reload of the aggregation rules file.

use super::AggregationPolicySource;
use crate::core::{Result, TierError};
use std::path::PathBuf;
use std::sync::Arc;

/// Watches a rules file and reloads the policy source when it changes.
pub struct RulesWatcher {
    path: PathBuf,
    source: Arc<AggregationPolicySource>,
}

impl RulesWatcher {
    /// Create a watcher for `path`.
    pub fn new(path: PathBuf, source: Arc<AggregationPolicySource>) -> Self {
        RulesWatcher { path, source }
    }

    /// Watch until the runtime shuts down.
    pub async fn watch(self) -> Result<()> {
        use notify::{RecursiveMode, Watcher};

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        })
        .map_err(|e| TierError::config(format!("Failed to create file watcher: {}", e)))?;

        watcher
            .watch(&self.path, RecursiveMode::NonRecursive)
            .map_err(|e| TierError::config(format!("Failed to watch rules file: {}", e)))?;

        tracing::info!("Watching aggregation rules: {:?}", self.path);

        while let Some(event) = rx.recv().await {
            if !matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                continue;
            }
            match tokio::fs::read_to_string(&self.path).await {
                Ok(content) => match self.source.reload(content.lines()) {
                    Ok(revision) => {
                        tracing::info!("Aggregation rules reloaded, revision {}", revision)
                    },
                    Err(e) => tracing::error!("Invalid aggregation rules, keeping previous: {}", e),
                },
                Err(e) => tracing::error!("Failed to read aggregation rules: {}", e),
            }
        }

        Ok(())
    }
}
