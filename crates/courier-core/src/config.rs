//! Worker configuration.
//!
//! Passed explicitly to `DeliveryWorker::new` / `WorkerGroup::spawn`; nothing is
//! read from global state, so several differently configured workers can live
//! in one process (and one test).

use std::collections::HashSet;
use std::time::Duration;

use crate::domain::{ConfigError, WorkerId};

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Identity written into `owner` on claimed messages. Must be unique in the cluster.
    pub worker_id: WorkerId,

    /// Upper bound on messages handled per sweep.
    pub batch_size: usize,

    /// Delay between the starts of consecutive sweeps.
    pub sweep_interval: Duration,
}

impl WorkerConfig {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: WorkerId::new(worker_id),
            batch_size: DEFAULT_BATCH_SIZE,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.worker_id.is_empty() {
            return Err(ConfigError::EmptyWorkerId);
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::ZeroSweepInterval);
        }
        Ok(())
    }

    /// `count` configs named `{prefix}-{i}` sharing the same tuning.
    pub fn numbered(prefix: &str, count: usize, template: &WorkerConfig) -> Vec<WorkerConfig> {
        (0..count)
            .map(|i| WorkerConfig {
                worker_id: WorkerId::new(format!("{prefix}-{i}")),
                ..template.clone()
            })
            .collect()
    }
}

/// Validate each config and reject duplicate identities.
pub fn validate_all(configs: &[WorkerConfig]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for config in configs {
        config.validate()?;
        if !seen.insert(config.worker_id.as_str()) {
            return Err(ConfigError::DuplicateWorkerId(config.worker_id.to_string()));
        }
    }
    Ok(())
}
