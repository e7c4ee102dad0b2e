//! Configuration for counting stages.
//!
//! `ImportConfig` carries the knobs a stage consumes: the work-ahead window,
//! the throughput smoothing window, the label/type bounds that size dense
//! accumulation arenas, and the fixed worker pool size.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ImportError, Result};
use crate::resource::ImportTuning;

/// Upper bound on the worker pool of a single stage.
pub const MAX_WORKERS: usize = 256;

/// How per-worker aggregators are merged into the sink at stage completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// One thread drains every aggregator in slot order.
    Sequential,
    /// Aggregators drain concurrently on a dedicated rayon pool.
    Parallel { threads: usize },
}

impl Default for MergeMode {
    fn default() -> Self {
        MergeMode::Sequential
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    /// Batches the producer may queue ahead of the workers.
    pub work_ahead_size: usize,
    /// Number of recent batch durations averaged for throughput reporting.
    pub moving_average_size: usize,
    /// Highest label id any node may carry (inclusive).
    pub high_label_id: u32,
    /// Highest relationship type id any record may carry (inclusive).
    pub high_relationship_type_id: u32,
    /// Size of the fixed worker pool.
    pub worker_count: usize,
    /// Maximum packed values per batch; a multiple of 3.
    pub max_batch_records: usize,
    /// Largest dense arena (in cells) an aggregator allocates before it
    /// falls back to a sparse map.
    pub dense_cell_limit: usize,
    /// Batches between progress log lines (0 disables progress logging).
    pub progress_interval: u64,
    pub merge_mode: MergeMode,
}

impl Default for ImportConfig {
    fn default() -> Self {
        let tuning = ImportTuning::default();
        Self {
            work_ahead_size: tuning.work_ahead_size,
            moving_average_size: 100,
            high_label_id: 0,
            high_relationship_type_id: 0,
            worker_count: tuning.worker_count,
            max_batch_records: tuning.max_batch_records,
            dense_cell_limit: 1 << 20,
            progress_interval: 1_000,
            merge_mode: MergeMode::Sequential,
        }
    }
}

impl ImportConfig {
    /// Config with the given label/type bounds and defaults elsewhere.
    pub fn with_bounds(high_label_id: u32, high_relationship_type_id: u32) -> Self {
        Self {
            high_label_id,
            high_relationship_type_id,
            ..Self::default()
        }
    }

    /// Replace pool and queue sizing with values derived from the host.
    pub fn tuned(mut self, tuning: &ImportTuning) -> Self {
        self.worker_count = tuning.worker_count;
        self.work_ahead_size = tuning.work_ahead_size;
        self.max_batch_records = tuning.max_batch_records;
        self
    }

    /// Load a config from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: ImportConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.work_ahead_size == 0 {
            return Err(ImportError::InvalidConfig("work_ahead_size must be > 0".into()));
        }
        if self.moving_average_size == 0 {
            return Err(ImportError::InvalidConfig("moving_average_size must be > 0".into()));
        }
        if self.worker_count == 0 || self.worker_count > MAX_WORKERS {
            return Err(ImportError::InvalidConfig(format!(
                "worker_count must be in 1..={MAX_WORKERS}, got {}",
                self.worker_count
            )));
        }
        if self.max_batch_records == 0 || self.max_batch_records % 3 != 0 {
            return Err(ImportError::InvalidConfig(format!(
                "max_batch_records must be a positive multiple of 3, got {}",
                self.max_batch_records
            )));
        }
        if let MergeMode::Parallel { threads } = self.merge_mode {
            if threads == 0 {
                return Err(ImportError::InvalidConfig("merge threads must be > 0".into()));
            }
        }
        Ok(())
    }
}
