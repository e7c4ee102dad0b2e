//! System resource detection and adaptive tuning for imports.
//!
//! Detects available RAM and CPU cores, then computes the worker pool size,
//! work-ahead window and batch cap for a counting stage. Stateless: each
//! call to `ImportTuning::detect()` re-probes the system.

use sysinfo::{MemoryRefreshKind, RefreshKind, System};

use crate::config::MAX_WORKERS;

// ── Constants ───────────────────────────────────────────────────────

const MB: usize = 1024 * 1024;
const GB: u64 = 1024 * 1024 * 1024;

/// Bytes held by one packed relationship (three u64 values).
const BYTES_PER_RELATIONSHIP: usize = 3 * 8;

/// Queued-batch memory floor (16 MB).
const QUEUE_BYTES_MIN: usize = 16 * MB;

/// Queued-batch memory ceiling (512 MB).
const QUEUE_BYTES_MAX: usize = 512 * MB;

/// Fraction of available memory the work-ahead queue may hold.
const QUEUE_FRACTION: f64 = 0.05;

/// Relationships per batch when memory allows.
const DEFAULT_BATCH_RELATIONSHIPS: usize = 10_000;

// ── SystemResources ─────────────────────────────────────────────────

/// Snapshot of detected hardware resources.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total physical RAM in bytes.
    pub total_memory_bytes: u64,
    /// Available (re-usable) RAM in bytes.
    pub available_memory_bytes: u64,
    /// Logical CPU count.
    pub cpu_count: usize,
}

impl SystemResources {
    /// Probe the current system for RAM and CPU information.
    pub fn detect() -> Self {
        let mut sys = System::new_with_specifics(
            RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
        );
        sys.refresh_memory();

        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);

        Self {
            total_memory_bytes: sys.total_memory(),
            available_memory_bytes: sys.available_memory(),
            cpu_count,
        }
    }
}

// ── ImportTuning ────────────────────────────────────────────────────

/// Stage sizing derived from system resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportTuning {
    /// Size of the fixed worker pool.
    pub worker_count: usize,
    /// Batches the producer may queue ahead of the workers.
    pub work_ahead_size: usize,
    /// Maximum packed values per batch (always a multiple of 3).
    pub max_batch_records: usize,
}

impl ImportTuning {
    /// Probe the system and derive a tuning.
    pub fn detect() -> Self {
        Self::from_resources(&SystemResources::detect())
    }

    /// Compute a tuning from detected resources.
    ///
    /// Heuristics:
    /// - `worker_count`: RAM < 2 GB -> 1, else `clamp(cpu - 1, 1, MAX_WORKERS)`
    ///   (one core stays with the producer).
    /// - batch size: 10 000 relationships, 2 500 when RAM < 2 GB.
    /// - `work_ahead_size`: `clamp(available * 0.05, 16 MB, 512 MB) / batch_bytes`,
    ///   at least twice the worker count.
    pub fn from_resources(res: &SystemResources) -> Self {
        let low_memory = res.total_memory_bytes < 2 * GB;

        let worker_count = if low_memory {
            1
        } else {
            res.cpu_count.saturating_sub(1).clamp(1, MAX_WORKERS)
        };

        let batch_relationships = if low_memory {
            DEFAULT_BATCH_RELATIONSHIPS / 4
        } else {
            DEFAULT_BATCH_RELATIONSHIPS
        };
        let batch_bytes = batch_relationships * BYTES_PER_RELATIONSHIP;

        let raw_bytes = (res.available_memory_bytes as f64 * QUEUE_FRACTION) as usize;
        let queue_bytes = raw_bytes.clamp(QUEUE_BYTES_MIN, QUEUE_BYTES_MAX);
        let work_ahead_size = (queue_bytes / batch_bytes).max(worker_count * 2);

        Self {
            worker_count,
            work_ahead_size,
            max_batch_records: batch_relationships * 3,
        }
    }
}

impl Default for ImportTuning {
    /// Conservative values for tests and unknown environments.
    fn default() -> Self {
        Self {
            worker_count: 4,
            work_ahead_size: 20,
            max_batch_records: DEFAULT_BATCH_RELATIONSHIPS * 3,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_resources(total_gb: f64, available_gb: f64, cpus: usize) -> SystemResources {
        SystemResources {
            total_memory_bytes: (total_gb * GB as f64) as u64,
            available_memory_bytes: (available_gb * GB as f64) as u64,
            cpu_count: cpus,
        }
    }

    #[test]
    fn test_system_resources_detection() {
        let res = SystemResources::detect();
        assert!(res.cpu_count >= 1, "cpu count must be at least 1");
    }

    #[test]
    fn test_low_memory_uses_single_worker() {
        let tuning = ImportTuning::from_resources(&make_resources(1.0, 0.5, 8));
        assert_eq!(tuning.worker_count, 1);
        assert_eq!(tuning.max_batch_records, 2_500 * 3);
        assert!(tuning.work_ahead_size >= 2);
    }

    #[test]
    fn test_worker_count_leaves_core_for_producer() {
        let tuning = ImportTuning::from_resources(&make_resources(16.0, 8.0, 8));
        assert_eq!(tuning.worker_count, 7);
    }

    #[test]
    fn test_worker_count_capped() {
        let tuning = ImportTuning::from_resources(&make_resources(512.0, 256.0, 1024));
        assert_eq!(tuning.worker_count, MAX_WORKERS);
    }

    #[test]
    fn test_work_ahead_bounded_by_queue_ceiling() {
        let tuning = ImportTuning::from_resources(&make_resources(512.0, 256.0, 4));
        let batch_bytes = DEFAULT_BATCH_RELATIONSHIPS * BYTES_PER_RELATIONSHIP;
        assert_eq!(tuning.work_ahead_size, QUEUE_BYTES_MAX / batch_bytes);
    }

    #[test]
    fn test_batch_cap_is_whole_triples() {
        for (total, avail, cpus) in [(1.0, 0.2, 1), (8.0, 4.0, 4), (64.0, 60.0, 32)] {
            let tuning = ImportTuning::from_resources(&make_resources(total, avail, cpus));
            assert_eq!(tuning.max_batch_records % 3, 0);
        }
    }
}
