//! Throughput tracking for pipeline steps.
//!
//! Counters are atomics so any worker can record a batch without
//! coordination; the moving average of recent batch durations sits behind a
//! mutex since the ring buffer isn't atomic. Stats feed progress logging
//! only and never affect correctness.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;

// ── MovingAverage ───────────────────────────────────────────────────

/// Mean of the last `window` samples.
#[derive(Debug, Clone)]
pub struct MovingAverage {
    window: usize,
    samples: VecDeque<u64>,
    sum: u64,
}

impl MovingAverage {
    /// A window of 0 is treated as 1.
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            window,
            samples: VecDeque::with_capacity(window),
            sum: 0,
        }
    }

    pub fn add(&mut self, sample: u64) {
        if self.samples.len() == self.window {
            if let Some(old) = self.samples.pop_front() {
                self.sum -= old;
            }
        }
        self.samples.push_back(sample);
        self.sum += sample;
    }

    /// 0 when no samples were added.
    pub fn average(&self) -> u64 {
        if self.samples.is_empty() {
            0
        } else {
            self.sum / self.samples.len() as u64
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

// ── StepStats ───────────────────────────────────────────────────────

/// Live counters for one step.
#[derive(Debug)]
pub struct StepStats {
    name: String,
    batches: AtomicU64,
    records: AtomicU64,
    busy_micros: AtomicU64,
    batch_micros: Mutex<MovingAverage>,
    progress_interval: u64,
    started_at: Instant,
}

/// Point-in-time copy of `StepStats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepStatsSnapshot {
    pub name: String,
    pub batches: u64,
    pub records: u64,
    /// Moving average of recent batch processing times.
    pub avg_batch_micros: u64,
    /// Total time workers spent inside the step, summed over workers.
    pub busy_micros: u64,
    /// Relationships per wall-clock second since the step was created.
    pub records_per_sec: f64,
}

impl StepStats {
    pub fn new(
        name: impl Into<String>,
        moving_average_size: usize,
        progress_interval: u64,
    ) -> Self {
        Self {
            name: name.into(),
            batches: AtomicU64::new(0),
            records: AtomicU64::new(0),
            busy_micros: AtomicU64::new(0),
            batch_micros: Mutex::new(MovingAverage::new(moving_average_size)),
            progress_interval,
            started_at: Instant::now(),
        }
    }

    /// Record one processed batch of `records` relationships.
    pub fn record_batch(&self, records: u64, elapsed: Duration) {
        let micros = elapsed.as_micros() as u64;
        let batches = self.batches.fetch_add(1, Ordering::Relaxed) + 1;
        self.records.fetch_add(records, Ordering::Relaxed);
        self.busy_micros.fetch_add(micros, Ordering::Relaxed);

        if let Ok(mut avg) = self.batch_micros.lock() {
            avg.add(micros);
        }

        if self.progress_interval > 0 && batches % self.progress_interval == 0 {
            let snap = self.snapshot();
            tracing::info!(
                "[{}] {} batches, {} relationships, avg {}us/batch, {:.0} rel/s",
                snap.name,
                snap.batches,
                snap.records,
                snap.avg_batch_micros,
                snap.records_per_sec
            );
        }
    }

    pub fn batches(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    pub fn records(&self) -> u64 {
        self.records.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StepStatsSnapshot {
        let records = self.records();
        let elapsed = self.started_at.elapsed().as_secs_f64();
        let avg_batch_micros = self.batch_micros.lock().map(|a| a.average()).unwrap_or(0);
        StepStatsSnapshot {
            name: self.name.clone(),
            batches: self.batches(),
            records,
            avg_batch_micros,
            busy_micros: self.busy_micros.load(Ordering::Relaxed),
            records_per_sec: if elapsed > 0.0 { records as f64 / elapsed } else { 0.0 },
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
