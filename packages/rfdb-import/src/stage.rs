//! A stage: one upstream source feeding one step through a bounded queue.
//!
//! Run protocol:
//! 1. Spawn the fixed worker pool. Worker `i` leases slot `i` once and keeps
//!    it for the whole run (sticky slot assignment).
//! 2. The calling thread is the producer: it pulls batches, checks ticket
//!    order, and pushes them into a `work_ahead_size`-bounded channel. A full
//!    channel blocks the producer (backpressure).
//! 3. Workers pull until the channel disconnects or the control halts.
//!    Errors and panics are reported to the `StageControl`.
//! 4. After every worker has returned (scope join), and only if nothing
//!    failed, the step's `done()` merges all worker state exactly once.
//!
//! On failure no worker state is merged; it is dropped with the step's slots.

use std::panic::{self, AssertUnwindSafe};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender, TrySendError};
use serde::Serialize;

use crate::batch::{Batch, TicketSequencer};
use crate::config::ImportConfig;
use crate::control::{report_worker_panic, SharedStageControl, StageControl};
use crate::error::{ImportError, Result};
use crate::source::BatchSource;
use crate::stats::StepStatsSnapshot;
use crate::step::{BatchProcessor, FinishSummary, Step, WorkerSlot};

/// How long blocked producers and idle workers wait before re-checking the
/// control for cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Outcome of a successful stage run.
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub name: String,
    pub workers: usize,
    pub batches: u64,
    pub relationships: u64,
    pub elapsed_ms: u64,
    /// Time the producer spent waiting on a full work-ahead queue.
    pub producer_blocked_ms: u64,
    pub step: StepStatsSnapshot,
    pub merge: FinishSummary,
}

#[derive(Debug, Default)]
struct ProducerTally {
    batches: u64,
    relationships: u64,
    blocked: Duration,
    exhausted: bool,
}

pub struct Stage<P: BatchProcessor> {
    name: String,
    config: ImportConfig,
    step: Step<P>,
}

impl<P: BatchProcessor> Stage<P> {
    /// The step's pool must match `config.worker_count`.
    pub fn new(name: impl Into<String>, config: ImportConfig, step: Step<P>) -> Result<Self> {
        config.validate()?;
        if step.pool_size() != config.worker_count {
            return Err(ImportError::InvalidConfig(format!(
                "step '{}' has {} worker slots, stage runs {} workers",
                step.name(),
                step.pool_size(),
                config.worker_count
            )));
        }
        Ok(Self {
            name: name.into(),
            config,
            step,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn step(&self) -> &Step<P> {
        &self.step
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    /// Run with a private control and return the underlying failure cause
    /// on error.
    pub fn execute(&self, source: &mut dyn BatchSource) -> Result<StageReport> {
        let control = SharedStageControl::new();
        self.run(source, &control).map_err(|aborted| control.take_failure().unwrap_or(aborted))
    }

    /// Run the stage to completion.
    ///
    /// On failure the cause is reported to `control` and this returns
    /// `ImportError::Aborted`.
    pub fn run(
        &self,
        source: &mut dyn BatchSource,
        control: &dyn StageControl,
    ) -> Result<StageReport> {
        let started = Instant::now();
        let workers = self.config.worker_count;
        tracing::info!(
            "[{}] starting: {} workers, work-ahead {} batches",
            self.name,
            workers,
            self.config.work_ahead_size
        );

        let (tx, rx) = crossbeam_channel::bounded::<Batch>(self.config.work_ahead_size);
        let step = &self.step;

        let tally = thread::scope(|scope| {
            for slot in 0..workers {
                let rx = rx.clone();
                let spawned = thread::Builder::new()
                    .name(format!("{}-{}", step.name(), slot))
                    .spawn_scoped(scope, move || {
                        let result = panic::catch_unwind(AssertUnwindSafe(|| {
                            run_worker(step, WorkerSlot(slot), &rx, control)
                        }));
                        match result {
                            Ok(Ok(())) => {}
                            Ok(Err(e)) => control.report_failure(e),
                            Err(panic_info) => report_worker_panic(control, slot, panic_info),
                        }
                    });
                if let Err(e) = spawned {
                    // already-running workers see the halt on their next poll
                    control.report_failure(ImportError::Io(e));
                    break;
                }
            }
            drop(rx);

            let tally = self.produce(source, &tx, control);
            drop(tx);
            tally
        });

        if !control.is_still_running() {
            tracing::warn!(
                "[{}] aborted after {} batches; nothing merged",
                self.name,
                tally.batches
            );
            return Err(ImportError::Aborted(self.name.clone()));
        }
        if !tally.exhausted {
            control.report_failure(ImportError::Aborted(self.name.clone()));
            return Err(ImportError::Aborted(self.name.clone()));
        }

        let merge = match self.step.done() {
            Ok(summary) => summary,
            Err(e) => {
                control.report_failure(e);
                return Err(ImportError::Aborted(self.name.clone()));
            }
        };

        let report = StageReport {
            name: self.name.clone(),
            workers,
            batches: tally.batches,
            relationships: tally.relationships,
            elapsed_ms: started.elapsed().as_millis() as u64,
            producer_blocked_ms: tally.blocked.as_millis() as u64,
            step: self.step.stats(),
            merge,
        };
        tracing::info!(
            "[{}] done: {} batches, {} relationships in {}ms (producer blocked {}ms)",
            report.name,
            report.batches,
            report.relationships,
            report.elapsed_ms,
            report.producer_blocked_ms
        );
        Ok(report)
    }

    fn produce(
        &self,
        source: &mut dyn BatchSource,
        tx: &Sender<Batch>,
        control: &dyn StageControl,
    ) -> ProducerTally {
        let mut tally = ProducerTally::default();
        let mut sequencer = TicketSequencer::new(self.step.name());

        while control.is_still_running() {
            let batch = match source.next_batch() {
                Ok(Some(batch)) => batch,
                Ok(None) => {
                    tally.exhausted = true;
                    break;
                }
                Err(e) => {
                    control.report_failure(e);
                    break;
                }
            };
            if let Err(e) = self.admit(&mut sequencer, &batch) {
                control.report_failure(e);
                break;
            }

            let relationships = batch.len() as u64;
            match send_with_backpressure(tx, batch, control) {
                Ok(blocked) => {
                    tally.blocked += blocked;
                    tally.batches += 1;
                    tally.relationships += relationships;
                }
                Err(()) => break,
            }
        }
        tally
    }

    fn admit(&self, sequencer: &mut TicketSequencer, batch: &Batch) -> Result<()> {
        sequencer.observe(batch.ticket())?;
        if batch.records().len() > self.config.max_batch_records {
            return Err(ImportError::BatchTooLarge {
                ticket: batch.ticket().0,
                len: batch.records().len(),
                max: self.config.max_batch_records,
            });
        }
        Ok(())
    }
}

/// Push one batch, waiting while the work-ahead window is full. Returns
/// the time spent blocked, or `Err` if the stage halted or every worker
/// is gone.
fn send_with_backpressure(
    tx: &Sender<Batch>,
    batch: Batch,
    control: &dyn StageControl,
) -> std::result::Result<Duration, ()> {
    let mut pending = match tx.try_send(batch) {
        Ok(()) => return Ok(Duration::ZERO),
        Err(TrySendError::Full(batch)) => batch,
        Err(TrySendError::Disconnected(_)) => return Err(()),
    };

    let waited = Instant::now();
    loop {
        match tx.send_timeout(pending, POLL_INTERVAL) {
            Ok(()) => return Ok(waited.elapsed()),
            Err(SendTimeoutError::Timeout(batch)) => {
                if !control.is_still_running() {
                    return Err(());
                }
                pending = batch;
            }
            Err(SendTimeoutError::Disconnected(_)) => return Err(()),
        }
    }
}

fn run_worker<P: BatchProcessor>(
    step: &Step<P>,
    slot: WorkerSlot,
    rx: &Receiver<Batch>,
    control: &dyn StageControl,
) -> Result<()> {
    let mut lease = step.lease(slot)?;
    while control.is_still_running() {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(batch) => step.process_batch(&mut lease, &batch)?,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

// ── Tests ──────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{RelationshipRecord, Ticket};
    use crate::source::{RelationshipBatchSource, VecBatchSource};
    use std::sync::atomic::{AtomicU64, Ordering};

    /// Counts relationships per slot; optionally panics on a given start id.
    #[derive(Default)]
    struct TallyProcessor {
        total: AtomicU64,
        finished: AtomicU64,
        panic_on: Option<u64>,
    }

    impl BatchProcessor for TallyProcessor {
        type Local = u64;

        fn create_local(&self, _slot: WorkerSlot) -> u64 {
            0
        }

        fn process(&self, local: &mut u64, batch: &Batch) -> Result<()> {
            for rel in batch.triples() {
                let rel = rel?;
                if Some(rel.start) == self.panic_on {
                    panic!("poison record {}", rel.start);
                }
                *local += 1;
            }
            Ok(())
        }

        fn finish(&self, locals: Vec<(WorkerSlot, u64)>) -> Result<FinishSummary> {
            self.finished.fetch_add(1, Ordering::Relaxed);
            let sum: u64 = locals.iter().map(|(_, n)| n).sum();
            self.total.fetch_add(sum, Ordering::Relaxed);
            Ok(FinishSummary {
                locals: locals.len(),
                items_flushed: sum,
            })
        }
    }

    fn config(workers: usize, work_ahead: usize) -> ImportConfig {
        ImportConfig {
            worker_count: workers,
            work_ahead_size: work_ahead,
            max_batch_records: 30,
            ..ImportConfig::default()
        }
    }

    fn stage(workers: usize, work_ahead: usize, panic_on: Option<u64>) -> Stage<TallyProcessor> {
        let processor = TallyProcessor {
            panic_on,
            ..TallyProcessor::default()
        };
        let step = Step::new("TALLY", processor, workers, 10, 0);
        Stage::new("tally", config(workers, work_ahead), step).unwrap()
    }

    fn records(n: u64) -> impl Iterator<Item = RelationshipRecord> + Send {
        (0..n).map(|i| RelationshipRecord::new(i, 0, i))
    }

    #[test]
    fn test_runs_every_batch_and_merges_once() {
        let stage = stage(4, 2, None);
        let mut source = RelationshipBatchSource::new(records(1_000), 30);

        let report = stage.execute(&mut source).unwrap();
        assert_eq!(report.relationships, 1_000);
        assert_eq!(report.batches, 100);
        assert_eq!(report.workers, 4);
        assert_eq!(report.step.records, 1_000);
        assert_eq!(stage.step().processor().total.load(Ordering::Relaxed), 1_000);
        assert_eq!(stage.step().processor().finished.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_single_worker_tiny_window() {
        let stage = stage(1, 1, None);
        let mut source = RelationshipBatchSource::new(records(95), 30);
        let report = stage.execute(&mut source).unwrap();
        assert_eq!(report.relationships, 95);
        assert_eq!(report.merge.locals, 1);
    }

    #[test]
    fn test_empty_source_still_finishes() {
        let stage = stage(2, 2, None);
        let report = stage.execute(&mut VecBatchSource::default()).unwrap();
        assert_eq!(report.batches, 0);
        assert_eq!(report.merge.locals, 0);
        assert_eq!(stage.step().processor().finished.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_ticket_gap_aborts_without_merge() {
        let stage = stage(2, 4, None);
        let rel = [RelationshipRecord::new(1, 0, 1)];
        let mut source = VecBatchSource::new(vec![
            Batch::from_relationships(Ticket(0), &rel),
            Batch::from_relationships(Ticket(2), &rel),
        ]);

        let err = stage.execute(&mut source).unwrap_err();
        assert!(matches!(err, ImportError::OutOfOrderTicket { ticket: 2, .. }));
        assert_eq!(stage.step().processor().finished.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_oversized_batch_aborts() {
        let stage = stage(1, 1, None);
        let rels: Vec<_> = records(11).collect();
        let mut source = VecBatchSource::new(vec![Batch::from_relationships(Ticket(0), &rels)]);
        let err = stage.execute(&mut source).unwrap_err();
        assert_eq!(err.code(), "BATCH_TOO_LARGE");
    }

    #[test]
    fn test_worker_panic_halts_stage() {
        let stage = stage(3, 2, Some(500));
        let mut source = RelationshipBatchSource::new(records(10_000), 30);

        let err = stage.execute(&mut source).unwrap_err();
        match err {
            ImportError::WorkerPanicked { message, .. } => {
                assert!(message.contains("poison record 500"))
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(stage.step().processor().finished.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_run_reports_into_shared_control() {
        let stage = stage(2, 2, None);
        let control = SharedStageControl::new();
        control.report_failure(ImportError::Aborted("earlier stage".into()));

        let mut source = RelationshipBatchSource::new(records(10), 30);
        let err = stage.run(&mut source, &control).unwrap_err();
        assert!(matches!(err, ImportError::Aborted(_)));
        assert_eq!(stage.step().processor().finished.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_pool_size_mismatch_rejected() {
        let step = Step::new("TALLY", TallyProcessor::default(), 2, 10, 0);
        assert!(Stage::new("tally", config(3, 2), step).is_err());
    }
}
