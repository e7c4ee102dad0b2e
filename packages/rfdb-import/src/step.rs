//! Generic batch step with per-worker-slot local state.
//!
//! A `Step` owns a fixed array of worker slots sized at construction. A
//! worker leases its slot once for the whole run and keeps the lease across
//! every batch it processes, so the hot path touches only memory owned by
//! that worker. Slot identity is assigned by the stage, not derived from OS
//! thread identity.
//!
//! The per-slot mutex is taken once per lease, never per batch; a second
//! concurrent lease of the same slot fails with `SlotBusy` instead of
//! blocking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};
use std::time::Instant;

use serde::Serialize;

use crate::batch::{Batch, Ticket};
use crate::error::{ImportError, Result};
use crate::stats::{StepStats, StepStatsSnapshot};

/// Scheduler-assigned worker identity in `0..pool_size`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerSlot(pub usize);

impl std::fmt::Display for WorkerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

// ── BatchProcessor ──────────────────────────────────────────────────

/// What a step does with its batches.
///
/// Send + Sync required: one processor is shared by every worker of a stage.
pub trait BatchProcessor: Send + Sync {
    /// State owned by one worker slot for the lifetime of a run.
    type Local: Send;

    /// Create a slot's state; called lazily on the slot's first batch.
    fn create_local(&self, slot: WorkerSlot) -> Self::Local;

    /// Consume one batch into the calling slot's state.
    fn process(&self, local: &mut Self::Local, batch: &Batch) -> Result<()>;

    /// Merge every slot's state. Called exactly once, after all workers
    /// returned, and never on an aborted run.
    fn finish(&self, locals: Vec<(WorkerSlot, Self::Local)>) -> Result<FinishSummary>;
}

/// Outcome of `BatchProcessor::finish`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FinishSummary {
    /// Slot states merged.
    pub locals: usize,
    /// Items the merge wrote downstream (e.g. count keys applied).
    pub items_flushed: u64,
}

// ── WorkerSlots ─────────────────────────────────────────────────────

struct SlotCell<L> {
    local: Option<L>,
    last_ticket: Option<Ticket>,
}

/// Fixed array of per-worker state cells.
pub struct WorkerSlots<L> {
    cells: Box<[Mutex<SlotCell<L>>]>,
}

/// Exclusive claim on one worker slot.
pub struct SlotLease<'a, L> {
    slot: WorkerSlot,
    cell: MutexGuard<'a, SlotCell<L>>,
}

impl<L> WorkerSlots<L> {
    pub fn new(pool_size: usize) -> Self {
        let cells = (0..pool_size)
            .map(|_| {
                Mutex::new(SlotCell {
                    local: None,
                    last_ticket: None,
                })
            })
            .collect();
        Self { cells }
    }

    pub fn pool_size(&self) -> usize {
        self.cells.len()
    }

    pub fn lease(&self, slot: WorkerSlot) -> Result<SlotLease<'_, L>> {
        let cell = self.cell(slot)?;
        let guard = match cell.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::WouldBlock) => return Err(ImportError::SlotBusy(slot.0)),
            // a worker panicked while holding the lease; the run is already failed
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
        };
        Ok(SlotLease { slot, cell: guard })
    }

    /// Remove every created local state, in slot order. Fails with
    /// `SlotBusy` if a lease is still held, leaving every slot untouched.
    pub fn take_all(&self) -> Result<Vec<(WorkerSlot, L)>> {
        let mut leases = (0..self.cells.len())
            .map(|idx| self.lease(WorkerSlot(idx)))
            .collect::<Result<Vec<_>>>()?;
        Ok(leases
            .iter_mut()
            .filter_map(|lease| lease.cell.local.take().map(|local| (lease.slot, local)))
            .collect())
    }

    fn cell(&self, slot: WorkerSlot) -> Result<&Mutex<SlotCell<L>>> {
        self.cells.get(slot.0).ok_or(ImportError::UnknownWorkerSlot {
            slot: slot.0,
            pool_size: self.cells.len(),
        })
    }
}

impl<L> SlotLease<'_, L> {
    pub fn slot(&self) -> WorkerSlot {
        self.slot
    }

    /// The slot's state, if it processed a batch yet.
    pub fn local(&self) -> Option<&L> {
        self.cell.local.as_ref()
    }

    pub fn last_ticket(&self) -> Option<Ticket> {
        self.cell.last_ticket
    }
}

// ── Step ────────────────────────────────────────────────────────────

/// A pipeline step: per-slot state, per-slot ticket order, one finish.
pub struct Step<P: BatchProcessor> {
    name: String,
    processor: P,
    slots: WorkerSlots<P::Local>,
    stats: StepStats,
    finished: AtomicBool,
}

impl<P: BatchProcessor> Step<P> {
    pub fn new(
        name: impl Into<String>,
        processor: P,
        pool_size: usize,
        moving_average_size: usize,
        progress_interval: u64,
    ) -> Self {
        let name = name.into();
        Self {
            stats: StepStats::new(name.clone(), moving_average_size, progress_interval),
            name,
            processor,
            slots: WorkerSlots::new(pool_size),
            finished: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn processor(&self) -> &P {
        &self.processor
    }

    pub fn pool_size(&self) -> usize {
        self.slots.pool_size()
    }

    pub fn stats(&self) -> StepStatsSnapshot {
        self.stats.snapshot()
    }

    /// Claim `slot` for the calling worker. Hold the lease for the run.
    pub fn lease(&self, slot: WorkerSlot) -> Result<SlotLease<'_, P::Local>> {
        self.slots.lease(slot)
    }

    /// Process one batch on the leased slot.
    ///
    /// Tickets seen by one slot must strictly increase; the slot's state is
    /// created on its first batch.
    pub fn process_batch(
        &self,
        lease: &mut SlotLease<'_, P::Local>,
        batch: &Batch,
    ) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(self.double_drain());
        }
        if let Some(last) = lease.cell.last_ticket {
            if batch.ticket() <= last {
                return Err(ImportError::OutOfOrderTicket {
                    step: self.name.clone(),
                    ticket: batch.ticket().0,
                    last: last.0,
                });
            }
        }
        lease.cell.last_ticket = Some(batch.ticket());

        let start = Instant::now();
        let slot = lease.slot;
        let local = lease
            .cell
            .local
            .get_or_insert_with(|| self.processor.create_local(slot));
        self.processor.process(local, batch)?;
        self.stats.record_batch(batch.len() as u64, start.elapsed());
        Ok(())
    }

    /// Finish the step: hand every slot's state to the processor exactly
    /// once. A second call is a `DoubleDrain`. While a lease is outstanding
    /// this fails with `SlotBusy` and the step stays unfinished.
    pub fn done(&self) -> Result<FinishSummary> {
        if self.finished.load(Ordering::Acquire) {
            return Err(self.double_drain());
        }
        let locals = self.slots.take_all()?;
        if self.finished.swap(true, Ordering::AcqRel) {
            return Err(self.double_drain());
        }
        tracing::debug!("[{}] finishing {} worker states", self.name, locals.len());
        self.processor.finish(locals)
    }

    pub fn is_done(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn double_drain(&self) -> ImportError {
        ImportError::DoubleDrain {
            owner: format!("step '{}'", self.name),
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────
