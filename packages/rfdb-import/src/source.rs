//! Upstream batch producers.
//!
//! A source hands the stage ticketed batches and then reports end-of-stream
//! once with `Ok(None)`. Calls after that keep returning `Ok(None)`.

use std::collections::VecDeque;

use crate::batch::{Batch, BatchBuilder, RelationshipRecord};
use crate::error::Result;

pub trait BatchSource: Send {
    fn next_batch(&mut self) -> Result<Option<Batch>>;
}

/// Reads relationships from an iterator and packs them into capped batches
/// with tickets 0, 1, 2, ...
pub struct RelationshipBatchSource<I> {
    records: I,
    builder: BatchBuilder,
    exhausted: bool,
}

impl<I> RelationshipBatchSource<I>
where
    I: Iterator<Item = RelationshipRecord> + Send,
{
    pub fn new(records: I, max_batch_records: usize) -> Self {
        Self {
            records,
            builder: BatchBuilder::new(max_batch_records),
            exhausted: false,
        }
    }
}

impl<I> BatchSource for RelationshipBatchSource<I>
where
    I: Iterator<Item = RelationshipRecord> + Send,
{
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        if self.exhausted {
            return Ok(None);
        }
        for rel in self.records.by_ref() {
            if let Some(batch) = self.builder.push(&rel) {
                return Ok(Some(batch));
            }
        }
        self.exhausted = true;
        Ok(self.builder.flush())
    }
}

/// Replays pre-built batches as given, tickets untouched.
#[derive(Debug, Default)]
pub struct VecBatchSource {
    batches: VecDeque<Batch>,
}

impl VecBatchSource {
    pub fn new(batches: Vec<Batch>) -> Self {
        Self {
            batches: batches.into(),
        }
    }
}

impl BatchSource for VecBatchSource {
    fn next_batch(&mut self) -> Result<Option<Batch>> {
        Ok(self.batches.pop_front())
    }
}
