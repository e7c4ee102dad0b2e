//! The relationship counting step.
//!
//! Terminal step of the counts stage: it consumes batches of packed
//! `(start, type, end)` triples, feeds each one to the calling worker's
//! aggregator, and when the stage completes drains every aggregator into
//! the counts sink. Nothing flows downstream.

use std::sync::Arc;

use rayon::prelude::*;

use crate::aggregator::{DrainSummary, RelationshipCountsAggregator};
use crate::batch::Batch;
use crate::config::{ImportConfig, MergeMode};
use crate::error::Result;
use crate::labels::NodeLabelLookup;
use crate::sink::CountsSink;
use crate::stage::Stage;
use crate::step::{BatchProcessor, FinishSummary, Step, WorkerSlot};

/// Name the counting step reports under.
pub const COUNT_STEP_NAME: &str = "COUNT";

pub struct RelationshipCountsProcessor {
    labels: Arc<dyn NodeLabelLookup>,
    sink: Arc<dyn CountsSink>,
    config: ImportConfig,
}

pub type ProcessRelationshipCountsStep = Step<RelationshipCountsProcessor>;

impl RelationshipCountsProcessor {
    pub fn new(
        config: ImportConfig,
        labels: Arc<dyn NodeLabelLookup>,
        sink: Arc<dyn CountsSink>,
    ) -> Self {
        Self { labels, sink, config }
    }

    fn drain_sequential(
        &self,
        aggregators: Vec<(WorkerSlot, RelationshipCountsAggregator)>,
    ) -> Result<Vec<DrainSummary>> {
        aggregators
            .into_iter()
            .map(|(_, mut agg)| agg.done(&*self.sink))
            .collect()
    }

    fn drain_parallel(
        &self,
        aggregators: Vec<(WorkerSlot, RelationshipCountsAggregator)>,
        threads: usize,
    ) -> Result<Vec<DrainSummary>> {
        if threads <= 1 || aggregators.len() <= 1 {
            return self.drain_sequential(aggregators);
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("{COUNT_STEP_NAME} merge {i}"))
            .build()?;

        let sink = &*self.sink;
        pool.install(|| {
            aggregators
                .into_par_iter()
                .map(|(_, mut agg)| agg.done(sink))
                .collect()
        })
    }
}

impl BatchProcessor for RelationshipCountsProcessor {
    type Local = RelationshipCountsAggregator;

    fn create_local(&self, slot: WorkerSlot) -> RelationshipCountsAggregator {
        RelationshipCountsAggregator::new(
            format!("{COUNT_STEP_NAME} {slot}"),
            Arc::clone(&self.labels),
            &self.config,
        )
    }

    fn process(&self, aggregator: &mut RelationshipCountsAggregator, batch: &Batch) -> Result<()> {
        for rel in batch.triples() {
            let rel = rel?;
            aggregator.process(rel.start, rel.rel_type, rel.end)?;
        }
        Ok(())
    }

    fn finish(
        &self,
        aggregators: Vec<(WorkerSlot, RelationshipCountsAggregator)>,
    ) -> Result<FinishSummary> {
        let count = aggregators.len();
        let summaries = match self.config.merge_mode {
            MergeMode::Sequential => self.drain_sequential(aggregators)?,
            MergeMode::Parallel { threads } => self.drain_parallel(aggregators, threads)?,
        };

        let keys: u64 = summaries.iter().map(|s| s.keys_applied as u64).sum();
        let relationships: u64 = summaries.iter().map(|s| s.relationships).sum();
        tracing::info!(
            "[{}] merged {} aggregators: {} relationships, {} count deltas",
            COUNT_STEP_NAME,
            count,
            relationships,
            keys
        );
        Ok(FinishSummary {
            locals: count,
            items_flushed: keys,
        })
    }
}

/// Build the counting step for a fixed worker pool.
pub fn relationship_counts_step(
    config: &ImportConfig,
    labels: Arc<dyn NodeLabelLookup>,
    sink: Arc<dyn CountsSink>,
) -> ProcessRelationshipCountsStep {
    Step::new(
        COUNT_STEP_NAME,
        RelationshipCountsProcessor::new(config.clone(), labels, sink),
        config.worker_count,
        config.moving_average_size,
        config.progress_interval,
    )
}

/// Build a stage whose terminal step counts relationships into `sink`.
pub fn relationship_counts_stage(
    config: ImportConfig,
    labels: Arc<dyn NodeLabelLookup>,
    sink: Arc<dyn CountsSink>,
) -> Result<Stage<RelationshipCountsProcessor>> {
    config.validate()?;
    let step = relationship_counts_step(&config, labels, sink);
    Stage::new("Relationship counts", config, step)
}

// ── Tests ──────────────────────────────────────────────────────────
