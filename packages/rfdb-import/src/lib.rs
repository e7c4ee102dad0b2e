//! rfdb-import: parallel relationship-count aggregation for graph bulk import.
//!
//! A stage pulls ticketed batches of `(start, type, end)` triples from a
//! source and fans them out to a fixed pool of workers. Each worker owns a
//! private aggregator for its slot; when the stage completes, every
//! aggregator is drained into a shared counts sink exactly once.
//!
//! ```text
//! BatchSource ──▶ bounded queue ──▶ worker slot 0 ─┐
//!                                 ├▶ worker slot 1 ─┼─ done() ─▶ CountsSink
//!                                 └▶ worker slot N ─┘
//! ```

pub mod aggregator;
pub mod batch;
pub mod config;
pub mod control;
pub mod count_step;
pub mod counts;
pub mod error;
pub mod labels;
pub mod logging;
pub mod pipeline;
pub mod resource;
pub mod sink;
pub mod source;
pub mod stage;
pub mod stats;
pub mod step;

pub use aggregator::{AggregatorState, DrainSummary, RelationshipCountsAggregator};
pub use batch::{Batch, BatchBuilder, RelationshipRecord, Ticket, TicketSequencer};
pub use config::{ImportConfig, MergeMode, MAX_WORKERS};
pub use control::{SharedStageControl, StageControl};
pub use count_step::{
    relationship_counts_stage, relationship_counts_step, ProcessRelationshipCountsStep,
    RelationshipCountsProcessor, COUNT_STEP_NAME,
};
pub use counts::{CountsKey, LabelSelector, TypeSelector};
pub use error::{ImportError, Result};
pub use labels::{LabelId, NodeLabelCache, NodeLabelLookup};
pub use pipeline::{Pipeline, PipelineReport};
pub use resource::{ImportTuning, SystemResources};
pub use sink::{CountsSink, FileCountsSink, InMemoryCountsSink};
pub use source::{BatchSource, RelationshipBatchSource, VecBatchSource};
pub use stage::{Stage, StageReport};
pub use step::{BatchProcessor, FinishSummary, Step, WorkerSlot};
