//! Error types for the import pipeline

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ImportError>;

#[derive(Error, Debug)]
pub enum ImportError {
    #[error("{kind} id {id} exceeds configured maximum {high}")]
    ConfigurationBoundsExceeded {
        kind: &'static str,
        id: u64,
        high: u64,
    },

    #[error("Step '{step}' received ticket {ticket} after ticket {last}")]
    OutOfOrderTicket { step: String, ticket: u64, last: u64 },

    #[error("Aggregator {owner} drained more than once")]
    DoubleDrain { owner: String },

    #[error("Counts sink failed to apply delta: {0}")]
    SinkApplyFailure(String),

    #[error("Node {0} has no entry in the label lookup")]
    UnknownNode(u64),

    #[error("Batch {ticket} has {len} values, not a whole number of triples")]
    MalformedBatch { ticket: u64, len: usize },

    #[error("Batch {ticket} has {len} values (limit {max})")]
    BatchTooLarge { ticket: u64, len: usize, max: usize },

    #[error("Worker slot {slot} is outside the pool of {pool_size}")]
    UnknownWorkerSlot { slot: usize, pool_size: usize },

    #[error("Worker slot {0} is already leased")]
    SlotBusy(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Worker {slot} panicked: {message}")]
    WorkerPanicked { slot: usize, message: String },

    #[error("Stage '{0}' was aborted")]
    Aborted(String),

    #[error("Merge thread pool failed to start: {0}")]
    MergePool(#[from] rayon::ThreadPoolBuildError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ImportError {
    /// Stable error code for reports and logs
    pub fn code(&self) -> &'static str {
        match self {
            ImportError::ConfigurationBoundsExceeded { .. } => "CONFIGURATION_BOUNDS_EXCEEDED",
            ImportError::OutOfOrderTicket { .. } => "OUT_OF_ORDER_TICKET",
            ImportError::DoubleDrain { .. } => "DOUBLE_DRAIN",
            ImportError::SinkApplyFailure(_) => "SINK_APPLY_FAILURE",
            ImportError::UnknownNode(_) => "UNKNOWN_NODE",
            ImportError::MalformedBatch { .. } => "MALFORMED_BATCH",
            ImportError::BatchTooLarge { .. } => "BATCH_TOO_LARGE",
            ImportError::UnknownWorkerSlot { .. } => "UNKNOWN_WORKER_SLOT",
            ImportError::SlotBusy(_) => "SLOT_BUSY",
            ImportError::InvalidConfig(_) => "INVALID_CONFIG",
            ImportError::WorkerPanicked { .. } => "WORKER_PANICKED",
            ImportError::Aborted(_) => "ABORTED",
            ImportError::MergePool(_) => "MERGE_POOL_UNAVAILABLE",
            _ => "INTERNAL_ERROR",
        }
    }

    /// Every import error halts the stage; there is no per-batch retry.
    pub fn is_fatal(&self) -> bool {
        true
    }
}
