//! Stage coordination: failure reporting and cooperative cancellation.
//!
//! Steps never halt the pipeline themselves. They report the cause to the
//! `StageControl`, and every worker and the producer poll
//! `is_still_running()` between batches.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::error::ImportError;

/// Coordination surface a step uses to halt its pipeline.
pub trait StageControl: Send + Sync {
    /// Record a fatal cause and stop the pipeline.
    fn report_failure(&self, cause: ImportError);

    /// False once any failure was reported.
    fn is_still_running(&self) -> bool;
}

/// Shared control for all stages of one pipeline run. The first reported
/// failure wins; later ones are logged and dropped.
#[derive(Debug, Default)]
pub struct SharedStageControl {
    halted: AtomicBool,
    failure: Mutex<Option<ImportError>>,
}

impl SharedStageControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_failed(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Take the recorded failure, leaving the control halted.
    pub fn take_failure(&self) -> Option<ImportError> {
        match self.failure.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    /// Display form of the recorded failure, if any.
    pub fn failure_message(&self) -> Option<String> {
        match self.failure.lock() {
            Ok(slot) => slot.as_ref().map(ToString::to_string),
            Err(poisoned) => poisoned.into_inner().as_ref().map(ToString::to_string),
        }
    }
}

impl StageControl for SharedStageControl {
    fn report_failure(&self, cause: ImportError) {
        let mut slot = match self.failure.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        if slot.is_none() && !self.halted.load(Ordering::Acquire) {
            tracing::warn!("stage failure [{}]: {}", cause.code(), cause);
            *slot = Some(cause);
        } else {
            tracing::debug!("secondary failure ignored [{}]: {}", cause.code(), cause);
        }
        self.halted.store(true, Ordering::Release);
    }

    fn is_still_running(&self) -> bool {
        !self.halted.load(Ordering::Acquire)
    }
}

/// Turn a caught worker panic into a failure on `control`.
pub fn report_worker_panic(
    control: &dyn StageControl,
    slot: usize,
    panic_info: Box<dyn Any + Send>,
) {
    let message = if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    control.report_failure(ImportError::WorkerPanicked { slot, message });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_first_failure_wins() {
        let control = SharedStageControl::new();
        assert!(control.is_still_running());

        control.report_failure(ImportError::SinkApplyFailure("first".into()));
        control.report_failure(ImportError::Aborted("second".into()));

        assert!(!control.is_still_running());
        assert!(control.has_failed());
        let failure = control.take_failure().unwrap();
        assert_eq!(failure.code(), "SINK_APPLY_FAILURE");
        assert!(control.take_failure().is_none());
        assert!(!control.is_still_running());
    }

    #[test]
    fn test_panic_payload_becomes_failure() {
        let control = SharedStageControl::new();
        let caught = std::panic::catch_unwind(|| panic!("worker exploded")).unwrap_err();
        report_worker_panic(&control, 3, caught);

        let msg = control.failure_message().unwrap();
        assert!(msg.contains("Worker 3 panicked"));
        assert!(msg.contains("worker exploded"));
    }

    #[test]
    fn test_concurrent_reports_keep_one() {
        let control = Arc::new(SharedStageControl::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let control = Arc::clone(&control);
                thread::spawn(move || {
                    control.report_failure(ImportError::UnknownNode(i));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(matches!(control.take_failure(), Some(ImportError::UnknownNode(_))));
        assert!(control.take_failure().is_none());
    }
}
