//! Ordered execution of several stages under one control.
//!
//! Stages run one after another; every stage polls the same
//! `SharedStageControl`, so a failure anywhere halts the rest of the
//! pipeline and the first cause is what `run` returns.

use std::time::Instant;

use serde::Serialize;

use crate::control::SharedStageControl;
use crate::error::Result;
use crate::source::BatchSource;
use crate::stage::{Stage, StageReport};
use crate::step::BatchProcessor;

/// A stage already paired with its upstream source.
pub trait PipelineStage: Send {
    fn name(&self) -> &str;
    fn run(&mut self, control: &SharedStageControl) -> Result<StageReport>;
}

struct BoundStage<P: BatchProcessor, S> {
    stage: Stage<P>,
    source: S,
}

impl<P, S> PipelineStage for BoundStage<P, S>
where
    P: BatchProcessor,
    S: BatchSource,
{
    fn name(&self) -> &str {
        self.stage.name()
    }

    fn run(&mut self, control: &SharedStageControl) -> Result<StageReport> {
        self.stage.run(&mut self.source, control)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub name: String,
    pub elapsed_ms: u64,
    pub stages: Vec<StageReport>,
}

impl PipelineReport {
    pub fn relationships(&self) -> u64 {
        self.stages.iter().map(|s| s.relationships).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

pub struct Pipeline {
    name: String,
    stages: Vec<Box<dyn PipelineStage>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
        }
    }

    pub fn add_stage<P, S>(mut self, stage: Stage<P>, source: S) -> Self
    where
        P: BatchProcessor + 'static,
        S: BatchSource + 'static,
    {
        self.stages.push(Box::new(BoundStage { stage, source }));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Run every stage in order. Returns the first failure's cause; stages
    /// after it never start.
    pub fn run(mut self) -> Result<PipelineReport> {
        let started = Instant::now();
        let control = SharedStageControl::new();
        let mut reports = Vec::with_capacity(self.stages.len());

        for stage in &mut self.stages {
            match stage.run(&control) {
                Ok(report) => reports.push(report),
                Err(aborted) => {
                    let cause = control.take_failure().unwrap_or(aborted);
                    tracing::error!(
                        "[{}] stopped in stage '{}' after {} completed: {}",
                        self.name,
                        stage.name(),
                        reports.len(),
                        cause
                    );
                    return Err(cause);
                }
            }
        }

        let report = PipelineReport {
            name: self.name,
            elapsed_ms: started.elapsed().as_millis() as u64,
            stages: reports,
        };
        tracing::info!(
            "[{}] {} stages complete in {}ms",
            report.name,
            report.stages.len(),
            report.elapsed_ms
        );
        Ok(report)
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.stages.iter().map(|s| s.name()).collect();
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &names)
            .finish()
    }
}
