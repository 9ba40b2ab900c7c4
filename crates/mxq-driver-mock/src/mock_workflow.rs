//! Simulated workflow engine.

use anyhow::Result;
use async_trait::async_trait;
use mxq_core::capabilities::{WorkflowOutcome, WorkflowRunner};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::common::ErrorConfig;

const DEVICE: &str = "workflow_engine";

/// Workflow engine answering pre-set outcomes per workflow name.
///
/// Unknown workflows finish successfully.
#[derive(Debug, Default)]
pub struct MockWorkflowRunner {
    outcomes: Mutex<HashMap<String, WorkflowOutcome>>,
    runs: Mutex<Vec<(String, serde_json::Value)>>,
    aborted: AtomicBool,
    error_config: ErrorConfig,
}

impl MockWorkflowRunner {
    /// Runner answering `WorkflowOutcome::Finished` unless told otherwise.
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer `outcome` whenever `name` runs.
    pub fn with_outcome(self, name: impl Into<String>, outcome: WorkflowOutcome) -> Self {
        self.outcomes.lock().insert(name.into(), outcome);
        self
    }

    /// Inject faults.
    pub fn with_error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    /// Workflows run so far with their parameters.
    pub fn runs(&self) -> Vec<(String, serde_json::Value)> {
        self.runs.lock().clone()
    }

    /// True once `abort` has been called.
    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WorkflowRunner for MockWorkflowRunner {
    async fn run(&self, name: &str, params: &serde_json::Value) -> Result<WorkflowOutcome> {
        self.error_config.check_operation(DEVICE, "run")?;
        self.runs.lock().push((name.to_string(), params.clone()));
        let outcome = self
            .outcomes
            .lock()
            .get(name)
            .cloned()
            .unwrap_or(WorkflowOutcome::Finished);
        tracing::info!(workflow = name, ?outcome, "Workflow ended");
        Ok(outcome)
    }

    async fn abort(&self) -> Result<()> {
        self.aborted.store(true, Ordering::SeqCst);
        Ok(())
    }
}
