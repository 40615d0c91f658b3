//! The run contract between the executor and task implementations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::devices::DeviceDriver;
use crate::error::ExecutionError;
use crate::model::TaskOutput;

/// Everything an implementation gets to work with for one run.
pub struct RunContext {
    pub task_id: Uuid,
    /// Resolved task inputs (template defaults merged with node overrides).
    pub inputs: serde_json::Value,
    /// Drivers of the devices allocated to this task, keyed by device id.
    pub devices: HashMap<Uuid, Arc<dyn DeviceDriver>>,
    /// Sample position names reserved for this task.
    pub positions: Vec<String>,
    pub artifacts: Arc<dyn ArtifactStore>,
    cancelled: watch::Receiver<bool>,
}

impl RunContext {
    pub fn new(
        task_id: Uuid,
        inputs: serde_json::Value,
        devices: HashMap<Uuid, Arc<dyn DeviceDriver>>,
        positions: Vec<String>,
        artifacts: Arc<dyn ArtifactStore>,
        cancelled: watch::Receiver<bool>,
    ) -> Self {
        Self {
            task_id,
            inputs,
            devices,
            positions,
            artifacts,
            cancelled,
        }
    }

    /// Driver of one allocated device.
    pub fn device(&self, id: Uuid) -> Option<Arc<dyn DeviceDriver>> {
        self.devices.get(&id).cloned()
    }

    /// Has cancellation been requested for this run?
    ///
    /// Cancellation is cooperative: long-running implementations should check
    /// this between steps, or select on `cancel_signal()`.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// A receiver that flips to `true` when cancellation is requested.
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancelled.clone()
    }
}

/// How a run ended, as reported by the implementation itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    Failed,
}

/// Result of one run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Named outputs matching the template's output schema.
    pub outputs: HashMap<String, TaskOutput>,
    /// Reason for a soft failure; `None` on success.
    pub error: Option<String>,
    /// Wall-clock seconds the run took.
    pub execution_time: f64,
    /// Free-form diagnostics kept out of the output schema.
    pub metadata: serde_json::Value,
}

impl RunOutcome {
    pub fn completed(outputs: HashMap<String, TaskOutput>, execution_time: f64) -> Self {
        Self {
            status: RunStatus::Completed,
            outputs,
            error: None,
            execution_time,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn failed(reason: impl Into<String>, execution_time: f64) -> Self {
        Self {
            status: RunStatus::Failed,
            outputs: HashMap::new(),
            error: Some(reason.into()),
            execution_time,
            metadata: serde_json::Value::Null,
        }
    }
}

/// A task implementation resolvable through the registry.
///
/// Implementations return `Ok` with a `Failed` status for domain-level
/// failures (bad measurement, out-of-range reading) and `Err` for
/// infrastructure errors (device unreachable, artifact store down). Both
/// paths feed the same retry machinery.
#[async_trait]
pub trait TaskRunnable: Send + Sync {
    /// Registry key, unique per implementation.
    fn key(&self) -> &str;

    /// Execute one task attempt.
    async fn run(&self, ctx: &RunContext) -> Result<RunOutcome, ExecutionError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::LocalArtifactStore;

    fn context(cancelled: watch::Receiver<bool>) -> RunContext {
        let dir = std::env::temp_dir();
        RunContext::new(
            Uuid::new_v4(),
            serde_json::Value::Null,
            HashMap::new(),
            vec!["slot_1".to_string()],
            Arc::new(LocalArtifactStore::new(dir)),
            cancelled,
        )
    }

    #[test]
    fn cancel_signal_is_observable() {
        let (tx, rx) = watch::channel(false);
        let ctx = context(rx);

        assert!(!ctx.is_cancelled());
        tx.send(true).unwrap();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn outcome_constructors() {
        let ok = RunOutcome::completed(HashMap::new(), 1.5);
        assert_eq!(ok.status, RunStatus::Completed);
        assert!(ok.error.is_none());

        let bad = RunOutcome::failed("sensor drift out of range", 0.2);
        assert_eq!(bad.status, RunStatus::Failed);
        assert_eq!(bad.error.as_deref(), Some("sensor drift out of range"));
    }
}
