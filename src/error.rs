//! Error types for the engine.

use uuid::Uuid;

use crate::model::{JobStatus, TaskStatus, WorkflowStatus};

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Workflow error: {0}")]
    Workflow(#[from] WorkflowError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}

/// Entity-store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("Duplicate entity: {entity} with id {id}")]
    Duplicate { entity: &'static str, id: Uuid },

    #[error("Store backend error: {0}")]
    Backend(String),
}

/// Workflow-related errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("Workflow {id} not found")]
    NotFound { id: Uuid },

    #[error("Workflow {id} in status {status}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        status: WorkflowStatus,
        target: WorkflowStatus,
    },

    #[error("Workflow {id} in status {status} is not accepting jobs")]
    NotAcceptingJobs { id: Uuid, status: WorkflowStatus },

    #[error("Task graph contains a cycle involving node {node}")]
    CycleDetected { node: String },

    #[error("Task graph edge references unknown node {node}")]
    UnknownNode { node: String },

    #[error("Task graph declares node {node} more than once")]
    DuplicateNode { node: String },
}

/// Job-related errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: Uuid },

    #[error("Job {id} in status {status}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        status: JobStatus,
        target: JobStatus,
    },
}

/// Task-related errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: Uuid },

    #[error("Task {id} in status {status}, cannot transition to {target}")]
    InvalidTransition {
        id: Uuid,
        status: TaskStatus,
        target: TaskStatus,
    },

    #[error("Task {id} is {status}, only running tasks can be cancelled")]
    NotCancellable { id: Uuid, status: TaskStatus },
}

/// Device driver errors.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("Device {id} is offline")]
    Offline { id: Uuid },

    #[error("Command {command} failed on device {id}: {reason}")]
    CommandFailed {
        id: Uuid,
        command: String,
        reason: String,
    },
}

/// Task execution errors.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Implementation failed: {reason}")]
    Failed { reason: String },

    #[error("Execution cancelled")]
    Cancelled,

    #[error("Device error during execution: {0}")]
    Device(#[from] DeviceError),

    #[error("Artifact error during execution: {0}")]
    Artifact(#[from] ArtifactError),
}

/// Artifact storage errors.
#[derive(Debug, thiserror::Error)]
pub enum ArtifactError {
    #[error("Invalid artifact key: {key}")]
    InvalidKey { key: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
