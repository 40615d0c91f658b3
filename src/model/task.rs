//! Task records, templates, and the task state machine.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;

/// State of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Instantiated, waiting on dependencies or resources.
    Pending,
    /// Explicitly marked eligible to run.
    Ready,
    /// Holding an allocation and executing.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
    /// Cancelled before or during execution.
    Cancelled,
    /// Failed but waiting out a retry backoff.
    Retrying,
}

impl TaskStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            // From Pending
            (Pending, Ready) | (Pending, Running) | (Pending, Cancelled) |
            // From Ready
            (Ready, Running) | (Ready, Cancelled) |
            // From Running
            (Running, Completed) | (Running, Failed) |
            (Running, Cancelled) | (Running, Retrying) |
            // From Retrying (backoff elapsed, or cancelled while waiting)
            (Retrying, Pending) | (Retrying, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the scheduler may consider this task for dispatch.
    pub fn is_schedulable(&self) -> bool {
        matches!(self, Self::Pending | Self::Ready)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
        };
        write!(f, "{s}")
    }
}

/// Metadata attached to a file-typed task output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u64,
    pub content_type: String,
}

/// One named output produced by a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    pub value: serde_json::Value,
    pub output_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_metadata: Option<FileMetadata>,
}

impl TaskOutput {
    /// A plain (non-file) output.
    pub fn value(value: serde_json::Value, output_type: impl Into<String>) -> Self {
        Self {
            value,
            output_type: output_type.into(),
            file_url: None,
            file_metadata: None,
        }
    }

    /// A file output uploaded to artifact storage.
    pub fn file(url: impl Into<String>, metadata: FileMetadata) -> Self {
        let url = url.into();
        Self {
            value: serde_json::Value::String(url.clone()),
            output_type: "file".to_string(),
            file_url: Some(url),
            file_metadata: Some(metadata),
        }
    }
}

/// Reusable definition a task is instantiated from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    pub id: Uuid,
    pub name: String,
    /// Registry key of the implementation; `None` runs the default execution.
    pub implementation: Option<String>,
    /// Device types this task needs, one device per entry.
    pub required_device_types: Vec<Uuid>,
    pub input_schema: serde_json::Value,
    /// Declared outputs: map of output name to `{"type": ...}` descriptors.
    pub output_schema: serde_json::Value,
    /// Estimated duration in minutes.
    pub estimated_duration: Option<u32>,
    pub max_retries: u32,
    /// Base delay between retry attempts, in seconds.
    pub retry_delay_secs: u64,
    pub created_at: DateTime<Utc>,
}

impl TaskTemplate {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            implementation: None,
            required_device_types: Vec::new(),
            input_schema: serde_json::Value::Null,
            output_schema: serde_json::Value::Null,
            estimated_duration: None,
            max_retries: 0,
            retry_delay_secs: 60,
            created_at: Utc::now(),
        }
    }
}

/// One node of a job's instantiated task graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub template_id: Uuid,
    pub job_id: Uuid,
    pub workflow_id: Uuid,
    pub status: TaskStatus,
    /// 1 (low) to 4 (urgent); ties within a job are broken by creation time.
    pub priority: u8,
    pub retry_count: u32,
    pub inputs: serde_json::Value,
    pub outputs: Option<HashMap<String, TaskOutput>>,
    /// Predecessor task ids; all must complete before this task may run.
    pub prev_tasks: Vec<Uuid>,
    /// Successor task ids.
    pub next_tasks: Vec<Uuid>,
    pub assigned_device_id: Option<Uuid>,
    pub error_message: Option<String>,
    /// Wall-clock execution time of the last attempt, in seconds.
    pub execution_time: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: impl Into<String>, template_id: Uuid, job_id: Uuid, workflow_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            template_id,
            job_id,
            workflow_id,
            status: TaskStatus::Pending,
            priority: 1,
            retry_count: 0,
            inputs: serde_json::Value::Null,
            outputs: None,
            prev_tasks: Vec::new(),
            next_tasks: Vec::new(),
            assigned_device_id: None,
            error_message: None,
            execution_time: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Transition to a new status, stamping timestamps along the way.
    pub fn transition_to(&mut self, target: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(target) {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                status: self.status,
                target,
            });
        }

        self.status = target;
        self.updated_at = Utc::now();

        match target {
            TaskStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }

        Ok(())
    }

    /// Reset attempt state ahead of a retry or a manual job re-queue.
    pub fn reset_for_retry(&mut self) {
        self.assigned_device_id = None;
        self.error_message = None;
        self.execution_time = None;
        self.started_at = None;
        self.completed_at = None;
        self.outputs = None;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> Task {
        Task::new("heat", Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
    }

    #[test]
    fn transitions_valid() {
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Ready));
        assert!(TaskStatus::Pending.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Ready.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Failed));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Retrying));
        assert!(TaskStatus::Retrying.can_transition_to(TaskStatus::Pending));
        assert!(TaskStatus::Retrying.can_transition_to(TaskStatus::Cancelled));
    }

    #[test]
    fn transitions_invalid() {
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Failed.can_transition_to(TaskStatus::Pending));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Ready.can_transition_to(TaskStatus::Retrying));
    }

    #[test]
    fn schedulable_states() {
        assert!(TaskStatus::Pending.is_schedulable());
        assert!(TaskStatus::Ready.is_schedulable());
        assert!(!TaskStatus::Running.is_schedulable());
        assert!(!TaskStatus::Retrying.is_schedulable());
        assert!(!TaskStatus::Completed.is_schedulable());
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::Retrying.is_terminal());
        assert!(!TaskStatus::Running.is_terminal());
    }

    #[test]
    fn transition_stamps_timestamps() {
        let mut t = task();
        t.transition_to(TaskStatus::Running).unwrap();
        assert!(t.started_at.is_some());
        assert!(t.completed_at.is_none());

        t.transition_to(TaskStatus::Completed).unwrap();
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn invalid_transition_is_rejected() {
        let mut t = task();
        t.transition_to(TaskStatus::Running).unwrap();
        t.transition_to(TaskStatus::Completed).unwrap();

        let err = t.transition_to(TaskStatus::Running).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[test]
    fn reset_for_retry_clears_attempt_state() {
        let mut t = task();
        t.transition_to(TaskStatus::Running).unwrap();
        t.assigned_device_id = Some(Uuid::new_v4());
        t.error_message = Some("boom".to_string());
        t.execution_time = Some(1.5);

        t.reset_for_retry();
        assert!(t.assigned_device_id.is_none());
        assert!(t.error_message.is_none());
        assert!(t.execution_time.is_none());
        assert!(t.started_at.is_none());
    }

    #[test]
    fn file_output_carries_url_and_metadata() {
        let out = TaskOutput::file(
            "file:///artifacts/a.txt",
            FileMetadata {
                size: 100,
                content_type: "text/plain".to_string(),
            },
        );
        assert_eq!(out.output_type, "file");
        assert_eq!(out.file_url.as_deref(), Some("file:///artifacts/a.txt"));

        let json = serde_json::to_string(&out).unwrap();
        assert!(json.contains("\"file_url\""));
    }

    #[test]
    fn status_serde_roundtrip() {
        let json = serde_json::to_string(&TaskStatus::Retrying).unwrap();
        assert_eq!(json, "\"retrying\"");
        let parsed: TaskStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, TaskStatus::Retrying);
    }
}
