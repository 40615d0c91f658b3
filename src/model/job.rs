//! Job records and the job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::JobError;

/// State of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created but not yet queued for scheduling.
    Created,
    /// Waiting in the job queue.
    Queued,
    /// At least one task has started.
    Running,
    /// All tasks finished, none failed.
    Completed,
    /// Finished with failed tasks, or failed outright; re-queueable.
    Failed,
    /// Cancelled by request.
    Cancelled,
    /// Suspended; tasks are not scheduled while paused.
    Paused,
}

impl JobStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobStatus) -> bool {
        use JobStatus::*;

        matches!(
            (self, target),
            // From Created
            (Created, Queued) | (Created, Cancelled) |
            // From Queued
            (Queued, Running) | (Queued, Cancelled) | (Queued, Failed) |
            // From Running
            (Running, Completed) | (Running, Failed) |
            (Running, Cancelled) | (Running, Paused) |
            // From Paused. Completed and Failed are reachable because a
            // task still in flight when the job was paused can be its last.
            (Paused, Running) | (Paused, Completed) |
            (Paused, Failed) | (Paused, Cancelled) |
            // From Failed (manual retry)
            (Failed, Queued)
        )
    }

    /// Check if this is a terminal state. Failed counts as terminal even
    /// though a manual re-queue edge exists.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if the scheduler may dispatch this job's tasks.
    pub fn is_runnable(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        };
        write!(f, "{s}")
    }
}

/// Job priority, ordered low to urgent.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    Normal,
    High,
    Urgent,
}

impl JobPriority {
    /// Numeric level, 1 (low) to 4 (urgent).
    pub fn level(&self) -> u8 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 3,
            Self::Urgent => 4,
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        write!(f, "{s}")
    }
}

/// How a job's tasks should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    Normal,
    Optimized,
    Debug,
    Simulation,
}

/// One execution instance of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub workflow_id: Uuid,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub execution_mode: ExecutionMode,
    /// Job-level retry budget for manual failed→queued re-queues.
    pub max_retries: u32,
    pub retry_count: u32,
    /// Upper bound on this job's simultaneously running tasks.
    pub max_concurrent_tasks: usize,
    /// Free-form resource requirement descriptor, carried for operators.
    pub resource_requirements: Option<serde_json::Value>,
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub failed_tasks: u32,
    pub cancelled_tasks: u32,
    /// 0–100; see [`Job::calculate_progress`].
    pub progress: u8,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(name: impl Into<String>, workflow_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            workflow_id,
            status: JobStatus::Created,
            priority: JobPriority::Normal,
            execution_mode: ExecutionMode::Normal,
            max_retries: 0,
            retry_count: 0,
            max_concurrent_tasks: 10,
            resource_requirements: None,
            total_tasks: 0,
            completed_tasks: 0,
            failed_tasks: 0,
            cancelled_tasks: 0,
            progress: 0,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            queued_at: None,
            started_at: None,
            completed_at: None,
        }
    }

    /// Transition to a new status, stamping timestamps along the way.
    pub fn transition_to(&mut self, target: JobStatus) -> Result<(), JobError> {
        if !self.status.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: self.id,
                status: self.status,
                target,
            });
        }

        self.status = target;
        self.updated_at = Utc::now();

        match target {
            JobStatus::Queued => {
                self.queued_at = Some(Utc::now());
            }
            JobStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(Utc::now());
            }
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }

        Ok(())
    }

    /// Progress percentage from the task counters.
    ///
    /// Completed tasks count fully, failed as half, cancelled as a quarter —
    /// a deliberately lossy approximation. A job with no tasks reports 100
    /// once terminal, 0 before that.
    pub fn calculate_progress(&self) -> u8 {
        if self.total_tasks == 0 {
            return if self.status.is_terminal() { 100 } else { 0 };
        }
        let weighted = u64::from(self.completed_tasks) * 100
            + u64::from(self.failed_tasks) * 50
            + u64::from(self.cancelled_tasks) * 25;
        (weighted / u64::from(self.total_tasks)).min(100) as u8
    }

    /// Count of tasks that have reached a terminal state.
    pub fn terminal_tasks(&self) -> u32 {
        self.completed_tasks + self.failed_tasks + self.cancelled_tasks
    }
}
