//! `Store` trait — single async interface for entity persistence.
//!
//! The engine only ever touches entities through this trait; the in-memory
//! backend in `memory.rs` backs tests and the demo binary. Every call is
//! atomic per record; cross-record sequences are not transactional and the
//! engine is written to tolerate that.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Device, Job, JobStatus, Task, TaskStatus, TaskTemplate, Workflow};

/// Filter for task listings. Empty fields match everything.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    /// Match any of these statuses; empty matches all.
    pub statuses: Vec<TaskStatus>,
    pub job_id: Option<Uuid>,
    pub workflow_id: Option<Uuid>,
    pub limit: Option<usize>,
}

impl TaskFilter {
    /// Tasks of one job, any status.
    pub fn for_job(job_id: Uuid) -> Self {
        Self {
            job_id: Some(job_id),
            ..Self::default()
        }
    }

    /// Tasks in any of the given statuses.
    pub fn with_statuses(statuses: &[TaskStatus]) -> Self {
        Self {
            statuses: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if !self.statuses.is_empty() && !self.statuses.contains(&task.status) {
            return false;
        }
        if let Some(job_id) = self.job_id
            && task.job_id != job_id
        {
            return false;
        }
        if let Some(workflow_id) = self.workflow_id
            && task.workflow_id != workflow_id
        {
            return false;
        }
        true
    }
}

/// Backend-agnostic entity store.
///
/// Listings return records ordered by creation time (ties broken by id) so
/// "first match in inventory order" is deterministic across backends.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Workflows ───────────────────────────────────────────────────

    /// Insert a new workflow.
    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Get a workflow by id.
    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError>;

    /// Replace a workflow record.
    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Delete a workflow.
    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError>;

    /// List all workflows.
    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError>;

    // ── Jobs ────────────────────────────────────────────────────────

    /// Insert a new job.
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Get a job by id.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Replace a job record.
    async fn update_job(&self, job: &Job) -> Result<(), StoreError>;

    /// Delete a job.
    async fn delete_job(&self, id: Uuid) -> Result<(), StoreError>;

    /// List jobs, optionally restricted to one status.
    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task.
    async fn insert_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Get a task by id.
    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Replace a task record.
    async fn update_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Delete a task.
    async fn delete_task(&self, id: Uuid) -> Result<(), StoreError>;

    /// List tasks matching a filter.
    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError>;

    // ── Devices ─────────────────────────────────────────────────────

    /// Insert a new device.
    async fn insert_device(&self, device: &Device) -> Result<(), StoreError>;

    /// Get a device by id.
    async fn get_device(&self, id: Uuid) -> Result<Option<Device>, StoreError>;

    /// Replace a device record.
    async fn update_device(&self, device: &Device) -> Result<(), StoreError>;

    /// Delete a device.
    async fn delete_device(&self, id: Uuid) -> Result<(), StoreError>;

    /// List the full device inventory.
    async fn list_devices(&self) -> Result<Vec<Device>, StoreError>;

    // ── Task templates ──────────────────────────────────────────────

    /// Insert a task template.
    async fn insert_template(&self, template: &TaskTemplate) -> Result<(), StoreError>;

    /// Get a task template by id.
    async fn get_template(&self, id: Uuid) -> Result<Option<TaskTemplate>, StoreError>;

    /// List all task templates.
    async fn list_templates(&self) -> Result<Vec<TaskTemplate>, StoreError>;
}
