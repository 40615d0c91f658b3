//! In-memory `Store` backend over per-entity hash maps.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{Device, Job, JobStatus, Task, TaskTemplate, Workflow};
use crate::store::{Store, TaskFilter};

/// Process-local store. Cheap clones of every record cross the lock
/// boundary, so readers never observe a half-applied update.
#[derive(Default)]
pub struct MemoryStore {
    workflows: RwLock<HashMap<Uuid, Workflow>>,
    jobs: RwLock<HashMap<Uuid, Job>>,
    tasks: RwLock<HashMap<Uuid, Task>>,
    devices: RwLock<HashMap<Uuid, Device>>,
    templates: RwLock<HashMap<Uuid, TaskTemplate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

async fn insert_row<T: Clone>(
    map: &RwLock<HashMap<Uuid, T>>,
    entity: &'static str,
    id: Uuid,
    row: T,
) -> Result<(), StoreError> {
    let mut map = map.write().await;
    if map.contains_key(&id) {
        return Err(StoreError::Duplicate { entity, id });
    }
    map.insert(id, row);
    Ok(())
}

async fn get_row<T: Clone>(
    map: &RwLock<HashMap<Uuid, T>>,
    id: Uuid,
) -> Result<Option<T>, StoreError> {
    Ok(map.read().await.get(&id).cloned())
}

async fn update_row<T: Clone>(
    map: &RwLock<HashMap<Uuid, T>>,
    entity: &'static str,
    id: Uuid,
    row: T,
) -> Result<(), StoreError> {
    let mut map = map.write().await;
    if !map.contains_key(&id) {
        return Err(StoreError::NotFound { entity, id });
    }
    map.insert(id, row);
    Ok(())
}

async fn delete_row<T>(
    map: &RwLock<HashMap<Uuid, T>>,
    entity: &'static str,
    id: Uuid,
) -> Result<(), StoreError> {
    map.write()
        .await
        .remove(&id)
        .map(|_| ())
        .ok_or(StoreError::NotFound { entity, id })
}

#[async_trait]
impl Store for MemoryStore {
    // ── Workflows ───────────────────────────────────────────────────

    async fn insert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        insert_row(&self.workflows, "workflow", workflow.id, workflow.clone()).await
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Option<Workflow>, StoreError> {
        get_row(&self.workflows, id).await
    }

    async fn update_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let mut row = workflow.clone();
        row.updated_at = Utc::now();
        update_row(&self.workflows, "workflow", row.id, row).await
    }

    async fn delete_workflow(&self, id: Uuid) -> Result<(), StoreError> {
        delete_row(&self.workflows, "workflow", id).await
    }

    async fn list_workflows(&self) -> Result<Vec<Workflow>, StoreError> {
        let mut rows: Vec<Workflow> = self.workflows.read().await.values().cloned().collect();
        rows.sort_by_key(|w| (w.created_at, w.id));
        Ok(rows)
    }

    // ── Jobs ────────────────────────────────────────────────────────

    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        insert_row(&self.jobs, "job", job.id, job.clone()).await
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        get_row(&self.jobs, id).await
    }

    async fn update_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut row = job.clone();
        row.updated_at = Utc::now();
        update_row(&self.jobs, "job", row.id, row).await
    }

    async fn delete_job(&self, id: Uuid) -> Result<(), StoreError> {
        delete_row(&self.jobs, "job", id).await
    }

    async fn list_jobs(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        let mut rows: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| status.is_none_or(|s| j.status == s))
            .cloned()
            .collect();
        rows.sort_by_key(|j| (j.created_at, j.id));
        Ok(rows)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn insert_task(&self, task: &Task) -> Result<(), StoreError> {
        insert_row(&self.tasks, "task", task.id, task.clone()).await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        get_row(&self.tasks, id).await
    }

    async fn update_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut row = task.clone();
        row.updated_at = Utc::now();
        update_row(&self.tasks, "task", row.id, row).await
    }

    async fn delete_task(&self, id: Uuid) -> Result<(), StoreError> {
        delete_row(&self.tasks, "task", id).await
    }

    async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        let mut rows: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        rows.sort_by_key(|t| (t.created_at, t.id));
        if let Some(limit) = filter.limit {
            rows.truncate(limit);
        }
        Ok(rows)
    }

    // ── Devices ─────────────────────────────────────────────────────

    async fn insert_device(&self, device: &Device) -> Result<(), StoreError> {
        insert_row(&self.devices, "device", device.id, device.clone()).await
    }

    async fn get_device(&self, id: Uuid) -> Result<Option<Device>, StoreError> {
        get_row(&self.devices, id).await
    }

    async fn update_device(&self, device: &Device) -> Result<(), StoreError> {
        let mut row = device.clone();
        row.updated_at = Utc::now();
        update_row(&self.devices, "device", row.id, row).await
    }

    async fn delete_device(&self, id: Uuid) -> Result<(), StoreError> {
        delete_row(&self.devices, "device", id).await
    }

    async fn list_devices(&self) -> Result<Vec<Device>, StoreError> {
        let mut rows: Vec<Device> = self.devices.read().await.values().cloned().collect();
        rows.sort_by_key(|d| (d.created_at, d.id));
        Ok(rows)
    }

    // ── Task templates ──────────────────────────────────────────────

    async fn insert_template(&self, template: &TaskTemplate) -> Result<(), StoreError> {
        insert_row(&self.templates, "template", template.id, template.clone()).await
    }

    async fn get_template(&self, id: Uuid) -> Result<Option<TaskTemplate>, StoreError> {
        get_row(&self.templates, id).await
    }

    async fn list_templates(&self) -> Result<Vec<TaskTemplate>, StoreError> {
        let mut rows: Vec<TaskTemplate> = self.templates.read().await.values().cloned().collect();
        rows.sort_by_key(|t| (t.created_at, t.id));
        Ok(rows)
    }
}
