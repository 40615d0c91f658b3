//! Job intake: workflow registration, job creation and queueing.
//!
//! Validates the declared task graph, instantiates the job's tasks with
//! their dependency wiring, and manages the job-level lifecycle the
//! scheduler does not own (queueing, cancellation, manual retry).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use crate::error::{JobError, Result, WorkflowError};
use crate::events::{Event, EventBus, EventKind};
use crate::model::{
    ExecutionMode, Job, JobPriority, JobStatus, Task, TaskGraph, TaskStatus, Workflow,
    WorkflowStatus,
};
use crate::resource::ResourceManager;
use crate::store::{Store, TaskFilter};

/// Aggregate view of the job queue.
#[derive(Debug, Serialize)]
pub struct QueueStatus {
    pub total_jobs: usize,
    pub by_status: HashMap<String, usize>,
    pub queued_by_priority: HashMap<String, usize>,
}

/// Front door for workflows and jobs.
pub struct JobIntake {
    store: Arc<dyn Store>,
    events: Arc<dyn EventBus>,
    resources: Arc<ResourceManager>,
}

impl JobIntake {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<dyn EventBus>,
        resources: Arc<ResourceManager>,
    ) -> Self {
        Self {
            store,
            events,
            resources,
        }
    }

    // ── Workflows ────────────────────────────────────────────────────────

    /// Register a new workflow definition.
    pub async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow> {
        self.store.insert_workflow(&workflow).await?;
        info!(workflow_id = %workflow.id, workflow = %workflow.name, "Workflow created");

        self.events
            .publish(Event::workflow(
                EventKind::Created,
                workflow.id,
                json!({ "name": workflow.name }),
            ))
            .await;
        Ok(workflow)
    }

    // ── Jobs ─────────────────────────────────────────────────────────────

    /// Create a job from a workflow: validate the graph, instantiate its
    /// tasks with dependency wiring, and flip a draft workflow active.
    pub async fn create_job(
        &self,
        workflow_id: Uuid,
        name: impl Into<String>,
        priority: JobPriority,
        execution_mode: ExecutionMode,
    ) -> Result<Job> {
        let Some(mut workflow) = self.store.get_workflow(workflow_id).await? else {
            return Err(WorkflowError::NotFound { id: workflow_id }.into());
        };
        if !workflow.status.accepts_jobs() {
            return Err(WorkflowError::NotAcceptingJobs {
                id: workflow.id,
                status: workflow.status,
            }
            .into());
        }
        validate_graph(&workflow.graph)?;

        let mut job = Job::new(name, workflow.id);
        job.priority = priority;
        job.execution_mode = execution_mode;
        job.max_concurrent_tasks = workflow.max_concurrent_tasks;
        job.total_tasks = workflow.graph.nodes.len() as u32;

        let tasks = instantiate_tasks(&workflow, &job);
        self.store.insert_job(&job).await?;
        for task in &tasks {
            self.store.insert_task(task).await?;
        }

        if workflow.status == WorkflowStatus::Draft {
            let old_status = workflow.status;
            workflow.transition_to(WorkflowStatus::Active)?;
            self.store.update_workflow(&workflow).await?;
            self.events
                .publish(Event::workflow(
                    EventKind::StatusChanged,
                    workflow.id,
                    json!({
                        "old_status": old_status,
                        "new_status": workflow.status,
                    }),
                ))
                .await;
        }

        info!(
            job_id = %job.id,
            job = %job.name,
            workflow = %workflow.name,
            tasks = tasks.len(),
            "Job created"
        );
        self.events
            .publish(Event::job(
                EventKind::Created,
                job.id,
                json!({
                    "workflow_id": workflow.id,
                    "total_tasks": job.total_tasks,
                }),
            ))
            .await;
        Ok(job)
    }

    /// Put a created job in line for the scheduler.
    pub async fn queue_job(&self, job_id: Uuid) -> Result<Job> {
        let Some(mut job) = self.store.get_job(job_id).await? else {
            return Err(JobError::NotFound { id: job_id }.into());
        };
        job.transition_to(JobStatus::Queued)?;
        self.store.update_job(&job).await?;

        let queued = self.store.list_jobs(Some(JobStatus::Queued)).await?;
        let position = queue_position(&job, &queued);

        info!(job_id = %job.id, job = %job.name, position, "Job queued");
        self.events
            .publish(Event::job(
                EventKind::Queued,
                job.id,
                json!({ "position": position }),
            ))
            .await;
        Ok(job)
    }

    /// Cancel a job and its tasks that have not started.
    ///
    /// Running tasks are not preempted here; cancel them individually
    /// through the executor if needed.
    pub async fn cancel_job(&self, job_id: Uuid) -> Result<Job> {
        let Some(mut job) = self.store.get_job(job_id).await? else {
            return Err(JobError::NotFound { id: job_id }.into());
        };
        job.transition_to(JobStatus::Cancelled)?;

        let waiting = self
            .store
            .list_tasks(TaskFilter {
                statuses: vec![TaskStatus::Pending, TaskStatus::Ready, TaskStatus::Retrying],
                job_id: Some(job_id),
                ..TaskFilter::default()
            })
            .await?;

        let mut cancelled_ids = Vec::with_capacity(waiting.len());
        for mut task in waiting {
            task.transition_to(TaskStatus::Cancelled)?;
            self.store.update_task(&task).await?;
            self.resources.cancel_request(task.id).await?;
            cancelled_ids.push(task.id);
        }

        let all = self.store.list_tasks(TaskFilter::for_job(job_id)).await?;
        let count = |status: TaskStatus| all.iter().filter(|t| t.status == status).count() as u32;
        job.completed_tasks = count(TaskStatus::Completed);
        job.failed_tasks = count(TaskStatus::Failed);
        job.cancelled_tasks = count(TaskStatus::Cancelled);
        job.progress = job.calculate_progress();
        self.store.update_job(&job).await?;

        info!(
            job_id = %job.id,
            job = %job.name,
            cancelled_tasks = cancelled_ids.len(),
            "Job cancelled"
        );
        for task_id in cancelled_ids {
            self.events
                .publish(Event::task(
                    EventKind::Cancelled,
                    task_id,
                    json!({ "reason": "Job cancelled" }),
                ))
                .await;
        }
        self.events
            .publish(Event::job(
                EventKind::Cancelled,
                job.id,
                json!({ "reason": "User requested cancellation" }),
            ))
            .await;
        Ok(job)
    }

    /// Operator-driven status change (pause, resume, manual retry).
    ///
    /// `failed → queued` is the manual retry path: the job's failed tasks
    /// go back to pending with a fresh retry budget.
    pub async fn update_job_status(&self, job_id: Uuid, target: JobStatus) -> Result<Job> {
        let Some(mut job) = self.store.get_job(job_id).await? else {
            return Err(JobError::NotFound { id: job_id }.into());
        };
        if !job.status.can_transition_to(target) {
            return Err(JobError::InvalidTransition {
                id: job.id,
                status: job.status,
                target,
            }
            .into());
        }
        let old_status = job.status;

        if job.status == JobStatus::Failed && target == JobStatus::Queued {
            let failed = self
                .store
                .list_tasks(TaskFilter {
                    statuses: vec![TaskStatus::Failed],
                    job_id: Some(job_id),
                    ..TaskFilter::default()
                })
                .await?;
            for mut task in failed {
                task.reset_for_retry();
                task.retry_count = 0;
                // Failed is terminal for the task machine; the manual retry
                // path is the one place a terminal task re-enters it.
                task.status = TaskStatus::Pending;
                self.store.update_task(&task).await?;
            }
            job.failed_tasks = 0;
            job.error_message = None;
            job.retry_count += 1;
            job.progress = job.calculate_progress();
        }

        job.transition_to(target)?;
        self.store.update_job(&job).await?;

        info!(job_id = %job.id, old = %old_status, new = %job.status, "Job status updated");
        self.events
            .publish(Event::job(
                EventKind::StatusChanged,
                job.id,
                json!({
                    "old_status": old_status,
                    "new_status": job.status,
                }),
            ))
            .await;
        Ok(job)
    }

    /// Aggregate queue counters for operators.
    pub async fn queue_status(&self) -> Result<QueueStatus> {
        let jobs = self.store.list_jobs(None).await?;
        let mut by_status: HashMap<String, usize> = HashMap::new();
        let mut queued_by_priority: HashMap<String, usize> = HashMap::new();
        for job in &jobs {
            *by_status.entry(job.status.to_string()).or_insert(0) += 1;
            if job.status == JobStatus::Queued {
                *queued_by_priority
                    .entry(job.priority.to_string())
                    .or_insert(0) += 1;
            }
        }
        Ok(QueueStatus {
            total_jobs: jobs.len(),
            by_status,
            queued_by_priority,
        })
    }
}

// ── Graph handling ───────────────────────────────────────────────────────

/// Reject duplicate nodes, edges to nowhere, and cycles (Kahn's algorithm).
fn validate_graph(graph: &TaskGraph) -> std::result::Result<(), WorkflowError> {
    let mut keys: HashSet<&str> = HashSet::new();
    for node in &graph.nodes {
        if !keys.insert(node.key.as_str()) {
            return Err(WorkflowError::DuplicateNode {
                node: node.key.clone(),
            });
        }
    }
    for edge in &graph.edges {
        for key in [&edge.from, &edge.to] {
            if !keys.contains(key.as_str()) {
                return Err(WorkflowError::UnknownNode { node: key.clone() });
            }
        }
    }

    let mut indegree: HashMap<&str, usize> =
        graph.nodes.iter().map(|n| (n.key.as_str(), 0)).collect();
    let mut successors: HashMap<&str, Vec<&str>> = HashMap::new();
    for edge in &graph.edges {
        if let Some(d) = indegree.get_mut(edge.to.as_str()) {
            *d += 1;
        }
        successors
            .entry(edge.from.as_str())
            .or_default()
            .push(edge.to.as_str());
    }

    let mut ready: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(k, _)| *k)
        .collect();
    let mut visited = 0;
    while let Some(key) = ready.pop_front() {
        visited += 1;
        if let Some(next) = successors.get(key) {
            for succ in next {
                if let Some(d) = indegree.get_mut(succ) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(succ);
                    }
                }
            }
        }
    }

    if visited < graph.nodes.len() {
        let node = indegree
            .iter()
            .find(|(_, d)| **d > 0)
            .map(|(k, _)| (*k).to_string())
            .unwrap_or_default();
        return Err(WorkflowError::CycleDetected { node });
    }
    Ok(())
}

/// Instantiate one task per graph node, wiring `prev_tasks`/`next_tasks`
/// from the declared edges. Assumes a validated graph.
fn instantiate_tasks(workflow: &Workflow, job: &Job) -> Vec<Task> {
    let mut tasks: Vec<Task> = workflow
        .graph
        .nodes
        .iter()
        .map(|node| {
            let mut task = Task::new(node.key.clone(), node.template_id, job.id, workflow.id);
            task.inputs = node.inputs.clone();
            task.priority = node.priority;
            task
        })
        .collect();

    let index: HashMap<&str, usize> = workflow
        .graph
        .nodes
        .iter()
        .enumerate()
        .map(|(i, node)| (node.key.as_str(), i))
        .collect();

    for edge in &workflow.graph.edges {
        let (Some(&from), Some(&to)) = (
            index.get(edge.from.as_str()),
            index.get(edge.to.as_str()),
        ) else {
            continue;
        };
        let from_id = tasks[from].id;
        let to_id = tasks[to].id;
        tasks[to].prev_tasks.push(from_id);
        tasks[from].next_tasks.push(to_id);
    }
    tasks
}

/// Queued jobs ahead of this one: strictly higher priority, or the same
/// priority queued earlier.
fn queue_position(job: &Job, queued: &[Job]) -> usize {
    queued
        .iter()
        .filter(|other| {
            other.id != job.id
                && (other.priority > job.priority
                    || (other.priority == job.priority && other.queued_at < job.queued_at))
        })
        .count()
}
