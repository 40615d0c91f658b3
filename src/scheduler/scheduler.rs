//! The scheduling loop — decides which task runs next and commits it.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{Error, JobError, TaskError};
use crate::events::{Event, EventBus, EventKind};
use crate::executor::TaskExecutor;
use crate::model::{Device, DeviceStatus, JobPriority, JobStatus, Task, TaskStatus};
use crate::resource::{Allocation, RequestOutcome, ResourceManager, ResourceRequest};
use crate::scheduler::decision::SchedulingDecision;
use crate::store::{Store, TaskFilter};

/// Polls schedulable tasks, evaluates each against the decision chain, and
/// commits positive decisions: allocate, flip state, dispatch.
pub struct Scheduler {
    store: Arc<dyn Store>,
    events: Arc<dyn EventBus>,
    resources: Arc<ResourceManager>,
    executor: Arc<TaskExecutor>,
    config: EngineConfig,
}

/// Running scheduler loop. Dropping the handle does not stop the loop;
/// call [`SchedulerHandle::stop`].
pub struct SchedulerHandle {
    handle: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl SchedulerHandle {
    /// Signal the loop to stop and wait for it to finish its current pass.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Pass ordering: job priority descending, then task priority descending,
/// then creation time ascending.
fn task_order(a: &Task, b: &Task, priorities: &HashMap<Uuid, JobPriority>) -> Ordering {
    let pa = priorities.get(&a.job_id).copied().unwrap_or(JobPriority::Normal);
    let pb = priorities.get(&b.job_id).copied().unwrap_or(JobPriority::Normal);
    pb.cmp(&pa)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.created_at.cmp(&b.created_at))
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<dyn EventBus>,
        resources: Arc<ResourceManager>,
        executor: Arc<TaskExecutor>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            events,
            resources,
            executor,
            config,
        }
    }

    /// Evaluate whether a task may run right now.
    ///
    /// Checks run in order and stop at the first failure: task state, owning
    /// job state and concurrency, dependencies, resource availability,
    /// estimated start. A negative decision carries the failing check's
    /// reason.
    pub async fn can_run(&self, task_id: Uuid) -> Result<SchedulingDecision, Error> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(SchedulingDecision::no(task_id, "Task not found"));
        };
        if !task.status.is_schedulable() {
            return Ok(SchedulingDecision::no(
                task_id,
                format!("Task in invalid state: {}", task.status),
            ));
        }

        let Some(job) = self.store.get_job(task.job_id).await? else {
            return Ok(SchedulingDecision::no(task_id, "Job not found"));
        };
        if !job.status.is_runnable() {
            return Ok(SchedulingDecision::no(
                task_id,
                format!("Job not in a runnable state: {}", job.status),
            ));
        }
        let running_siblings = self
            .store
            .list_tasks(TaskFilter {
                statuses: vec![TaskStatus::Running],
                job_id: Some(job.id),
                ..TaskFilter::default()
            })
            .await?
            .len();
        if running_siblings >= job.max_concurrent_tasks {
            return Ok(SchedulingDecision::no(
                task_id,
                "Job concurrency limit reached",
            ));
        }

        for prev_id in &task.prev_tasks {
            let completed = self
                .store
                .get_task(*prev_id)
                .await?
                .is_some_and(|t| t.status == TaskStatus::Completed);
            if !completed {
                return Ok(SchedulingDecision::no(task_id, "Dependencies not satisfied"));
            }
        }

        let Some(template) = self.store.get_template(task.template_id).await? else {
            return Ok(SchedulingDecision::no(task_id, "Task template not found"));
        };
        let devices = self.store.list_devices().await?;
        let now = Utc::now();

        // A pinned task needs its exact device free; otherwise each required
        // type needs at least one healthy device. Busy devices pass the type
        // check (the request queues behind them), faulted ones do not.
        if let Some(device_id) = task.assigned_device_id {
            let Some(device) = devices.iter().find(|d| d.id == device_id) else {
                return Ok(SchedulingDecision::no(
                    task_id,
                    format!("Assigned device {device_id} not found"),
                ));
            };
            if !device.is_allocatable() {
                return Ok(SchedulingDecision::no(
                    task_id,
                    format!("Assigned device {} unavailable", device.name),
                ));
            }
            if self.resources.is_allocated(device_id).await {
                return Ok(SchedulingDecision::no(
                    task_id,
                    format!("Assigned device {} already allocated", device.name),
                ));
            }
            return Ok(SchedulingDecision::yes(task_id, now));
        }

        let mut estimated_start = now;
        for type_id in &template.required_device_types {
            let of_type: Vec<&Device> = devices
                .iter()
                .filter(|d| d.device_type_id == *type_id)
                .collect();

            if of_type.iter().any(|d| d.is_allocatable()) {
                continue; // available now
            }
            let Some(busy) = of_type.iter().find(|d| d.is_operational()) else {
                return Ok(SchedulingDecision::no(
                    task_id,
                    "Insufficient devices for required types",
                ));
            };
            let available_at = self.device_free_estimate(busy, now).await?;
            estimated_start = estimated_start.max(available_at);
        }

        Ok(SchedulingDecision::yes(task_id, estimated_start))
    }

    /// When will a busy device come free? Running task's start plus its
    /// template estimate; a configured fallback when the estimate is unknown.
    async fn device_free_estimate(
        &self,
        device: &Device,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, Error> {
        let fallback = now + self.config.fallback_estimate;
        let Some(task_id) = device.current_task_id else {
            return Ok(fallback);
        };
        let Some(task) = self.store.get_task(task_id).await? else {
            return Ok(fallback);
        };
        let Some(started_at) = task.started_at else {
            return Ok(fallback);
        };
        let Some(template) = self.store.get_template(task.template_id).await? else {
            return Ok(fallback);
        };
        Ok(match template.estimated_duration {
            Some(minutes) => started_at + chrono::Duration::minutes(i64::from(minutes)),
            None => fallback,
        })
    }

    /// One scheduling pass. Returns the number of tasks dispatched.
    ///
    /// Positive decisions are committed immediately: on `Allocated` the task
    /// starts within the same pass, on `Queued` it waits for a release.
    /// Backlog entries fulfilled by a release start on the next pass through
    /// the idempotent request path.
    pub async fn run_pass(&self) -> Result<usize, Error> {
        let mut tasks = self
            .store
            .list_tasks(TaskFilter::with_statuses(&[
                TaskStatus::Pending,
                TaskStatus::Ready,
            ]))
            .await?;
        if tasks.is_empty() {
            return Ok(0);
        }

        let priorities: HashMap<Uuid, JobPriority> = self
            .store
            .list_jobs(None)
            .await?
            .iter()
            .map(|j| (j.id, j.priority))
            .collect();
        tasks.sort_by(|a, b| task_order(a, b, &priorities));

        let mut started = 0;
        for task in tasks {
            let decision = self.can_run(task.id).await?;
            if !decision.can_run {
                trace!(task_id = %task.id, reason = %decision.reason, "Task held back");
                continue;
            }

            let Some(template) = self.store.get_template(task.template_id).await? else {
                continue;
            };
            let Some(workflow) = self.store.get_workflow(task.workflow_id).await? else {
                warn!(task_id = %task.id, "Task references a missing workflow, skipping");
                continue;
            };

            let request = ResourceRequest::new(
                task.id,
                template.required_device_types.clone(),
                workflow.sample_count,
            );
            match self.resources.request(request).await? {
                RequestOutcome::Allocated(allocation) => {
                    if let Err(e) = self.start_task(task.id, &allocation).await {
                        warn!(task_id = %task.id, error = %e, "Failed to start allocated task");
                        self.unwind_allocation(&allocation).await;
                        continue;
                    }
                    started += 1;
                }
                RequestOutcome::Queued => {
                    trace!(task_id = %task.id, "Task waiting for resources");
                }
            }
        }

        Ok(started)
    }

    /// Commit one positive decision: devices busy, task running, owning job
    /// running, events out, execution dispatched.
    async fn start_task(&self, task_id: Uuid, allocation: &Allocation) -> Result<(), Error> {
        // Devices first, so a running task never points at an idle-looking
        // device.
        for device_id in &allocation.device_ids {
            let Some(mut device) = self.store.get_device(*device_id).await? else {
                continue;
            };
            let old_status = device.status;
            device.status = DeviceStatus::Busy;
            device.current_task_id = Some(task_id);
            self.store.update_device(&device).await?;
            self.events
                .publish(Event::device(
                    EventKind::StatusChanged,
                    device.id,
                    json!({ "old_status": old_status, "new_status": device.status }),
                ))
                .await;
        }

        let Some(mut task) = self.store.get_task(task_id).await? else {
            return Err(TaskError::NotFound { id: task_id }.into());
        };
        task.transition_to(TaskStatus::Running)?;
        task.assigned_device_id = allocation.device_ids.first().copied();
        self.store.update_task(&task).await?;

        let Some(mut job) = self.store.get_job(task.job_id).await? else {
            return Err(JobError::NotFound { id: task.job_id }.into());
        };
        if job.status == JobStatus::Queued {
            job.transition_to(JobStatus::Running)?;
            self.store.update_job(&job).await?;
            self.events
                .publish(Event::job(EventKind::Started, job.id, json!({})))
                .await;
            info!(job_id = %job.id, job = %job.name, "Job started");
        }

        self.events
            .publish(Event::task(
                EventKind::Started,
                task.id,
                json!({ "device_id": task.assigned_device_id }),
            ))
            .await;
        info!(task_id = %task.id, task = %task.name, "Task started");

        self.executor
            .clone()
            .spawn_execution(task.id, allocation.clone())
            .await;
        Ok(())
    }

    /// Roll back a commit that failed halfway: devices back online, the
    /// allocation released. Backlog entries fulfilled by the release start
    /// on the next pass.
    async fn unwind_allocation(&self, allocation: &Allocation) {
        for device_id in &allocation.device_ids {
            match self.store.get_device(*device_id).await {
                Ok(Some(mut device)) => {
                    device.status = DeviceStatus::Online;
                    device.current_task_id = None;
                    if let Err(e) = self.store.update_device(&device).await {
                        warn!(device_id = %device_id, error = %e, "Failed to reset device during unwind");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(device_id = %device_id, error = %e, "Failed to load device during unwind")
                }
            }
        }
        if let Err(e) = self.resources.release(allocation.task_id).await {
            warn!(task_id = %allocation.task_id, error = %e, "Failed to release allocation during unwind");
        }
    }
}

/// Spawn the scheduling loop as a long-lived background task.
///
/// Runs a pass immediately, then every `poll_interval`; after a pass fails
/// it waits `error_backoff` instead. The returned handle's `stop` signals
/// the loop and waits for it to exit.
pub fn spawn_scheduler_loop(scheduler: Arc<Scheduler>) -> SchedulerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        info!(
            "Scheduler loop started (interval: {:?})",
            scheduler.config.poll_interval
        );

        loop {
            let wait = match scheduler.run_pass().await {
                Ok(started) => {
                    if started > 0 {
                        debug!(started, "Scheduling pass dispatched tasks");
                    }
                    scheduler.config.poll_interval
                }
                Err(e) => {
                    error!(error = %e, "Scheduling pass failed");
                    scheduler.config.error_backoff
                }
            };

            tokio::select! {
                _ = shutdown_rx.changed() => {
                    info!("Scheduler loop stopping");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }
        }
    });

    SchedulerHandle { handle, shutdown }
}
