//! The execution pipeline behind the scheduler.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;
use tokio::sync::{RwLock, Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::artifacts::ArtifactStore;
use crate::config::EngineConfig;
use crate::devices::DeviceDriver;
use crate::error::{Error, ExecutionError, JobError, TaskError};
use crate::events::{Event, EventBus, EventKind};
use crate::executor::default_run::default_run;
use crate::model::{DeviceStatus, Job, JobStatus, TaskStatus, TaskTemplate};
use crate::resource::{Allocation, ResourceManager};
use crate::runnable::{RunContext, RunOutcome, RunStatus, RunnableRegistry};
use crate::store::{Store, TaskFilter};

/// One tracked in-flight execution.
struct ActiveExecution {
    handle: JoinHandle<()>,
    cancel_tx: watch::Sender<bool>,
}

/// Runs allocated tasks and folds their outcomes back into the store.
///
/// Each execution is its own tokio task, bounded by a semaphore on top of
/// the physical limits the allocation already enforces. Whatever happens
/// during a run — success, failure, cancellation — the devices and
/// positions go back to the pool afterwards.
pub struct TaskExecutor {
    store: Arc<dyn Store>,
    events: Arc<dyn EventBus>,
    resources: Arc<ResourceManager>,
    registry: Arc<RunnableRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    drivers: RwLock<HashMap<Uuid, Arc<dyn DeviceDriver>>>,
    active: RwLock<HashMap<Uuid, ActiveExecution>>,
    semaphore: Arc<Semaphore>,
    config: EngineConfig,
}

impl TaskExecutor {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<dyn EventBus>,
        resources: Arc<ResourceManager>,
        registry: Arc<RunnableRegistry>,
        artifacts: Arc<dyn ArtifactStore>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            events,
            resources,
            registry,
            artifacts,
            drivers: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            semaphore: Arc::new(Semaphore::new(config.max_parallel_executions)),
            config,
        }
    }

    /// Make a device driver reachable from task implementations.
    pub async fn register_driver(&self, device_id: Uuid, driver: Arc<dyn DeviceDriver>) {
        self.drivers.write().await.insert(device_id, driver);
    }

    /// Number of executions currently in flight.
    pub async fn active_count(&self) -> usize {
        self.active.read().await.len()
    }

    // ── Dispatch ─────────────────────────────────────────────────────────

    /// Spawn the execution of an allocated, already-running task.
    ///
    /// Returns once the execution is tracked; the run itself proceeds on its
    /// own tokio task under the parallelism semaphore.
    pub async fn spawn_execution(self: Arc<Self>, task_id: Uuid, allocation: Allocation) {
        if self.active.read().await.contains_key(&task_id) {
            warn!(task_id = %task_id, "Execution already in flight, ignoring dispatch");
            return;
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (start_tx, start_rx) = oneshot::channel::<()>();

        let executor = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            // Hold the run until the execution is tracked, so a cancel can
            // always reach it.
            if start_rx.await.is_err() {
                return;
            }
            let permit = match executor.semaphore.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            executor.execute(task_id, &allocation, cancel_rx).await;
            drop(permit);
            executor.active.write().await.remove(&task_id);
        });

        self.active
            .write()
            .await
            .insert(task_id, ActiveExecution { handle, cancel_tx });
        let _ = start_tx.send(());
    }

    /// Wait for every in-flight execution to finish.
    pub async fn shutdown(&self) {
        let drained: Vec<ActiveExecution> = {
            let mut active = self.active.write().await;
            active.drain().map(|(_, exec)| exec).collect()
        };
        if drained.is_empty() {
            return;
        }
        info!(count = drained.len(), "Waiting for in-flight executions");
        futures::future::join_all(drained.into_iter().map(|exec| exec.handle)).await;
    }

    // ── The run itself ───────────────────────────────────────────────────

    async fn execute(
        &self,
        task_id: Uuid,
        allocation: &Allocation,
        cancel_rx: watch::Receiver<bool>,
    ) {
        let started = Instant::now();

        if let Err(e) = self.run_attempt(task_id, allocation, cancel_rx).await {
            error!(task_id = %task_id, error = %e, "Execution pipeline failed");
        }

        // Devices and positions come back no matter how the run went.
        let wall_secs = started.elapsed().as_secs_f64();
        if let Err(e) = self
            .release_task_resources(task_id, allocation, wall_secs)
            .await
        {
            error!(task_id = %task_id, error = %e, "Failed to release task resources");
        }
    }

    /// Resolve the implementation, run it, and fold the result. Errors out
    /// of here are infrastructure failures (store unreachable), not task
    /// failures.
    async fn run_attempt(
        &self,
        task_id: Uuid,
        allocation: &Allocation,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<(), Error> {
        let Some(task) = self.store.get_task(task_id).await? else {
            return Err(TaskError::NotFound { id: task_id }.into());
        };
        if task.status != TaskStatus::Running {
            debug!(task_id = %task_id, status = %task.status, "Task no longer running, skipping execution");
            return Ok(());
        }

        let Some(template) = self.store.get_template(task.template_id).await? else {
            return self
                .fail_task(task_id, "Task template not found", 0.0)
                .await;
        };

        let runnable = match &template.implementation {
            Some(key) => {
                let found = self.registry.get(key).await;
                if found.is_none() {
                    debug!(
                        task_id = %task_id,
                        implementation = %key,
                        "No registered implementation, using default execution"
                    );
                }
                found
            }
            None => None,
        };

        let ctx = RunContext::new(
            task.id,
            task.inputs.clone(),
            self.allocated_drivers(allocation).await,
            allocation.sample_positions.clone(),
            Arc::clone(&self.artifacts),
            cancel_rx,
        );

        let attempt_started = Instant::now();
        let run_result = match runnable {
            Some(runnable) => runnable.run(&ctx).await,
            None => default_run(&template, &ctx).await,
        };
        let attempt_secs = attempt_started.elapsed().as_secs_f64();

        match run_result {
            Ok(outcome) => match outcome.status {
                RunStatus::Completed => self.complete_task(task_id, outcome).await,
                RunStatus::Failed => {
                    let reason = outcome
                        .error
                        .unwrap_or_else(|| "Implementation reported failure".to_string());
                    self.handle_run_failure(task_id, &template, reason, outcome.execution_time)
                        .await
                }
            },
            Err(ExecutionError::Cancelled) => {
                // cancel_task already folded the state change.
                debug!(task_id = %task_id, "Run observed cancellation");
                Ok(())
            }
            Err(e) => {
                self.handle_run_failure(task_id, &template, e.to_string(), attempt_secs)
                    .await
            }
        }
    }

    /// Drivers for the allocated devices, where one is registered.
    async fn allocated_drivers(
        &self,
        allocation: &Allocation,
    ) -> HashMap<Uuid, Arc<dyn DeviceDriver>> {
        let drivers = self.drivers.read().await;
        allocation
            .device_ids
            .iter()
            .filter_map(|id| drivers.get(id).map(|d| (*id, Arc::clone(d))))
            .collect()
    }

    // ── Result folding ───────────────────────────────────────────────────

    async fn complete_task(&self, task_id: Uuid, outcome: RunOutcome) -> Result<(), Error> {
        let Some(mut task) = self.store.get_task(task_id).await? else {
            return Err(TaskError::NotFound { id: task_id }.into());
        };
        if task.status != TaskStatus::Running {
            // Cancelled while the result was in flight.
            debug!(task_id = %task_id, status = %task.status, "Discarding late result");
            return Ok(());
        }

        task.transition_to(TaskStatus::Completed)?;
        task.outputs = Some(outcome.outputs);
        task.execution_time = Some(outcome.execution_time);
        task.error_message = None;
        self.store.update_task(&task).await?;
        info!(task_id = %task.id, task = %task.name, "Task completed");

        // Task and job rows are both current before any event goes out.
        let finished = self.recount_job(task.job_id).await?;

        self.events
            .publish(Event::task(
                EventKind::Completed,
                task.id,
                json!({ "execution_time": outcome.execution_time }),
            ))
            .await;
        if let Some(job) = finished {
            self.publish_job_finished(&job).await;
        }
        Ok(())
    }

    /// Decide between a retry and a final failure.
    async fn handle_run_failure(
        &self,
        task_id: Uuid,
        template: &TaskTemplate,
        reason: String,
        execution_time: f64,
    ) -> Result<(), Error> {
        let Some(mut task) = self.store.get_task(task_id).await? else {
            return Err(TaskError::NotFound { id: task_id }.into());
        };
        if task.status != TaskStatus::Running {
            debug!(task_id = %task_id, status = %task.status, "Discarding late failure");
            return Ok(());
        }

        if task.retry_count >= template.max_retries {
            return self.fail_task(task_id, &reason, execution_time).await;
        }

        task.transition_to(TaskStatus::Retrying)?;
        task.error_message = Some(reason.clone());
        self.store.update_task(&task).await?;

        let attempt = task.retry_count + 1;
        let delay = retry_delay(template, task.retry_count, self.config.max_retry_backoff);
        warn!(
            task_id = %task.id,
            attempt,
            delay_secs = delay.as_secs(),
            error = %reason,
            "Task failed, will retry"
        );
        self.events
            .publish(Event::task(
                EventKind::Retrying,
                task.id,
                json!({
                    "attempt": attempt,
                    "delay_secs": delay.as_secs(),
                    "error": reason,
                }),
            ))
            .await;

        self.schedule_retry(task.id, delay);
        Ok(())
    }

    async fn fail_task(&self, task_id: Uuid, reason: &str, execution_time: f64) -> Result<(), Error> {
        let Some(mut task) = self.store.get_task(task_id).await? else {
            return Err(TaskError::NotFound { id: task_id }.into());
        };
        if task.status != TaskStatus::Running {
            debug!(task_id = %task_id, status = %task.status, "Discarding late failure");
            return Ok(());
        }

        task.transition_to(TaskStatus::Failed)?;
        task.error_message = Some(reason.to_string());
        task.execution_time = Some(execution_time);
        self.store.update_task(&task).await?;
        warn!(task_id = %task.id, task = %task.name, error = %reason, "Task failed");

        let finished = self.recount_job(task.job_id).await?;

        self.events
            .publish(Event::task(
                EventKind::Failed,
                task.id,
                json!({ "error": reason }),
            ))
            .await;
        if let Some(job) = finished {
            self.publish_job_finished(&job).await;
        }
        Ok(())
    }

    /// Hold the retrying task out for its backoff, then put it back in the
    /// pending pool for the next scheduling pass.
    fn schedule_retry(&self, task_id: Uuid, delay: Duration) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = requeue_retrying_task(store.as_ref(), task_id).await {
                warn!(task_id = %task_id, error = %e, "Failed to requeue retrying task");
            }
        });
    }

    // ── Job fan-in ───────────────────────────────────────────────────────

    /// Recompute the job's task counters and progress; finish the job once
    /// every task is terminal. The refreshed row always hits the store, and
    /// it does so before the caller publishes anything. Returns the job when
    /// this recount finished it so the caller can announce that after its
    /// own task event.
    async fn recount_job(&self, job_id: Uuid) -> Result<Option<Job>, Error> {
        let Some(mut job) = self.store.get_job(job_id).await? else {
            return Err(JobError::NotFound { id: job_id }.into());
        };
        let tasks = self.store.list_tasks(TaskFilter::for_job(job_id)).await?;

        job.completed_tasks = count_status(&tasks, TaskStatus::Completed);
        job.failed_tasks = count_status(&tasks, TaskStatus::Failed);
        job.cancelled_tasks = count_status(&tasks, TaskStatus::Cancelled);
        job.progress = job.calculate_progress();

        let all_terminal =
            !tasks.is_empty() && tasks.iter().all(|task| task.status.is_terminal());

        let mut finished = false;
        if all_terminal && !job.status.is_terminal() {
            let target = if job.failed_tasks > 0 {
                JobStatus::Failed
            } else {
                JobStatus::Completed
            };
            // Fan-in also finishes a paused job. A state with no edge to
            // the target keeps its refreshed counters and stays put.
            if job.status.can_transition_to(target) {
                job.transition_to(target)?;
                if target == JobStatus::Failed {
                    job.error_message = Some(format!(
                        "{} of {} tasks failed",
                        job.failed_tasks, job.total_tasks
                    ));
                } else {
                    job.result = Some(json!({
                        "total_tasks": job.total_tasks,
                        "completed_tasks": job.completed_tasks,
                        "failed_tasks": job.failed_tasks,
                        "cancelled_tasks": job.cancelled_tasks,
                    }));
                }
                job.progress = job.calculate_progress();
                finished = true;
            }
        }

        self.store.update_job(&job).await?;

        if finished {
            info!(
                job_id = %job.id,
                job = %job.name,
                status = %job.status,
                progress = job.progress,
                "Job finished"
            );
            return Ok(Some(job));
        }
        Ok(None)
    }

    /// The finished job row is already persisted; tell subscribers how it
    /// ended.
    async fn publish_job_finished(&self, job: &Job) {
        let kind = if job.status == JobStatus::Failed {
            EventKind::Failed
        } else {
            EventKind::Completed
        };
        self.events
            .publish(Event::job(
                kind,
                job.id,
                json!({
                    "progress": job.progress,
                    "completed_tasks": job.completed_tasks,
                    "failed_tasks": job.failed_tasks,
                    "cancelled_tasks": job.cancelled_tasks,
                }),
            ))
            .await;
    }

    // ── Cancellation ─────────────────────────────────────────────────────

    /// Cancel a running task.
    ///
    /// Non-preemptive: the state flips immediately and the in-flight run is
    /// signalled through its cancellation watch; a result arriving after
    /// this point is discarded. The allocation is released asynchronously.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<(), Error> {
        let Some(mut task) = self.store.get_task(task_id).await? else {
            return Err(TaskError::NotFound { id: task_id }.into());
        };
        if task.status != TaskStatus::Running {
            return Err(TaskError::NotCancellable {
                id: task_id,
                status: task.status,
            }
            .into());
        }

        task.transition_to(TaskStatus::Cancelled)?;
        self.store.update_task(&task).await?;
        info!(task_id = %task.id, task = %task.name, "Task cancelled");

        let finished = self.recount_job(task.job_id).await?;

        self.events
            .publish(Event::task(
                EventKind::Cancelled,
                task.id,
                json!({ "reason": "Manual cancellation" }),
            ))
            .await;
        if let Some(job) = finished {
            self.publish_job_finished(&job).await;
        }

        {
            let active = self.active.read().await;
            if let Some(exec) = active.get(&task_id) {
                let _ = exec.cancel_tx.send(true);
            }
        }

        if let Some(allocation) = self.resources.allocation_for(task_id).await {
            let store = Arc::clone(&self.store);
            let events = Arc::clone(&self.events);
            let resources = Arc::clone(&self.resources);
            tokio::spawn(async move {
                if let Err(e) = release_resources(
                    store.as_ref(),
                    events.as_ref(),
                    &resources,
                    task_id,
                    &allocation,
                    0.0,
                )
                .await
                {
                    warn!(task_id = %task_id, error = %e, "Failed to release cancelled task's resources");
                }
            });
        }
        Ok(())
    }

    async fn release_task_resources(
        &self,
        task_id: Uuid,
        allocation: &Allocation,
        execution_time: f64,
    ) -> Result<(), Error> {
        release_resources(
            self.store.as_ref(),
            self.events.as_ref(),
            &self.resources,
            task_id,
            allocation,
            execution_time,
        )
        .await
    }
}

// ── Release ──────────────────────────────────────────────────────────────

/// Return the allocated devices to the pool and release the allocation.
///
/// Safe to call twice for the same task: the second call finds the device
/// rows already handed back and the manager release is a no-op.
async fn release_resources(
    store: &dyn Store,
    events: &dyn EventBus,
    resources: &ResourceManager,
    task_id: Uuid,
    allocation: &Allocation,
    execution_time: f64,
) -> Result<(), Error> {
    for device_id in &allocation.device_ids {
        let Some(mut device) = store.get_device(*device_id).await? else {
            warn!(device_id = %device_id, "Allocated device vanished from the store");
            continue;
        };
        // Only touch rows this task still owns; an operator may have
        // re-flagged the device mid-run.
        if device.current_task_id != Some(task_id) {
            continue;
        }
        let old_status = device.status;
        device.current_task_id = None;
        device.total_runtime_seconds += execution_time;
        if device.status == DeviceStatus::Busy {
            device.status = DeviceStatus::Online;
        }
        store.update_device(&device).await?;

        if device.status != old_status {
            events
                .publish(Event::device(
                    EventKind::StatusChanged,
                    device.id,
                    json!({
                        "old_status": old_status,
                        "new_status": device.status,
                    }),
                ))
                .await;
        }
    }

    let fulfilled = resources.release(task_id).await?;
    if !fulfilled.is_empty() {
        debug!(
            task_id = %task_id,
            fulfilled = fulfilled.len(),
            "Release satisfied backlogged requests"
        );
    }
    Ok(())
}

// ── Helpers ──────────────────────────────────────────────────────────────

/// Exponential backoff from the template's base delay, capped.
fn retry_delay(template: &TaskTemplate, retry_count: u32, cap: Duration) -> Duration {
    let base = Duration::from_secs(template.retry_delay_secs);
    base.saturating_mul(2u32.saturating_pow(retry_count)).min(cap)
}

fn count_status(tasks: &[crate::model::Task], status: TaskStatus) -> u32 {
    tasks.iter().filter(|t| t.status == status).count() as u32
}

/// Flip a retrying task back to pending once its backoff has elapsed.
async fn requeue_retrying_task(store: &dyn Store, task_id: Uuid) -> Result<(), Error> {
    let Some(mut task) = store.get_task(task_id).await? else {
        return Ok(());
    };
    if task.status != TaskStatus::Retrying {
        // Cancelled while waiting out the backoff.
        return Ok(());
    }
    task.reset_for_retry();
    task.retry_count += 1;
    task.transition_to(TaskStatus::Pending)?;
    store.update_task(&task).await?;
    debug!(task_id = %task.id, retry_count = task.retry_count, "Task requeued after backoff");
    Ok(())
}
