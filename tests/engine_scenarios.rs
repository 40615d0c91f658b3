//! End-to-end scenarios over the real scheduling loop.
//!
//! Each test wires a full engine (in-memory store, broadcast bus, resource
//! manager, executor, scheduler), seeds devices and templates, submits jobs
//! through the intake, and follows them to a terminal state.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::time::timeout;
use uuid::Uuid;

use labflow::artifacts::{ArtifactStore, LocalArtifactStore};
use labflow::config::EngineConfig;
use labflow::error::ExecutionError;
use labflow::events::{BroadcastBus, Event, EventBus};
use labflow::executor::TaskExecutor;
use labflow::model::{
    Device, DeviceStatus, ExecutionMode, GraphEdge, Job, JobPriority, JobStatus, SamplePosition,
    Task, TaskGraph, TaskNode, TaskStatus, TaskTemplate, Workflow,
};
use labflow::resource::ResourceManager;
use labflow::runnable::{RunContext, RunOutcome, RunnableRegistry, TaskRunnable};
use labflow::scheduler::{Scheduler, SchedulerHandle, spawn_scheduler_loop};
use labflow::store::{MemoryStore, Store, TaskFilter};
use labflow::submit::JobIntake;

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Fails the first `fail_first` runs, then succeeds.
struct FlakyRunnable {
    key: String,
    fail_first: u32,
    calls: AtomicU32,
}

impl FlakyRunnable {
    fn new(key: &str, fail_first: u32) -> Self {
        Self {
            key: key.to_string(),
            fail_first,
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl TaskRunnable for FlakyRunnable {
    fn key(&self) -> &str {
        &self.key
    }

    async fn run(&self, _ctx: &RunContext) -> Result<RunOutcome, ExecutionError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first {
            return Ok(RunOutcome::failed("instrument glitch", 0.01));
        }
        Ok(RunOutcome::completed(HashMap::new(), 0.01))
    }
}

/// Runs until the cancellation watch fires.
struct BlockUntilCancelled {
    key: String,
}

#[async_trait]
impl TaskRunnable for BlockUntilCancelled {
    fn key(&self) -> &str {
        &self.key
    }

    async fn run(&self, ctx: &RunContext) -> Result<RunOutcome, ExecutionError> {
        let mut cancel = ctx.cancel_signal();
        match timeout(Duration::from_secs(10), cancel.changed()).await {
            Ok(Ok(())) if ctx.is_cancelled() => Err(ExecutionError::Cancelled),
            _ => Ok(RunOutcome::failed("cancellation never arrived", 0.0)),
        }
    }
}

/// A fully wired engine over an in-memory store.
struct Engine {
    store: Arc<MemoryStore>,
    bus: Arc<BroadcastBus>,
    resources: Arc<ResourceManager>,
    registry: Arc<RunnableRegistry>,
    executor: Arc<TaskExecutor>,
    scheduler: Arc<Scheduler>,
    intake: JobIntake,
    _artifact_dir: tempfile::TempDir,
}

fn engine() -> Engine {
    let config = EngineConfig {
        poll_interval: Duration::from_millis(25),
        error_backoff: Duration::from_millis(50),
        ..EngineConfig::default()
    };

    let store: Arc<MemoryStore> = Arc::new(MemoryStore::default());
    let bus = Arc::new(BroadcastBus::new());
    let events: Arc<dyn EventBus> = bus.clone();
    let resources = Arc::new(ResourceManager::new(
        store.clone() as Arc<dyn Store>,
        &config,
    ));
    let registry = Arc::new(RunnableRegistry::new());

    let artifact_dir = tempfile::tempdir().unwrap();
    let artifacts: Arc<dyn ArtifactStore> =
        Arc::new(LocalArtifactStore::new(artifact_dir.path().to_path_buf()));

    let executor = Arc::new(TaskExecutor::new(
        store.clone() as Arc<dyn Store>,
        events.clone(),
        resources.clone(),
        registry.clone(),
        artifacts,
        config.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(
        store.clone() as Arc<dyn Store>,
        events.clone(),
        resources.clone(),
        executor.clone(),
        config,
    ));
    let intake = JobIntake::new(store.clone() as Arc<dyn Store>, events, resources.clone());

    Engine {
        store,
        bus,
        resources,
        registry,
        executor,
        scheduler,
        intake,
        _artifact_dir: artifact_dir,
    }
}

impl Engine {
    fn start(&self) -> SchedulerHandle {
        spawn_scheduler_loop(self.scheduler.clone())
    }

    /// Insert an online device with the given positions.
    async fn seed_device(&self, name: &str, type_id: Uuid, positions: &[&str]) -> Device {
        let positions = positions.iter().map(|p| SamplePosition::new(*p)).collect();
        let mut device = Device::new(name, type_id, positions);
        device.status = DeviceStatus::Online;
        self.store.insert_device(&device).await.unwrap();
        device
    }

    /// Insert an instant template for the given device type.
    async fn seed_template(
        &self,
        name: &str,
        type_id: Uuid,
        implementation: Option<&str>,
    ) -> TaskTemplate {
        let mut template = TaskTemplate::new(name);
        template.required_device_types = vec![type_id];
        template.estimated_duration = Some(0);
        template.implementation = implementation.map(str::to_string);
        self.store.insert_template(&template).await.unwrap();
        template
    }

    /// Create and queue a job whose tasks form a chain in template order.
    async fn submit_chain(
        &self,
        name: &str,
        priority: JobPriority,
        templates: &[&TaskTemplate],
    ) -> Job {
        let nodes = templates
            .iter()
            .map(|t| TaskNode::new(t.name.clone(), t.id))
            .collect::<Vec<_>>();
        let edges = templates
            .windows(2)
            .map(|pair| GraphEdge::new(pair[0].name.clone(), pair[1].name.clone()))
            .collect::<Vec<_>>();
        let workflow = self
            .intake
            .create_workflow(Workflow::new(
                format!("{name}-wf"),
                TaskGraph { nodes, edges },
            ))
            .await
            .unwrap();
        let job = self
            .intake
            .create_job(workflow.id, name, priority, ExecutionMode::Normal)
            .await
            .unwrap();
        self.intake.queue_job(job.id).await.unwrap()
    }

    /// Poll until the job reaches a terminal state.
    async fn wait_for_job(&self, job_id: Uuid) -> Job {
        loop {
            let job = self.store.get_job(job_id).await.unwrap().unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until the task reaches the given status.
    async fn wait_for_task_status(&self, task_id: Uuid, status: TaskStatus) -> Task {
        loop {
            let task = self.store.get_task(task_id).await.unwrap().unwrap();
            if task.status == status {
                return task;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn tasks_of(&self, job_id: Uuid) -> Vec<Task> {
        self.store
            .list_tasks(TaskFilter::for_job(job_id))
            .await
            .unwrap()
    }
}

/// Drain everything the bus buffered so far.
fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ── Scenario 1: dependency chain ─────────────────────────────────────────

#[tokio::test]
async fn linear_chain_runs_in_dependency_order() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine();
        let thermal = Uuid::new_v4();
        engine.seed_device("heater-1", thermal, &["A1"]).await;

        let a = engine.seed_template("prepare", thermal, None).await;
        let b = engine.seed_template("anneal", thermal, None).await;
        let c = engine.seed_template("verify", thermal, None).await;

        let mut rx = engine.bus.subscribe();
        let handle = engine.start();
        let job = engine
            .submit_chain("chain", JobPriority::Normal, &[&a, &b, &c])
            .await;

        let job = engine.wait_for_job(job.id).await;
        handle.stop().await;
        engine.executor.shutdown().await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);
        assert_eq!(job.completed_tasks, 3);

        let tasks = engine.tasks_of(job.id).await;
        assert!(tasks.iter().all(|t| t.status == TaskStatus::Completed));

        // task.started events arrive in dependency order.
        let by_id: HashMap<Uuid, &Task> = tasks.iter().map(|t| (t.id, t)).collect();
        let started_names: Vec<&str> = drain_events(&mut rx)
            .iter()
            .filter(|e| e.topic() == "task.started")
            .filter_map(|e| by_id.get(&e.entity_id).map(|t| t.name.as_str()))
            .collect();
        assert_eq!(started_names, vec!["prepare", "anneal", "verify"]);

        // A predecessor finishes before its successor starts.
        let by_name: HashMap<&str, &Task> = tasks.iter().map(|t| (t.name.as_str(), t)).collect();
        assert!(by_name["prepare"].completed_at <= by_name["anneal"].started_at);
        assert!(by_name["anneal"].completed_at <= by_name["verify"].started_at);
    })
    .await
    .expect("test timed out");
}

// ── Scenario 2: contention on one device ─────────────────────────────────

#[tokio::test]
async fn contended_device_serializes_jobs() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine();
        let optical = Uuid::new_v4();
        let device = engine.seed_device("reader-1", optical, &["C1"]).await;
        let template = engine.seed_template("scan", optical, None).await;

        let handle = engine.start();
        let first = engine
            .submit_chain("first", JobPriority::Normal, &[&template])
            .await;
        let second = engine
            .submit_chain("second", JobPriority::Normal, &[&template])
            .await;

        let first = engine.wait_for_job(first.id).await;
        let second = engine.wait_for_job(second.id).await;
        handle.stop().await;
        engine.executor.shutdown().await;

        assert_eq!(first.status, JobStatus::Completed);
        assert_eq!(second.status, JobStatus::Completed);

        let t1 = engine.tasks_of(first.id).await.remove(0);
        let t2 = engine.tasks_of(second.id).await.remove(0);
        assert_eq!(t1.assigned_device_id, Some(device.id));
        assert_eq!(t2.assigned_device_id, Some(device.id));

        // The device never ran both at once: the earlier job finished
        // before the later one started.
        assert!(t1.completed_at <= t2.started_at);

        let status = engine.resources.status().await.unwrap();
        assert_eq!(status.active_allocations, 0);
        assert_eq!(status.queued_requests, 0);
    })
    .await
    .expect("test timed out");
}

// ── Scenario 3: failure and retries ──────────────────────────────────────

#[tokio::test]
async fn flaky_task_retries_and_completes() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine();
        let thermal = Uuid::new_v4();
        engine.seed_device("heater-1", thermal, &["A1"]).await;

        let mut template = TaskTemplate::new("flaky-step");
        template.required_device_types = vec![thermal];
        template.estimated_duration = Some(0);
        template.implementation = Some("flaky".to_string());
        template.max_retries = 2;
        template.retry_delay_secs = 0;
        engine.store.insert_template(&template).await.unwrap();
        engine
            .registry
            .register(Arc::new(FlakyRunnable::new("flaky", 1)))
            .await;

        let handle = engine.start();
        let job = engine
            .submit_chain("flaky-run", JobPriority::Normal, &[&template])
            .await;

        let job = engine.wait_for_job(job.id).await;
        handle.stop().await;
        engine.executor.shutdown().await;

        assert_eq!(job.status, JobStatus::Completed);
        let task = engine.tasks_of(job.id).await.remove(0);
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error_message, None);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn exhausted_retries_fail_the_job_and_free_the_device() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine();
        let thermal = Uuid::new_v4();
        let device = engine.seed_device("heater-1", thermal, &["A1"]).await;

        let mut template = TaskTemplate::new("broken-step");
        template.required_device_types = vec![thermal];
        template.estimated_duration = Some(0);
        template.implementation = Some("broken".to_string());
        template.max_retries = 1;
        template.retry_delay_secs = 0;
        engine.store.insert_template(&template).await.unwrap();
        engine
            .registry
            .register(Arc::new(FlakyRunnable::new("broken", u32::MAX)))
            .await;

        let mut rx = engine.bus.subscribe();
        let handle = engine.start();
        let job = engine
            .submit_chain("broken-run", JobPriority::Normal, &[&template])
            .await;

        let job = engine.wait_for_job(job.id).await;
        handle.stop().await;
        engine.executor.shutdown().await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.failed_tasks, 1);
        assert_eq!(job.error_message.as_deref(), Some("1 of 1 tasks failed"));

        let task = engine.tasks_of(job.id).await.remove(0);
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 1);
        assert_eq!(task.error_message.as_deref(), Some("instrument glitch"));

        // Device back in the pool despite the failure.
        let device = engine.store.get_device(device.id).await.unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Online);
        assert_eq!(device.current_task_id, None);

        let events = drain_events(&mut rx);
        assert!(events.iter().any(|e| e.topic() == "task.retrying"));
        assert!(events.iter().any(|e| e.topic() == "task.failed"));
        assert!(events.iter().any(|e| e.topic() == "job.failed"));
    })
    .await
    .expect("test timed out");
}

// ── Scenario 4: priority ─────────────────────────────────────────────────

#[tokio::test]
async fn urgent_job_takes_the_contended_device_first() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine();
        let optical = Uuid::new_v4();
        engine.seed_device("reader-1", optical, &["C1"]).await;
        let template = engine.seed_template("scan", optical, None).await;

        // Queue the normal job before the urgent one, then start the loop.
        let normal = engine
            .submit_chain("normal", JobPriority::Normal, &[&template])
            .await;
        let urgent = engine
            .submit_chain("urgent", JobPriority::Urgent, &[&template])
            .await;
        let handle = engine.start();

        let normal = engine.wait_for_job(normal.id).await;
        let urgent = engine.wait_for_job(urgent.id).await;
        handle.stop().await;
        engine.executor.shutdown().await;

        assert_eq!(normal.status, JobStatus::Completed);
        assert_eq!(urgent.status, JobStatus::Completed);

        let normal_task = engine.tasks_of(normal.id).await.remove(0);
        let urgent_task = engine.tasks_of(urgent.id).await.remove(0);
        assert!(urgent_task.started_at < normal_task.started_at);
    })
    .await
    .expect("test timed out");
}

// ── Scenario 5: cancellation ─────────────────────────────────────────────

#[tokio::test]
async fn cancelling_a_running_task_frees_the_device_for_the_next_job() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine();
        let thermal = Uuid::new_v4();
        engine.seed_device("heater-1", thermal, &["A1"]).await;

        let mut blocking = TaskTemplate::new("endless");
        blocking.required_device_types = vec![thermal];
        blocking.estimated_duration = Some(0);
        blocking.implementation = Some("block".to_string());
        engine.store.insert_template(&blocking).await.unwrap();
        engine
            .registry
            .register(Arc::new(BlockUntilCancelled {
                key: "block".to_string(),
            }))
            .await;

        let quick = engine.seed_template("quick", thermal, None).await;

        let handle = engine.start();
        let blocked_job = engine
            .submit_chain("blocked", JobPriority::Normal, &[&blocking])
            .await;

        let blocked_task = engine.tasks_of(blocked_job.id).await.remove(0);
        engine
            .wait_for_task_status(blocked_task.id, TaskStatus::Running)
            .await;
        engine.executor.cancel_task(blocked_task.id).await.unwrap();

        let blocked_task = engine
            .wait_for_task_status(blocked_task.id, TaskStatus::Cancelled)
            .await;
        assert!(blocked_task.outputs.is_none());

        // The freed device carries the next job.
        let next = engine
            .submit_chain("after-cancel", JobPriority::Normal, &[&quick])
            .await;
        let next = engine.wait_for_job(next.id).await;
        assert_eq!(next.status, JobStatus::Completed);

        let blocked_job = engine.wait_for_job(blocked_job.id).await;
        assert_eq!(blocked_job.cancelled_tasks, 1);
        assert_eq!(blocked_job.status, JobStatus::Completed);

        handle.stop().await;
        engine.executor.shutdown().await;

        let status = engine.resources.status().await.unwrap();
        assert_eq!(status.active_allocations, 0);
    })
    .await
    .expect("test timed out");
}

// ── Cross-component properties ───────────────────────────────────────────

#[tokio::test]
async fn parallel_jobs_never_share_a_device() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine();
        let thermal = Uuid::new_v4();
        let d1 = engine.seed_device("heater-1", thermal, &["A1"]).await;
        let d2 = engine.seed_device("heater-2", thermal, &["B1"]).await;
        let template = engine.seed_template("bake", thermal, None).await;

        let handle = engine.start();
        let mut jobs = Vec::new();
        for i in 0..3 {
            jobs.push(
                engine
                    .submit_chain(&format!("bake-{i}"), JobPriority::Normal, &[&template])
                    .await,
            );
        }

        let mut tasks = Vec::new();
        for job in &jobs {
            let job = engine.wait_for_job(job.id).await;
            assert_eq!(job.status, JobStatus::Completed);
            tasks.push(engine.tasks_of(job.id).await.remove(0));
        }
        handle.stop().await;
        engine.executor.shutdown().await;

        let pool = [d1.id, d2.id];
        for task in &tasks {
            assert!(pool.contains(&task.assigned_device_id.unwrap()));
        }

        // Runs sharing a device never overlapped in time.
        for a in &tasks {
            for b in &tasks {
                if a.id != b.id && a.assigned_device_id == b.assigned_device_id {
                    assert!(
                        a.completed_at <= b.started_at || b.completed_at <= a.started_at,
                        "overlapping runs on the same device"
                    );
                }
            }
        }

        let status = engine.resources.status().await.unwrap();
        assert_eq!(status.active_allocations, 0);
        assert_eq!(status.held_positions, 0);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn manual_retry_after_failure_reruns_the_job() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine();
        let thermal = Uuid::new_v4();
        engine.seed_device("heater-1", thermal, &["A1"]).await;

        let mut template = TaskTemplate::new("one-shot");
        template.required_device_types = vec![thermal];
        template.estimated_duration = Some(0);
        template.implementation = Some("second-time-lucky".to_string());
        engine.store.insert_template(&template).await.unwrap();
        // No task-level retries: the first failure fails the job, the
        // manual requeue gives it a second run.
        engine
            .registry
            .register(Arc::new(FlakyRunnable::new("second-time-lucky", 1)))
            .await;

        let handle = engine.start();
        let job = engine
            .submit_chain("manual-retry", JobPriority::Normal, &[&template])
            .await;

        let job = engine.wait_for_job(job.id).await;
        assert_eq!(job.status, JobStatus::Failed);

        let job = engine
            .intake
            .update_job_status(job.id, JobStatus::Queued)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        let job = engine.wait_for_job(job.id).await;
        handle.stop().await;
        engine.executor.shutdown().await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.retry_count, 1);
        let task = engine.tasks_of(job.id).await.remove(0);
        assert_eq!(task.status, TaskStatus::Completed);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn lifecycle_events_carry_the_documented_payloads() {
    timeout(TEST_TIMEOUT, async {
        let engine = engine();
        let thermal = Uuid::new_v4();
        engine.seed_device("heater-1", thermal, &["A1"]).await;
        let template = engine.seed_template("step", thermal, None).await;

        let mut rx = engine.bus.subscribe();
        let handle = engine.start();
        let job = engine
            .submit_chain("events", JobPriority::Normal, &[&template])
            .await;
        engine.wait_for_job(job.id).await;
        handle.stop().await;
        engine.executor.shutdown().await;

        let events = drain_events(&mut rx);
        let topics: Vec<String> = events.iter().map(|e| e.topic()).collect();
        for expected in [
            "workflow.created",
            "workflow.status_changed",
            "job.created",
            "job.queued",
            "job.started",
            "task.started",
            "task.completed",
            "job.completed",
            "device.status_changed",
        ] {
            assert!(
                topics.iter().any(|t| t == expected),
                "missing topic {expected}, saw {topics:?}"
            );
        }

        let queued = events.iter().find(|e| e.topic() == "job.queued").unwrap();
        assert_eq!(queued.data["position"], json!(0));

        let started = events.iter().find(|e| e.topic() == "task.started").unwrap();
        assert!(started.data["device_id"].is_string());

        // Tasks precede their job's terminal event.
        let task_done = topics.iter().position(|t| t == "task.completed").unwrap();
        let job_done = topics.iter().position(|t| t == "job.completed").unwrap();
        assert!(task_done < job_done);
    })
    .await
    .expect("test timed out");
}
