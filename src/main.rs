use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use labflow::artifacts::{ArtifactStore, LocalArtifactStore};
use labflow::config::EngineConfig;
use labflow::devices::{DeviceDriver, SimulatedDriver, sync_device_status};
use labflow::error::ExecutionError;
use labflow::events::{BroadcastBus, EventBus};
use labflow::executor::TaskExecutor;
use labflow::model::{
    Device, ExecutionMode, GraphEdge, JobPriority, SamplePosition, TaskGraph, TaskNode,
    TaskOutput, TaskTemplate, Workflow,
};
use labflow::resource::ResourceManager;
use labflow::runnable::{RunContext, RunOutcome, RunnableRegistry, TaskRunnable};
use labflow::scheduler::{Scheduler, spawn_scheduler_loop};
use labflow::store::{MemoryStore, Store};
use labflow::submit::JobIntake;

/// Demo implementation: reads one sensor value from each allocated device.
struct MeasureSample;

#[async_trait::async_trait]
impl TaskRunnable for MeasureSample {
    fn key(&self) -> &str {
        "measure_sample"
    }

    async fn run(&self, ctx: &RunContext) -> Result<RunOutcome, ExecutionError> {
        let started = std::time::Instant::now();
        let mut outputs = HashMap::new();
        for driver in ctx.devices.values() {
            let value = driver
                .execute_command("read_sensor", &serde_json::json!({}))
                .await?;
            outputs.insert("reading".to_string(), TaskOutput::value(value, "number"));
        }
        Ok(RunOutcome::completed(
            outputs,
            started.elapsed().as_secs_f64(),
        ))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let poll_secs: u64 = std::env::var("LABFLOW_POLL_INTERVAL_SECS")
        .unwrap_or_else(|_| "1".to_string())
        .parse()
        .unwrap_or(1);

    let max_parallel: usize = std::env::var("LABFLOW_MAX_PARALLEL")
        .unwrap_or_else(|_| "10".to_string())
        .parse()
        .unwrap_or(10);

    let artifact_dir = std::env::var("LABFLOW_ARTIFACT_DIR")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::env::temp_dir().join("labflow-artifacts"));

    let config = EngineConfig {
        poll_interval: Duration::from_secs(poll_secs),
        max_parallel_executions: max_parallel,
        ..EngineConfig::default()
    };

    eprintln!("⚗️  Labflow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Poll interval: {}s", poll_secs);
    eprintln!("   Max parallel executions: {}", max_parallel);
    eprintln!("   Artifacts: {}\n", artifact_dir.display());

    // ── Engine wiring ────────────────────────────────────────────────────
    let store: Arc<MemoryStore> = Arc::new(MemoryStore::default());
    let events = Arc::new(BroadcastBus::new());
    let resources = Arc::new(ResourceManager::new(
        store.clone() as Arc<dyn Store>,
        &config,
    ));
    let registry = Arc::new(RunnableRegistry::new());
    registry.register(Arc::new(MeasureSample)).await;

    let artifacts: Arc<dyn ArtifactStore> = Arc::new(LocalArtifactStore::new(artifact_dir));

    let executor = Arc::new(TaskExecutor::new(
        store.clone() as Arc<dyn Store>,
        events.clone() as Arc<dyn EventBus>,
        resources.clone(),
        registry,
        artifacts,
        config.clone(),
    ));

    // ── Inventory: two device types, three devices ───────────────────────
    let thermal_type = uuid::Uuid::new_v4();
    let optical_type = uuid::Uuid::new_v4();

    let devices = vec![
        Device::new(
            "heater-1",
            thermal_type,
            vec![SamplePosition::new("A1"), SamplePosition::new("A2")],
        ),
        Device::new(
            "heater-2",
            thermal_type,
            vec![SamplePosition::new("B1"), SamplePosition::new("B2")],
        ),
        Device::new("reader-1", optical_type, vec![SamplePosition::new("C1")]),
    ];
    for device in &devices {
        store.insert_device(device).await?;
        let driver: Arc<dyn DeviceDriver> = Arc::new(SimulatedDriver::for_device(device));
        // Drivers report online; sync flips the store rows to match.
        sync_device_status(store.as_ref(), device.id, driver.as_ref()).await?;
        executor.register_driver(device.id, driver).await;
    }
    eprintln!("   Devices: {} registered", devices.len());

    // ── Templates and workflow: heat → measure → cool ────────────────────
    let mut heat = TaskTemplate::new("heat");
    heat.required_device_types = vec![thermal_type];
    heat.estimated_duration = Some(0);

    let mut measure = TaskTemplate::new("measure");
    measure.implementation = Some("measure_sample".to_string());
    measure.required_device_types = vec![optical_type];
    measure.estimated_duration = Some(0);
    measure.output_schema = serde_json::json!({
        "reading": { "type": "number" },
        "report": { "type": "file" },
    });

    let mut cool = TaskTemplate::new("cool");
    cool.required_device_types = vec![thermal_type];
    cool.estimated_duration = Some(0);

    for template in [&heat, &measure, &cool] {
        store.insert_template(template).await?;
    }

    let graph = TaskGraph {
        nodes: vec![
            TaskNode::new("heat", heat.id),
            TaskNode::new("measure", measure.id),
            TaskNode::new("cool", cool.id),
        ],
        edges: vec![
            GraphEdge::new("heat", "measure"),
            GraphEdge::new("measure", "cool"),
        ],
    };

    let intake = JobIntake::new(
        store.clone() as Arc<dyn Store>,
        events.clone() as Arc<dyn EventBus>,
        resources.clone(),
    );
    let workflow = intake
        .create_workflow(Workflow::new("anneal-and-measure", graph))
        .await?;

    // ── Event tap ────────────────────────────────────────────────────────
    let mut event_rx = events.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = event_rx.recv().await {
            tracing::debug!(topic = %event.topic(), entity = %event.entity_id, "event");
        }
    });

    // ── Run one job to completion ────────────────────────────────────────
    let scheduler = Arc::new(Scheduler::new(
        store.clone() as Arc<dyn Store>,
        events.clone() as Arc<dyn EventBus>,
        resources.clone(),
        executor.clone(),
        config,
    ));
    let handle = spawn_scheduler_loop(scheduler);

    let job = intake
        .create_job(
            workflow.id,
            "demo-run",
            JobPriority::Normal,
            ExecutionMode::Normal,
        )
        .await?;
    intake.queue_job(job.id).await?;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(60);
    let finished = loop {
        if tokio::time::Instant::now() > deadline {
            break None;
        }
        if let Some(current) = store.get_job(job.id).await?
            && current.status.is_terminal()
        {
            break Some(current);
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    };

    match &finished {
        Some(job) => {
            eprintln!(
                "\n   Job '{}' {} ({}% — {} completed, {} failed, {} cancelled)",
                job.name,
                job.status,
                job.progress,
                job.completed_tasks,
                job.failed_tasks,
                job.cancelled_tasks,
            );
        }
        None => eprintln!("\n   Job did not finish within 60s"),
    }

    let status = resources.status().await?;
    eprintln!("   Resources: {}", serde_json::to_string_pretty(&status)?);

    handle.stop().await;
    executor.shutdown().await;
    Ok(())
}
