//! Default execution for templates with no registered implementation.
//!
//! Simulates the run: sleeps a tenth of the template's estimated duration
//! (capped at 30 seconds), then synthesizes placeholder outputs matching the
//! template's output schema. File-typed outputs are uploaded through the
//! artifact store so downstream consumers see real URLs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use serde_json::json;
use tracing::debug;

use crate::error::ExecutionError;
use crate::model::{FileMetadata, TaskOutput, TaskTemplate};
use crate::runnable::{RunContext, RunOutcome};

const MAX_SIMULATED_SLEEP_SECS: u64 = 30;

pub(crate) async fn default_run(
    template: &TaskTemplate,
    ctx: &RunContext,
) -> Result<RunOutcome, ExecutionError> {
    let started = Instant::now();
    let sleep_secs = simulated_sleep_secs(template);
    debug!(task_id = %ctx.task_id, sleep_secs, "Default execution started");

    let mut cancel = ctx.cancel_signal();
    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
        changed = cancel.changed() => {
            if changed.is_ok() && *cancel.borrow() {
                return Err(ExecutionError::Cancelled);
            }
        }
    }

    let outputs = synthesize_outputs(template, ctx).await?;
    let mut outcome = RunOutcome::completed(outputs, started.elapsed().as_secs_f64());
    outcome.metadata = json!({ "mode": "default_execution" });
    Ok(outcome)
}

/// A tenth of the estimated duration, capped. Templates without an estimate
/// get the cap.
fn simulated_sleep_secs(template: &TaskTemplate) -> u64 {
    match template.estimated_duration {
        Some(minutes) => (u64::from(minutes) * 60 / 10).min(MAX_SIMULATED_SLEEP_SECS),
        None => MAX_SIMULATED_SLEEP_SECS,
    }
}

/// Placeholder outputs, one per entry of the template's output schema.
async fn synthesize_outputs(
    template: &TaskTemplate,
    ctx: &RunContext,
) -> Result<HashMap<String, TaskOutput>, ExecutionError> {
    let mut outputs = HashMap::new();
    let Some(schema) = template.output_schema.as_object() else {
        return Ok(outputs);
    };

    for (name, entry) in schema {
        let output_type = entry
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or("string");

        let output = match output_type {
            "file" => {
                let key = format!("tasks/{}/{}.txt", ctx.task_id, name);
                let content = format!("Simulated output {} for task {}\n", name, ctx.task_id);
                let url = ctx.artifacts.put(&key, content.as_bytes()).await?;
                TaskOutput::file(
                    url,
                    FileMetadata {
                        size: content.len() as u64,
                        content_type: "text/plain".to_string(),
                    },
                )
            }
            "number" => {
                let reading: f64 = rand::thread_rng().gen_range(0.0..100.0);
                TaskOutput::value(json!(reading), "number")
            }
            other => TaskOutput::value(json!(format!("Simulated result for {name}")), other),
        };
        outputs.insert(name.clone(), output);
    }
    Ok(outputs)
}
