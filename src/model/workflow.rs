//! Workflow records and the task-graph definition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::WorkflowError;

/// State of a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    /// Being authored; no jobs yet.
    Draft,
    /// Has at least one job.
    Active,
    /// A job of this workflow is executing.
    Running,
    /// Suspended.
    Paused,
    /// Finished successfully.
    Completed,
    /// Finished with failures.
    Failed,
    /// Cancelled by request.
    Cancelled,
}

impl WorkflowStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkflowStatus) -> bool {
        use WorkflowStatus::*;

        matches!(
            (self, target),
            // From Draft
            (Draft, Active) | (Draft, Cancelled) |
            // From Active
            (Active, Running) | (Active, Paused) | (Active, Cancelled) |
            // From Running
            (Running, Completed) | (Running, Failed) | (Running, Paused) |
            // From Paused
            (Paused, Running) | (Paused, Cancelled)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check if new jobs may be created against this workflow.
    pub fn accepts_jobs(&self) -> bool {
        matches!(self, Self::Draft | Self::Active)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One node of a workflow's task graph: a template reference plus inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNode {
    /// Graph-local key the edges refer to.
    pub key: String,
    pub template_id: Uuid,
    #[serde(default)]
    pub inputs: serde_json::Value,
    /// Task priority, 1 (low) to 4 (urgent).
    #[serde(default = "default_priority")]
    pub priority: u8,
}

fn default_priority() -> u8 {
    1
}

impl TaskNode {
    pub fn new(key: impl Into<String>, template_id: Uuid) -> Self {
        Self {
            key: key.into(),
            template_id,
            inputs: serde_json::Value::Null,
            priority: 1,
        }
    }
}

/// A directed dependency edge: `from` must complete before `to` starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
}

impl GraphEdge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

/// Declared task graph of a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    pub nodes: Vec<TaskNode>,
    pub edges: Vec<GraphEdge>,
}

/// A reusable task-dependency graph plus execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub graph: TaskGraph,
    /// Number of sample positions a job of this workflow reserves.
    pub sample_count: usize,
    /// Default concurrency bound copied onto jobs at creation.
    pub max_concurrent_tasks: usize,
    /// Declarative start/stop condition descriptors, carried for operators.
    pub start_conditions: Vec<serde_json::Value>,
    pub stop_conditions: Vec<serde_json::Value>,
    pub status: WorkflowStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workflow {
    pub fn new(name: impl Into<String>, graph: TaskGraph) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            graph,
            sample_count: 1,
            max_concurrent_tasks: 10,
            start_conditions: Vec::new(),
            stop_conditions: Vec::new(),
            status: WorkflowStatus::Draft,
            created_at: now,
            updated_at: now,
        }
    }

    /// Transition to a new status.
    pub fn transition_to(&mut self, target: WorkflowStatus) -> Result<(), WorkflowError> {
        if !self.status.can_transition_to(target) {
            return Err(WorkflowError::InvalidTransition {
                id: self.id,
                status: self.status,
                target,
            });
        }
        self.status = target;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transitions_valid() {
        assert!(WorkflowStatus::Draft.can_transition_to(WorkflowStatus::Active));
        assert!(WorkflowStatus::Active.can_transition_to(WorkflowStatus::Running));
        assert!(WorkflowStatus::Running.can_transition_to(WorkflowStatus::Completed));
        assert!(WorkflowStatus::Running.can_transition_to(WorkflowStatus::Paused));
        assert!(WorkflowStatus::Paused.can_transition_to(WorkflowStatus::Running));
    }

    #[test]
    fn transitions_invalid() {
        assert!(!WorkflowStatus::Draft.can_transition_to(WorkflowStatus::Running));
        assert!(!WorkflowStatus::Completed.can_transition_to(WorkflowStatus::Active));
        assert!(!WorkflowStatus::Running.can_transition_to(WorkflowStatus::Cancelled));
        assert!(!WorkflowStatus::Cancelled.can_transition_to(WorkflowStatus::Draft));
    }

    #[test]
    fn draft_and_active_accept_jobs() {
        assert!(WorkflowStatus::Draft.accepts_jobs());
        assert!(WorkflowStatus::Active.accepts_jobs());
        assert!(!WorkflowStatus::Running.accepts_jobs());
        assert!(!WorkflowStatus::Cancelled.accepts_jobs());
    }

    #[test]
    fn graph_serde_roundtrip() {
        let template = Uuid::new_v4();
        let graph = TaskGraph {
            nodes: vec![TaskNode::new("heat", template), TaskNode::new("cool", template)],
            edges: vec![GraphEdge::new("heat", "cool")],
        };
        let json = serde_json::to_string(&graph).unwrap();
        let parsed: TaskGraph = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.edges, vec![GraphEdge::new("heat", "cool")]);
        assert_eq!(parsed.nodes[0].priority, 1);
    }

    #[test]
    fn new_workflow_is_draft() {
        let wf = Workflow::new("anneal", TaskGraph::default());
        assert_eq!(wf.status, WorkflowStatus::Draft);
        assert_eq!(wf.sample_count, 1);
    }
}
