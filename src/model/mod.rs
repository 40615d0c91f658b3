//! Entity records and state machines.
//!
//! Core entities:
//! - `workflow` — Workflow + TaskGraph (the reusable dependency graph)
//! - `job` — Job (one execution instance of a workflow) + progress math
//! - `task` — Task, TaskTemplate, TaskOutput + the task state machine
//! - `device` — Device records and sample positions

pub mod device;
pub mod job;
pub mod task;
pub mod workflow;

pub use device::{Device, DeviceStatus, SamplePosition};
pub use job::{ExecutionMode, Job, JobPriority, JobStatus};
pub use task::{FileMetadata, Task, TaskOutput, TaskStatus, TaskTemplate};
pub use workflow::{GraphEdge, TaskGraph, TaskNode, Workflow, WorkflowStatus};
