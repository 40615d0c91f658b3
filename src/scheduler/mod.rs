//! Task scheduling.
//!
//! - `decision` — the per-task `SchedulingDecision`
//! - `scheduler` — the decision chain, the pass, and the polling loop

pub mod decision;
pub mod scheduler;

pub use decision::SchedulingDecision;
pub use scheduler::{Scheduler, SchedulerHandle, spawn_scheduler_loop};
