//! Task execution.
//!
//! - `executor` — the pipeline: resolve the implementation, run it, fold the
//!   outcome into the task and job rows, release the allocation
//! - `default_run` — simulated execution for templates with no registered
//!   implementation

pub mod default_run;
pub mod executor;

pub use executor::TaskExecutor;
