//! Task implementations and their registry.

pub mod registry;
pub mod runnable;

pub use registry::RunnableRegistry;
pub use runnable::{RunContext, RunOutcome, RunStatus, TaskRunnable};
