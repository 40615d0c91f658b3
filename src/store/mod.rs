//! Entity persistence.
//!
//! - `traits` — the backend-agnostic `Store` interface
//! - `memory` — process-local backend used by tests and the demo binary

pub mod memory;
pub mod traits;

pub use memory::MemoryStore;
pub use traits::{Store, TaskFilter};
