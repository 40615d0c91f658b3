//! Conflict-aware resource allocation.
//!
//! - `types` — requests, allocations, pool status
//! - `manager` — the single-mutex allocation authority with FIFO backlog

pub mod manager;
pub mod types;

pub use manager::ResourceManager;
pub use types::{Allocation, RequestOutcome, ResourceRequest, ResourceStatus};
