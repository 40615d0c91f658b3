//! Allocation data types. None of these are persisted.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A task's resource demand.
///
/// One device is selected per entry in `device_type_ids`; a type listed
/// twice gets two distinct devices.
#[derive(Debug, Clone)]
pub struct ResourceRequest {
    pub task_id: Uuid,
    pub device_type_ids: Vec<Uuid>,
    /// Sample positions to reserve across the selected devices.
    pub sample_count: usize,
    pub requested_at: DateTime<Utc>,
}

impl ResourceRequest {
    pub fn new(task_id: Uuid, device_type_ids: Vec<Uuid>, sample_count: usize) -> Self {
        Self {
            task_id,
            device_type_ids,
            sample_count,
            requested_at: Utc::now(),
        }
    }
}

/// An exclusive binding of devices and sample positions to one task.
///
/// Position names identify positions on their own, so names are expected to
/// be unique across the pool.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub task_id: Uuid,
    pub device_ids: Vec<Uuid>,
    pub sample_positions: Vec<String>,
    pub allocated_at: DateTime<Utc>,
}

/// Outcome of a resource request. Queuing is a normal outcome, not an error.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    Allocated(Allocation),
    Queued,
}

impl RequestOutcome {
    pub fn is_allocated(&self) -> bool {
        matches!(self, Self::Allocated(_))
    }
}

/// Point-in-time counters over the resource pool.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceStatus {
    /// Device counts keyed by status name.
    pub devices_by_status: HashMap<String, usize>,
    pub active_allocations: usize,
    pub queued_requests: usize,
    pub total_positions: usize,
    pub held_positions: usize,
    pub free_positions: usize,
}
