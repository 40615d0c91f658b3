//! Device records — physical resource instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// State of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    /// Device is unreachable.
    Offline,
    /// Device is reachable and idle.
    Online,
    /// Device is allocated to a running task.
    Busy,
    /// Device is under maintenance.
    Maintenance,
    /// Device reported a fault.
    Error,
    /// Device state has not been observed yet.
    Unknown,
}

impl DeviceStatus {
    /// Reachable and healthy (idle or working), as opposed to faulted,
    /// offline, or under maintenance.
    pub fn is_operational(&self) -> bool {
        matches!(self, Self::Online | Self::Busy)
    }
}

impl std::fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Offline => "offline",
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Maintenance => "maintenance",
            Self::Error => "error",
            Self::Unknown => "unknown",
        };
        write!(f, "{s}")
    }
}

/// A named sub-capacity slot within a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplePosition {
    pub name: String,
}

impl SamplePosition {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// A physical resource instance of a device type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    /// Identity of the device type this instance belongs to.
    pub device_type_id: Uuid,
    pub status: DeviceStatus,
    /// Administrative availability flag, independent of `status`.
    pub is_available: bool,
    /// The task currently holding this device, if any.
    pub current_task_id: Option<Uuid>,
    /// Fixed set of named sample positions.
    pub sample_positions: Vec<SamplePosition>,
    /// Accumulated execution time across all tasks run on this device.
    pub total_runtime_seconds: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Create a new device record, initially offline until a driver reports in.
    pub fn new(
        name: impl Into<String>,
        device_type_id: Uuid,
        sample_positions: Vec<SamplePosition>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            device_type_id,
            status: DeviceStatus::Offline,
            is_available: true,
            current_task_id: None,
            sample_positions,
            total_runtime_seconds: 0.0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Can this device take a new allocation right now?
    pub fn is_allocatable(&self) -> bool {
        self.status == DeviceStatus::Online && self.is_available
    }

    /// Is this device part of the usable pool (idle or merely busy)?
    ///
    /// Busy devices still count towards structural availability: a request
    /// against them queues in the backlog rather than failing outright.
    pub fn is_operational(&self) -> bool {
        self.is_available && self.status.is_operational()
    }

    /// Iterate the names of this device's sample positions.
    pub fn position_names(&self) -> impl Iterator<Item = &str> {
        self.sample_positions.iter().map(|p| p.name.as_str())
    }
}
