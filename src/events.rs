//! Lifecycle event publishing.
//!
//! Every state change of interest produces one [`Event`] on the bus, topic
//! `"<entity>.<kind>"` (`task.started`, `job.completed`,
//! `device.status_changed`). Delivery is fire-and-forget: publish failures
//! are logged by the bus implementation and never escalated to callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// Default capacity of the in-process broadcast channel.
const DEFAULT_BROADCAST_CAPACITY: usize = 256;

/// Which entity an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Workflow,
    Job,
    Task,
    Device,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Workflow => "workflow",
            Self::Job => "job",
            Self::Task => "task",
            Self::Device => "device",
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What happened to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Queued,
    Started,
    Completed,
    Failed,
    Cancelled,
    Retrying,
    StatusChanged,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Retrying => "retrying",
            Self::StatusChanged => "status_changed",
        }
    }

    /// Whether this event marks the end of an entity's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One lifecycle notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventKind,
    pub entity_id: Uuid,
    pub entity_type: EntityType,
    pub timestamp: DateTime<Utc>,
    /// Event-specific payload, e.g. `{"device_id": ...}` for `task.started`.
    pub data: serde_json::Value,
}

impl Event {
    pub fn new(
        entity_type: EntityType,
        event_type: EventKind,
        entity_id: Uuid,
        data: serde_json::Value,
    ) -> Self {
        Self {
            event_type,
            entity_id,
            entity_type,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn workflow(kind: EventKind, id: Uuid, data: serde_json::Value) -> Self {
        Self::new(EntityType::Workflow, kind, id, data)
    }

    pub fn job(kind: EventKind, id: Uuid, data: serde_json::Value) -> Self {
        Self::new(EntityType::Job, kind, id, data)
    }

    pub fn task(kind: EventKind, id: Uuid, data: serde_json::Value) -> Self {
        Self::new(EntityType::Task, kind, id, data)
    }

    pub fn device(kind: EventKind, id: Uuid, data: serde_json::Value) -> Self {
        Self::new(EntityType::Device, kind, id, data)
    }

    /// Topic string, `"<entity>.<kind>"`.
    pub fn topic(&self) -> String {
        format!("{}.{}", self.entity_type.as_str(), self.event_type.as_str())
    }
}

/// Fire-and-forget publish channel for lifecycle events.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish one event. Implementations log failures; callers never see them.
    async fn publish(&self, event: Event);
}

/// In-process bus over a tokio broadcast channel.
///
/// Subscribers that lag are dropped by the channel; having no subscribers at
/// all is normal (events are observability, not control flow).
pub struct BroadcastBus {
    tx: broadcast::Sender<Event>,
}

impl BroadcastBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all events.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for BroadcastBus {
    async fn publish(&self, event: Event) {
        trace!(topic = %event.topic(), entity_id = %event.entity_id, "publish event");
        // send only fails with zero subscribers, which is fine
        let _ = self.tx.send(event);
    }
}
