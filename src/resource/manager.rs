//! The resource allocation authority.
//!
//! All mutable allocation state lives behind one mutex, and every operation
//! is a single critical section, so no interleaving of requests and releases
//! can double-allocate a device or a sample position.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::Error;
use crate::model::Device;
use crate::resource::types::{Allocation, RequestOutcome, ResourceRequest, ResourceStatus};
use crate::store::Store;

/// Mutable allocation state. Only touched with the manager's mutex held.
#[derive(Default)]
struct ResourceTable {
    /// Active allocations by task id.
    allocations: HashMap<Uuid, Allocation>,
    /// Held position names and when each hold expires.
    position_holds: HashMap<String, DateTime<Utc>>,
    /// Unsatisfied requests, oldest first.
    backlog: VecDeque<ResourceRequest>,
}

impl ResourceTable {
    fn allocated_device_ids(&self) -> HashSet<Uuid> {
        self.allocations
            .values()
            .flat_map(|a| a.device_ids.iter().copied())
            .collect()
    }

    fn is_backlogged(&self, task_id: Uuid) -> bool {
        self.backlog.iter().any(|r| r.task_id == task_id)
    }

    /// Drop holds past their expiry. An expired hold whose allocation is
    /// still active means the safety ceiling fired on a leaked allocation.
    fn prune_expired_holds(&mut self, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .position_holds
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(name, _)| name.clone())
            .collect();

        for name in expired {
            self.position_holds.remove(&name);
            if self
                .allocations
                .values()
                .any(|a| a.sample_positions.contains(&name))
            {
                warn!(
                    position = %name,
                    "Position hold expired while its allocation is still active"
                );
            }
        }
    }

    /// Try to satisfy one request against the inventory. Commits the
    /// allocation entry and its position holds on success; on failure
    /// nothing changes.
    fn try_allocate(
        &mut self,
        inventory: &[Device],
        request: &ResourceRequest,
        now: DateTime<Utc>,
        hold: Duration,
    ) -> Option<Allocation> {
        let taken = self.allocated_device_ids();

        // One device per requested type, first match in inventory order.
        // Every selected device must cover the full sample count out of its
        // own free positions, and gets that many reserved.
        let mut chosen: Vec<&Device> = Vec::with_capacity(request.device_type_ids.len());
        let mut positions: Vec<String> = Vec::new();
        for type_id in &request.device_type_ids {
            let candidate = inventory.iter().find(|d| {
                d.device_type_id == *type_id
                    && d.is_allocatable()
                    && !taken.contains(&d.id)
                    && !chosen.iter().any(|c| c.id == d.id)
            })?;

            let free: Vec<String> = candidate
                .position_names()
                .filter(|name| {
                    self.position_holds
                        .get(*name)
                        .is_none_or(|expires_at| *expires_at <= now)
                })
                .filter(|name| !positions.iter().any(|reserved| reserved == name))
                .take(request.sample_count)
                .map(str::to_string)
                .collect();
            if free.len() < request.sample_count {
                return None;
            }

            chosen.push(candidate);
            positions.extend(free);
        }

        for name in &positions {
            self.position_holds.insert(name.clone(), now + hold);
        }

        let allocation = Allocation {
            task_id: request.task_id,
            device_ids: chosen.iter().map(|d| d.id).collect(),
            sample_positions: positions,
            allocated_at: now,
        };
        self.allocations.insert(request.task_id, allocation.clone());
        Some(allocation)
    }
}

/// Sole authority for device and position allocation.
pub struct ResourceManager {
    store: Arc<dyn Store>,
    table: Mutex<ResourceTable>,
    position_hold: Duration,
    backlog_ttl: Duration,
}

impl ResourceManager {
    pub fn new(store: Arc<dyn Store>, config: &EngineConfig) -> Self {
        Self {
            store,
            table: Mutex::new(ResourceTable::default()),
            position_hold: config.position_hold,
            backlog_ttl: config.backlog_ttl,
        }
    }

    /// Request devices and positions for a task.
    ///
    /// An unsatisfiable request is appended to the FIFO backlog and `Queued`
    /// is returned; that is a normal outcome, never an error. The call is
    /// idempotent: a task that already holds an allocation gets it back, and
    /// one already backlogged stays queued without a duplicate entry.
    pub async fn request(&self, request: ResourceRequest) -> Result<RequestOutcome, Error> {
        let mut table = self.table.lock().await;
        let now = Utc::now();
        table.prune_expired_holds(now);

        if let Some(existing) = table.allocations.get(&request.task_id) {
            trace!(task_id = %request.task_id, "Request for an already-allocated task");
            return Ok(RequestOutcome::Allocated(existing.clone()));
        }
        if table.is_backlogged(request.task_id) {
            return Ok(RequestOutcome::Queued);
        }

        let inventory = self.store.list_devices().await?;
        match table.try_allocate(&inventory, &request, now, self.position_hold) {
            Some(allocation) => {
                debug!(
                    task_id = %request.task_id,
                    devices = allocation.device_ids.len(),
                    positions = allocation.sample_positions.len(),
                    "Allocated resources"
                );
                Ok(RequestOutcome::Allocated(allocation))
            }
            None => {
                table.backlog.push_back(request.clone());
                debug!(
                    task_id = %request.task_id,
                    backlog_len = table.backlog.len(),
                    "Resources unavailable, request queued"
                );
                Ok(RequestOutcome::Queued)
            }
        }
    }

    /// Release a task's allocation and synchronously reprocess the backlog.
    ///
    /// Backlog entries that the freed resources now satisfy are allocated in
    /// FIFO order and returned; entries past the TTL are evicted. Callers
    /// flip freed device records back to `online` before releasing so the
    /// reprocessing pass sees them. Releasing a task without an active
    /// allocation is a no-op.
    pub async fn release(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<(ResourceRequest, Allocation)>, Error> {
        let mut table = self.table.lock().await;
        let now = Utc::now();
        table.prune_expired_holds(now);

        let Some(allocation) = table.allocations.remove(&task_id) else {
            trace!(%task_id, "Release without an active allocation, nothing to do");
            return Ok(Vec::new());
        };
        for name in &allocation.sample_positions {
            table.position_holds.remove(name);
        }
        debug!(%task_id, devices = allocation.device_ids.len(), "Released resources");

        self.reprocess_backlog(&mut table, now).await
    }

    /// Withdraw a task from the manager entirely.
    ///
    /// Drops the task's backlog entry, and frees an allocation that a
    /// release fulfilled from the backlog but nothing ever started. Freed
    /// resources are offered to the remaining backlog exactly as on release.
    pub async fn cancel_request(
        &self,
        task_id: Uuid,
    ) -> Result<Vec<(ResourceRequest, Allocation)>, Error> {
        let mut table = self.table.lock().await;
        let now = Utc::now();
        table.prune_expired_holds(now);

        table.backlog.retain(|entry| entry.task_id != task_id);

        let Some(allocation) = table.allocations.remove(&task_id) else {
            return Ok(Vec::new());
        };
        for name in &allocation.sample_positions {
            table.position_holds.remove(name);
        }
        debug!(
            %task_id,
            devices = allocation.device_ids.len(),
            "Cancelled request held an unstarted allocation, freed it"
        );

        self.reprocess_backlog(&mut table, now).await
    }

    /// Retry the backlog oldest-first against the current inventory,
    /// evicting entries past the TTL. The caller holds the table lock.
    async fn reprocess_backlog(
        &self,
        table: &mut ResourceTable,
        now: DateTime<Utc>,
    ) -> Result<Vec<(ResourceRequest, Allocation)>, Error> {
        let inventory = self.store.list_devices().await?;
        let mut fulfilled = Vec::new();
        let mut remaining = VecDeque::with_capacity(table.backlog.len());
        while let Some(entry) = table.backlog.pop_front() {
            if entry.requested_at + self.backlog_ttl < now {
                warn!(
                    task_id = %entry.task_id,
                    requested_at = %entry.requested_at,
                    "Evicting expired backlog entry"
                );
                continue;
            }
            match table.try_allocate(&inventory, &entry, now, self.position_hold) {
                Some(allocation) => {
                    debug!(task_id = %entry.task_id, "Backlogged request fulfilled");
                    fulfilled.push((entry, allocation));
                }
                None => remaining.push_back(entry),
            }
        }
        table.backlog = remaining;

        Ok(fulfilled)
    }

    /// Is this device bound by any active allocation?
    pub async fn is_allocated(&self, device_id: Uuid) -> bool {
        self.table
            .lock()
            .await
            .allocations
            .values()
            .any(|a| a.device_ids.contains(&device_id))
    }

    /// The active allocation of a task, if any.
    pub async fn allocation_for(&self, task_id: Uuid) -> Option<Allocation> {
        self.table.lock().await.allocations.get(&task_id).cloned()
    }

    /// Counters over devices, allocations, the backlog, and positions.
    pub async fn status(&self) -> Result<ResourceStatus, Error> {
        let mut table = self.table.lock().await;
        let now = Utc::now();
        table.prune_expired_holds(now);

        let inventory = self.store.list_devices().await?;
        let mut devices_by_status: HashMap<String, usize> = HashMap::new();
        for device in &inventory {
            *devices_by_status
                .entry(device.status.to_string())
                .or_insert(0) += 1;
        }
        let total_positions: usize = inventory.iter().map(|d| d.sample_positions.len()).sum();
        let held_positions = table.position_holds.len();

        Ok(ResourceStatus {
            devices_by_status,
            active_allocations: table.allocations.len(),
            queued_requests: table.backlog.len(),
            total_positions,
            held_positions,
            free_positions: total_positions.saturating_sub(held_positions),
        })
    }
}
