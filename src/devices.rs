//! Device drivers — the hardware-facing seam of the engine.
//!
//! A driver answers capability probes (online, available, type, positions)
//! and executes commands. The engine itself only probes; commands are issued
//! exclusively by task implementations through their run context.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Value, json};
use uuid::Uuid;

use crate::error::{DeviceError, Error, StoreError};
use crate::model::{Device, DeviceStatus, SamplePosition};
use crate::store::Store;

/// Capability interface of one physical device.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Type identity of the device this driver controls.
    fn device_type_id(&self) -> Uuid;

    /// Named sample positions exposed by the hardware.
    fn sample_positions(&self) -> Vec<SamplePosition>;

    /// Does the hardware answer at all?
    async fn is_online(&self) -> bool;

    /// Can the hardware take work right now?
    async fn is_available(&self) -> bool;

    /// Issue a command and return its raw result payload.
    async fn execute_command(&self, command: &str, params: &Value) -> Result<Value, DeviceError>;
}

/// Driver that fakes a real instrument. Backs tests and the demo binary.
pub struct SimulatedDriver {
    device_id: Uuid,
    device_type_id: Uuid,
    positions: Vec<SamplePosition>,
    online: AtomicBool,
    available: AtomicBool,
}

impl SimulatedDriver {
    /// Simulate the hardware behind an existing device record.
    pub fn for_device(device: &Device) -> Self {
        Self {
            device_id: device.id,
            device_type_id: device.device_type_id,
            positions: device.sample_positions.clone(),
            online: AtomicBool::new(true),
            available: AtomicBool::new(true),
        }
    }

    /// Toggle the simulated link state.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Toggle the simulated readiness flag.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceDriver for SimulatedDriver {
    fn device_type_id(&self) -> Uuid {
        self.device_type_id
    }

    fn sample_positions(&self) -> Vec<SamplePosition> {
        self.positions.clone()
    }

    async fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    async fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn execute_command(&self, command: &str, params: &Value) -> Result<Value, DeviceError> {
        if !self.online.load(Ordering::SeqCst) {
            return Err(DeviceError::Offline { id: self.device_id });
        }

        match command {
            "read_sensor" => {
                let reading: f64 = rand::thread_rng().gen_range(18.0..25.0);
                Ok(json!({
                    "command": command,
                    "reading": reading,
                    "unit": "celsius",
                }))
            }
            "set_temperature" => Ok(json!({
                "command": command,
                "target": params.get("target").cloned().unwrap_or(Value::Null),
                "status": "ok",
            })),
            "move_sample" => Ok(json!({
                "command": command,
                "from": params.get("from").cloned().unwrap_or(Value::Null),
                "to": params.get("to").cloned().unwrap_or(Value::Null),
                "status": "ok",
            })),
            other => Err(DeviceError::CommandFailed {
                id: self.device_id,
                command: other.to_string(),
                reason: "unsupported command".to_string(),
            }),
        }
    }
}

/// Refresh a device record from its driver's probes.
///
/// Only the offline/online edge is written back; `busy`, `maintenance` and
/// `error` are owned by the engine and operators. Returns the new status when
/// it changed.
pub async fn sync_device_status(
    store: &dyn Store,
    device_id: Uuid,
    driver: &dyn DeviceDriver,
) -> Result<Option<DeviceStatus>, Error> {
    let mut device = store
        .get_device(device_id)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "device",
            id: device_id,
        })?;

    let old_status = device.status;

    if driver.is_online().await {
        if matches!(device.status, DeviceStatus::Offline | DeviceStatus::Unknown) {
            device.status = DeviceStatus::Online;
        }
        if device.status != DeviceStatus::Busy {
            device.is_available = driver.is_available().await;
        }
    } else {
        device.status = DeviceStatus::Offline;
        device.is_available = false;
    }

    store.update_device(&device).await?;
    Ok((device.status != old_status).then_some(device.status))
}
