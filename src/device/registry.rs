//! Shared device bookkeeping for the protocol adapters.
//!
//! The adapters compose a [`DeviceRegistry`] instead of inheriting common
//! behavior: device map, per-device status callbacks and the running /
//! discovering flags all live here. Callbacks are invoked strictly after the
//! registry locks are released, so a callback may re-enter the owning adapter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{GatewayError, Result};

use super::{DeviceInfo, DeviceProtocol, StatusCallback};

pub struct DeviceRegistry {
    protocol: DeviceProtocol,
    running: AtomicBool,
    discovering: AtomicBool,
    devices: Mutex<HashMap<String, DeviceInfo>>,
    // Separate lock from `devices` so neither is held across user code.
    status_callbacks: Mutex<HashMap<String, StatusCallback>>,
}

impl DeviceRegistry {
    pub fn new(protocol: DeviceProtocol) -> Self {
        Self {
            protocol,
            running: AtomicBool::new(false),
            discovering: AtomicBool::new(false),
            devices: Mutex::new(HashMap::new()),
            status_callbacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn protocol(&self) -> DeviceProtocol {
        self.protocol
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns false if the adapter was already running.
    pub fn set_running(&self, running: bool) -> bool {
        self.running.swap(running, Ordering::SeqCst) != running
    }

    pub fn discovery_in_progress(&self) -> bool {
        self.discovering.load(Ordering::SeqCst)
    }

    /// Claim the single discovery slot; Err if one is already in progress.
    pub fn begin_discovery(&self) -> Result<()> {
        if self.discovering.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::Internal(format!(
                "{} discovery already in progress",
                self.protocol
            )));
        }
        Ok(())
    }

    pub fn end_discovery(&self) {
        self.discovering.store(false, Ordering::SeqCst);
    }

    pub fn add_device(&self, info: DeviceInfo) -> Result<()> {
        if info.protocol() != self.protocol {
            return Err(GatewayError::ConfigValidation(format!(
                "device {} has protocol {} but adapter speaks {}",
                info.id,
                info.protocol(),
                self.protocol
            )));
        }
        info.address.validate()?;

        let mut devices = self.devices.lock();
        if devices.contains_key(&info.id) {
            return Err(GatewayError::ConfigValidation(format!(
                "device {} already registered",
                info.id
            )));
        }
        info!(device_id = %info.id, protocol = %self.protocol, "device registered");
        devices.insert(info.id.clone(), info);
        Ok(())
    }

    pub fn remove_device(&self, device_id: &str) -> Result<()> {
        let removed = self.devices.lock().remove(device_id);
        if removed.is_none() {
            return Err(GatewayError::Internal(format!(
                "device {device_id} not found"
            )));
        }
        self.status_callbacks.lock().remove(device_id);
        info!(device_id, "device removed");
        Ok(())
    }

    pub fn device_info(&self, device_id: &str) -> Option<DeviceInfo> {
        self.devices.lock().get(device_id).cloned()
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        self.devices.lock().values().cloned().collect()
    }

    pub fn is_device_online(&self, device_id: &str) -> bool {
        self.devices
            .lock()
            .get(device_id)
            .map(|d| d.online)
            .unwrap_or(false)
    }

    pub fn set_status_callback(&self, device_id: &str, callback: StatusCallback) -> Result<()> {
        if !self.devices.lock().contains_key(device_id) {
            return Err(GatewayError::Internal(format!(
                "device {device_id} not found"
            )));
        }
        self.status_callbacks
            .lock()
            .insert(device_id.to_string(), callback);
        Ok(())
    }

    /// Update a device's online flag. The status callback fires exactly once
    /// per transition, after every registry lock has been released.
    pub fn update_status(&self, device_id: &str, online: bool) {
        let changed = {
            let mut devices = self.devices.lock();
            match devices.get_mut(device_id) {
                Some(device) if device.online != online => {
                    device.online = online;
                    if online {
                        device.last_seen = Some(Utc::now());
                    }
                    true
                }
                Some(_) => false,
                None => {
                    warn!(device_id, "status update for unknown device");
                    return;
                }
            }
        };

        if !changed {
            return;
        }

        info!(device_id, online, "device status changed");
        let callback = self.status_callbacks.lock().get(device_id).cloned();
        if let Some(callback) = callback {
            callback(device_id, online);
        }
    }

    /// Mark every device offline (adapter shutdown), firing the transition
    /// callbacks outside the locks.
    pub fn mark_all_offline(&self) {
        let transitioned: Vec<String> = {
            let mut devices = self.devices.lock();
            devices
                .values_mut()
                .filter(|d| d.online)
                .map(|d| {
                    d.online = false;
                    d.id.clone()
                })
                .collect()
        };

        for device_id in transitioned {
            let callback = self.status_callbacks.lock().get(&device_id).cloned();
            if let Some(callback) = callback {
                callback(&device_id, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceAddress;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn tcp_device(id: &str) -> DeviceInfo {
        DeviceInfo {
            id: id.to_string(),
            name: "test".into(),
            model: String::new(),
            manufacturer: String::new(),
            firmware_version: String::new(),
            address: DeviceAddress::ModbusTcp {
                ip: "192.168.1.50".into(),
                port: 502,
                unit_id: 1,
            },
            template_id: "t".into(),
            online: false,
            last_seen: None,
        }
    }

    #[test]
    fn duplicate_device_rejected() {
        let reg = DeviceRegistry::new(DeviceProtocol::ModbusTcp);
        reg.add_device(tcp_device("d1")).unwrap();
        assert!(reg.add_device(tcp_device("d1")).is_err());
    }

    #[test]
    fn protocol_mismatch_rejected() {
        let reg = DeviceRegistry::new(DeviceProtocol::EchonetLite);
        assert!(reg.add_device(tcp_device("d1")).is_err());
    }

    #[test]
    fn status_callback_fires_only_on_transitions() {
        let reg = DeviceRegistry::new(DeviceProtocol::ModbusTcp);
        reg.add_device(tcp_device("d1")).unwrap();

        let transitions = Arc::new(AtomicUsize::new(0));
        let counted = transitions.clone();
        reg.set_status_callback(
            "d1",
            Arc::new(move |_, _| {
                counted.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

        reg.update_status("d1", true);
        reg.update_status("d1", true); // redundant, no callback
        reg.update_status("d1", false);
        reg.update_status("d1", false); // redundant, no callback
        reg.update_status("d1", true);

        assert_eq!(transitions.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn callback_may_reenter_registry() {
        let reg = Arc::new(DeviceRegistry::new(DeviceProtocol::ModbusTcp));
        reg.add_device(tcp_device("d1")).unwrap();

        let reentrant = reg.clone();
        reg.set_status_callback(
            "d1",
            Arc::new(move |id, _| {
                // Would deadlock if the registry held its locks here.
                let _ = reentrant.device_info(id);
                let _ = reentrant.devices();
            }),
        )
        .unwrap();

        reg.update_status("d1", true);
        reg.mark_all_offline();
        assert!(!reg.is_device_online("d1"));
    }

    #[test]
    fn discovery_slot_is_exclusive() {
        let reg = DeviceRegistry::new(DeviceProtocol::ModbusRtu);
        reg.begin_discovery().unwrap();
        assert!(reg.begin_discovery().is_err());
        reg.end_discovery();
        assert!(reg.begin_discovery().is_ok());
    }
}
