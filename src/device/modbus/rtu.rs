//! Modbus RTU adapter
//!
//! Serial links are pooled by port path; every device behind the same port
//! shares one connection, and the per-connection mutex makes all operations
//! on a port mutually exclusive. Discovery sweeps a curated list of port
//! paths, baud rates and parities, probing unit ids with a holding-register
//! read.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_modbus::client::{rtu, Context};
use tokio_modbus::prelude::*;
use tokio_serial::SerialStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};

use super::super::registry::DeviceRegistry;
use super::super::{
    DeviceAddress, DeviceAdapter, DeviceInfo, DeviceProtocol, DiscoveryCallback, Parity,
    ReadResult, RegisterAddress, RegisterValue, StatusCallback, WriteResult,
};
use super::{
    group_registers, read_group, read_one, read_words_retry, validate_register_address,
    write_one, PollingConfig, STATUS_MONITOR_INTERVAL,
};

const DISCOVERY_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_TICK: Duration = Duration::from_secs(1);

/// Serial ports, baud rates and parities tried by the discovery sweep.
const DISCOVERY_PORTS: &[&str] = &[
    "/dev/ttyS0",
    "/dev/ttyS1",
    "/dev/ttyUSB0",
    "/dev/ttyUSB1",
    "/dev/ttyACM0",
    "/dev/ttyACM1",
];
const DISCOVERY_BAUD_RATES: &[u32] = &[9600, 19200, 38400, 57600, 115200];
const DISCOVERY_PARITIES: &[Parity] = &[Parity::None, Parity::Even, Parity::Odd];

#[derive(Debug, Clone, PartialEq, Eq)]
struct SerialSettings {
    port: String,
    baud_rate: u32,
    data_bits: u8,
    stop_bits: u8,
    parity: Parity,
}

struct PooledPort {
    settings: SerialSettings,
    ctx: tokio::sync::Mutex<Context>,
    last_used: Mutex<Instant>,
}

struct Core {
    registry: DeviceRegistry,
    pool: tokio::sync::Mutex<HashMap<String, Arc<PooledPort>>>,
    polling: Mutex<HashMap<String, PollingConfig>>,
    discovery_cancel: Mutex<Option<CancellationToken>>,
}

fn open_serial(settings: &SerialSettings) -> Result<Context> {
    let builder = tokio_serial::new(&settings.port, settings.baud_rate)
        .data_bits(data_bits_from(settings.data_bits)?)
        .stop_bits(stop_bits_from(settings.stop_bits)?)
        .parity(match settings.parity {
            Parity::None => tokio_serial::Parity::None,
            Parity::Even => tokio_serial::Parity::Even,
            Parity::Odd => tokio_serial::Parity::Odd,
        })
        .timeout(Duration::from_secs(1));

    let stream = SerialStream::open(&builder).map_err(|e| {
        GatewayError::network(format!("failed to open {}: {e}", settings.port))
    })?;
    Ok(rtu::attach(stream))
}

fn data_bits_from(bits: u8) -> Result<tokio_serial::DataBits> {
    match bits {
        5 => Ok(tokio_serial::DataBits::Five),
        6 => Ok(tokio_serial::DataBits::Six),
        7 => Ok(tokio_serial::DataBits::Seven),
        8 => Ok(tokio_serial::DataBits::Eight),
        other => Err(GatewayError::ConfigValidation(format!(
            "unsupported data bits: {other}"
        ))),
    }
}

fn stop_bits_from(bits: u8) -> Result<tokio_serial::StopBits> {
    match bits {
        1 => Ok(tokio_serial::StopBits::One),
        2 => Ok(tokio_serial::StopBits::Two),
        other => Err(GatewayError::ConfigValidation(format!(
            "unsupported stop bits: {other}"
        ))),
    }
}

impl Core {
    fn serial_settings(&self, device_id: &str) -> Result<(SerialSettings, u8)> {
        let info = self
            .registry
            .device_info(device_id)
            .ok_or_else(|| GatewayError::Internal(format!("device {device_id} not found")))?;
        match &info.address {
            DeviceAddress::ModbusRtu {
                port,
                baud_rate,
                data_bits,
                stop_bits,
                parity,
                unit_id,
            } => Ok((
                SerialSettings {
                    port: port.clone(),
                    baud_rate: *baud_rate,
                    data_bits: *data_bits,
                    stop_bits: *stop_bits,
                    parity: *parity,
                },
                *unit_id,
            )),
            _ => Err(GatewayError::Internal("not a Modbus RTU address".into())),
        }
    }

    /// Fetch or open the pooled port. All devices on a port share it; the
    /// first device's line settings win.
    async fn port_for(&self, settings: &SerialSettings) -> Result<Arc<PooledPort>> {
        let mut pool = self.pool.lock().await;

        if let Some(port) = pool.get(&settings.port) {
            if port.settings != *settings {
                warn!(
                    port = %settings.port,
                    "line settings differ from the pooled connection"
                );
            }
            *port.last_used.lock() = Instant::now();
            return Ok(port.clone());
        }

        debug!(port = %settings.port, baud = settings.baud_rate, "opening serial port");
        let ctx = open_serial(settings)?;
        let port = Arc::new(PooledPort {
            settings: settings.clone(),
            ctx: tokio::sync::Mutex::new(ctx),
            last_used: Mutex::new(Instant::now()),
        });
        pool.insert(settings.port.clone(), port.clone());
        Ok(port)
    }

    async fn read_register(&self, device_id: &str, address: &RegisterAddress) -> ReadResult {
        if !self.registry.is_running() {
            return ReadResult::err("Modbus RTU adapter not running");
        }
        if let Err(e) = validate_register_address(address) {
            return ReadResult::err(e.to_string());
        }
        let Some(device) = self.registry.device_info(device_id) else {
            return ReadResult::err("Device not found");
        };
        if !device.online {
            return ReadResult::err("Device is offline");
        }

        let (settings, unit_id) = match self.serial_settings(device_id) {
            Ok(v) => v,
            Err(e) => return ReadResult::err(e.to_string()),
        };
        let port = match self.port_for(&settings).await {
            Ok(port) => port,
            Err(e) => return ReadResult::err(e.to_string()),
        };

        let mut ctx = port.ctx.lock().await;
        *port.last_used.lock() = Instant::now();
        ctx.set_slave(Slave(unit_id));
        read_one(&mut ctx, address).await
    }

    async fn write_register(
        &self,
        device_id: &str,
        address: &RegisterAddress,
        value: &RegisterValue,
    ) -> WriteResult {
        if !self.registry.is_running() {
            return WriteResult::err("Modbus RTU adapter not running");
        }
        if let Err(e) = validate_register_address(address) {
            return WriteResult::err(e.to_string());
        }
        if address.register_type.is_read_only() {
            return WriteResult::err("Cannot write to read-only register type");
        }
        let Some(device) = self.registry.device_info(device_id) else {
            return WriteResult::err("Device not found");
        };
        if !device.online {
            return WriteResult::err("Device is offline");
        }

        let (settings, unit_id) = match self.serial_settings(device_id) {
            Ok(v) => v,
            Err(e) => return WriteResult::err(e.to_string()),
        };
        let port = match self.port_for(&settings).await {
            Ok(port) => port,
            Err(e) => return WriteResult::err(e.to_string()),
        };

        let mut ctx = port.ctx.lock().await;
        *port.last_used.lock() = Instant::now();
        ctx.set_slave(Slave(unit_id));
        write_one(&mut ctx, address, value).await
    }

    async fn read_registers(
        &self,
        device_id: &str,
        addresses: &[RegisterAddress],
    ) -> BTreeMap<RegisterAddress, ReadResult> {
        let mut results = BTreeMap::new();

        if !self.registry.is_running() {
            for address in addresses {
                results.insert(*address, ReadResult::err("Modbus RTU adapter not running"));
            }
            return results;
        }
        let Some(device) = self.registry.device_info(device_id) else {
            for address in addresses {
                results.insert(*address, ReadResult::err("Device not found"));
            }
            return results;
        };
        if !device.online {
            for address in addresses {
                results.insert(*address, ReadResult::err("Device is offline"));
            }
            return results;
        }

        let mut valid = Vec::new();
        for address in addresses {
            match validate_register_address(address) {
                Ok(()) => valid.push(*address),
                Err(e) => {
                    results.insert(*address, ReadResult::err(e.to_string()));
                }
            }
        }

        let (settings, unit_id) = match self.serial_settings(device_id) {
            Ok(v) => v,
            Err(e) => {
                for address in valid {
                    results.insert(address, ReadResult::err(e.to_string()));
                }
                return results;
            }
        };
        let port = match self.port_for(&settings).await {
            Ok(port) => port,
            Err(e) => {
                for address in valid {
                    results.insert(address, ReadResult::err(e.to_string()));
                }
                return results;
            }
        };

        let mut ctx = port.ctx.lock().await;
        *port.last_used.lock() = Instant::now();
        ctx.set_slave(Slave(unit_id));

        for group in group_registers(&valid) {
            read_group(&mut ctx, &group, &mut results).await;
        }
        results
    }

    async fn write_registers(
        &self,
        device_id: &str,
        values: &BTreeMap<RegisterAddress, RegisterValue>,
    ) -> BTreeMap<RegisterAddress, WriteResult> {
        let mut results = BTreeMap::new();
        for (address, value) in values {
            results.insert(*address, self.write_register(device_id, address, value).await);
        }
        results
    }

    /// Liveness probe: read holding register 0, bypassing the online gate.
    async fn probe_device(&self, device_id: &str) -> bool {
        let Ok((settings, unit_id)) = self.serial_settings(device_id) else {
            return false;
        };
        let Ok(port) = self.port_for(&settings).await else {
            return false;
        };
        let mut ctx = port.ctx.lock().await;
        ctx.set_slave(Slave(unit_id));
        read_words_retry(&mut ctx, false, 0, 1).await.is_ok()
    }
}

pub struct ModbusRtuAdapter {
    core: Arc<Core>,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ModbusRtuAdapter {
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core {
                registry: DeviceRegistry::new(DeviceProtocol::ModbusRtu),
                pool: tokio::sync::Mutex::new(HashMap::new()),
                polling: Mutex::new(HashMap::new()),
                discovery_cancel: Mutex::new(None),
            }),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn set_polling_config(&self, device_id: &str, config: PollingConfig) {
        self.core
            .polling
            .lock()
            .insert(device_id.to_string(), config);
    }

    fn spawn_status_monitor(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let core = self.core.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(STATUS_MONITOR_INTERVAL) => {}
                }
                for device in core.registry.devices() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let online = core.probe_device(&device.id).await;
                    core.registry.update_status(&device.id, online);
                }
            }
            debug!("status monitor task stopped");
        })
    }

    fn spawn_polling(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let core = self.core.clone();
        tokio::spawn(async move {
            let mut last_polled: HashMap<String, Instant> = HashMap::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(POLL_TICK) => {}
                }

                for device in core.registry.devices() {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let Some(config) = core.polling.lock().get(&device.id).cloned() else {
                        continue;
                    };
                    if config.addresses.is_empty() {
                        continue;
                    }
                    let due = last_polled
                        .get(&device.id)
                        .map(|t| t.elapsed() >= Duration::from_millis(config.interval_ms))
                        .unwrap_or(true);
                    if !due {
                        continue;
                    }
                    last_polled.insert(device.id.clone(), Instant::now());

                    let results = core.read_registers(&device.id, &config.addresses).await;
                    let any_ok = results.values().any(|r| r.success);
                    core.registry.update_status(&device.id, any_ok);
                }
            }
            debug!("polling task stopped");
        })
    }

    fn spawn_discovery(
        &self,
        callback: DiscoveryCallback,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let core = self.core.clone();
        tokio::spawn(async move {
            let deadline = Instant::now() + timeout;

            'sweep: for &port in DISCOVERY_PORTS {
                for &baud_rate in DISCOVERY_BAUD_RATES {
                    for &parity in DISCOVERY_PARITIES {
                        if cancel.is_cancelled() || Instant::now() >= deadline {
                            break 'sweep;
                        }

                        let settings = SerialSettings {
                            port: port.to_string(),
                            baud_rate,
                            data_bits: 8,
                            stop_bits: 1,
                            parity,
                        };
                        let Ok(mut ctx) = open_serial(&settings) else {
                            // Port absent or busy; skip the other line settings too.
                            continue 'sweep;
                        };
                        info!(port, baud_rate, ?parity, "probing serial port");

                        for unit_id in 1u8..=247 {
                            if cancel.is_cancelled() || Instant::now() >= deadline {
                                break 'sweep;
                            }
                            ctx.set_slave(Slave(unit_id));
                            let probe = tokio::time::timeout(
                                DISCOVERY_PROBE_TIMEOUT,
                                ctx.read_holding_registers(0, 1),
                            )
                            .await;
                            if !matches!(probe, Ok(Ok(_))) {
                                continue;
                            }

                            info!(port, baud_rate, unit_id, "found Modbus RTU device");
                            callback(DeviceInfo {
                                id: format!("modbus_rtu_{port}_{unit_id}"),
                                name: "Modbus RTU Device".into(),
                                model: "Unknown".into(),
                                manufacturer: "Unknown".into(),
                                firmware_version: String::new(),
                                address: DeviceAddress::ModbusRtu {
                                    port: port.to_string(),
                                    baud_rate,
                                    data_bits: 8,
                                    stop_bits: 1,
                                    parity,
                                    unit_id,
                                },
                                template_id: String::new(),
                                online: true,
                                last_seen: Some(chrono::Utc::now()),
                            });
                        }
                    }
                }
            }

            core.discovery_cancel.lock().take();
            core.registry.end_discovery();
            info!("Modbus RTU discovery finished");
        })
    }
}

impl Default for ModbusRtuAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceAdapter for ModbusRtuAdapter {
    fn protocol(&self) -> DeviceProtocol {
        DeviceProtocol::ModbusRtu
    }

    async fn initialize(&self) -> Result<()> {
        info!("initializing Modbus RTU adapter");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if !self.core.registry.set_running(true) {
            return Ok(());
        }
        info!("starting Modbus RTU adapter");

        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_status_monitor(cancel.clone()));
        tasks.push(self.spawn_polling(cancel));
        Ok(())
    }

    async fn stop(&self) {
        if !self.core.registry.set_running(false) {
            return;
        }
        info!("stopping Modbus RTU adapter");

        self.stop_discovery().await;
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        self.core.pool.lock().await.clear();
        self.core.registry.mark_all_offline();
    }

    fn is_running(&self) -> bool {
        self.core.registry.is_running()
    }

    fn add_device(&self, info: DeviceInfo) -> Result<()> {
        self.core.registry.add_device(info)
    }

    fn remove_device(&self, device_id: &str) -> Result<()> {
        self.core.polling.lock().remove(device_id);
        self.core.registry.remove_device(device_id)
    }

    fn device_info(&self, device_id: &str) -> Option<DeviceInfo> {
        self.core.registry.device_info(device_id)
    }

    fn devices(&self) -> Vec<DeviceInfo> {
        self.core.registry.devices()
    }

    fn is_device_online(&self, device_id: &str) -> bool {
        self.core.registry.is_device_online(device_id)
    }

    fn set_status_callback(&self, device_id: &str, callback: StatusCallback) -> Result<()> {
        self.core.registry.set_status_callback(device_id, callback)
    }

    async fn start_discovery(&self, callback: DiscoveryCallback, timeout: Duration) -> Result<()> {
        self.core.registry.begin_discovery()?;
        info!(timeout_ms = timeout.as_millis() as u64, "starting Modbus RTU discovery");

        let cancel = CancellationToken::new();
        *self.core.discovery_cancel.lock() = Some(cancel.clone());
        let task = self.spawn_discovery(callback, timeout, cancel);
        self.tasks.lock().push(task);
        Ok(())
    }

    async fn stop_discovery(&self) {
        if let Some(cancel) = self.core.discovery_cancel.lock().take() {
            cancel.cancel();
            self.core.registry.end_discovery();
            info!("Modbus RTU discovery stopped");
        }
    }

    fn discovery_in_progress(&self) -> bool {
        self.core.registry.discovery_in_progress()
    }

    async fn read_register(&self, device_id: &str, address: &RegisterAddress) -> ReadResult {
        self.core.read_register(device_id, address).await
    }

    async fn write_register(
        &self,
        device_id: &str,
        address: &RegisterAddress,
        value: &RegisterValue,
    ) -> WriteResult {
        self.core.write_register(device_id, address, value).await
    }

    async fn read_registers(
        &self,
        device_id: &str,
        addresses: &[RegisterAddress],
    ) -> BTreeMap<RegisterAddress, ReadResult> {
        self.core.read_registers(device_id, addresses).await
    }

    async fn write_registers(
        &self,
        device_id: &str,
        values: &BTreeMap<RegisterAddress, RegisterValue>,
    ) -> BTreeMap<RegisterAddress, WriteResult> {
        self.core.write_registers(device_id, values).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_line_settings_validation() {
        assert!(data_bits_from(8).is_ok());
        assert!(data_bits_from(9).is_err());
        assert!(stop_bits_from(1).is_ok());
        assert!(stop_bits_from(3).is_err());
    }

    #[tokio::test]
    async fn offline_device_rejected_before_the_wire() {
        let adapter = ModbusRtuAdapter::new();
        adapter.core.registry.set_running(true);
        adapter
            .add_device(DeviceInfo {
                id: "rtu1".into(),
                name: "meter".into(),
                model: String::new(),
                manufacturer: String::new(),
                firmware_version: String::new(),
                address: DeviceAddress::ModbusRtu {
                    port: "/dev/ttyUSB0".into(),
                    baud_rate: 9600,
                    data_bits: 8,
                    stop_bits: 1,
                    parity: Parity::None,
                    unit_id: 1,
                },
                template_id: "t".into(),
                online: false,
                last_seen: None,
            })
            .unwrap();

        let address = RegisterAddress::modbus(super::super::super::RegisterType::HoldingRegister, 0, 1);
        let result = adapter.read_register("rtu1", &address).await;
        assert!(!result.success);
        assert_eq!(result.error_message, "Device is offline");
    }

    #[tokio::test]
    async fn write_to_input_register_rejected_locally() {
        let adapter = ModbusRtuAdapter::new();
        adapter.core.registry.set_running(true);
        adapter
            .add_device(DeviceInfo {
                id: "rtu1".into(),
                name: "meter".into(),
                model: String::new(),
                manufacturer: String::new(),
                firmware_version: String::new(),
                address: DeviceAddress::ModbusRtu {
                    port: "/dev/ttyUSB0".into(),
                    baud_rate: 9600,
                    data_bits: 8,
                    stop_bits: 1,
                    parity: Parity::None,
                    unit_id: 1,
                },
                template_id: "t".into(),
                online: true,
                last_seen: None,
            })
            .unwrap();

        let address = RegisterAddress::modbus(
            super::super::super::RegisterType::InputRegister,
            5,
            1,
        );
        let result = adapter
            .write_register("rtu1", &address, &RegisterValue::from_u16(1))
            .await;
        assert!(!result.success);
        assert_eq!(result.error_message, "Cannot write to read-only register type");
    }
}
