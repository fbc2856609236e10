//! Modbus TCP adapter
//!
//! Connections are pooled by `ip:port` and shared by every device behind the
//! same endpoint; a per-connection mutex keeps operations totally ordered. A
//! keepalive task probes each pooled connection and evicts dead or idle ones,
//! and a worker task drains queued operations serially so callers can offload
//! round-trips from their own task.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_modbus::client::{tcp, Context};
use tokio_modbus::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{GatewayError, Result};

use super::super::registry::DeviceRegistry;
use super::super::{
    DeviceAddress, DeviceAdapter, DeviceInfo, DeviceProtocol, DiscoveryCallback, ReadResult,
    RegisterAddress, RegisterValue, StatusCallback, WriteResult,
};
use super::{
    group_registers, read_group, read_one, validate_register_address, write_one, PollingConfig,
    STATUS_MONITOR_INTERVAL,
};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);
const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const DISCOVERY_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const POLL_TICK: Duration = Duration::from_secs(1);

struct PooledConnection {
    key: String,
    ctx: tokio::sync::Mutex<Context>,
    last_used: Mutex<Instant>,
    unit_ids: Mutex<HashSet<u8>>,
}

struct Core {
    registry: DeviceRegistry,
    pool: tokio::sync::Mutex<HashMap<String, Arc<PooledConnection>>>,
    polling: Mutex<HashMap<String, PollingConfig>>,
    discovery_hosts: Mutex<Vec<String>>,
    discovery_cancel: Mutex<Option<CancellationToken>>,
}

impl Core {
    fn tcp_endpoint(&self, device_id: &str) -> Result<(SocketAddr, u8)> {
        let info = self
            .registry
            .device_info(device_id)
            .ok_or_else(|| GatewayError::Internal(format!("device {device_id} not found")))?;
        match &info.address {
            DeviceAddress::ModbusTcp { ip, port, unit_id } => {
                let addr: SocketAddr = format!("{ip}:{port}").parse().map_err(|_| {
                    GatewayError::ConfigValidation(format!("invalid device address {ip}:{port}"))
                })?;
                Ok((addr, *unit_id))
            }
            _ => Err(GatewayError::Internal("not a Modbus TCP address".into())),
        }
    }

    /// Fetch or establish the pooled connection for an endpoint.
    async fn connection_for(&self, addr: SocketAddr, unit_id: u8) -> Result<Arc<PooledConnection>> {
        let key = addr.to_string();
        let mut pool = self.pool.lock().await;

        if let Some(conn) = pool.get(&key) {
            conn.unit_ids.lock().insert(unit_id);
            *conn.last_used.lock() = Instant::now();
            return Ok(conn.clone());
        }

        debug!(%addr, "opening Modbus TCP connection");
        let ctx = tcp::connect(addr)
            .await
            .map_err(|e| GatewayError::network_with_code(
                format!("failed to connect to {addr}: {e}"),
                e.raw_os_error().unwrap_or(0),
            ))?;

        let conn = Arc::new(PooledConnection {
            key: key.clone(),
            ctx: tokio::sync::Mutex::new(ctx),
            last_used: Mutex::new(Instant::now()),
            unit_ids: Mutex::new(HashSet::from([unit_id])),
        });
        pool.insert(key, conn.clone());
        Ok(conn)
    }

    async fn evict(&self, key: &str) {
        if let Some(conn) = self.pool.lock().await.remove(key) {
            let mut ctx = conn.ctx.lock().await;
            let _ = ctx.disconnect().await;
            info!(key, "evicted Modbus TCP connection");
        }
    }

    async fn read_register(&self, device_id: &str, address: &RegisterAddress) -> ReadResult {
        if !self.registry.is_running() {
            return ReadResult::err("Modbus TCP adapter not running");
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

        let (addr, unit_id) = match self.tcp_endpoint(device_id) {
            Ok(v) => v,
            Err(e) => return ReadResult::err(e.to_string()),
        };
        let conn = match self.connection_for(addr, unit_id).await {
            Ok(conn) => conn,
            Err(e) => return ReadResult::err(e.to_string()),
        };

        let mut ctx = conn.ctx.lock().await;
        *conn.last_used.lock() = Instant::now();
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
            return WriteResult::err("Modbus TCP adapter not running");
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

        let (addr, unit_id) = match self.tcp_endpoint(device_id) {
            Ok(v) => v,
            Err(e) => return WriteResult::err(e.to_string()),
        };
        let conn = match self.connection_for(addr, unit_id).await {
            Ok(conn) => conn,
            Err(e) => return WriteResult::err(e.to_string()),
        };

        let mut ctx = conn.ctx.lock().await;
        *conn.last_used.lock() = Instant::now();
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
                results.insert(*address, ReadResult::err("Modbus TCP adapter not running"));
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

        let (addr, unit_id) = match self.tcp_endpoint(device_id) {
            Ok(v) => v,
            Err(e) => {
                for address in valid {
                    results.insert(address, ReadResult::err(e.to_string()));
                }
                return results;
            }
        };
        let conn = match self.connection_for(addr, unit_id).await {
            Ok(conn) => conn,
            Err(e) => {
                for address in valid {
                    results.insert(address, ReadResult::err(e.to_string()));
                }
                return results;
            }
        };

        let mut ctx = conn.ctx.lock().await;
        *conn.last_used.lock() = Instant::now();
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
        let Ok((addr, unit_id)) = self.tcp_endpoint(device_id) else {
            return false;
        };
        let Ok(conn) = self.connection_for(addr, unit_id).await else {
            return false;
        };
        let mut ctx = conn.ctx.lock().await;
        ctx.set_slave(Slave(unit_id));
        ctx.read_holding_registers(0, 1).await.is_ok()
    }

    /// Keepalive pass: evict idle connections, probe the rest.
    async fn keepalive_pass(&self) {
        let connections: Vec<Arc<PooledConnection>> =
            self.pool.lock().await.values().cloned().collect();

        for conn in connections {
            let idle = self.pool.lock().await.get(&conn.key).is_some()
                && conn.last_used.lock().elapsed() > CONNECTION_IDLE_TIMEOUT;
            if idle {
                info!(key = %conn.key, "closing idle Modbus TCP connection");
                self.evict(&conn.key).await;
                continue;
            }

            let unit = conn.unit_ids.lock().iter().next().copied().unwrap_or(1);
            let alive = {
                let mut ctx = conn.ctx.lock().await;
                ctx.set_slave(Slave(unit));
                ctx.read_holding_registers(0, 1).await.is_ok()
            };
            if !alive {
                warn!(key = %conn.key, "keepalive failed, evicting connection");
                self.evict(&conn.key).await;
            }
        }
    }
}

pub struct ModbusTcpAdapter {
    core: Arc<Core>,
    worker_tx: Mutex<Option<mpsc::UnboundedSender<BoxFuture<'static, ()>>>>,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ModbusTcpAdapter {
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core {
                registry: DeviceRegistry::new(DeviceProtocol::ModbusTcp),
                pool: tokio::sync::Mutex::new(HashMap::new()),
                polling: Mutex::new(HashMap::new()),
                discovery_hosts: Mutex::new(Vec::new()),
                discovery_cancel: Mutex::new(None),
            }),
            worker_tx: Mutex::new(None),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Candidate `ip:port` endpoints swept by discovery.
    pub fn set_discovery_hosts(&self, hosts: Vec<String>) {
        *self.core.discovery_hosts.lock() = hosts;
    }

    pub fn set_polling_config(&self, device_id: &str, config: PollingConfig) {
        self.core
            .polling
            .lock()
            .insert(device_id.to_string(), config);
    }

    fn enqueue(&self, fut: BoxFuture<'static, ()>) -> bool {
        match self.worker_tx.lock().as_ref() {
            Some(tx) => tx.send(fut).is_ok(),
            None => false,
        }
    }

    /// Queue a read onto the serial worker; resolves when the worker gets to
    /// it. Dropped (Err) when the adapter is not running.
    pub fn queue_read(
        &self,
        device_id: &str,
        address: RegisterAddress,
    ) -> oneshot::Receiver<ReadResult> {
        let (tx, rx) = oneshot::channel();
        let core = self.core.clone();
        let device_id = device_id.to_string();
        self.enqueue(Box::pin(async move {
            let result = core.read_register(&device_id, &address).await;
            let _ = tx.send(result);
        }));
        rx
    }

    /// Queue a write onto the serial worker.
    pub fn queue_write(
        &self,
        device_id: &str,
        address: RegisterAddress,
        value: RegisterValue,
    ) -> oneshot::Receiver<WriteResult> {
        let (tx, rx) = oneshot::channel();
        let core = self.core.clone();
        let device_id = device_id.to_string();
        self.enqueue(Box::pin(async move {
            let result = core.write_register(&device_id, &address, &value).await;
            let _ = tx.send(result);
        }));
        rx
    }

    fn spawn_worker(
        &self,
        mut rx: mpsc::UnboundedReceiver<BoxFuture<'static, ()>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    fut = rx.recv() => {
                        match fut {
                            Some(fut) => fut.await,
                            None => break,
                        }
                    }
                }
            }
            debug!("worker task stopped");
        })
    }

    fn spawn_keepalive(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let core = self.core.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(KEEPALIVE_INTERVAL) => {}
                }
                core.keepalive_pass().await;
            }
            debug!("keepalive task stopped");
        })
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
            let hosts = core.discovery_hosts.lock().clone();
            let deadline = Instant::now() + timeout;

            'sweep: for host in hosts {
                let Ok(addr) = host.parse::<SocketAddr>() else {
                    warn!(host, "invalid discovery host, expected ip:port");
                    continue;
                };

                let Ok(Ok(mut ctx)) =
                    tokio::time::timeout(DISCOVERY_PROBE_TIMEOUT, tcp::connect(addr)).await
                else {
                    continue;
                };

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

                    info!(%addr, unit_id, "found Modbus TCP device");
                    callback(DeviceInfo {
                        id: format!("modbus_tcp_{}_{}", addr.ip(), unit_id),
                        name: "Modbus TCP Device".into(),
                        model: "Unknown".into(),
                        manufacturer: "Unknown".into(),
                        firmware_version: String::new(),
                        address: DeviceAddress::ModbusTcp {
                            ip: addr.ip().to_string(),
                            port: addr.port(),
                            unit_id,
                        },
                        template_id: String::new(),
                        online: true,
                        last_seen: Some(chrono::Utc::now()),
                    });
                }
                let _ = ctx.disconnect().await;
            }

            core.discovery_cancel.lock().take();
            core.registry.end_discovery();
            info!("Modbus TCP discovery finished");
        })
    }
}

impl Default for ModbusTcpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceAdapter for ModbusTcpAdapter {
    fn protocol(&self) -> DeviceProtocol {
        DeviceProtocol::ModbusTcp
    }

    async fn initialize(&self) -> Result<()> {
        info!("initializing Modbus TCP adapter");
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if !self.core.registry.set_running(true) {
            return Ok(());
        }
        info!("starting Modbus TCP adapter");

        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        *self.worker_tx.lock() = Some(tx);

        let mut tasks = self.tasks.lock();
        tasks.push(self.spawn_worker(rx, cancel.clone()));
        tasks.push(self.spawn_keepalive(cancel.clone()));
        tasks.push(self.spawn_status_monitor(cancel.clone()));
        tasks.push(self.spawn_polling(cancel));
        Ok(())
    }

    async fn stop(&self) {
        if !self.core.registry.set_running(false) {
            return;
        }
        info!("stopping Modbus TCP adapter");

        self.stop_discovery().await;
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }
        self.worker_tx.lock().take();

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let keys: Vec<String> = self.core.pool.lock().await.keys().cloned().collect();
        for key in keys {
            self.core.evict(&key).await;
        }
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
        info!(timeout_ms = timeout.as_millis() as u64, "starting Modbus TCP discovery");

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
            info!("Modbus TCP discovery stopped");
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
