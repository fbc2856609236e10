//! ECHONET Lite adapter
//!
//! UDP on port 3610. The unicast socket is bound to the well-known port and
//! joined to the 224.0.23.0 multicast group, so one receive task sees both
//! unicast responses and multicast traffic; discovery requests go out a
//! separate sending socket with TTL 1. Responses are correlated by TID.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};

use super::registry::DeviceRegistry;
use super::{
    DataType, DeviceAddress, DeviceAdapter, DeviceInfo, DeviceProtocol, DiscoveryCallback,
    ReadResult, RegisterAddress, RegisterType, RegisterValue, StatusCallback, WriteResult,
};

// Service codes
pub const ESV_SET_REQUEST: u8 = 0x61;
pub const ESV_GET_REQUEST: u8 = 0x62;
pub const ESV_SET_RESPONSE: u8 = 0x71;
pub const ESV_GET_RESPONSE: u8 = 0x72;
pub const ESV_INF: u8 = 0x73;
pub const ESV_SET_SNA: u8 = 0x51;
pub const ESV_GET_SNA: u8 = 0x52;
pub const ESV_SETGET_SNA: u8 = 0x55;

pub const ECHONET_PORT: u16 = 3610;
pub const ECHONET_MULTICAST_ADDR: Ipv4Addr = Ipv4Addr::new(224, 0, 23, 0);

// Node profile object and its instance-list property
const EOJ_NODE_PROFILE_CLASS_GROUP: u8 = 0x0E;
const EOJ_NODE_PROFILE_CLASS: u8 = 0xF0;
const EOJ_NODE_PROFILE_INSTANCE: u8 = 0x01;
const EPC_SELF_NODE_INSTANCE_LIST_S: u8 = 0xD6;

// EV charging equipment classes. Charger and charger/discharger share the
// class code; template ids keep them apart in mapping configs.
pub const EOJ_EV_CHARGER_CLASS_GROUP: u8 = 0x02;
pub const EOJ_EV_CHARGER_CLASS: u8 = 0xA1;
pub const EOJ_EV_DISCHARGER_CLASS: u8 = 0xA1;

const EPC_OPERATION_STATUS: u8 = 0x80;

const MAX_UDP_PACKET_SIZE: usize = 1500;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_RETRANSMISSIONS: u32 = 3;
const STATUS_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// One EPC/PDC/EDT triple inside a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Property {
    pub epc: u8,
    pub edt: Vec<u8>,
}

/// An ECHONET Lite frame (format 1).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchonetLiteFrame {
    pub ehd1: u8,
    pub ehd2: u8,
    pub tid: u16,
    pub seoj_class_group: u8,
    pub seoj_class: u8,
    pub seoj_instance: u8,
    pub deoj_class_group: u8,
    pub deoj_class: u8,
    pub deoj_instance: u8,
    pub esv: u8,
    pub properties: Vec<Property>,
}

impl Default for EchonetLiteFrame {
    fn default() -> Self {
        Self {
            ehd1: 0x10,
            ehd2: 0x81,
            tid: 0,
            // Controller object
            seoj_class_group: 0x05,
            seoj_class: 0xFF,
            seoj_instance: 0x01,
            deoj_class_group: 0,
            deoj_class: 0,
            deoj_instance: 0,
            esv: 0,
            properties: Vec::new(),
        }
    }
}

impl EchonetLiteFrame {
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(14);
        data.push(self.ehd1);
        data.push(self.ehd2);
        data.extend_from_slice(&self.tid.to_be_bytes());
        data.push(self.seoj_class_group);
        data.push(self.seoj_class);
        data.push(self.seoj_instance);
        data.push(self.deoj_class_group);
        data.push(self.deoj_class);
        data.push(self.deoj_instance);
        data.push(self.esv);
        data.push(self.properties.len() as u8);
        for prop in &self.properties {
            data.push(prop.epc);
            data.push(prop.edt.len() as u8);
            data.extend_from_slice(&prop.edt);
        }
        data
    }

    /// Parse a frame; any truncation or header mismatch yields None.
    pub fn deserialize(data: &[u8]) -> Option<Self> {
        if data.len() < 12 {
            return None;
        }
        if data[0] != 0x10 || (data[1] != 0x81 && data[1] != 0x82) {
            return None;
        }

        let mut frame = Self {
            ehd1: data[0],
            ehd2: data[1],
            tid: u16::from_be_bytes([data[2], data[3]]),
            seoj_class_group: data[4],
            seoj_class: data[5],
            seoj_instance: data[6],
            deoj_class_group: data[7],
            deoj_class: data[8],
            deoj_instance: data[9],
            esv: data[10],
            properties: Vec::new(),
        };

        let opc = data[11] as usize;
        let mut pos = 12;
        for _ in 0..opc {
            if pos + 2 > data.len() {
                return None;
            }
            let epc = data[pos];
            let pdc = data[pos + 1] as usize;
            pos += 2;
            if pos + pdc > data.len() {
                return None;
            }
            frame.properties.push(Property {
                epc,
                edt: data[pos..pos + pdc].to_vec(),
            });
            pos += pdc;
        }

        Some(frame)
    }

    /// GET request for a set of EPCs on one destination object.
    pub fn get_properties(deoj: (u8, u8, u8), epcs: &[u8]) -> Self {
        Self {
            deoj_class_group: deoj.0,
            deoj_class: deoj.1,
            deoj_instance: deoj.2,
            esv: ESV_GET_REQUEST,
            properties: epcs
                .iter()
                .map(|&epc| Property {
                    epc,
                    edt: Vec::new(),
                })
                .collect(),
            ..Self::default()
        }
    }

    /// SET request writing one property.
    pub fn set_property(deoj: (u8, u8, u8), epc: u8, edt: Vec<u8>) -> Self {
        Self {
            deoj_class_group: deoj.0,
            deoj_class: deoj.1,
            deoj_instance: deoj.2,
            esv: ESV_SET_REQUEST,
            properties: vec![Property { epc, edt }],
            ..Self::default()
        }
    }

    /// Node-profile instance-list GET used for discovery.
    pub fn discovery() -> Self {
        Self::get_properties(
            (
                EOJ_NODE_PROFILE_CLASS_GROUP,
                EOJ_NODE_PROFILE_CLASS,
                EOJ_NODE_PROFILE_INSTANCE,
            ),
            &[EPC_SELF_NODE_INSTANCE_LIST_S],
        )
    }
}

struct DiscoverySession {
    callback: DiscoveryCallback,
    seen: HashSet<String>,
    cancel: CancellationToken,
}

struct Sockets {
    unicast: Arc<UdpSocket>,
    multicast: Arc<UdpSocket>,
}

/// State shared with the background tasks.
struct Core {
    registry: DeviceRegistry,
    sockets: Mutex<Option<Sockets>>,
    pending: Mutex<HashMap<u16, oneshot::Sender<EchonetLiteFrame>>>,
    discovery: Mutex<Option<DiscoverySession>>,
    next_tid: AtomicU16,
}

impl Core {
    /// 16-bit counter starting at 1, skipping zero on wraparound.
    fn next_tid(&self) -> u16 {
        let tid = self.next_tid.fetch_add(1, Ordering::SeqCst);
        if tid == 0 {
            self.next_tid.fetch_add(1, Ordering::SeqCst)
        } else {
            tid
        }
    }

    fn unicast_socket(&self) -> Result<Arc<UdpSocket>> {
        self.sockets
            .lock()
            .as_ref()
            .map(|s| s.unicast.clone())
            .ok_or_else(|| GatewayError::Internal("adapter not initialized".into()))
    }

    fn multicast_socket(&self) -> Result<Arc<UdpSocket>> {
        self.sockets
            .lock()
            .as_ref()
            .map(|s| s.multicast.clone())
            .ok_or_else(|| GatewayError::Internal("adapter not initialized".into()))
    }

    fn device_target(&self, device_id: &str) -> Result<SocketAddr> {
        let info = self
            .registry
            .device_info(device_id)
            .ok_or_else(|| GatewayError::Internal(format!("device {device_id} not found")))?;
        match &info.address {
            DeviceAddress::EchonetLite { ip, port } => {
                let ip: Ipv4Addr = ip.parse().map_err(|_| {
                    GatewayError::ConfigValidation(format!("invalid device IP: {ip}"))
                })?;
                Ok(SocketAddr::from((ip, *port)))
            }
            _ => Err(GatewayError::Internal("not an ECHONET Lite address".into())),
        }
    }

    async fn send_frame(&self, target: SocketAddr, frame: &EchonetLiteFrame) -> Result<()> {
        let socket = self.unicast_socket()?;
        let data = frame.serialize();
        let sent = socket.send_to(&data, target).await?;
        if sent != data.len() {
            return Err(GatewayError::network(format!(
                "incomplete frame sent to {target}: {sent} of {} bytes",
                data.len()
            )));
        }
        debug!(
            %target,
            tid = frame.tid,
            esv = format_args!("0x{:02X}", frame.esv),
            properties = frame.properties.len(),
            "sent frame"
        );
        Ok(())
    }

    async fn send_multicast(&self, frame: &EchonetLiteFrame) -> Result<()> {
        let socket = self.multicast_socket()?;
        let data = frame.serialize();
        let target = SocketAddr::from((ECHONET_MULTICAST_ADDR, ECHONET_PORT));
        socket.send_to(&data, target).await?;
        debug!(tid = frame.tid, "sent multicast frame");
        Ok(())
    }

    /// Send a request and wait for the TID-matched response, retransmitting
    /// with linear backoff before giving up.
    async fn send_request_with_response(
        &self,
        target: SocketAddr,
        mut frame: EchonetLiteFrame,
        timeout: Duration,
    ) -> Option<EchonetLiteFrame> {
        frame.tid = self.next_tid();
        let (tx, mut rx) = oneshot::channel();
        self.pending.lock().insert(frame.tid, tx);

        let mut attempt: u32 = 0;
        let response = loop {
            if let Err(e) = self.send_frame(target, &frame).await {
                warn!(tid = frame.tid, error = %e, "failed to send request");
                break None;
            }

            match tokio::time::timeout(timeout, &mut rx).await {
                Ok(Ok(response)) => break Some(response),
                Ok(Err(_)) => break None, // sender dropped (adapter stopping)
                Err(_) => {
                    attempt += 1;
                    if attempt > MAX_RETRANSMISSIONS {
                        warn!(tid = frame.tid, "no response after retransmissions");
                        break None;
                    }
                    debug!(tid = frame.tid, attempt, "request timed out, retransmitting");
                    tokio::time::sleep(Duration::from_millis(100) * attempt).await;
                }
            }
        };

        self.pending.lock().remove(&frame.tid);
        response
    }

    fn handle_received_frame(&self, source: Ipv4Addr, frame: EchonetLiteFrame) {
        debug!(
            %source,
            tid = frame.tid,
            esv = format_args!("0x{:02X}", frame.esv),
            "received frame"
        );

        // Node-profile frames feed discovery while a session is active. The
        // callback fires after the session lock is released.
        if frame.seoj_class_group == EOJ_NODE_PROFILE_CLASS_GROUP
            && frame.seoj_class == EOJ_NODE_PROFILE_CLASS
        {
            let found = {
                let mut session = self.discovery.lock();
                session
                    .as_mut()
                    .map(|s| (s.callback.clone(), handle_discovery_response(source, &frame, s)))
            };
            if let Some((callback, devices)) = found {
                for device in devices {
                    callback(device);
                }
                return;
            }
        }

        let sender = self.pending.lock().remove(&frame.tid);
        if let Some(sender) = sender {
            let _ = sender.send(frame);
        }
    }

    /// Liveness probe of EPC 0x80 against the known EV classes; bypasses the
    /// online gate so an offline device can come back.
    async fn probe_device(&self, device_id: &str) -> bool {
        let Ok(target) = self.device_target(device_id) else {
            return false;
        };
        for class in [EOJ_EV_CHARGER_CLASS, EOJ_EV_DISCHARGER_CLASS] {
            let frame = EchonetLiteFrame::get_properties(
                (EOJ_EV_CHARGER_CLASS_GROUP, class, 0x01),
                &[EPC_OPERATION_STATUS],
            );
            if let Some(response) = self
                .send_request_with_response(target, frame, REQUEST_TIMEOUT)
                .await
            {
                if response.esv == ESV_GET_RESPONSE {
                    return true;
                }
            }
        }
        false
    }

    fn end_discovery(&self) {
        self.discovery.lock().take();
        self.registry.end_discovery();
    }
}

/// Parse an instance-list frame into the not-yet-seen EV devices it names.
fn handle_discovery_response(
    source: Ipv4Addr,
    frame: &EchonetLiteFrame,
    session: &mut DiscoverySession,
) -> Vec<DeviceInfo> {
    let mut found = Vec::new();

    if frame.esv != ESV_GET_RESPONSE && frame.esv != ESV_INF {
        return found;
    }

    let Some(prop) = frame
        .properties
        .iter()
        .find(|p| p.epc == EPC_SELF_NODE_INSTANCE_LIST_S)
    else {
        return found;
    };

    let Some((&count, triples)) = prop.edt.split_first() else {
        warn!(%source, "empty instance list");
        return found;
    };
    if triples.len() < count as usize * 3 {
        warn!(%source, "truncated instance list");
        return found;
    }

    for chunk in triples.chunks_exact(3).take(count as usize) {
        let (class_group, class, instance) = (chunk[0], chunk[1], chunk[2]);

        if class_group == EOJ_NODE_PROFILE_CLASS_GROUP && class == EOJ_NODE_PROFILE_CLASS {
            continue;
        }
        if class_group != EOJ_EV_CHARGER_CLASS_GROUP {
            continue;
        }

        let (device_type, template_id) = if class == EOJ_EV_CHARGER_CLASS {
            ("EV Charger", "echonet_lite_charger")
        } else if class == EOJ_EV_DISCHARGER_CLASS {
            ("EV Charger/Discharger", "echonet_lite_charger_discharger")
        } else {
            // Storage batteries, PV generation and the like are not bridged.
            continue;
        };

        let device_id = format!("echonet_{source}_{class_group}_{class}_{instance}");
        if !session.seen.insert(device_id.clone()) {
            continue;
        }

        info!(%source, device_id, device_type, "discovered device");
        found.push(DeviceInfo {
            id: device_id,
            name: format!("ECHONET Lite {device_type}"),
            model: "Unknown".into(),
            manufacturer: "Unknown".into(),
            firmware_version: String::new(),
            address: DeviceAddress::EchonetLite {
                ip: source.to_string(),
                port: ECHONET_PORT,
            },
            template_id: template_id.into(),
            online: true,
            last_seen: Some(chrono::Utc::now()),
        });
    }

    found
}

fn validate_register_address(address: &RegisterAddress) -> Result<()> {
    if address.register_type != RegisterType::Epc {
        return Err(GatewayError::ConfigValidation(
            "register type must be EPC for ECHONET Lite".into(),
        ));
    }
    if address.eoj_class_group == 0 && address.eoj_class == 0 {
        return Err(GatewayError::ConfigValidation(
            "invalid EOJ class codes".into(),
        ));
    }
    Ok(())
}

pub struct EchonetLiteAdapter {
    core: Arc<Core>,
    cancel: Mutex<Option<CancellationToken>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl EchonetLiteAdapter {
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core {
                registry: DeviceRegistry::new(DeviceProtocol::EchonetLite),
                sockets: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                discovery: Mutex::new(None),
                next_tid: AtomicU16::new(1),
            }),
            cancel: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn spawn_receiver(&self, cancel: CancellationToken) -> Result<JoinHandle<()>> {
        let socket = self.core.unicast_socket()?;
        let core = self.core.clone();
        Ok(tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = socket.recv_from(&mut buf) => {
                        let (len, source) = match received {
                            Ok(r) => r,
                            Err(e) => {
                                error!(error = %e, "receive error");
                                continue;
                            }
                        };
                        let SocketAddr::V4(source) = source else { continue };
                        match EchonetLiteFrame::deserialize(&buf[..len]) {
                            Some(frame) => core.handle_received_frame(*source.ip(), frame),
                            None => warn!(source = %source.ip(), "invalid frame"),
                        }
                    }
                }
            }
            debug!("receiver task stopped");
        }))
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
}

impl Default for EchonetLiteAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceAdapter for EchonetLiteAdapter {
    fn protocol(&self) -> DeviceProtocol {
        DeviceProtocol::EchonetLite
    }

    async fn initialize(&self) -> Result<()> {
        if self.core.sockets.lock().is_some() {
            return Ok(());
        }

        info!("initializing ECHONET Lite adapter");
        let unicast = UdpSocket::bind(("0.0.0.0", ECHONET_PORT)).await?;
        unicast.join_multicast_v4(ECHONET_MULTICAST_ADDR, Ipv4Addr::UNSPECIFIED)?;

        let multicast = UdpSocket::bind(("0.0.0.0", 0)).await?;
        multicast.set_multicast_ttl_v4(1)?;

        *self.core.sockets.lock() = Some(Sockets {
            unicast: Arc::new(unicast),
            multicast: Arc::new(multicast),
        });
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        if !self.core.registry.set_running(true) {
            return Ok(());
        }
        info!("starting ECHONET Lite adapter");

        let cancel = CancellationToken::new();
        *self.cancel.lock() = Some(cancel.clone());

        let receiver = self.spawn_receiver(cancel.clone())?;
        let monitor = self.spawn_status_monitor(cancel);

        let mut tasks = self.tasks.lock();
        tasks.push(receiver);
        tasks.push(monitor);
        Ok(())
    }

    async fn stop(&self) {
        if !self.core.registry.set_running(false) {
            return;
        }
        info!("stopping ECHONET Lite adapter");

        self.stop_discovery().await;
        if let Some(cancel) = self.cancel.lock().take() {
            cancel.cancel();
        }

        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        // Drop pending completions so in-flight waiters fail fast.
        self.core.pending.lock().clear();
        self.core.registry.mark_all_offline();
        *self.core.sockets.lock() = None;
    }

    fn is_running(&self) -> bool {
        self.core.registry.is_running()
    }

    fn add_device(&self, info: DeviceInfo) -> Result<()> {
        self.core.registry.add_device(info)
    }

    fn remove_device(&self, device_id: &str) -> Result<()> {
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
        info!(timeout_ms = timeout.as_millis() as u64, "starting discovery");

        let cancel = CancellationToken::new();
        *self.core.discovery.lock() = Some(DiscoverySession {
            callback,
            seen: HashSet::new(),
            cancel: cancel.clone(),
        });

        let mut frame = EchonetLiteFrame::discovery();
        frame.tid = self.core.next_tid();
        if let Err(e) = self.core.send_multicast(&frame).await {
            self.core.end_discovery();
            return Err(e);
        }

        // The session ends at the timeout or on stop_discovery.
        let core = self.core.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {}
            }
            core.end_discovery();
            info!("discovery finished");
        });
        self.tasks.lock().push(task);
        Ok(())
    }

    async fn stop_discovery(&self) {
        let cancel = self
            .core
            .discovery
            .lock()
            .as_ref()
            .map(|s| s.cancel.clone());
        if let Some(cancel) = cancel {
            cancel.cancel();
            self.core.end_discovery();
            info!("discovery stopped");
        }
    }

    fn discovery_in_progress(&self) -> bool {
        self.core.registry.discovery_in_progress()
    }

    async fn read_register(&self, device_id: &str, address: &RegisterAddress) -> ReadResult {
        if !self.is_running() {
            return ReadResult::err("ECHONET Lite adapter not running");
        }
        if let Err(e) = validate_register_address(address) {
            return ReadResult::err(e.to_string());
        }
        let Some(device) = self.core.registry.device_info(device_id) else {
            return ReadResult::err("Device not found");
        };
        if !device.online {
            return ReadResult::err("Device is offline");
        }
        let target = match self.core.device_target(device_id) {
            Ok(target) => target,
            Err(e) => return ReadResult::err(e.to_string()),
        };

        let frame = EchonetLiteFrame::get_properties(
            (
                address.eoj_class_group,
                address.eoj_class,
                address.eoj_instance,
            ),
            &[address.epc],
        );

        let Some(response) = self
            .core
            .send_request_with_response(target, frame, REQUEST_TIMEOUT)
            .await
        else {
            return ReadResult::err("No response from device");
        };

        if response.esv != ESV_GET_RESPONSE && response.esv != ESV_GET_SNA {
            return ReadResult::err("Unexpected response type");
        }

        for prop in &response.properties {
            if prop.epc == address.epc {
                if response.esv == ESV_GET_SNA {
                    return ReadResult::err("Device reported property read not possible");
                }
                return ReadResult::ok(RegisterValue {
                    data_type: Some(DataType::Binary),
                    data: prop.edt.clone(),
                });
            }
        }
        ReadResult::err("Property not found in response")
    }

    async fn write_register(
        &self,
        device_id: &str,
        address: &RegisterAddress,
        value: &RegisterValue,
    ) -> WriteResult {
        if !self.is_running() {
            return WriteResult::err("ECHONET Lite adapter not running");
        }
        if let Err(e) = validate_register_address(address) {
            return WriteResult::err(e.to_string());
        }
        if value.data.is_empty() {
            return WriteResult::err("Register value is empty");
        }
        let Some(device) = self.core.registry.device_info(device_id) else {
            return WriteResult::err("Device not found");
        };
        if !device.online {
            return WriteResult::err("Device is offline");
        }
        let target = match self.core.device_target(device_id) {
            Ok(target) => target,
            Err(e) => return WriteResult::err(e.to_string()),
        };

        let frame = EchonetLiteFrame::set_property(
            (
                address.eoj_class_group,
                address.eoj_class,
                address.eoj_instance,
            ),
            address.epc,
            value.data.clone(),
        );

        let Some(response) = self
            .core
            .send_request_with_response(target, frame, REQUEST_TIMEOUT)
            .await
        else {
            return WriteResult::err("No response from device");
        };

        if response.esv != ESV_SET_RESPONSE
            && response.esv != ESV_SET_SNA
            && response.esv != ESV_SETGET_SNA
        {
            return WriteResult::err("Unexpected response type");
        }

        for prop in &response.properties {
            if prop.epc == address.epc {
                if response.esv != ESV_SET_RESPONSE {
                    return WriteResult::err("Device reported property write not possible");
                }
                return WriteResult::ok();
            }
        }
        WriteResult::err("Property not found in response")
    }

    async fn read_registers(
        &self,
        device_id: &str,
        addresses: &[RegisterAddress],
    ) -> BTreeMap<RegisterAddress, ReadResult> {
        let mut results = BTreeMap::new();

        if !self.is_running() {
            for address in addresses {
                results.insert(*address, ReadResult::err("ECHONET Lite adapter not running"));
            }
            return results;
        }
        let Some(device) = self.core.registry.device_info(device_id) else {
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
        let target = match self.core.device_target(device_id) {
            Ok(target) => target,
            Err(e) => {
                for address in addresses {
                    results.insert(*address, ReadResult::err(e.to_string()));
                }
                return results;
            }
        };

        // One GET per destination object, all of its EPCs in the OPC list.
        let mut groups: BTreeMap<(u8, u8, u8), Vec<RegisterAddress>> = BTreeMap::new();
        for address in addresses {
            if let Err(e) = validate_register_address(address) {
                results.insert(*address, ReadResult::err(e.to_string()));
                continue;
            }
            groups
                .entry((
                    address.eoj_class_group,
                    address.eoj_class,
                    address.eoj_instance,
                ))
                .or_default()
                .push(*address);
        }

        for (eoj, group) in groups {
            let epcs: Vec<u8> = group.iter().map(|a| a.epc).collect();
            let frame = EchonetLiteFrame::get_properties(eoj, &epcs);

            let Some(response) = self
                .core
                .send_request_with_response(target, frame, REQUEST_TIMEOUT)
                .await
            else {
                for address in &group {
                    results.insert(*address, ReadResult::err("No response from device"));
                }
                continue;
            };

            if response.esv != ESV_GET_RESPONSE && response.esv != ESV_GET_SNA {
                for address in &group {
                    results.insert(*address, ReadResult::err("Unexpected response type"));
                }
                continue;
            }

            for address in &group {
                let result = match response.properties.iter().find(|p| p.epc == address.epc) {
                    Some(_) if response.esv == ESV_GET_SNA => {
                        ReadResult::err("Device reported property read not possible")
                    }
                    Some(prop) => ReadResult::ok(RegisterValue {
                        data_type: Some(DataType::Binary),
                        data: prop.edt.clone(),
                    }),
                    None => ReadResult::err("Property not found in response"),
                };
                results.insert(*address, result);
            }
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn get_frame_wire_bytes() {
        // DEOJ 02 A1 01, ESV 0x62, OPC 1, EPC 0x80.
        let mut frame = EchonetLiteFrame::get_properties((0x02, 0xA1, 0x01), &[0x80]);
        frame.tid = 0x1234;
        assert_eq!(
            frame.serialize(),
            vec![
                0x10, 0x81, 0x12, 0x34, 0x05, 0xFF, 0x01, 0x02, 0xA1, 0x01, 0x62, 0x01, 0x80,
                0x00
            ]
        );
    }

    #[test]
    fn get_response_parses() {
        let bytes = [
            0x10, 0x81, 0x12, 0x34, 0x02, 0xA1, 0x01, 0x05, 0xFF, 0x01, 0x72, 0x01, 0x80, 0x01,
            0x30,
        ];
        let frame = EchonetLiteFrame::deserialize(&bytes).unwrap();
        assert_eq!(frame.tid, 0x1234);
        assert_eq!(frame.esv, ESV_GET_RESPONSE);
        assert_eq!(frame.properties.len(), 1);
        assert_eq!(frame.properties[0].epc, 0x80);
        assert_eq!(frame.properties[0].edt, vec![0x30]);
    }

    #[test]
    fn truncated_frames_return_none() {
        let mut frame = EchonetLiteFrame::get_properties((0x02, 0xA1, 0x01), &[0x80, 0x88]);
        frame.tid = 7;
        let bytes = frame.serialize();
        for len in 0..bytes.len() {
            assert!(
                EchonetLiteFrame::deserialize(&bytes[..len]).is_none(),
                "prefix of length {len} should not parse"
            );
        }
    }

    #[test]
    fn bad_header_rejected() {
        let mut frame = EchonetLiteFrame::discovery();
        frame.tid = 1;
        let mut bytes = frame.serialize();
        bytes[0] = 0x11;
        assert!(EchonetLiteFrame::deserialize(&bytes).is_none());
        bytes[0] = 0x10;
        bytes[1] = 0x80;
        assert!(EchonetLiteFrame::deserialize(&bytes).is_none());
    }

    #[test]
    fn format2_header_accepted() {
        let mut frame = EchonetLiteFrame::discovery();
        frame.ehd2 = 0x82;
        frame.tid = 1;
        let parsed = EchonetLiteFrame::deserialize(&frame.serialize()).unwrap();
        assert_eq!(parsed.ehd2, 0x82);
    }

    #[test]
    fn tid_counter_skips_zero() {
        let adapter = EchonetLiteAdapter::new();
        adapter.core.next_tid.store(u16::MAX, Ordering::SeqCst);
        let a = adapter.core.next_tid();
        let b = adapter.core.next_tid();
        assert_eq!(a, u16::MAX);
        assert_ne!(b, 0);
    }

    fn test_session() -> DiscoverySession {
        DiscoverySession {
            callback: Arc::new(|_info: DeviceInfo| {}),
            seen: HashSet::new(),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn discovery_parses_instance_list_once_per_device() {
        let mut session = test_session();

        // Instance count 2: one EV charger, one storage battery (ignored).
        let frame = EchonetLiteFrame {
            seoj_class_group: EOJ_NODE_PROFILE_CLASS_GROUP,
            seoj_class: EOJ_NODE_PROFILE_CLASS,
            seoj_instance: 0x01,
            esv: ESV_GET_RESPONSE,
            properties: vec![Property {
                epc: EPC_SELF_NODE_INSTANCE_LIST_S,
                edt: vec![0x02, 0x02, 0xA1, 0x01, 0x02, 0x87, 0x01],
            }],
            ..EchonetLiteFrame::default()
        };

        let source = Ipv4Addr::new(192, 168, 1, 30);
        let first = handle_discovery_response(source, &frame, &mut session);
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, "echonet_192.168.1.30_2_161_1");
        assert_eq!(first[0].template_id, "echonet_lite_charger");
        assert!(first[0].online);

        // The same response again yields nothing new.
        let second = handle_discovery_response(source, &frame, &mut session);
        assert!(second.is_empty());
    }

    #[test]
    fn discovery_accepts_inf_notifications() {
        let mut session = test_session();
        let frame = EchonetLiteFrame {
            seoj_class_group: EOJ_NODE_PROFILE_CLASS_GROUP,
            seoj_class: EOJ_NODE_PROFILE_CLASS,
            esv: ESV_INF,
            properties: vec![Property {
                epc: EPC_SELF_NODE_INSTANCE_LIST_S,
                edt: vec![0x01, 0x02, 0xA1, 0x02],
            }],
            ..EchonetLiteFrame::default()
        };

        let found = handle_discovery_response(Ipv4Addr::new(10, 0, 0, 9), &frame, &mut session);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "echonet_10.0.0.9_2_161_2");
    }

    #[test]
    fn discovery_ignores_truncated_instance_list() {
        let mut session = test_session();
        let frame = EchonetLiteFrame {
            seoj_class_group: EOJ_NODE_PROFILE_CLASS_GROUP,
            seoj_class: EOJ_NODE_PROFILE_CLASS,
            esv: ESV_GET_RESPONSE,
            properties: vec![Property {
                epc: EPC_SELF_NODE_INSTANCE_LIST_S,
                edt: vec![0x05, 0x02, 0xA1], // claims 5 instances, carries 2/3 of one
            }],
            ..EchonetLiteFrame::default()
        };

        let found = handle_discovery_response(Ipv4Addr::new(10, 0, 0, 1), &frame, &mut session);
        assert!(found.is_empty());
    }

    #[test]
    fn epc_validation() {
        let bad_type = RegisterAddress::modbus(RegisterType::HoldingRegister, 0, 1);
        assert!(validate_register_address(&bad_type).is_err());

        let zero_eoj = RegisterAddress::epc(0, 0, 1, 0x80);
        assert!(validate_register_address(&zero_eoj).is_err());

        let ok = RegisterAddress::epc(0x02, 0xA1, 0x01, 0x80);
        assert!(validate_register_address(&ok).is_ok());
    }

    proptest! {
        #[test]
        fn prop_frame_round_trips(
            tid in any::<u16>(),
            esv in prop_oneof![Just(0x62u8), Just(0x72u8), Just(0x61u8), Just(0x71u8), Just(0x73u8)],
            props in proptest::collection::vec(
                (any::<u8>(), proptest::collection::vec(any::<u8>(), 0..=253)),
                0..=16,
            ),
        ) {
            let frame = EchonetLiteFrame {
                tid,
                deoj_class_group: 0x02,
                deoj_class: 0xA1,
                deoj_instance: 0x01,
                esv,
                properties: props
                    .into_iter()
                    .map(|(epc, edt)| Property { epc, edt })
                    .collect(),
                ..EchonetLiteFrame::default()
            };
            let parsed = EchonetLiteFrame::deserialize(&frame.serialize());
            prop_assert_eq!(parsed, Some(frame));
        }
    }
}
