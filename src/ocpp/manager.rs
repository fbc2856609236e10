//! OCPP client manager
//!
//! Owns the message processor, the WebSocket transport and the EVSE state
//! machines, and wires them together: transport events drive the processor's
//! connection state, machine callbacks become StatusNotification /
//! MeterValues / TransactionEvent calls, and inbound CSMS commands are turned
//! into machine events.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{GatewayError, Result};

use super::evse::{ConnectorStatus, EvseEvent, EvseStateMachine, TransactionEventData};
use super::message::{Action, Message};
use super::messages::{self, BootNotificationResponse, RegistrationStatus};
use super::processor::MessageProcessor;
use super::transport::{TransportEvents, WsTransport};

/// Configuration for the OCPP client manager.
#[derive(Debug, Clone)]
pub struct OcppClientConfig {
    pub csms_url: String,
    pub ca_cert_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub verify_peer: bool,
    pub connect_timeout: Duration,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    /// 0 = retry forever.
    pub max_reconnect_attempts: u32,
    pub heartbeat_interval: Duration,
    pub charge_point_model: String,
    pub charge_point_vendor: String,
    pub firmware_version: String,
}

impl Default for OcppClientConfig {
    fn default() -> Self {
        Self {
            csms_url: String::new(),
            ca_cert_path: None,
            client_cert_path: None,
            client_key_path: None,
            verify_peer: true,
            connect_timeout: Duration::from_secs(10),
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_interval: Duration::from_secs(300),
            max_reconnect_attempts: 0,
            heartbeat_interval: Duration::from_secs(300),
            charge_point_model: "OCPP Gateway".into(),
            charge_point_vendor: "OCPP Gateway".into(),
            firmware_version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

struct Inner {
    config: OcppClientConfig,
    processor: Arc<MessageProcessor>,
    transport: Arc<dyn WsTransport>,
    evses: Mutex<Vec<EvseStateMachine>>,
    running: AtomicBool,
    heartbeat: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl Inner {
    fn send(&self, message: &Message) -> bool {
        self.processor.send_message(message)
    }

    fn send_boot_notification(&self) -> bool {
        info!("sending BootNotification");
        self.send(&messages::boot_notification(
            &self.config.charge_point_model,
            &self.config.charge_point_vendor,
            Some(&self.config.firmware_version),
        ))
    }

    fn send_status_notification(&self, evse_id: i32, connector_id: i32, status: ConnectorStatus) {
        info!(evse_id, connector_id, status = %status, "sending StatusNotification");
        self.send(&messages::status_notification(
            evse_id,
            connector_id,
            &status.to_string(),
            chrono::Utc::now(),
        ));
    }

    fn send_meter_values(&self, evse_id: i32, value: f64) {
        debug!(evse_id, value, "sending MeterValues");
        self.send(&messages::meter_values(evse_id, value));
    }

    fn send_transaction_event(&self, data: &TransactionEventData) {
        info!(
            evse_id = data.evse_id,
            event_type = data.event_type,
            transaction_id = %data.transaction_id,
            trigger = %data.trigger_reason,
            "sending TransactionEvent"
        );
        let connector_id = self
            .evses
            .lock()
            .iter()
            .find(|m| m.evse_id() == data.evse_id)
            .map(|m| m.connector_id())
            .unwrap_or(1);
        self.send(&messages::transaction_event(
            data.event_type,
            &data.timestamp,
            &data.trigger_reason,
            data.seq_no,
            &data.transaction_id,
            data.evse_id,
            connector_id,
            Some(data.meter_value),
        ));
    }

    fn find_evse(&self, evse_id: i32, connector_id: i32) -> Option<EvseStateMachine> {
        self.evses
            .lock()
            .iter()
            .find(|m| m.evse_id() == evse_id && m.connector_id() == connector_id)
            .cloned()
    }

    fn first_evse(&self, evse_id: Option<i32>) -> Option<EvseStateMachine> {
        let evses = self.evses.lock();
        match evse_id {
            Some(id) => evses.iter().find(|m| m.evse_id() == id).cloned(),
            None => evses.first().cloned(),
        }
    }

    fn stop_heartbeat(&self) {
        if let Some((cancel, _task)) = self.heartbeat.lock().take() {
            cancel.cancel();
            debug!("heartbeat timer stopped");
        }
    }
}

fn start_heartbeat(inner: &Arc<Inner>, interval: Duration) {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let weak = Arc::downgrade(inner);

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
            let Some(inner) = weak.upgrade() else { break };
            if !inner.processor.is_connected() {
                continue;
            }
            debug!("sending Heartbeat");
            inner.send(&messages::heartbeat());
        }
    });

    info!(interval_secs = interval.as_secs(), "heartbeat timer started");
    if let Some((old_cancel, old_task)) = inner.heartbeat.lock().replace((cancel, task)) {
        old_cancel.cancel();
        old_task.abort();
    }
}

fn on_boot_notification_result(inner: &Arc<Inner>, payload: &Value) {
    let response: BootNotificationResponse = match serde_json::from_value(payload.clone()) {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "malformed BootNotification response");
            return;
        }
    };

    match response.status {
        RegistrationStatus::Accepted => {
            let interval = if response.interval > 0 {
                Duration::from_secs(response.interval)
            } else {
                inner.config.heartbeat_interval
            };
            info!(interval_secs = interval.as_secs(), "registration accepted");
            start_heartbeat(inner, interval);
        }
        status => warn!(?status, "CSMS did not accept registration"),
    }
}

/// Manages the OCPP client connection to the CSMS.
#[derive(Clone)]
pub struct ClientManager {
    inner: Arc<Inner>,
}

impl ClientManager {
    pub fn new(config: OcppClientConfig, transport: Arc<dyn WsTransport>) -> Self {
        let inner = Arc::new(Inner {
            config,
            processor: Arc::new(MessageProcessor::new()),
            transport,
            evses: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
        });

        {
            let transport = inner.transport.clone();
            inner
                .processor
                .set_send_fn(move |frame: &str| transport.send(frame));
        }
        {
            let weak = Arc::downgrade(&inner);
            inner.processor.set_result_hook(move |action, message| {
                if action != Action::BootNotification {
                    return;
                }
                if let (Some(inner), Message::CallResult { payload, .. }) =
                    (weak.upgrade(), message)
                {
                    on_boot_notification_result(&inner, payload);
                }
            });
        }
        let manager = Self { inner };
        manager.register_handlers();
        manager
    }

    pub fn config(&self) -> &OcppClientConfig {
        &self.inner.config
    }

    /// Connect to the CSMS and begin processing.
    pub fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            warn!("client manager already running");
            return Ok(());
        }
        info!(url = %self.inner.config.csms_url, "starting OCPP client manager");

        let weak = Arc::downgrade(&self.inner);
        let events = TransportEvents {
            on_open: Arc::new({
                let weak = weak.clone();
                move |connected| {
                    let Some(inner) = weak.upgrade() else { return };
                    if connected {
                        inner.processor.set_connected(true);
                        inner.send_boot_notification();
                    } else {
                        inner.processor.set_connected(false);
                    }
                }
            }),
            on_message: Arc::new({
                let weak = weak.clone();
                move |text: String| {
                    let Some(inner) = weak.upgrade() else { return };
                    if let Err(e) = inner.processor.process_incoming(&text) {
                        error!(error = %e, "failed to process inbound message");
                    }
                }
            }),
            on_close: Arc::new({
                let weak = weak.clone();
                move |reason: String| {
                    info!(reason, "CSMS connection closed");
                    let Some(inner) = weak.upgrade() else { return };
                    inner.processor.set_connected(false);
                    inner.stop_heartbeat();
                }
            }),
            on_error: Arc::new({
                let weak = weak.clone();
                move |message: String, code: i32| {
                    error!(message, code, "transport error");
                    if let Some(inner) = weak.upgrade() {
                        inner.processor.set_connected(false);
                    }
                }
            }),
        };

        self.inner.transport.start(events)
    }

    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping OCPP client manager");

        self.inner.stop_heartbeat();
        for evse in self.inner.evses.lock().drain(..) {
            evse.stop_timers();
        }
        self.inner.transport.close("Client shutdown").await;
    }

    pub fn is_connected(&self) -> bool {
        self.inner.processor.is_connected()
    }

    pub fn queue_size(&self) -> usize {
        self.inner.processor.queue_size()
    }

    pub fn heartbeat_running(&self) -> bool {
        self.inner.heartbeat.lock().is_some()
    }

    pub fn send_message(&self, message: &Message) -> bool {
        self.inner.send(message)
    }

    /// Add a state machine for `(evse_id, connector_id)` and announce its
    /// initial connector status.
    pub fn add_evse(&self, evse_id: i32, connector_id: i32) -> Result<()> {
        let machine = {
            let mut evses = self.inner.evses.lock();
            if evses
                .iter()
                .any(|m| m.evse_id() == evse_id && m.connector_id() == connector_id)
            {
                return Err(GatewayError::ConfigValidation(format!(
                    "EVSE {evse_id} connector {connector_id} already exists"
                )));
            }

            let machine = EvseStateMachine::new(evse_id, connector_id);
            evses.push(machine.clone());
            machine
        };

        let weak = Arc::downgrade(&self.inner);
        machine.set_status_change_callback(Arc::new({
            let weak = weak.clone();
            move |connector_id, _error_code, status| {
                if let Some(inner) = weak.upgrade() {
                    inner.send_status_notification(evse_id, connector_id, status);
                }
            }
        }));
        machine.set_meter_value_callback(Arc::new({
            let weak = weak.clone();
            move |evse_id, value| {
                if let Some(inner) = weak.upgrade() {
                    inner.send_meter_values(evse_id, value);
                }
            }
        }));
        machine.set_transaction_event_callback(Arc::new({
            let weak = weak.clone();
            move |data| {
                if let Some(inner) = weak.upgrade() {
                    inner.send_transaction_event(data);
                }
            }
        }));

        machine.start_heartbeat(self.inner.config.heartbeat_interval);
        self.inner
            .send_status_notification(evse_id, connector_id, machine.connector_status());
        Ok(())
    }

    pub fn remove_evse(&self, evse_id: i32, connector_id: i32) -> Result<()> {
        let mut evses = self.inner.evses.lock();
        let index = evses
            .iter()
            .position(|m| m.evse_id() == evse_id && m.connector_id() == connector_id)
            .ok_or_else(|| {
                GatewayError::Internal(format!(
                    "EVSE {evse_id} connector {connector_id} not found"
                ))
            })?;
        let machine = evses.remove(index);
        machine.stop_timers();
        Ok(())
    }

    pub fn evse(&self, evse_id: i32, connector_id: i32) -> Option<EvseStateMachine> {
        self.inner.find_evse(evse_id, connector_id)
    }

    pub fn process_evse_event(&self, evse_id: i32, connector_id: i32, event: EvseEvent) -> bool {
        match self.inner.find_evse(evse_id, connector_id) {
            Some(machine) => machine.process_event(event),
            None => {
                error!(evse_id, connector_id, "EVSE not found");
                false
            }
        }
    }

    /// Install the handlers for CSMS-originated commands.
    fn register_handlers(&self) {
        let processor = &self.inner.processor;

        processor.register_handler(
            Action::RemoteStartTransaction,
            Arc::new(handler(&self.inner, |inner, msg: &Message| {
                let Message::Call { id, payload, .. } = msg else {
                    return None;
                };
                let Some(id_tag) = payload
                    .pointer("/idToken/idToken")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                else {
                    return Some(Message::call_result(
                        id.clone(),
                        json!({"status": "Rejected"}),
                    ));
                };
                let evse_id = payload
                    .get("evseId")
                    .and_then(Value::as_i64)
                    .map(|v| v as i32);

                info!(id_tag, ?evse_id, "RemoteStartTransaction");
                let accepted = inner
                    .first_evse(evse_id)
                    .map(|m| m.process_event(EvseEvent::AuthorizeStart { id_tag }))
                    .unwrap_or(false);
                let status = if accepted { "Accepted" } else { "Rejected" };
                Some(Message::call_result(id.clone(), json!({"status": status})))
            })),
        );

        processor.register_handler(
            Action::RemoteStopTransaction,
            Arc::new(handler(&self.inner, |inner, msg: &Message| {
                let Message::Call { id, payload, .. } = msg else {
                    return None;
                };
                let Some(transaction_id) = payload
                    .get("transactionId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                else {
                    return Some(Message::call_result(
                        id.clone(),
                        json!({"status": "Rejected"}),
                    ));
                };

                info!(transaction_id, "RemoteStopTransaction");
                let target = inner.evses.lock().iter().find_map(|m| {
                    m.current_transaction()
                        .filter(|t| t.id == transaction_id)
                        .map(|_| m.clone())
                });
                let accepted = target
                    .map(|m| m.process_event(EvseEvent::StopCharging))
                    .unwrap_or(false);
                let status = if accepted { "Accepted" } else { "Rejected" };
                Some(Message::call_result(id.clone(), json!({"status": status})))
            })),
        );

        processor.register_handler(
            Action::UnlockConnector,
            Arc::new(handler(&self.inner, |inner, msg: &Message| {
                let Message::Call { id, payload, .. } = msg else {
                    return None;
                };
                let evse_id = payload.get("evseId").and_then(Value::as_i64).unwrap_or(1) as i32;
                let connector_id = payload
                    .get("connectorId")
                    .and_then(Value::as_i64)
                    .unwrap_or(1) as i32;

                info!(evse_id, connector_id, "UnlockConnector");
                let unlocked = inner
                    .find_evse(evse_id, connector_id)
                    .map(|m| m.process_event(EvseEvent::PlugOut))
                    .unwrap_or(false);
                let status = if unlocked { "Unlocked" } else { "UnlockFailed" };
                Some(Message::call_result(id.clone(), json!({"status": status})))
            })),
        );

        processor.register_handler(
            Action::TriggerMessage,
            Arc::new(handler(&self.inner, |inner, msg: &Message| {
                let Message::Call { id, payload, .. } = msg else {
                    return None;
                };
                let requested = payload
                    .get("requestedMessage")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                info!(requested, "TriggerMessage");

                let status = match requested {
                    "StatusNotification" => {
                        for machine in inner.evses.lock().iter() {
                            inner.send_status_notification(
                                machine.evse_id(),
                                machine.connector_id(),
                                machine.connector_status(),
                            );
                        }
                        "Accepted"
                    }
                    "Heartbeat" => {
                        inner.send(&messages::heartbeat());
                        "Accepted"
                    }
                    "BootNotification" => {
                        inner.send_boot_notification();
                        "Accepted"
                    }
                    _ => "NotImplemented",
                };
                Some(Message::call_result(id.clone(), json!({"status": status})))
            })),
        );

        processor.register_handler(
            Action::SetChargingProfile,
            Arc::new(handler(&self.inner, |_inner, msg: &Message| {
                let Message::Call { id, payload, .. } = msg else {
                    return None;
                };
                let evse_id = payload.get("evseId").and_then(Value::as_i64);
                let profile_id = payload.pointer("/chargingProfile/id").and_then(Value::as_i64);
                if evse_id.is_none() {
                    return Some(Message::call_result(
                        id.clone(),
                        json!({"status": "Rejected"}),
                    ));
                }
                info!(?evse_id, ?profile_id, "SetChargingProfile accepted");
                Some(Message::call_result(id.clone(), json!({"status": "Accepted"})))
            })),
        );

        processor.register_handler(
            Action::DataTransfer,
            Arc::new(handler(&self.inner, |_inner, msg: &Message| {
                let Message::Call { id, payload, .. } = msg else {
                    return None;
                };
                let Some(vendor_id) = payload.get("vendorId").and_then(Value::as_str) else {
                    return Some(Message::call_result(
                        id.clone(),
                        json!({"status": "Rejected"}),
                    ));
                };
                info!(vendor_id, "DataTransfer");
                Some(Message::call_result(id.clone(), json!({"status": "Accepted"})))
            })),
        );
    }
}

/// Wrap a handler body with the weak-upgrade dance.
fn handler<F>(inner: &Arc<Inner>, f: F) -> impl Fn(&Message) -> Option<Message> + Send + Sync
where
    F: Fn(&Arc<Inner>, &Message) -> Option<Message> + Send + Sync,
{
    let weak: Weak<Inner> = Arc::downgrade(inner);
    move |msg: &Message| {
        let inner = weak.upgrade()?;
        f(&inner, msg)
    }
}
