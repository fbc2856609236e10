//! Per-connector EVSE state machine
//!
//! Event-driven automaton tracking connector lifecycle and the charging
//! transaction. Invalid events for the current state are rejected by
//! returning `false` with no effect. Callbacks into the owner fire after the
//! internal lock has been released, so they may call back into the machine.
//!
//! The meter-value timer runs exactly while the machine is Charging; the
//! heartbeat timer exists from `start_heartbeat` until stopped and has no
//! side effect beyond its tick (the manager uses it as a liveness signal).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::message::now_timestamp;

/// The variable the meter-value timer samples.
pub const METER_VALUE_VARIABLE: &str = "MeterValue.Energy.Active.Import.Register";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum EvseState {
    Available,
    Preparing,
    Charging,
    #[strum(serialize = "SuspendedEV")]
    SuspendedEv,
    #[strum(serialize = "SuspendedEVSE")]
    SuspendedEvse,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum ConnectorStatus {
    Available,
    Occupied,
    Reserved,
    Unavailable,
    Faulted,
}

/// Projection of [`EvseState`] onto the OCPP connector status values.
pub fn connector_status_for(state: EvseState) -> ConnectorStatus {
    match state {
        EvseState::Available => ConnectorStatus::Available,
        EvseState::Preparing
        | EvseState::Charging
        | EvseState::SuspendedEv
        | EvseState::SuspendedEvse
        | EvseState::Finishing => ConnectorStatus::Occupied,
        EvseState::Reserved => ConnectorStatus::Reserved,
        EvseState::Unavailable => ConnectorStatus::Unavailable,
        EvseState::Faulted => ConnectorStatus::Faulted,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EvseEvent {
    PlugIn,
    PlugOut,
    AuthorizeStart { id_tag: String },
    AuthorizeStop { id_tag: String },
    StartCharging,
    StopCharging,
    SuspendChargingEv,
    SuspendChargingEvse,
    ResumeCharging,
    Reserve,
    CancelReservation,
    SetUnavailable,
    SetAvailable,
    FaultDetected,
    FaultCleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    Completed,
    Expired,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct SampledValue {
    pub value: String,
    pub context: String,
    pub measurand: String,
    pub unit: String,
}

#[derive(Debug, Clone)]
pub struct MeterValue {
    pub timestamp: DateTime<Utc>,
    pub sampled_values: Vec<SampledValue>,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    pub id: String,
    pub id_tag: String,
    pub start_time: DateTime<Utc>,
    pub stop_time: Option<DateTime<Utc>>,
    pub meter_values: Vec<MeterValue>,
    pub status: TransactionStatus,
}

/// Name-keyed OCPP variable attached to a state machine.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub data_type: String,
    pub scale: Option<f64>,
    pub unit: Option<String>,
    pub enum_mapping: Option<HashMap<String, String>>,
}

/// Data carried by a transaction event callback.
#[derive(Debug, Clone)]
pub struct TransactionEventData {
    pub event_type: &'static str,
    pub timestamp: String,
    pub trigger_reason: String,
    pub seq_no: i64,
    pub transaction_id: String,
    pub evse_id: i32,
    pub meter_value: f64,
}

pub type StatusChangeCallback = Arc<dyn Fn(i32, &str, ConnectorStatus) + Send + Sync>;
pub type MeterValueCallback = Arc<dyn Fn(i32, f64) + Send + Sync>;
pub type TransactionEventCallback = Arc<dyn Fn(&TransactionEventData) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    status_change: Option<StatusChangeCallback>,
    meter_value: Option<MeterValueCallback>,
    transaction_event: Option<TransactionEventCallback>,
}

struct Core {
    state: EvseState,
    connector_status: ConnectorStatus,
    transaction: Option<Transaction>,
    variables: HashMap<String, Variable>,
    seq_no: i64,
}

enum Emission {
    Status(ConnectorStatus),
    Meter(f64),
    Transaction(TransactionEventData),
}

struct Inner {
    evse_id: i32,
    connector_id: i32,
    core: Mutex<Core>,
    callbacks: Mutex<Callbacks>,
    meter_interval: Mutex<Duration>,
    meter_timer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    heartbeat_timer: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

/// Cheaply clonable handle; all clones share one machine.
#[derive(Clone)]
pub struct EvseStateMachine {
    inner: Arc<Inner>,
}

impl EvseStateMachine {
    pub fn new(evse_id: i32, connector_id: i32) -> Self {
        info!(evse_id, connector_id, "initializing EVSE state machine");
        Self {
            inner: Arc::new(Inner {
                evse_id,
                connector_id,
                core: Mutex::new(Core {
                    state: EvseState::Available,
                    connector_status: ConnectorStatus::Available,
                    transaction: None,
                    variables: HashMap::new(),
                    seq_no: 0,
                }),
                callbacks: Mutex::new(Callbacks::default()),
                meter_interval: Mutex::new(Duration::from_secs(60)),
                meter_timer: Mutex::new(None),
                heartbeat_timer: Mutex::new(None),
            }),
        }
    }

    pub fn evse_id(&self) -> i32 {
        self.inner.evse_id
    }

    pub fn connector_id(&self) -> i32 {
        self.inner.connector_id
    }

    pub fn state(&self) -> EvseState {
        self.inner.core.lock().state
    }

    pub fn connector_status(&self) -> ConnectorStatus {
        self.inner.core.lock().connector_status
    }

    pub fn current_transaction(&self) -> Option<Transaction> {
        self.inner.core.lock().transaction.clone()
    }

    pub fn set_status_change_callback(&self, callback: StatusChangeCallback) {
        self.inner.callbacks.lock().status_change = Some(callback);
    }

    pub fn set_meter_value_callback(&self, callback: MeterValueCallback) {
        self.inner.callbacks.lock().meter_value = Some(callback);
    }

    pub fn set_transaction_event_callback(&self, callback: TransactionEventCallback) {
        self.inner.callbacks.lock().transaction_event = Some(callback);
    }

    pub fn set_variable(
        &self,
        name: &str,
        value: &str,
        data_type: &str,
        scale: Option<f64>,
        unit: Option<String>,
        enum_mapping: Option<HashMap<String, String>>,
    ) {
        self.inner.core.lock().variables.insert(
            name.to_string(),
            Variable {
                name: name.to_string(),
                value: value.to_string(),
                data_type: data_type.to_string(),
                scale,
                unit,
                enum_mapping,
            },
        );
    }

    pub fn variable(&self, name: &str) -> Option<Variable> {
        self.inner.core.lock().variables.get(name).cloned()
    }

    pub fn variable_value(&self, name: &str) -> String {
        self.inner
            .core
            .lock()
            .variables
            .get(name)
            .map(|v| v.value.clone())
            .unwrap_or_default()
    }

    /// Process one event; invalid events are rejected without effect.
    pub fn process_event(&self, event: EvseEvent) -> bool {
        let mut emissions = Vec::new();
        let (accepted, entered_charging, left_charging) = {
            let mut core = self.inner.core.lock();
            let before = core.state;
            debug!(
                evse_id = self.inner.evse_id,
                connector_id = self.inner.connector_id,
                state = %before,
                event = ?event,
                "processing event"
            );

            let accepted = self.apply_event(&mut core, event, &mut emissions);
            let after = core.state;
            (
                accepted,
                after == EvseState::Charging && before != EvseState::Charging,
                before == EvseState::Charging && after != EvseState::Charging,
            )
        };

        if entered_charging {
            self.start_meter_timer();
        } else if left_charging {
            self.stop_meter_timer();
        }

        self.dispatch(emissions);
        accepted
    }

    fn apply_event(&self, core: &mut Core, event: EvseEvent, out: &mut Vec<Emission>) -> bool {
        use EvseEvent as E;
        use EvseState as S;

        match (core.state, event) {
            (S::Available, E::PlugIn) => self.transition(core, S::Preparing, out),
            (S::Available, E::Reserve) => self.transition(core, S::Reserved, out),
            (S::Available, E::SetUnavailable) => self.transition(core, S::Unavailable, out),
            (S::Available, E::FaultDetected) => self.transition(core, S::Faulted, out),

            (S::Preparing, E::PlugOut) => self.transition(core, S::Available, out),
            (S::Preparing, E::AuthorizeStart { id_tag }) => {
                if self.start_transaction(core, &id_tag, out) {
                    self.transition(core, S::Charging, out)
                } else {
                    false
                }
            }
            (S::Preparing, E::SetUnavailable) => self.transition(core, S::Unavailable, out),
            (S::Preparing, E::FaultDetected) => self.transition(core, S::Faulted, out),

            (S::Charging | S::SuspendedEv | S::SuspendedEvse, E::StopCharging) => {
                if self.stop_transaction(core, "Local", out) {
                    self.transition(core, S::Finishing, out)
                } else {
                    false
                }
            }
            (S::Charging | S::SuspendedEv | S::SuspendedEvse, E::AuthorizeStop { .. }) => {
                if self.stop_transaction(core, "DeAuthorized", out) {
                    self.transition(core, S::Finishing, out)
                } else {
                    false
                }
            }
            (S::Charging, E::SuspendChargingEv) => self.transition(core, S::SuspendedEv, out),
            (S::Charging, E::SuspendChargingEvse) => self.transition(core, S::SuspendedEvse, out),
            (S::SuspendedEv | S::SuspendedEvse, E::ResumeCharging) => {
                self.transition(core, S::Charging, out)
            }
            (S::Charging | S::SuspendedEv | S::SuspendedEvse, E::FaultDetected) => {
                // The transaction ends even if clearing it fails.
                self.stop_transaction(core, "Faulted", out);
                self.transition(core, S::Faulted, out)
            }

            (S::Finishing, E::PlugOut) => self.transition(core, S::Available, out),
            (S::Finishing, E::FaultDetected) => self.transition(core, S::Faulted, out),

            (S::Reserved, E::PlugIn) => self.transition(core, S::Preparing, out),
            (S::Reserved, E::CancelReservation) => self.transition(core, S::Available, out),
            (S::Reserved, E::SetUnavailable) => self.transition(core, S::Unavailable, out),
            (S::Reserved, E::FaultDetected) => self.transition(core, S::Faulted, out),

            (S::Unavailable, E::SetAvailable) => self.transition(core, S::Available, out),
            (S::Unavailable, E::FaultDetected) => self.transition(core, S::Faulted, out),

            (S::Faulted, E::FaultCleared) => self.transition(core, S::Available, out),

            (state, event) => {
                warn!(
                    evse_id = self.inner.evse_id,
                    connector_id = self.inner.connector_id,
                    state = %state,
                    event = ?event,
                    "invalid event for state"
                );
                false
            }
        }
    }

    fn transition(&self, core: &mut Core, new_state: EvseState, out: &mut Vec<Emission>) -> bool {
        info!(
            evse_id = self.inner.evse_id,
            connector_id = self.inner.connector_id,
            from = %core.state,
            to = %new_state,
            "state transition"
        );
        core.state = new_state;
        core.connector_status = connector_status_for(new_state);
        out.push(Emission::Status(core.connector_status));
        true
    }

    fn start_transaction(&self, core: &mut Core, id_tag: &str, out: &mut Vec<Emission>) -> bool {
        if core.transaction.is_some() {
            error!(
                evse_id = self.inner.evse_id,
                connector_id = self.inner.connector_id,
                "transaction already in progress"
            );
            return false;
        }

        let transaction = Transaction {
            id: Uuid::new_v4().to_string(),
            id_tag: id_tag.to_string(),
            start_time: Utc::now(),
            stop_time: None,
            meter_values: Vec::new(),
            status: TransactionStatus::Active,
        };
        info!(
            evse_id = self.inner.evse_id,
            transaction_id = %transaction.id,
            id_tag,
            "transaction started"
        );

        core.seq_no = 0;
        let meter_value = Self::read_meter_variable(core);
        out.push(Emission::Transaction(TransactionEventData {
            event_type: "Started",
            timestamp: now_timestamp(),
            trigger_reason: "Authorized".to_string(),
            seq_no: core.seq_no,
            transaction_id: transaction.id.clone(),
            evse_id: self.inner.evse_id,
            meter_value,
        }));
        core.seq_no += 1;
        core.transaction = Some(transaction);
        true
    }

    fn stop_transaction(&self, core: &mut Core, reason: &str, out: &mut Vec<Emission>) -> bool {
        let Some(transaction) = core.transaction.as_mut() else {
            error!(
                evse_id = self.inner.evse_id,
                connector_id = self.inner.connector_id,
                "no transaction in progress"
            );
            return false;
        };

        transaction.stop_time = Some(Utc::now());
        transaction.status = TransactionStatus::Completed;
        info!(
            evse_id = self.inner.evse_id,
            transaction_id = %transaction.id,
            reason,
            "transaction stopped"
        );

        let transaction_id = transaction.id.clone();
        let meter_value = Self::read_meter_variable(core);
        out.push(Emission::Transaction(TransactionEventData {
            event_type: "Ended",
            timestamp: now_timestamp(),
            trigger_reason: reason.to_string(),
            seq_no: core.seq_no,
            transaction_id,
            evse_id: self.inner.evse_id,
            meter_value,
        }));
        core.seq_no += 1;
        core.transaction = None;
        true
    }

    /// Sample the meter variable with its scale applied; 0.0 when unset or
    /// unparsable.
    fn read_meter_variable(core: &Core) -> f64 {
        let Some(var) = core.variables.get(METER_VALUE_VARIABLE) else {
            return 0.0;
        };
        match var.value.parse::<f64>() {
            Ok(raw) => raw * var.scale.unwrap_or(1.0),
            Err(_) => {
                warn!(value = %var.value, "meter variable is not numeric");
                0.0
            }
        }
    }

    /// Append a periodic sample to the active transaction and emit
    /// Updated/MeterValue events.
    pub fn add_meter_value(&self, value: f64) {
        let mut emissions = Vec::new();
        {
            let mut core = self.inner.core.lock();
            let Some(transaction) = core.transaction.as_mut() else {
                warn!(
                    evse_id = self.inner.evse_id,
                    "cannot add meter value, no transaction in progress"
                );
                return;
            };

            transaction.meter_values.push(MeterValue {
                timestamp: Utc::now(),
                sampled_values: vec![SampledValue {
                    value: value.to_string(),
                    context: "Sample.Periodic".to_string(),
                    measurand: "Energy.Active.Import.Register".to_string(),
                    unit: "Wh".to_string(),
                }],
            });
            let transaction_id = transaction.id.clone();

            emissions.push(Emission::Meter(value));
            emissions.push(Emission::Transaction(TransactionEventData {
                event_type: "Updated",
                timestamp: now_timestamp(),
                trigger_reason: "MeterValue".to_string(),
                seq_no: core.seq_no,
                transaction_id,
                evse_id: self.inner.evse_id,
                meter_value: value,
            }));
            core.seq_no += 1;
        }
        self.dispatch(emissions);
    }

    fn dispatch(&self, emissions: Vec<Emission>) {
        if emissions.is_empty() {
            return;
        }
        let callbacks = self.inner.callbacks.lock();
        let status_cb = callbacks.status_change.clone();
        let meter_cb = callbacks.meter_value.clone();
        let txn_cb = callbacks.transaction_event.clone();
        drop(callbacks);

        for emission in emissions {
            match emission {
                Emission::Status(status) => {
                    if let Some(cb) = &status_cb {
                        cb(self.inner.connector_id, "NoError", status);
                    }
                }
                Emission::Meter(value) => {
                    if let Some(cb) = &meter_cb {
                        cb(self.inner.evse_id, value);
                    }
                }
                Emission::Transaction(data) => {
                    if let Some(cb) = &txn_cb {
                        cb(&data);
                    }
                }
            }
        }
    }

    pub fn set_meter_value_interval(&self, interval: Duration) {
        *self.inner.meter_interval.lock() = interval;
    }

    pub fn meter_timer_running(&self) -> bool {
        self.inner.meter_timer.lock().is_some()
    }

    pub fn heartbeat_running(&self) -> bool {
        self.inner.heartbeat_timer.lock().is_some()
    }

    fn start_meter_timer(&self) {
        let interval = *self.inner.meter_interval.lock();
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let machine = self.clone();

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                let value = {
                    let core = machine.inner.core.lock();
                    if core.state != EvseState::Charging {
                        break;
                    }
                    Self::read_meter_variable(&core)
                };
                machine.add_meter_value(value);
            }
        });

        debug!(
            evse_id = self.inner.evse_id,
            interval_secs = interval.as_secs(),
            "meter value timer started"
        );
        if let Some((old_cancel, old_task)) =
            self.inner.meter_timer.lock().replace((cancel, task))
        {
            old_cancel.cancel();
            old_task.abort();
        }
    }

    fn stop_meter_timer(&self) {
        if let Some((cancel, _task)) = self.inner.meter_timer.lock().take() {
            cancel.cancel();
            debug!(evse_id = self.inner.evse_id, "meter value timer stopped");
        }
    }

    /// Start the liveness heartbeat tick. Reschedules itself until stopped.
    pub fn start_heartbeat(&self, interval: Duration) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let evse_id = self.inner.evse_id;
        let connector_id = self.inner.connector_id;

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        debug!(evse_id, connector_id, "heartbeat tick");
                    }
                }
            }
        });

        debug!(
            evse_id,
            connector_id,
            interval_secs = interval.as_secs(),
            "heartbeat timer started"
        );
        if let Some((old_cancel, old_task)) =
            self.inner.heartbeat_timer.lock().replace((cancel, task))
        {
            old_cancel.cancel();
            old_task.abort();
        }
    }

    pub fn stop_heartbeat(&self) {
        if let Some((cancel, _task)) = self.inner.heartbeat_timer.lock().take() {
            cancel.cancel();
            debug!(evse_id = self.inner.evse_id, "heartbeat timer stopped");
        }
    }

    /// Cancel both timers (owner shutdown).
    pub fn stop_timers(&self) {
        self.stop_meter_timer();
        self.stop_heartbeat();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::sync::Mutex as StdMutex;

    fn machine() -> EvseStateMachine {
        EvseStateMachine::new(1, 1)
    }

    fn auth_start(tag: &str) -> EvseEvent {
        EvseEvent::AuthorizeStart {
            id_tag: tag.to_string(),
        }
    }

    #[rstest]
    #[case(EvseState::Available, ConnectorStatus::Available)]
    #[case(EvseState::Preparing, ConnectorStatus::Occupied)]
    #[case(EvseState::Charging, ConnectorStatus::Occupied)]
    #[case(EvseState::SuspendedEv, ConnectorStatus::Occupied)]
    #[case(EvseState::SuspendedEvse, ConnectorStatus::Occupied)]
    #[case(EvseState::Finishing, ConnectorStatus::Occupied)]
    #[case(EvseState::Reserved, ConnectorStatus::Reserved)]
    #[case(EvseState::Unavailable, ConnectorStatus::Unavailable)]
    #[case(EvseState::Faulted, ConnectorStatus::Faulted)]
    fn connector_status_projection(#[case] state: EvseState, #[case] expected: ConnectorStatus) {
        assert_eq!(connector_status_for(state), expected);
    }

    #[tokio::test]
    async fn plug_in_charging_cycle() {
        let m = machine();
        let events: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        {
            let log = events.clone();
            m.set_transaction_event_callback(Arc::new(move |data| {
                log.lock()
                    .unwrap()
                    .push(format!("{}:{}", data.event_type, data.trigger_reason));
            }));
        }

        assert!(m.process_event(EvseEvent::PlugIn));
        assert_eq!(m.state(), EvseState::Preparing);
        assert_eq!(m.connector_status(), ConnectorStatus::Occupied);

        assert!(m.process_event(auth_start("TAG001")));
        assert_eq!(m.state(), EvseState::Charging);
        let txn = m.current_transaction().unwrap();
        assert_eq!(txn.id_tag, "TAG001");
        assert_eq!(txn.status, TransactionStatus::Active);

        assert!(m.process_event(EvseEvent::StopCharging));
        assert_eq!(m.state(), EvseState::Finishing);
        assert!(m.current_transaction().is_none());

        assert!(m.process_event(EvseEvent::PlugOut));
        assert_eq!(m.state(), EvseState::Available);
        assert_eq!(m.connector_status(), ConnectorStatus::Available);

        let log = events.lock().unwrap().clone();
        assert_eq!(log, vec!["Started:Authorized", "Ended:Local"]);
    }

    #[tokio::test]
    async fn second_transaction_rejected() {
        let m = machine();
        m.process_event(EvseEvent::PlugIn);
        assert!(m.process_event(auth_start("A")));
        let first = m.current_transaction().unwrap().id;

        // Already charging: a second authorize is an invalid event, and the
        // transaction is untouched.
        assert!(!m.process_event(auth_start("B")));
        assert_eq!(m.current_transaction().unwrap().id, first);
    }

    #[tokio::test]
    async fn fault_during_charging_stops_transaction() {
        let m = machine();
        let reasons: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        {
            let log = reasons.clone();
            m.set_transaction_event_callback(Arc::new(move |data| {
                if data.event_type == "Ended" {
                    log.lock().unwrap().push(data.trigger_reason.clone());
                }
            }));
        }

        m.process_event(EvseEvent::PlugIn);
        m.process_event(auth_start("TAG001"));
        assert!(m.process_event(EvseEvent::FaultDetected));
        assert_eq!(m.state(), EvseState::Faulted);
        assert!(m.current_transaction().is_none());
        assert_eq!(*reasons.lock().unwrap(), vec!["Faulted".to_string()]);

        assert!(m.process_event(EvseEvent::FaultCleared));
        assert_eq!(m.state(), EvseState::Available);
    }

    #[tokio::test]
    async fn deauthorized_stop_reason() {
        let m = machine();
        let reasons: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
        {
            let log = reasons.clone();
            m.set_transaction_event_callback(Arc::new(move |data| {
                if data.event_type == "Ended" {
                    log.lock().unwrap().push(data.trigger_reason.clone());
                }
            }));
        }

        m.process_event(EvseEvent::PlugIn);
        m.process_event(auth_start("TAG001"));
        assert!(m.process_event(EvseEvent::AuthorizeStop {
            id_tag: "TAG001".into()
        }));
        assert_eq!(m.state(), EvseState::Finishing);
        assert_eq!(*reasons.lock().unwrap(), vec!["DeAuthorized".to_string()]);
    }

    #[tokio::test]
    async fn suspend_resume_keeps_transaction() {
        let m = machine();
        m.process_event(EvseEvent::PlugIn);
        m.process_event(auth_start("T"));
        let txn = m.current_transaction().unwrap().id;

        assert!(m.process_event(EvseEvent::SuspendChargingEv));
        assert_eq!(m.state(), EvseState::SuspendedEv);
        assert_eq!(m.current_transaction().unwrap().id, txn);

        assert!(m.process_event(EvseEvent::ResumeCharging));
        assert_eq!(m.state(), EvseState::Charging);

        assert!(m.process_event(EvseEvent::SuspendChargingEvse));
        assert_eq!(m.state(), EvseState::SuspendedEvse);
        assert!(m.process_event(EvseEvent::StopCharging));
        assert_eq!(m.state(), EvseState::Finishing);
    }

    #[tokio::test]
    async fn invalid_events_rejected_without_effect() {
        let m = machine();
        assert!(!m.process_event(EvseEvent::PlugOut));
        assert!(!m.process_event(EvseEvent::StopCharging));
        assert!(!m.process_event(EvseEvent::ResumeCharging));
        assert!(!m.process_event(EvseEvent::StartCharging));
        assert_eq!(m.state(), EvseState::Available);

        m.process_event(EvseEvent::SetUnavailable);
        assert!(!m.process_event(EvseEvent::PlugIn));
        assert_eq!(m.state(), EvseState::Unavailable);
        assert!(m.process_event(EvseEvent::SetAvailable));
    }

    #[tokio::test]
    async fn reservation_flow() {
        let m = machine();
        assert!(m.process_event(EvseEvent::Reserve));
        assert_eq!(m.connector_status(), ConnectorStatus::Reserved);
        assert!(m.process_event(EvseEvent::CancelReservation));
        assert_eq!(m.state(), EvseState::Available);

        m.process_event(EvseEvent::Reserve);
        assert!(m.process_event(EvseEvent::PlugIn));
        assert_eq!(m.state(), EvseState::Preparing);
    }

    #[tokio::test(start_paused = true)]
    async fn meter_timer_runs_only_while_charging() {
        let m = machine();
        m.set_meter_value_interval(Duration::from_secs(60));
        m.set_variable(METER_VALUE_VARIABLE, "1500", "float64", Some(0.001), None, None);

        let samples: Arc<StdMutex<Vec<f64>>> = Arc::new(StdMutex::new(Vec::new()));
        {
            let log = samples.clone();
            m.set_meter_value_callback(Arc::new(move |_evse, value| {
                log.lock().unwrap().push(value);
            }));
        }

        assert!(!m.meter_timer_running());
        m.process_event(EvseEvent::PlugIn);
        m.process_event(auth_start("T"));
        assert!(m.meter_timer_running());

        tokio::time::sleep(Duration::from_secs(121)).await;
        {
            let seen = samples.lock().unwrap();
            assert!(seen.len() >= 2, "expected periodic samples, got {seen:?}");
            // 1500 raw scaled by 0.001.
            assert!(seen.iter().all(|v| (*v - 1.5).abs() < 1e-9));
        }

        m.process_event(EvseEvent::StopCharging);
        assert!(!m.meter_timer_running());

        let count = samples.lock().unwrap().len();
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(samples.lock().unwrap().len(), count);
    }

    #[tokio::test]
    async fn seq_no_increments_across_events() {
        let m = machine();
        let seqs: Arc<StdMutex<Vec<i64>>> = Arc::new(StdMutex::new(Vec::new()));
        {
            let log = seqs.clone();
            m.set_transaction_event_callback(Arc::new(move |data| {
                log.lock().unwrap().push(data.seq_no);
            }));
        }

        m.process_event(EvseEvent::PlugIn);
        m.process_event(auth_start("T"));
        m.add_meter_value(10.0);
        m.add_meter_value(11.0);
        m.process_event(EvseEvent::StopCharging);

        assert_eq!(*seqs.lock().unwrap(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn heartbeat_lifecycle() {
        let m = machine();
        assert!(!m.heartbeat_running());
        m.start_heartbeat(Duration::from_secs(300));
        assert!(m.heartbeat_running());
        m.stop_heartbeat();
        assert!(!m.heartbeat_running());
    }
}
