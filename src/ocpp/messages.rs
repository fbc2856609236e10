//! Typed OCPP 2.0.1 payloads
//!
//! Request/response bodies for the messages the gateway originates, plus
//! builders that wrap them into wire [`Message`]s. Field names follow the
//! OCPP 2.0.1 JSON schemas (camelCase).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::message::{format_timestamp, now_timestamp, Action, Message};

/// Boot reason values used by the gateway.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BootReason {
    ApplicationReset,
    FirmwareUpdate,
    PowerUp,
    RemoteReset,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargingStation {
    pub model: String,
    pub vendor_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationRequest {
    pub reason: BootReason,
    pub charging_station: ChargingStation,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RegistrationStatus {
    Accepted,
    Pending,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BootNotificationResponse {
    pub current_time: String,
    /// Heartbeat interval in seconds.
    pub interval: u64,
    pub status: RegistrationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    pub current_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusNotificationRequest {
    pub timestamp: String,
    pub connector_status: String,
    pub evse_id: i32,
    pub connector_id: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnitOfMeasure {
    pub unit: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampledValue {
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub measurand: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit_of_measure: Option<UnitOfMeasure>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValue {
    pub timestamp: String,
    pub sampled_value: Vec<SampledValue>,
}

impl MeterValue {
    /// Periodic energy sample at the outlet, in kWh.
    pub fn energy_sample(timestamp: String, value: f64, context: &str) -> Self {
        Self {
            timestamp,
            sampled_value: vec![SampledValue {
                value,
                context: Some(context.to_string()),
                measurand: Some("Energy.Active.Import.Register".to_string()),
                location: Some("Outlet".to_string()),
                unit_of_measure: Some(UnitOfMeasure {
                    unit: "kWh".to_string(),
                }),
            }],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterValuesRequest {
    pub evse_id: i32,
    pub meter_value: Vec<MeterValue>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInfo {
    pub transaction_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvseRef {
    pub id: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connector_id: Option<i32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionEventRequest {
    pub event_type: String,
    pub timestamp: String,
    pub trigger_reason: String,
    pub seq_no: i64,
    pub transaction_info: TransactionInfo,
    pub evse: EvseRef,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meter_value: Option<Vec<MeterValue>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdToken {
    pub id_token: String,
    #[serde(rename = "type")]
    pub token_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizeRequest {
    pub id_token: IdToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataTransferRequest {
    pub vendor_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Outbound Call builders.
pub fn boot_notification(
    model: &str,
    vendor: &str,
    firmware_version: Option<&str>,
) -> Message {
    let request = BootNotificationRequest {
        reason: BootReason::PowerUp,
        charging_station: ChargingStation {
            model: model.to_string(),
            vendor_name: vendor.to_string(),
            firmware_version: firmware_version.map(str::to_string),
        },
    };
    Message::call(
        Action::BootNotification,
        serde_json::to_value(request).unwrap_or_default(),
    )
}

pub fn heartbeat() -> Message {
    Message::call(Action::Heartbeat, json!({}))
}

pub fn status_notification(
    evse_id: i32,
    connector_id: i32,
    connector_status: &str,
    timestamp: DateTime<Utc>,
) -> Message {
    let request = StatusNotificationRequest {
        timestamp: format_timestamp(timestamp),
        connector_status: connector_status.to_string(),
        evse_id,
        connector_id,
    };
    Message::call(
        Action::StatusNotification,
        serde_json::to_value(request).unwrap_or_default(),
    )
}

pub fn meter_values(evse_id: i32, value_kwh: f64) -> Message {
    let request = MeterValuesRequest {
        evse_id,
        meter_value: vec![MeterValue::energy_sample(
            now_timestamp(),
            value_kwh,
            "Sample.Periodic",
        )],
    };
    Message::call(
        Action::MeterValues,
        serde_json::to_value(request).unwrap_or_default(),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn transaction_event(
    event_type: &str,
    timestamp: &str,
    trigger_reason: &str,
    seq_no: i64,
    transaction_id: &str,
    evse_id: i32,
    connector_id: i32,
    meter_value_kwh: Option<f64>,
) -> Message {
    let context = match event_type {
        "Started" => "Transaction.Begin",
        "Ended" => "Transaction.End",
        _ => "Sample.Periodic",
    };
    let request = TransactionEventRequest {
        event_type: event_type.to_string(),
        timestamp: timestamp.to_string(),
        trigger_reason: trigger_reason.to_string(),
        seq_no,
        transaction_info: TransactionInfo {
            transaction_id: transaction_id.to_string(),
        },
        evse: EvseRef {
            id: evse_id,
            connector_id: Some(connector_id),
        },
        meter_value: meter_value_kwh
            .map(|v| vec![MeterValue::energy_sample(timestamp.to_string(), v, context)]),
    };
    Message::call(
        Action::TransactionEvent,
        serde_json::to_value(request).unwrap_or_default(),
    )
}

pub fn authorize(id_token: &str) -> Message {
    let request = AuthorizeRequest {
        id_token: IdToken {
            id_token: id_token.to_string(),
            token_type: "ISO14443".to_string(),
        },
    };
    Message::call(
        Action::Authorize,
        serde_json::to_value(request).unwrap_or_default(),
    )
}

pub fn data_transfer(
    vendor_id: &str,
    message_id: Option<&str>,
    data: Option<serde_json::Value>,
) -> Message {
    let request = DataTransferRequest {
        vendor_id: vendor_id.to_string(),
        message_id: message_id.map(str::to_string),
        data,
    };
    Message::call(
        Action::DataTransfer,
        serde_json::to_value(request).unwrap_or_default(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_notification_payload_shape() {
        let msg = boot_notification("M", "V", Some("1.2.0"));
        match msg {
            Message::Call {
                action, payload, ..
            } => {
                assert_eq!(action, Action::BootNotification);
                assert_eq!(payload["reason"], "PowerUp");
                assert_eq!(payload["chargingStation"]["model"], "M");
                assert_eq!(payload["chargingStation"]["vendorName"], "V");
                assert_eq!(payload["chargingStation"]["firmwareVersion"], "1.2.0");
            }
            _ => panic!("expected Call"),
        }
    }

    #[test]
    fn boot_notification_omits_absent_firmware() {
        let msg = boot_notification("M", "V", None);
        match msg {
            Message::Call { payload, .. } => {
                assert!(payload["chargingStation"]
                    .as_object()
                    .unwrap()
                    .get("firmwareVersion")
                    .is_none());
            }
            _ => panic!("expected Call"),
        }
    }

    #[test]
    fn boot_response_parses() {
        let response: BootNotificationResponse = serde_json::from_value(json!({
            "currentTime": "2023-01-01T00:00:00.000Z",
            "interval": 300,
            "status": "Accepted"
        }))
        .unwrap();
        assert_eq!(response.interval, 300);
        assert_eq!(response.status, RegistrationStatus::Accepted);
    }

    #[test]
    fn transaction_event_payload_shape() {
        let msg = transaction_event(
            "Started",
            "2023-01-01T00:00:00.000Z",
            "Authorized",
            0,
            "tx-1",
            1,
            1,
            Some(1.25),
        );
        match msg {
            Message::Call { payload, .. } => {
                assert_eq!(payload["eventType"], "Started");
                assert_eq!(payload["triggerReason"], "Authorized");
                assert_eq!(payload["seqNo"], 0);
                assert_eq!(payload["transactionInfo"]["transactionId"], "tx-1");
                assert_eq!(payload["evse"]["id"], 1);
                let sample = &payload["meterValue"][0]["sampledValue"][0];
                assert_eq!(sample["value"], 1.25);
                assert_eq!(sample["context"], "Transaction.Begin");
                assert_eq!(sample["measurand"], "Energy.Active.Import.Register");
                assert_eq!(sample["unitOfMeasure"]["unit"], "kWh");
            }
            _ => panic!("expected Call"),
        }
    }

    #[test]
    fn status_notification_uses_connector_status_key() {
        let ts = chrono::Utc::now();
        let msg = status_notification(1, 1, "Occupied", ts);
        match msg {
            Message::Call { payload, .. } => {
                assert_eq!(payload["connectorStatus"], "Occupied");
                assert_eq!(payload["evseId"], 1);
                assert_eq!(payload["connectorId"], 1);
            }
            _ => panic!("expected Call"),
        }
    }

    #[test]
    fn authorize_wraps_token() {
        let msg = authorize("TAG001");
        match msg {
            Message::Call { payload, .. } => {
                assert_eq!(payload["idToken"]["idToken"], "TAG001");
                assert_eq!(payload["idToken"]["type"], "ISO14443");
            }
            _ => panic!("expected Call"),
        }
    }
}
