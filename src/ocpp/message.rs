//! OCPP message wire codec
//!
//! Frames are JSON arrays: `[2, id, action, payload]` for a Call,
//! `[3, id, payload]` for a CallResult and `[4, id, code, description,
//! details]` for a CallError. Payloads stay opaque `serde_json::Value` trees
//! here; the typed builders live in [`super::messages`].

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use serde_json::{json, Value};

use crate::error::{GatewayError, Result};

/// OCPP actions the gateway knows about.
///
/// Parsing an unlisted action string yields [`Action::Unknown`] rather than a
/// protocol error: on an inbound Call the router answers it with a
/// NotImplemented CallError, and on a Result/Error the action was never on
/// the wire to begin with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum Action {
    Authorize,
    BootNotification,
    CancelReservation,
    ChangeAvailability,
    ClearCache,
    ClearChargingProfile,
    DataTransfer,
    GetCompositeSchedule,
    GetConfiguration,
    GetDiagnostics,
    GetLocalListVersion,
    Heartbeat,
    MeterValues,
    RemoteStartTransaction,
    RemoteStopTransaction,
    Reset,
    SendLocalList,
    SetChargingProfile,
    StatusNotification,
    TransactionEvent,
    TriggerMessage,
    UnlockConnector,
    UpdateFirmware,
    Unknown,
}

impl Action {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or(Self::Unknown)
    }
}

/// OCPP CallError codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurrenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

impl ErrorCode {
    pub fn parse(s: &str) -> Self {
        s.parse().unwrap_or(Self::GenericError)
    }
}

const MESSAGE_TYPE_CALL: u64 = 2;
const MESSAGE_TYPE_CALL_RESULT: u64 = 3;
const MESSAGE_TYPE_CALL_ERROR: u64 = 4;

/// A single OCPP frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Call {
        id: String,
        action: Action,
        payload: Value,
    },
    CallResult {
        id: String,
        payload: Value,
    },
    CallError {
        id: String,
        code: ErrorCode,
        description: String,
        details: Value,
    },
}

impl Message {
    pub fn call(action: Action, payload: Value) -> Self {
        Self::Call {
            id: generate_message_id(),
            action,
            payload,
        }
    }

    pub fn call_with_id(id: impl Into<String>, action: Action, payload: Value) -> Self {
        Self::Call {
            id: id.into(),
            action,
            payload,
        }
    }

    pub fn call_result(id: impl Into<String>, payload: Value) -> Self {
        Self::CallResult {
            id: id.into(),
            payload,
        }
    }

    pub fn call_error(
        id: impl Into<String>,
        code: ErrorCode,
        description: impl Into<String>,
    ) -> Self {
        Self::CallError {
            id: id.into(),
            code,
            description: description.into(),
            details: json!({}),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Call { id, .. } | Self::CallResult { id, .. } | Self::CallError { id, .. } => id,
        }
    }

    /// Serialize to the wire form.
    pub fn to_wire(&self) -> String {
        let array = match self {
            Self::Call {
                id,
                action,
                payload,
            } => json!([MESSAGE_TYPE_CALL, id, action.to_string(), payload]),
            Self::CallResult { id, payload } => json!([MESSAGE_TYPE_CALL_RESULT, id, payload]),
            Self::CallError {
                id,
                code,
                description,
                details,
            } => json!([
                MESSAGE_TYPE_CALL_ERROR,
                id,
                code.to_string(),
                description,
                details
            ]),
        };
        array.to_string()
    }

    /// Parse a wire frame. All shape violations are protocol errors.
    pub fn from_wire(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| GatewayError::Protocol(format!("invalid JSON: {e}")))?;

        let array = value
            .as_array()
            .ok_or_else(|| GatewayError::Protocol("OCPP message must be an array".into()))?;

        let message_type = array
            .first()
            .and_then(Value::as_u64)
            .ok_or_else(|| GatewayError::Protocol("missing message type".into()))?;

        let id = array
            .get(1)
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::Protocol("message id must be a string".into()))?
            .to_string();

        match message_type {
            MESSAGE_TYPE_CALL => {
                let action = array
                    .get(2)
                    .and_then(Value::as_str)
                    .ok_or_else(|| GatewayError::Protocol("Call action must be a string".into()))?;
                let payload = array
                    .get(3)
                    .cloned()
                    .ok_or_else(|| GatewayError::Protocol("Call is missing its payload".into()))?;
                Ok(Self::Call {
                    id,
                    action: Action::parse(action),
                    payload,
                })
            }
            MESSAGE_TYPE_CALL_RESULT => {
                let payload = array.get(2).cloned().ok_or_else(|| {
                    GatewayError::Protocol("CallResult is missing its payload".into())
                })?;
                Ok(Self::CallResult { id, payload })
            }
            MESSAGE_TYPE_CALL_ERROR => {
                let code = array.get(2).and_then(Value::as_str).ok_or_else(|| {
                    GatewayError::Protocol("CallError code must be a string".into())
                })?;
                let description = array.get(3).and_then(Value::as_str).ok_or_else(|| {
                    GatewayError::Protocol("CallError description must be a string".into())
                })?;
                Ok(Self::CallError {
                    id,
                    code: ErrorCode::parse(code),
                    description: description.to_string(),
                    details: array.get(4).cloned().unwrap_or_else(|| json!({})),
                })
            }
            other => Err(GatewayError::Protocol(format!(
                "invalid OCPP message type: {other}"
            ))),
        }
    }
}

const MESSAGE_ID_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const MESSAGE_ID_LEN: usize = 8;

/// Eight lowercase base-36 characters; unique among in-flight Calls by virtue
/// of the pending-table window.
pub fn generate_message_id() -> String {
    let mut rng = rand::thread_rng();
    (0..MESSAGE_ID_LEN)
        .map(|_| MESSAGE_ID_CHARSET[rng.gen_range(0..MESSAGE_ID_CHARSET.len())] as char)
        .collect()
}

/// ISO-8601 with millisecond precision and a trailing Z.
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn now_timestamp() -> String {
    format_timestamp(Utc::now())
}

/// Symmetric parser; tolerates missing fractional seconds.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| GatewayError::Protocol(format!("invalid timestamp '{s}': {e}")))
}
