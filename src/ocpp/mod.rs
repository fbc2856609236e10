//! OCPP 2.0.1 client-side protocol stack
//!
//! Wire framing for the JSON-array Call/CallResult/CallError model, a message
//! router with pending-request correlation and an offline outbound queue, the
//! per-connector EVSE state machine, and the client manager that wires all of
//! it to a WebSocket transport.

pub mod evse;
pub mod manager;
pub mod message;
pub mod messages;
pub mod processor;
pub mod translator;
pub mod transport;

pub use evse::{ConnectorStatus, EvseEvent, EvseState, EvseStateMachine};
pub use manager::ClientManager;
pub use message::{Action, ErrorCode, Message};
pub use processor::{MessageHandler, MessageProcessor};
pub use transport::{ConnectionState, TransportEvents, WebSocketConfig, WsTransport};
