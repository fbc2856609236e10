//! OCPP 2.0.1 gateway for EV charging field devices
//!
//! Presents ECHONET Lite, Modbus RTU and Modbus TCP equipment to a CSMS as
//! OCPP charging stations: CSMS commands become device reads and writes, and
//! device telemetry is lifted into OCPP events.

pub mod config;
pub mod device;
pub mod error;
pub mod gateway;
pub mod ocpp;
pub mod telemetry;

pub use error::GatewayError;
pub use gateway::Gateway;
