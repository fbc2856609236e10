//! Device adapter layer
//!
//! A uniform typed register interface over three field protocols:
//! ECHONET Lite (UDP), Modbus RTU (serial) and Modbus TCP. Each adapter owns
//! its device registry, connection pool and background tasks; the gateway
//! talks to all of them through the [`DeviceAdapter`] trait.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use byteorder::{BigEndian, ByteOrder};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::error::{GatewayError, Result};

pub mod echonet_lite;
pub mod modbus;
pub mod registry;

/// Supported device protocols.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProtocol {
    #[strum(serialize = "echonet_lite")]
    EchonetLite,
    #[strum(serialize = "modbus_rtu")]
    ModbusRtu,
    #[strum(serialize = "modbus_tcp")]
    ModbusTcp,
}

/// Serial parity for Modbus RTU links.
///
/// Parsing is strict: anything other than N/E/O (case-insensitive) is a
/// configuration error, never a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Parity {
    #[serde(rename = "N", alias = "n", alias = "none")]
    None,
    #[serde(rename = "E", alias = "e", alias = "even")]
    Even,
    #[serde(rename = "O", alias = "o", alias = "odd")]
    Odd,
}

impl std::str::FromStr for Parity {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "N" | "n" => Ok(Self::None),
            "E" | "e" => Ok(Self::Even),
            "O" | "o" => Ok(Self::Odd),
            other => Err(GatewayError::ConfigValidation(format!(
                "invalid parity '{other}', expected N, E or O"
            ))),
        }
    }
}

/// Device address, one variant per protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol", rename_all = "snake_case")]
pub enum DeviceAddress {
    EchonetLite {
        ip: String,
        #[serde(default = "default_echonet_port")]
        port: u16,
    },
    ModbusRtu {
        /// Serial port path, e.g. "/dev/ttyUSB0".
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_data_bits")]
        data_bits: u8,
        #[serde(default = "default_stop_bits")]
        stop_bits: u8,
        #[serde(default = "default_parity")]
        parity: Parity,
        unit_id: u8,
    },
    ModbusTcp {
        ip: String,
        #[serde(default = "default_modbus_tcp_port")]
        port: u16,
        unit_id: u8,
    },
}

fn default_echonet_port() -> u16 {
    3610
}

fn default_modbus_tcp_port() -> u16 {
    502
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_stop_bits() -> u8 {
    1
}

fn default_parity() -> Parity {
    Parity::None
}

impl DeviceAddress {
    pub fn protocol(&self) -> DeviceProtocol {
        match self {
            Self::EchonetLite { .. } => DeviceProtocol::EchonetLite,
            Self::ModbusRtu { .. } => DeviceProtocol::ModbusRtu,
            Self::ModbusTcp { .. } => DeviceProtocol::ModbusTcp,
        }
    }

    /// Address-level validation shared by the adapters.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::EchonetLite { ip, .. } => {
                if ip.is_empty() {
                    return Err(GatewayError::ConfigValidation(
                        "ECHONET Lite address has empty IP".into(),
                    ));
                }
            }
            Self::ModbusRtu {
                port, unit_id, ..
            } => {
                if port.is_empty() {
                    return Err(GatewayError::ConfigValidation(
                        "Modbus RTU address has empty serial port".into(),
                    ));
                }
                if !(1..=247).contains(unit_id) {
                    return Err(GatewayError::ConfigValidation(format!(
                        "Modbus unit id {unit_id} out of range 1..=247"
                    )));
                }
            }
            Self::ModbusTcp { ip, unit_id, .. } => {
                if ip.is_empty() {
                    return Err(GatewayError::ConfigValidation(
                        "Modbus TCP address has empty IP".into(),
                    ));
                }
                if !(1..=247).contains(unit_id) {
                    return Err(GatewayError::ConfigValidation(format!(
                        "Modbus unit id {unit_id} out of range 1..=247"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Everything the gateway knows about a field device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub firmware_version: String,
    pub address: DeviceAddress,
    pub template_id: String,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

impl DeviceInfo {
    pub fn protocol(&self) -> DeviceProtocol {
        self.address.protocol()
    }
}

/// Register tables a read/write can target.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
pub enum RegisterType {
    #[strum(serialize = "coil")]
    Coil,
    #[strum(serialize = "discrete_input")]
    DiscreteInput,
    #[strum(serialize = "input_register")]
    InputRegister,
    #[strum(serialize = "holding_register")]
    HoldingRegister,
    #[strum(serialize = "epc")]
    Epc,
}

impl RegisterType {
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::DiscreteInput | Self::InputRegister)
    }

    pub fn is_bit(self) -> bool {
        matches!(self, Self::Coil | Self::DiscreteInput)
    }
}

/// Address of a register.
///
/// For Modbus only `register_type`, `address` and `count` matter; for
/// ECHONET Lite only the EOJ triple and `epc`. The derived ordering is
/// lexicographic over the fields, which is what the result maps key on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RegisterAddress {
    pub register_type: RegisterType,
    #[serde(default)]
    pub address: u32,
    #[serde(default)]
    pub eoj_class_group: u8,
    #[serde(default)]
    pub eoj_class: u8,
    #[serde(default)]
    pub eoj_instance: u8,
    #[serde(default)]
    pub epc: u8,
    #[serde(default = "default_count")]
    pub count: u16,
}

fn default_count() -> u16 {
    1
}

impl RegisterAddress {
    pub fn modbus(register_type: RegisterType, address: u32, count: u16) -> Self {
        Self {
            register_type,
            address,
            eoj_class_group: 0,
            eoj_class: 0,
            eoj_instance: 0,
            epc: 0,
            count,
        }
    }

    pub fn epc(class_group: u8, class: u8, instance: u8, epc: u8) -> Self {
        Self {
            register_type: RegisterType::Epc,
            address: 0,
            eoj_class_group: class_group,
            eoj_class: class,
            eoj_instance: instance,
            epc,
            count: 1,
        }
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.register_type {
            RegisterType::Epc => write!(
                f,
                "epc {:02X}{:02X}{:02X}/{:02X}",
                self.eoj_class_group, self.eoj_class, self.eoj_instance, self.epc
            ),
            t => write!(f, "{t}@{} x{}", self.address, self.count),
        }
    }
}

/// Data types carried by register values.
///
/// All multi-byte encodings in [`RegisterValue::data`] are big-endian.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DataType {
    Bool,
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    U64,
    I64,
    F32,
    F64,
    String,
    Binary,
}

/// A typed register value as raw big-endian bytes.
///
/// Accessors never panic: a getter on short data yields the type's zero.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegisterValue {
    pub data_type: Option<DataType>,
    pub data: Vec<u8>,
}

impl RegisterValue {
    pub fn from_bool(v: bool) -> Self {
        Self {
            data_type: Some(DataType::Bool),
            data: vec![u8::from(v)],
        }
    }

    pub fn from_u8(v: u8) -> Self {
        Self {
            data_type: Some(DataType::U8),
            data: vec![v],
        }
    }

    pub fn from_i8(v: i8) -> Self {
        Self {
            data_type: Some(DataType::I8),
            data: vec![v as u8],
        }
    }

    pub fn from_u16(v: u16) -> Self {
        Self {
            data_type: Some(DataType::U16),
            data: v.to_be_bytes().to_vec(),
        }
    }

    pub fn from_i16(v: i16) -> Self {
        Self {
            data_type: Some(DataType::I16),
            data: v.to_be_bytes().to_vec(),
        }
    }

    pub fn from_u32(v: u32) -> Self {
        Self {
            data_type: Some(DataType::U32),
            data: v.to_be_bytes().to_vec(),
        }
    }

    pub fn from_i32(v: i32) -> Self {
        Self {
            data_type: Some(DataType::I32),
            data: v.to_be_bytes().to_vec(),
        }
    }

    pub fn from_u64(v: u64) -> Self {
        Self {
            data_type: Some(DataType::U64),
            data: v.to_be_bytes().to_vec(),
        }
    }

    pub fn from_i64(v: i64) -> Self {
        Self {
            data_type: Some(DataType::I64),
            data: v.to_be_bytes().to_vec(),
        }
    }

    pub fn from_f32(v: f32) -> Self {
        Self {
            data_type: Some(DataType::F32),
            data: v.to_bits().to_be_bytes().to_vec(),
        }
    }

    pub fn from_f64(v: f64) -> Self {
        Self {
            data_type: Some(DataType::F64),
            data: v.to_bits().to_be_bytes().to_vec(),
        }
    }

    pub fn from_string(v: &str) -> Self {
        Self {
            data_type: Some(DataType::String),
            data: v.as_bytes().to_vec(),
        }
    }

    pub fn from_binary(data: Vec<u8>) -> Self {
        Self {
            data_type: Some(DataType::Binary),
            data,
        }
    }

    pub fn as_bool(&self) -> bool {
        self.data.first().copied().unwrap_or(0) != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.data.first().copied().unwrap_or(0)
    }

    pub fn as_i8(&self) -> i8 {
        self.as_u8() as i8
    }

    pub fn as_u16(&self) -> u16 {
        if self.data.len() < 2 {
            return 0;
        }
        BigEndian::read_u16(&self.data)
    }

    pub fn as_i16(&self) -> i16 {
        self.as_u16() as i16
    }

    pub fn as_u32(&self) -> u32 {
        if self.data.len() < 4 {
            return 0;
        }
        BigEndian::read_u32(&self.data)
    }

    pub fn as_i32(&self) -> i32 {
        self.as_u32() as i32
    }

    pub fn as_u64(&self) -> u64 {
        if self.data.len() < 8 {
            return 0;
        }
        BigEndian::read_u64(&self.data)
    }

    pub fn as_i64(&self) -> i64 {
        self.as_u64() as i64
    }

    pub fn as_f32(&self) -> f32 {
        f32::from_bits(self.as_u32())
    }

    pub fn as_f64(&self) -> f64 {
        f64::from_bits(self.as_u64())
    }

    pub fn as_string(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Outcome of a single register read.
#[derive(Debug, Clone, Default)]
pub struct ReadResult {
    pub success: bool,
    pub value: RegisterValue,
    pub error_message: String,
    pub error_code: i32,
}

impl ReadResult {
    pub fn ok(value: RegisterValue) -> Self {
        Self {
            success: true,
            value,
            error_message: String::new(),
            error_code: 0,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self::err_with_code(message, 0)
    }

    pub fn err_with_code(message: impl Into<String>, code: i32) -> Self {
        Self {
            success: false,
            value: RegisterValue::default(),
            error_message: message.into(),
            error_code: code,
        }
    }
}

/// Outcome of a single register write.
#[derive(Debug, Clone, Default)]
pub struct WriteResult {
    pub success: bool,
    pub error_message: String,
    pub error_code: i32,
}

impl WriteResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_message: String::new(),
            error_code: 0,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self::err_with_code(message, 0)
    }

    pub fn err_with_code(message: impl Into<String>, code: i32) -> Self {
        Self {
            success: false,
            error_message: message.into(),
            error_code: code,
        }
    }
}

/// Invoked once per device found during discovery.
pub type DiscoveryCallback = Arc<dyn Fn(DeviceInfo) + Send + Sync>;

/// Invoked on every online/offline transition of a device.
pub type StatusCallback = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Uniform interface over the protocol adapters.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    fn protocol(&self) -> DeviceProtocol;

    /// Prepare sockets/contexts. Idempotent.
    async fn initialize(&self) -> Result<()>;

    /// Begin background work. Idempotent.
    async fn start(&self) -> Result<()>;

    /// Cancel background work and mark all devices offline. Idempotent,
    /// never fails; all spawned tasks have joined when this returns.
    async fn stop(&self);

    fn is_running(&self) -> bool;

    fn add_device(&self, info: DeviceInfo) -> Result<()>;

    fn remove_device(&self, device_id: &str) -> Result<()>;

    fn device_info(&self, device_id: &str) -> Option<DeviceInfo>;

    fn devices(&self) -> Vec<DeviceInfo>;

    fn is_device_online(&self, device_id: &str) -> bool;

    fn set_status_callback(&self, device_id: &str, callback: StatusCallback) -> Result<()>;

    /// At most one discovery session runs at a time.
    async fn start_discovery(&self, callback: DiscoveryCallback, timeout: Duration) -> Result<()>;

    async fn stop_discovery(&self);

    fn discovery_in_progress(&self) -> bool;

    async fn read_register(&self, device_id: &str, address: &RegisterAddress) -> ReadResult;

    async fn write_register(
        &self,
        device_id: &str,
        address: &RegisterAddress,
        value: &RegisterValue,
    ) -> WriteResult;

    /// Batched read; per-address outcomes even when the batch partially fails.
    async fn read_registers(
        &self,
        device_id: &str,
        addresses: &[RegisterAddress],
    ) -> BTreeMap<RegisterAddress, ReadResult>;

    /// Batched write with per-address outcomes.
    async fn write_registers(
        &self,
        device_id: &str,
        values: &BTreeMap<RegisterAddress, RegisterValue>,
    ) -> BTreeMap<RegisterAddress, WriteResult>;
}

/// Run a read as a task on the adapter's runtime.
pub fn read_register_task(
    adapter: Arc<dyn DeviceAdapter>,
    device_id: String,
    address: RegisterAddress,
) -> JoinHandle<ReadResult> {
    tokio::spawn(async move { adapter.read_register(&device_id, &address).await })
}

/// Run a write as a task on the adapter's runtime.
pub fn write_register_task(
    adapter: Arc<dyn DeviceAdapter>,
    device_id: String,
    address: RegisterAddress,
    value: RegisterValue,
) -> JoinHandle<WriteResult> {
    tokio::spawn(async move { adapter.write_register(&device_id, &address, &value).await })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_value_roundtrip_u32() {
        let v = RegisterValue::from_u32(0x1122_3344);
        assert_eq!(v.data, vec![0x11, 0x22, 0x33, 0x44]);
        assert_eq!(v.as_u32(), 0x1122_3344);
    }

    #[test]
    fn short_data_yields_zero() {
        let v = RegisterValue {
            data_type: Some(DataType::U16),
            data: vec![0x12],
        };
        assert_eq!(v.as_u16(), 0);
        assert_eq!(v.as_u32(), 0);
        assert_eq!(v.as_u64(), 0);
    }

    #[test]
    fn f32_bits_are_big_endian() {
        let v = RegisterValue::from_f32(1.5);
        assert_eq!(v.data, vec![0x3F, 0xC0, 0x00, 0x00]);
        assert_eq!(v.as_f32(), 1.5);
    }

    #[test]
    fn register_address_ordering_is_lexicographic() {
        let a = RegisterAddress::modbus(RegisterType::Coil, 10, 1);
        let b = RegisterAddress::modbus(RegisterType::HoldingRegister, 5, 1);
        let c = RegisterAddress::modbus(RegisterType::HoldingRegister, 6, 1);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn parity_parsing_is_strict() {
        assert_eq!("N".parse::<Parity>().unwrap(), Parity::None);
        assert_eq!("e".parse::<Parity>().unwrap(), Parity::Even);
        assert!("X".parse::<Parity>().is_err());
        assert!("NE".parse::<Parity>().is_err());
    }

    #[test]
    fn address_validation_rejects_bad_unit_ids() {
        let addr = DeviceAddress::ModbusTcp {
            ip: "10.0.0.5".into(),
            port: 502,
            unit_id: 0,
        };
        assert!(matches!(
            addr.validate(),
            Err(GatewayError::ConfigValidation(_))
        ));
    }
}
