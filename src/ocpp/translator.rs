//! Variable translator
//!
//! Maps named OCPP values to and from raw device bytes using a mapping
//! template. Numeric scaling is `device = ocpp / scale` on writes and
//! `ocpp = raw * scale` on reads, rounding half-to-even at the integer
//! boundary. Modbus representations are big-endian register words; ECHONET
//! Lite representations are packed big-endian bytes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::device::{DataType, RegisterAddress, RegisterType};
use crate::error::{GatewayError, Result};

/// A value as seen on the OCPP side.
#[derive(Debug, Clone, PartialEq)]
pub enum OcppValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl OcppValue {
    fn as_numeric(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            _ => None,
        }
    }
}

/// Raw bytes tagged with the protocol they belong to.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceData {
    Modbus(Vec<u8>),
    EchonetLite(Vec<u8>),
}

impl DeviceData {
    pub fn bytes(&self) -> &[u8] {
        match self {
            Self::Modbus(b) | Self::EchonetLite(b) => b,
        }
    }
}

/// One OCPP-variable ⟷ register binding inside a template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariableMapping {
    pub name: String,
    pub register: RegisterAddress,
    pub data_type: DataType,
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub read_only: bool,
    /// Present for enum variables: integer code ⟷ OCPP string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enum_map: Option<BTreeMap<i64, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

fn default_scale() -> f64 {
    1.0
}

/// Named set of variable bindings, supplied by the configuration loader.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingTemplate {
    pub id: String,
    #[serde(default)]
    pub description: String,
    pub variables: Vec<VariableMapping>,
}

impl MappingTemplate {
    pub fn variable(&self, name: &str) -> Option<&VariableMapping> {
        self.variables.iter().find(|v| v.name == name)
    }
}

pub struct VariableTranslator {
    template: MappingTemplate,
}

impl VariableTranslator {
    pub fn new(template: MappingTemplate) -> Self {
        Self { template }
    }

    pub fn template(&self) -> &MappingTemplate {
        &self.template
    }

    /// OCPP value → device bytes.
    pub fn translate_to_device(&self, name: &str, value: &OcppValue) -> Result<DeviceData> {
        let mapping = self.lookup(name)?;
        if mapping.read_only {
            return Err(GatewayError::Translation(format!(
                "Cannot write to read-only variable: {name}"
            )));
        }

        let bytes = encode(mapping, value)?;
        Ok(wrap(mapping, bytes))
    }

    /// Device bytes → OCPP value.
    pub fn translate_to_ocpp(&self, name: &str, data: &DeviceData) -> Result<OcppValue> {
        let mapping = self.lookup(name)?;

        match (mapping.register.register_type, data) {
            (RegisterType::Epc, DeviceData::EchonetLite(_)) => {}
            (RegisterType::Epc, _) => {
                return Err(GatewayError::Translation(format!(
                    "Expected ECHONET Lite data for variable: {name}"
                )))
            }
            (_, DeviceData::Modbus(_)) => {}
            (_, _) => {
                return Err(GatewayError::Translation(format!(
                    "Expected Modbus data for variable: {name}"
                )))
            }
        }

        decode(mapping, data.bytes())
    }

    fn lookup(&self, name: &str) -> Result<&VariableMapping> {
        self.template.variable(name).ok_or_else(|| {
            GatewayError::Translation(format!(
                "Variable not found in mapping template: {name}"
            ))
        })
    }
}

fn wrap(mapping: &VariableMapping, bytes: Vec<u8>) -> DeviceData {
    if mapping.register.register_type == RegisterType::Epc {
        DeviceData::EchonetLite(bytes)
    } else {
        DeviceData::Modbus(bytes)
    }
}

/// Enum codes are a u16 word on Modbus and a single byte on ECHONET Lite.
fn enum_width(mapping: &VariableMapping) -> usize {
    if mapping.register.register_type == RegisterType::Epc {
        1
    } else {
        2
    }
}

fn scale_to_device(mapping: &VariableMapping, value: f64) -> f64 {
    value / mapping.scale
}

fn scale_to_ocpp(mapping: &VariableMapping, raw: f64) -> f64 {
    raw * mapping.scale
}

fn numeric_for(mapping: &VariableMapping, value: &OcppValue) -> Result<f64> {
    value.as_numeric().ok_or_else(|| {
        GatewayError::Translation(format!(
            "Expected numeric value for {} data type",
            mapping.data_type
        ))
    })
}

fn encode(mapping: &VariableMapping, value: &OcppValue) -> Result<Vec<u8>> {
    if let Some(enum_map) = &mapping.enum_map {
        let OcppValue::Text(text) = value else {
            return Err(GatewayError::Translation(
                "Expected string value for enum data type".into(),
            ));
        };
        let code = enum_map
            .iter()
            .find(|(_, s)| s.as_str() == text)
            .map(|(c, _)| *c)
            .ok_or_else(|| {
                GatewayError::Translation(format!("Enum string not found in mapping: {text}"))
            })?;
        return Ok(match enum_width(mapping) {
            1 => vec![code as u8],
            _ => (code as u16).to_be_bytes().to_vec(),
        });
    }

    let bytes = match mapping.data_type {
        DataType::Bool => {
            let OcppValue::Bool(b) = value else {
                return Err(GatewayError::Translation(
                    "Expected boolean value for bool data type".into(),
                ));
            };
            vec![u8::from(*b)]
        }
        DataType::U8 => {
            let scaled = scale_to_device(mapping, numeric_for(mapping, value)?);
            vec![scaled.round_ties_even() as u8]
        }
        DataType::I8 => {
            let scaled = scale_to_device(mapping, numeric_for(mapping, value)?);
            vec![(scaled.round_ties_even() as i8) as u8]
        }
        DataType::U16 => {
            let scaled = scale_to_device(mapping, numeric_for(mapping, value)?);
            (scaled.round_ties_even() as u16).to_be_bytes().to_vec()
        }
        DataType::I16 => {
            let scaled = scale_to_device(mapping, numeric_for(mapping, value)?);
            (scaled.round_ties_even() as i16).to_be_bytes().to_vec()
        }
        DataType::U32 => {
            let scaled = scale_to_device(mapping, numeric_for(mapping, value)?);
            (scaled.round_ties_even() as u32).to_be_bytes().to_vec()
        }
        DataType::I32 => {
            let scaled = scale_to_device(mapping, numeric_for(mapping, value)?);
            (scaled.round_ties_even() as i32).to_be_bytes().to_vec()
        }
        DataType::U64 => {
            let scaled = scale_to_device(mapping, numeric_for(mapping, value)?);
            (scaled.round_ties_even() as u64).to_be_bytes().to_vec()
        }
        DataType::I64 => {
            let scaled = scale_to_device(mapping, numeric_for(mapping, value)?);
            (scaled.round_ties_even() as i64).to_be_bytes().to_vec()
        }
        DataType::F32 => {
            let scaled = scale_to_device(mapping, numeric_for(mapping, value)?) as f32;
            scaled.to_bits().to_be_bytes().to_vec()
        }
        DataType::F64 => {
            let scaled = scale_to_device(mapping, numeric_for(mapping, value)?);
            scaled.to_bits().to_be_bytes().to_vec()
        }
        DataType::String => {
            let OcppValue::Text(text) = value else {
                return Err(GatewayError::Translation(
                    "Expected string value for string data type".into(),
                ));
            };
            text.as_bytes().to_vec()
        }
        DataType::Binary => {
            let OcppValue::Text(text) = value else {
                return Err(GatewayError::Translation(
                    "Expected string value for binary data type".into(),
                ));
            };
            text.as_bytes().to_vec()
        }
    };
    Ok(bytes)
}

fn require(data: &[u8], len: usize, mapping: &VariableMapping) -> Result<()> {
    if data.len() < len {
        return Err(GatewayError::Translation(format!(
            "Device data too small for data type: {}",
            mapping.data_type
        )));
    }
    Ok(())
}

fn decode(mapping: &VariableMapping, data: &[u8]) -> Result<OcppValue> {
    if let Some(enum_map) = &mapping.enum_map {
        let width = enum_width(mapping);
        require(data, width, mapping)?;
        let code = match width {
            1 => i64::from(data[0]),
            _ => i64::from(u16::from_be_bytes([data[0], data[1]])),
        };
        let text = enum_map.get(&code).ok_or_else(|| {
            GatewayError::Translation(format!("Enum value not found in mapping: {code}"))
        })?;
        return Ok(OcppValue::Text(text.clone()));
    }

    let value = match mapping.data_type {
        DataType::Bool => {
            require(data, 1, mapping)?;
            OcppValue::Bool(data[0] != 0)
        }
        DataType::U8 => {
            require(data, 1, mapping)?;
            int_value(mapping, f64::from(data[0]))
        }
        DataType::I8 => {
            require(data, 1, mapping)?;
            int_value(mapping, f64::from(data[0] as i8))
        }
        DataType::U16 => {
            require(data, 2, mapping)?;
            int_value(mapping, f64::from(u16::from_be_bytes([data[0], data[1]])))
        }
        DataType::I16 => {
            require(data, 2, mapping)?;
            int_value(mapping, f64::from(i16::from_be_bytes([data[0], data[1]])))
        }
        DataType::U32 => {
            require(data, 4, mapping)?;
            int_value(
                mapping,
                f64::from(u32::from_be_bytes([data[0], data[1], data[2], data[3]])),
            )
        }
        DataType::I32 => {
            require(data, 4, mapping)?;
            int_value(
                mapping,
                f64::from(i32::from_be_bytes([data[0], data[1], data[2], data[3]])),
            )
        }
        DataType::U64 => {
            require(data, 8, mapping)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[..8]);
            int_value(mapping, u64::from_be_bytes(buf) as f64)
        }
        DataType::I64 => {
            require(data, 8, mapping)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[..8]);
            int_value(mapping, i64::from_be_bytes(buf) as f64)
        }
        DataType::F32 => {
            require(data, 4, mapping)?;
            let raw = f32::from_bits(u32::from_be_bytes([data[0], data[1], data[2], data[3]]));
            OcppValue::Float(scale_to_ocpp(mapping, f64::from(raw)))
        }
        DataType::F64 => {
            require(data, 8, mapping)?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&data[..8]);
            OcppValue::Float(scale_to_ocpp(mapping, f64::from_bits(u64::from_be_bytes(buf))))
        }
        DataType::String => OcppValue::Text(String::from_utf8_lossy(data).into_owned()),
        DataType::Binary => OcppValue::Text(String::from_utf8_lossy(data).into_owned()),
    };
    Ok(value)
}

/// Integer-typed variables surface as Int when the scale keeps them whole,
/// Float otherwise.
fn int_value(mapping: &VariableMapping, raw: f64) -> OcppValue {
    let scaled = scale_to_ocpp(mapping, raw);
    if scaled.fract() == 0.0 {
        OcppValue::Int(scaled as i64)
    } else {
        OcppValue::Float(scaled)
    }
}
