//! Modbus adapters
//!
//! Shared pieces for the RTU and TCP adapters: register grouping for batched
//! transactions, the big-endian word ⟷ value codec, retry policy and polling
//! configuration. Protocol limits are enforced locally before anything
//! touches the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_modbus::client::Context;
use tokio_modbus::prelude::*;
use tracing::debug;

use crate::error::{GatewayError, Result};

use super::{
    DataType, ReadResult, RegisterAddress, RegisterType, RegisterValue, WriteResult,
};
use std::collections::BTreeMap;

pub mod rtu;
pub mod tcp;

pub use rtu::ModbusRtuAdapter;
pub use tcp::ModbusTcpAdapter;

/// Protocol limits (function codes 0x01/0x02 and 0x03/0x04).
pub const MAX_READ_BITS: u16 = 2000;
pub const MAX_READ_REGISTERS: u16 = 125;

pub(crate) const MAX_RETRIES: u32 = 3;
pub(crate) const RETRY_DELAY: Duration = Duration::from_millis(100);
pub(crate) const STATUS_MONITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Per-device polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub interval_ms: u64,
    pub addresses: Vec<RegisterAddress>,
}

fn default_poll_interval_ms() -> u64 {
    5000
}

/// One fused read transaction covering `[start, start + count)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterGroup {
    pub register_type: RegisterType,
    pub start: u32,
    pub count: u16,
    pub addresses: Vec<RegisterAddress>,
}

/// Sort addresses by register type then address, fusing contiguous or
/// overlapping ranges into single transactions.
pub fn group_registers(addresses: &[RegisterAddress]) -> Vec<RegisterGroup> {
    let mut groups = Vec::new();

    let mut sorted: Vec<RegisterAddress> = addresses.to_vec();
    sorted.sort_by_key(|a| (a.register_type, a.address));

    let mut iter = sorted.into_iter();
    let Some(first) = iter.next() else {
        return groups;
    };

    let mut current_type = first.register_type;
    let mut start = first.address;
    let mut end = first.address + u32::from(first.count);
    let mut members = vec![first];

    for addr in iter {
        let contiguous = addr.register_type == current_type && addr.address <= end;
        if contiguous {
            end = end.max(addr.address + u32::from(addr.count));
            members.push(addr);
        } else {
            groups.push(RegisterGroup {
                register_type: current_type,
                start,
                count: (end - start) as u16,
                addresses: std::mem::take(&mut members),
            });
            current_type = addr.register_type;
            start = addr.address;
            end = addr.address + u32::from(addr.count);
            members.push(addr);
        }
    }

    groups.push(RegisterGroup {
        register_type: current_type,
        start,
        count: (end - start) as u16,
        addresses: members,
    });

    groups
}

/// Data type implied by a register count when the mapping does not say.
pub fn data_type_for_count(count: u16) -> DataType {
    match count {
        2 => DataType::U32,
        4 => DataType::U64,
        1 => DataType::U16,
        _ => DataType::Binary,
    }
}

/// Reconstruct a typed value from register words, big-endian across words.
pub fn words_to_value(words: &[u16], data_type: DataType) -> RegisterValue {
    match data_type {
        DataType::Bool => RegisterValue::from_bool(words.first().copied().unwrap_or(0) != 0),
        DataType::U8 => RegisterValue::from_u8(words.first().copied().unwrap_or(0) as u8),
        DataType::I8 => RegisterValue::from_i8(words.first().copied().unwrap_or(0) as i8),
        DataType::U16 => RegisterValue::from_u16(words.first().copied().unwrap_or(0)),
        DataType::I16 => RegisterValue::from_i16(words.first().copied().unwrap_or(0) as i16),
        DataType::U32 => RegisterValue::from_u32(join32(words)),
        DataType::I32 => RegisterValue::from_i32(join32(words) as i32),
        DataType::F32 => RegisterValue::from_f32(f32::from_bits(join32(words))),
        DataType::U64 => RegisterValue::from_u64(join64(words)),
        DataType::I64 => RegisterValue::from_i64(join64(words) as i64),
        DataType::F64 => RegisterValue::from_f64(f64::from_bits(join64(words))),
        DataType::String | DataType::Binary => {
            let mut data = Vec::with_capacity(words.len() * 2);
            for word in words {
                data.extend_from_slice(&word.to_be_bytes());
            }
            RegisterValue {
                data_type: Some(DataType::Binary),
                data,
            }
        }
    }
}

fn join32(words: &[u16]) -> u32 {
    match words {
        [] => 0,
        [only] => u32::from(*only),
        [high, low, ..] => (u32::from(*high) << 16) | u32::from(*low),
    }
}

fn join64(words: &[u16]) -> u64 {
    match words.len() {
        0 => 0,
        1 => u64::from(words[0]),
        2 | 3 => (u64::from(words[0]) << 16) | u64::from(words[1]),
        _ => {
            (u64::from(words[0]) << 48)
                | (u64::from(words[1]) << 32)
                | (u64::from(words[2]) << 16)
                | u64::from(words[3])
        }
    }
}

/// Split a typed value into register words, big-endian across words.
pub fn value_to_words(value: &RegisterValue) -> Vec<u16> {
    match value.data_type {
        Some(DataType::Bool) => vec![u16::from(value.as_bool())],
        Some(DataType::U8) | Some(DataType::I8) => vec![u16::from(value.as_u8())],
        Some(DataType::U16) | Some(DataType::I16) => vec![value.as_u16()],
        Some(DataType::U32) | Some(DataType::I32) | Some(DataType::F32) => {
            let v = value.as_u32();
            vec![(v >> 16) as u16, v as u16]
        }
        Some(DataType::U64) | Some(DataType::I64) | Some(DataType::F64) => {
            let v = value.as_u64();
            vec![
                (v >> 48) as u16,
                (v >> 32) as u16,
                (v >> 16) as u16,
                v as u16,
            ]
        }
        Some(DataType::String) | Some(DataType::Binary) | None => {
            let mut words = Vec::with_capacity((value.data.len() + 1) / 2);
            for chunk in value.data.chunks(2) {
                let high = u16::from(chunk[0]);
                let low = chunk.get(1).copied().map(u16::from).unwrap_or(0);
                words.push((high << 8) | low);
            }
            words
        }
    }
}

/// Up-front validation shared by both adapters.
pub fn validate_register_address(address: &RegisterAddress) -> Result<()> {
    if address.register_type == RegisterType::Epc {
        return Err(GatewayError::ConfigValidation(
            "EPC register type is not valid for Modbus".into(),
        ));
    }
    if address.address > 65535 {
        return Err(GatewayError::ConfigValidation(format!(
            "Modbus address {} out of range",
            address.address
        )));
    }
    if address.count == 0 {
        return Err(GatewayError::ConfigValidation(
            "register count must be at least 1".into(),
        ));
    }
    let limit = if address.register_type.is_bit() {
        MAX_READ_BITS
    } else {
        MAX_READ_REGISTERS
    };
    if address.count > limit {
        return Err(GatewayError::ConfigValidation(format!(
            "register count {} exceeds limit {limit}",
            address.count
        )));
    }
    Ok(())
}

/// Bit-table read with the shared retry budget and linear backoff. Retries
/// are invisible to callers; only the final outcome is returned.
pub(crate) async fn read_bits_retry(
    ctx: &mut Context,
    input: bool,
    start: u16,
    count: u16,
) -> std::io::Result<Vec<bool>> {
    let mut attempt: u32 = 0;
    loop {
        let result = if input {
            ctx.read_discrete_inputs(start, count).await
        } else {
            ctx.read_coils(start, count).await
        };
        match result {
            Ok(bits) => return Ok(bits),
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_RETRIES {
                    return Err(e);
                }
                debug!(start, count, attempt, error = %e, "retrying bit read");
                tokio::time::sleep(RETRY_DELAY * attempt).await;
            }
        }
    }
}

/// Register-table read with the shared retry budget.
pub(crate) async fn read_words_retry(
    ctx: &mut Context,
    input: bool,
    start: u16,
    count: u16,
) -> std::io::Result<Vec<u16>> {
    let mut attempt: u32 = 0;
    loop {
        let result = if input {
            ctx.read_input_registers(start, count).await
        } else {
            ctx.read_holding_registers(start, count).await
        };
        match result {
            Ok(words) => return Ok(words),
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_RETRIES {
                    return Err(e);
                }
                debug!(start, count, attempt, error = %e, "retrying register read");
                tokio::time::sleep(RETRY_DELAY * attempt).await;
            }
        }
    }
}

/// A write shape for the retrying dispatcher.
pub(crate) enum WriteOp<'a> {
    SingleCoil(u16, bool),
    MultiCoils(u16, &'a [bool]),
    SingleRegister(u16, u16),
    MultiRegisters(u16, &'a [u16]),
}

/// Write with the shared retry budget.
pub(crate) async fn write_retry(ctx: &mut Context, op: &WriteOp<'_>) -> std::io::Result<()> {
    let mut attempt: u32 = 0;
    loop {
        let result = match op {
            WriteOp::SingleCoil(start, value) => ctx.write_single_coil(*start, *value).await,
            WriteOp::MultiCoils(start, values) => ctx.write_multiple_coils(*start, values).await,
            WriteOp::SingleRegister(start, value) => {
                ctx.write_single_register(*start, *value).await
            }
            WriteOp::MultiRegisters(start, values) => {
                ctx.write_multiple_registers(*start, values).await
            }
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_RETRIES {
                    return Err(e);
                }
                debug!(attempt, error = %e, "retrying register write");
                tokio::time::sleep(RETRY_DELAY * attempt).await;
            }
        }
    }
}

/// Dispatch a single read by register type, with the shared retry budget.
pub(crate) async fn read_one(ctx: &mut Context, address: &RegisterAddress) -> ReadResult {
    let start = address.address as u16;
    let count = address.count;

    match address.register_type {
        RegisterType::Coil => match read_bits_retry(ctx, false, start, count).await {
            Ok(bits) => ReadResult::ok(RegisterValue::from_bool(
                bits.first().copied().unwrap_or(false),
            )),
            Err(e) => read_error("read coils", &e),
        },
        RegisterType::DiscreteInput => match read_bits_retry(ctx, true, start, count).await {
            Ok(bits) => ReadResult::ok(RegisterValue::from_bool(
                bits.first().copied().unwrap_or(false),
            )),
            Err(e) => read_error("read discrete inputs", &e),
        },
        RegisterType::InputRegister => match read_words_retry(ctx, true, start, count).await {
            Ok(words) => ReadResult::ok(words_to_value(&words, data_type_for_count(count))),
            Err(e) => read_error("read input registers", &e),
        },
        RegisterType::HoldingRegister => match read_words_retry(ctx, false, start, count).await {
            Ok(words) => ReadResult::ok(words_to_value(&words, data_type_for_count(count))),
            Err(e) => read_error("read holding registers", &e),
        },
        RegisterType::Epc => ReadResult::err("Unsupported register type"),
    }
}

/// Dispatch a single write by register type. Read-only tables were rejected
/// before this point.
pub(crate) async fn write_one(
    ctx: &mut Context,
    address: &RegisterAddress,
    value: &RegisterValue,
) -> WriteResult {
    let start = address.address as u16;

    match address.register_type {
        RegisterType::Coil => {
            let outcome = if address.count == 1 {
                write_retry(ctx, &WriteOp::SingleCoil(start, value.as_bool())).await
            } else {
                let bits: Vec<bool> = value
                    .data
                    .iter()
                    .take(address.count as usize)
                    .map(|b| *b != 0)
                    .collect();
                write_retry(ctx, &WriteOp::MultiCoils(start, &bits)).await
            };
            match outcome {
                Ok(()) => WriteResult::ok(),
                Err(e) => write_error("write coil", &e),
            }
        }
        RegisterType::HoldingRegister => {
            let outcome = if address.count == 1 {
                write_retry(ctx, &WriteOp::SingleRegister(start, value.as_u16())).await
            } else {
                let mut words = value_to_words(value);
                words.truncate(address.count as usize);
                write_retry(ctx, &WriteOp::MultiRegisters(start, &words)).await
            };
            match outcome {
                Ok(()) => WriteResult::ok(),
                Err(e) => write_error("write register", &e),
            }
        }
        RegisterType::DiscreteInput | RegisterType::InputRegister => {
            WriteResult::err("Cannot write to read-only register type")
        }
        RegisterType::Epc => WriteResult::err("Unsupported register type"),
    }
}

/// Read a fused group in one transaction and slice results back per address.
pub(crate) async fn read_group(
    ctx: &mut Context,
    group: &RegisterGroup,
    results: &mut BTreeMap<RegisterAddress, ReadResult>,
) {
    let start = group.start as u16;

    match group.register_type {
        RegisterType::Coil | RegisterType::DiscreteInput => {
            let input = group.register_type == RegisterType::DiscreteInput;
            let outcome = read_bits_retry(ctx, input, start, group.count).await;
            match outcome {
                Ok(bits) => {
                    for address in &group.addresses {
                        let offset = (address.address - group.start) as usize;
                        results.insert(
                            *address,
                            ReadResult::ok(RegisterValue::from_bool(
                                bits.get(offset).copied().unwrap_or(false),
                            )),
                        );
                    }
                }
                Err(e) => {
                    for address in &group.addresses {
                        results.insert(*address, read_error("read bits", &e));
                    }
                }
            }
        }
        RegisterType::InputRegister | RegisterType::HoldingRegister => {
            let input = group.register_type == RegisterType::InputRegister;
            let outcome = read_words_retry(ctx, input, start, group.count).await;
            match outcome {
                Ok(words) => {
                    for address in &group.addresses {
                        let offset = (address.address - group.start) as usize;
                        let slice = words
                            .get(offset..offset + address.count as usize)
                            .unwrap_or(&[]);
                        results.insert(
                            *address,
                            ReadResult::ok(words_to_value(
                                slice,
                                data_type_for_count(address.count),
                            )),
                        );
                    }
                }
                Err(e) => {
                    for address in &group.addresses {
                        results.insert(*address, read_error("read registers", &e));
                    }
                }
            }
        }
        RegisterType::Epc => {
            for address in &group.addresses {
                results.insert(*address, ReadResult::err("Unsupported register type"));
            }
        }
    }
}

fn read_error(operation: &str, e: &std::io::Error) -> ReadResult {
    ReadResult::err_with_code(
        format!("Failed to {operation}: {e}"),
        e.raw_os_error().unwrap_or(0),
    )
}

fn write_error(operation: &str, e: &std::io::Error) -> WriteResult {
    WriteResult::err_with_code(
        format!("Failed to {operation}: {e}"),
        e.raw_os_error().unwrap_or(0),
    )
}
