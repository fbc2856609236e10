//! In-process Modbus TCP server for adapter tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

/// Modbus exception codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
}

/// Mock Modbus TCP server
pub struct MockModbusServer {
    coils: Arc<RwLock<HashMap<u16, bool>>>,
    discrete_inputs: Arc<RwLock<HashMap<u16, bool>>>,
    holding_registers: Arc<RwLock<HashMap<u16, u16>>>,
    input_registers: Arc<RwLock<HashMap<u16, u16>>>,
    response_delay_ms: u64,
}

impl MockModbusServer {
    pub fn new() -> Self {
        Self {
            coils: Arc::new(RwLock::new(HashMap::new())),
            discrete_inputs: Arc::new(RwLock::new(HashMap::new())),
            holding_registers: Arc::new(RwLock::new(HashMap::new())),
            input_registers: Arc::new(RwLock::new(HashMap::new())),
            response_delay_ms: 0,
        }
    }

    /// Delay every response, for timeout/retry simulation.
    pub fn set_response_delay(&mut self, delay_ms: u64) {
        self.response_delay_ms = delay_ms;
    }

    pub async fn set_coil(&self, address: u16, value: bool) {
        self.coils.write().await.insert(address, value);
    }

    pub async fn get_coil(&self, address: u16) -> Option<bool> {
        self.coils.read().await.get(&address).copied()
    }

    pub async fn set_discrete_input(&self, address: u16, value: bool) {
        self.discrete_inputs.write().await.insert(address, value);
    }

    pub async fn set_holding_register(&self, address: u16, value: u16) {
        self.holding_registers.write().await.insert(address, value);
    }

    pub async fn set_holding_registers(&self, start_address: u16, values: &[u16]) {
        let mut registers = self.holding_registers.write().await;
        for (i, &value) in values.iter().enumerate() {
            registers.insert(start_address + i as u16, value);
        }
    }

    pub async fn get_holding_register(&self, address: u16) -> Option<u16> {
        self.holding_registers.read().await.get(&address).copied()
    }

    pub async fn set_input_register(&self, address: u16, value: u16) {
        self.input_registers.write().await.insert(address, value);
    }

    /// Bind an ephemeral port, serve connections in the background and
    /// return the bound address.
    pub async fn spawn(self) -> std::io::Result<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = Arc::new(self);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let server = server.clone();
                tokio::spawn(async move {
                    let _ = server.handle_connection(stream).await;
                });
            }
        });
        Ok(addr)
    }

    async fn handle_connection(&self, mut stream: TcpStream) -> std::io::Result<()> {
        let mut buffer = vec![0u8; 512];

        loop {
            let n = match stream.read(&mut buffer).await {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => return Err(e),
            };

            if self.response_delay_ms > 0 {
                sleep(Duration::from_millis(self.response_delay_ms)).await;
            }

            let response = self.process_request(&buffer[..n]).await;
            stream.write_all(&response).await?;
        }
    }

    async fn process_request(&self, request: &[u8]) -> Vec<u8> {
        if request.len() < 8 {
            return error_response(0, 0, 0, ExceptionCode::IllegalDataValue);
        }

        let transaction_id = u16::from_be_bytes([request[0], request[1]]);
        let unit_id = request[6];
        let function_code = request[7];
        let data = &request[8..];

        match function_code {
            0x01 => self.read_bits(transaction_id, unit_id, 0x01, data, &self.coils).await,
            0x02 => {
                self.read_bits(transaction_id, unit_id, 0x02, data, &self.discrete_inputs)
                    .await
            }
            0x03 => {
                self.read_words(transaction_id, unit_id, 0x03, data, &self.holding_registers)
                    .await
            }
            0x04 => {
                self.read_words(transaction_id, unit_id, 0x04, data, &self.input_registers)
                    .await
            }
            0x05 => self.write_single_coil(transaction_id, unit_id, data).await,
            0x06 => self.write_single_register(transaction_id, unit_id, data).await,
            0x0F => self.write_multiple_coils(transaction_id, unit_id, data).await,
            0x10 => self.write_multiple_registers(transaction_id, unit_id, data).await,
            _ => error_response(
                transaction_id,
                unit_id,
                function_code,
                ExceptionCode::IllegalFunction,
            ),
        }
    }

    async fn read_bits(
        &self,
        tid: u16,
        unit_id: u8,
        fc: u8,
        data: &[u8],
        table: &RwLock<HashMap<u16, bool>>,
    ) -> Vec<u8> {
        if data.len() < 4 {
            return error_response(tid, unit_id, fc, ExceptionCode::IllegalDataValue);
        }
        let start = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if quantity == 0 || quantity > 2000 {
            return error_response(tid, unit_id, fc, ExceptionCode::IllegalDataValue);
        }

        let table = table.read().await;
        let mut packed = vec![0u8; quantity.div_ceil(8) as usize];
        for i in 0..quantity {
            if table.get(&(start + i)).copied().unwrap_or(false) {
                packed[(i / 8) as usize] |= 1 << (i % 8);
            }
        }

        let mut body = vec![unit_id, fc, packed.len() as u8];
        body.extend_from_slice(&packed);
        framed(tid, body)
    }

    async fn read_words(
        &self,
        tid: u16,
        unit_id: u8,
        fc: u8,
        data: &[u8],
        table: &RwLock<HashMap<u16, u16>>,
    ) -> Vec<u8> {
        if data.len() < 4 {
            return error_response(tid, unit_id, fc, ExceptionCode::IllegalDataValue);
        }
        let start = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        if quantity == 0 || quantity > 125 {
            return error_response(tid, unit_id, fc, ExceptionCode::IllegalDataValue);
        }

        let table = table.read().await;
        let mut body = vec![unit_id, fc, (quantity * 2) as u8];
        for i in 0..quantity {
            let value = table.get(&(start + i)).copied().unwrap_or(0);
            body.extend_from_slice(&value.to_be_bytes());
        }
        framed(tid, body)
    }

    async fn write_single_coil(&self, tid: u16, unit_id: u8, data: &[u8]) -> Vec<u8> {
        if data.len() < 4 {
            return error_response(tid, unit_id, 0x05, ExceptionCode::IllegalDataValue);
        }
        let address = u16::from_be_bytes([data[0], data[1]]);
        let raw = u16::from_be_bytes([data[2], data[3]]);
        let value = match raw {
            0xFF00 => true,
            0x0000 => false,
            _ => return error_response(tid, unit_id, 0x05, ExceptionCode::IllegalDataValue),
        };

        self.coils.write().await.insert(address, value);

        let mut body = vec![unit_id, 0x05];
        body.extend_from_slice(&address.to_be_bytes());
        body.extend_from_slice(&raw.to_be_bytes());
        framed(tid, body)
    }

    async fn write_single_register(&self, tid: u16, unit_id: u8, data: &[u8]) -> Vec<u8> {
        if data.len() < 4 {
            return error_response(tid, unit_id, 0x06, ExceptionCode::IllegalDataValue);
        }
        let address = u16::from_be_bytes([data[0], data[1]]);
        let value = u16::from_be_bytes([data[2], data[3]]);

        self.holding_registers.write().await.insert(address, value);

        let mut body = vec![unit_id, 0x06];
        body.extend_from_slice(&address.to_be_bytes());
        body.extend_from_slice(&value.to_be_bytes());
        framed(tid, body)
    }

    async fn write_multiple_coils(&self, tid: u16, unit_id: u8, data: &[u8]) -> Vec<u8> {
        if data.len() < 5 {
            return error_response(tid, unit_id, 0x0F, ExceptionCode::IllegalDataValue);
        }
        let start = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        let payload = &data[5..];

        let mut coils = self.coils.write().await;
        for i in 0..quantity {
            let byte = (i / 8) as usize;
            if byte >= payload.len() {
                return error_response(tid, unit_id, 0x0F, ExceptionCode::IllegalDataValue);
            }
            let value = payload[byte] & (1 << (i % 8)) != 0;
            coils.insert(start + i, value);
        }

        let mut body = vec![unit_id, 0x0F];
        body.extend_from_slice(&start.to_be_bytes());
        body.extend_from_slice(&quantity.to_be_bytes());
        framed(tid, body)
    }

    async fn write_multiple_registers(&self, tid: u16, unit_id: u8, data: &[u8]) -> Vec<u8> {
        if data.len() < 5 {
            return error_response(tid, unit_id, 0x10, ExceptionCode::IllegalDataValue);
        }
        let start = u16::from_be_bytes([data[0], data[1]]);
        let quantity = u16::from_be_bytes([data[2], data[3]]);
        let byte_count = data[4] as usize;
        if byte_count != quantity as usize * 2 || data.len() < 5 + byte_count {
            return error_response(tid, unit_id, 0x10, ExceptionCode::IllegalDataValue);
        }

        let mut registers = self.holding_registers.write().await;
        for i in 0..quantity {
            let offset = 5 + (i * 2) as usize;
            let value = u16::from_be_bytes([data[offset], data[offset + 1]]);
            registers.insert(start + i, value);
        }

        let mut body = vec![unit_id, 0x10];
        body.extend_from_slice(&start.to_be_bytes());
        body.extend_from_slice(&quantity.to_be_bytes());
        framed(tid, body)
    }
}

impl Default for MockModbusServer {
    fn default() -> Self {
        Self::new()
    }
}

/// Wrap a unit+pdu body in an MBAP header echoing the transaction id.
fn framed(tid: u16, body: Vec<u8>) -> Vec<u8> {
    let mut response = Vec::with_capacity(6 + body.len());
    response.extend_from_slice(&tid.to_be_bytes());
    response.extend_from_slice(&0u16.to_be_bytes());
    response.extend_from_slice(&(body.len() as u16).to_be_bytes());
    response.extend_from_slice(&body);
    response
}

fn error_response(tid: u16, unit_id: u8, function_code: u8, exception: ExceptionCode) -> Vec<u8> {
    framed(tid, vec![unit_id, function_code | 0x80, exception as u8])
}
