//! Modbus TCP client
//!
//! Frames on the wire:
//! ```text
//! [ 2: transaction id ][ 2: protocol id = 0 ][ 2: length ][ 1: unit id ][ PDU ]
//! ```
//! `length` counts the unit id plus the PDU. All fields are big-endian.

use super::PlcLink;
use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// MBAP header length
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest PDU a Modbus frame may carry
pub const MAX_PDU_LEN: usize = 253;

/// Most registers a single read may request
pub const MAX_READ_REGISTERS: u16 = 125;

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const FC_WRITE_SINGLE_REGISTER: u8 = 0x06;

const EXCEPTION_FLAG: u8 = 0x80;

#[derive(Error, Debug)]
pub enum ModbusError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request to {0} timed out")]
    Timeout(String),

    #[error("Connection closed by PLC")]
    ConnectionClosed,

    #[error("Modbus exception 0x{code:02x} for function 0x{function:02x}")]
    Exception { function: u8, code: u8 },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Invalid register count: {0}")]
    InvalidCount(u16),
}

/// One Modbus TCP application data unit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModbusFrame {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub pdu: Bytes,
}

/// Encode a frame into `buf`
pub fn encode_frame(frame: &ModbusFrame, buf: &mut BytesMut) -> Result<(), ModbusError> {
    if frame.pdu.is_empty() || frame.pdu.len() > MAX_PDU_LEN {
        return Err(ModbusError::InvalidFrame(format!("PDU length {}", frame.pdu.len())));
    }
    buf.reserve(MBAP_HEADER_LEN + frame.pdu.len());
    buf.put_u16(frame.transaction_id);
    buf.put_u16(0);
    buf.put_u16(frame.pdu.len() as u16 + 1);
    buf.put_u8(frame.unit_id);
    buf.put_slice(&frame.pdu);
    Ok(())
}

/// Try to decode one frame from `buf`
///
/// Returns `Ok(None)` until a complete frame is buffered.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<ModbusFrame>, ModbusError> {
    if buf.len() < MBAP_HEADER_LEN {
        return Ok(None);
    }

    let protocol_id = u16::from_be_bytes([buf[2], buf[3]]);
    if protocol_id != 0 {
        return Err(ModbusError::InvalidFrame(format!("protocol id {}", protocol_id)));
    }
    let length = u16::from_be_bytes([buf[4], buf[5]]) as usize;
    if length < 2 || length > MAX_PDU_LEN + 1 {
        return Err(ModbusError::InvalidFrame(format!("length field {}", length)));
    }

    let total = 6 + length;
    if buf.len() < total {
        return Ok(None);
    }

    let transaction_id = buf.get_u16();
    buf.advance(4);
    let unit_id = buf.get_u8();
    let pdu = buf.split_to(length - 1).freeze();

    Ok(Some(ModbusFrame {
        transaction_id,
        unit_id,
        pdu,
    }))
}

/// Streaming decoder for frames arriving over TCP
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(512),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn decode_next(&mut self) -> Result<Option<ModbusFrame>, ModbusError> {
        decode_frame(&mut self.buffer)
    }
}

/// Request PDU for reading `count` holding registers at `addr`
pub fn read_holding_registers_pdu(addr: u16, count: u16) -> Result<Bytes, ModbusError> {
    if count == 0 || count > MAX_READ_REGISTERS {
        return Err(ModbusError::InvalidCount(count));
    }
    let mut pdu = BytesMut::with_capacity(5);
    pdu.put_u8(FC_READ_HOLDING_REGISTERS);
    pdu.put_u16(addr);
    pdu.put_u16(count);
    Ok(pdu.freeze())
}

/// Request PDU for writing one holding register
pub fn write_single_register_pdu(addr: u16, value: u16) -> Bytes {
    let mut pdu = BytesMut::with_capacity(5);
    pdu.put_u8(FC_WRITE_SINGLE_REGISTER);
    pdu.put_u16(addr);
    pdu.put_u16(value);
    pdu.freeze()
}

/// Check the function code of a response PDU, mapping exception responses to errors
fn check_function(function: u8, mut pdu: Bytes) -> Result<Bytes, ModbusError> {
    if pdu.is_empty() {
        return Err(ModbusError::InvalidFrame("empty PDU".into()));
    }
    let code = pdu.get_u8();
    if code == function | EXCEPTION_FLAG {
        let exception = if pdu.has_remaining() { pdu.get_u8() } else { 0 };
        return Err(ModbusError::Exception {
            function,
            code: exception,
        });
    }
    if code != function {
        return Err(ModbusError::InvalidFrame(format!(
            "expected function 0x{:02x}, got 0x{:02x}",
            function, code
        )));
    }
    Ok(pdu)
}

/// Parse a read holding registers response
pub fn parse_read_response(pdu: Bytes, count: u16) -> Result<Vec<u16>, ModbusError> {
    let mut body = check_function(FC_READ_HOLDING_REGISTERS, pdu)?;
    if !body.has_remaining() {
        return Err(ModbusError::InvalidFrame("missing byte count".into()));
    }
    let byte_count = body.get_u8() as usize;
    if byte_count != count as usize * 2 || body.remaining() != byte_count {
        return Err(ModbusError::InvalidFrame(format!(
            "byte count {} for {} registers",
            byte_count, count
        )));
    }
    Ok((0..count).map(|_| body.get_u16()).collect())
}

/// Parse a write single register response, which echoes the request
pub fn parse_write_response(pdu: Bytes, addr: u16, value: u16) -> Result<(), ModbusError> {
    let mut body = check_function(FC_WRITE_SINGLE_REGISTER, pdu)?;
    if body.remaining() != 4 {
        return Err(ModbusError::InvalidFrame("short write response".into()));
    }
    let (echo_addr, echo_value) = (body.get_u16(), body.get_u16());
    if echo_addr != addr || echo_value != value {
        return Err(ModbusError::InvalidFrame(format!(
            "write echo {}={} does not match {}={}",
            echo_addr, echo_value, addr, value
        )));
    }
    Ok(())
}

/// Modbus TCP link to a PLC.
///
/// The TCP connection is opened on first use and dropped after any transport
/// error, so the next request reconnects.
pub struct ModbusTcpLink {
    address: String,
    unit_id: u8,
    request_timeout: Duration,
    transaction_id: AtomicU16,
    stream: Mutex<Option<TcpStream>>,
}

impl ModbusTcpLink {
    pub fn new(address: impl Into<String>, unit_id: u8) -> Self {
        Self {
            address: address.into(),
            unit_id,
            request_timeout: Duration::from_secs(3),
            transaction_id: AtomicU16::new(0),
            stream: Mutex::new(None),
        }
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Send one request PDU and return the response PDU
    async fn request(&self, pdu: Bytes) -> Result<Bytes, ModbusError> {
        let mut guard = self.stream.lock().await;

        if guard.is_none() {
            let stream = timeout(self.request_timeout, TcpStream::connect(&self.address))
                .await
                .map_err(|_| ModbusError::Timeout(self.address.clone()))??;
            stream.set_nodelay(true)?;
            info!(address = %self.address, unit_id = self.unit_id, "Connected to PLC");
            *guard = Some(stream);
        }

        let transaction_id = self.transaction_id.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let frame = ModbusFrame {
            transaction_id,
            unit_id: self.unit_id,
            pdu,
        };

        let result = match guard.as_mut() {
            Some(stream) => {
                timeout(self.request_timeout, exchange(stream, &frame))
                    .await
                    .map_err(|_| ModbusError::Timeout(self.address.clone()))
                    .and_then(|r| r)
            }
            None => Err(ModbusError::ConnectionClosed),
        };

        if let Err(e) = &result {
            if !matches!(e, ModbusError::Exception { .. }) {
                warn!(address = %self.address, error = %e, "PLC link reset");
                *guard = None;
            }
        }
        result
    }
}

async fn exchange(stream: &mut TcpStream, request: &ModbusFrame) -> Result<Bytes, ModbusError> {
    let mut out = BytesMut::new();
    encode_frame(request, &mut out)?;
    stream.write_all(&out).await?;

    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 512];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ModbusError::ConnectionClosed);
        }
        decoder.extend(&buf[..n]);

        while let Some(frame) = decoder.decode_next()? {
            if frame.transaction_id == request.transaction_id {
                return Ok(frame.pdu);
            }
            debug!(
                expected = request.transaction_id,
                got = frame.transaction_id,
                "Discarding stale Modbus response"
            );
        }
    }
}

#[async_trait]
impl PlcLink for ModbusTcpLink {
    async fn read_holding_registers(&self, addr: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        let pdu = read_holding_registers_pdu(addr, count)?;
        let response = self.request(pdu).await?;
        parse_read_response(response, count)
    }

    async fn write_register(&self, addr: u16, value: u16) -> Result<(), ModbusError> {
        let response = self.request(write_single_register_pdu(addr, value)).await?;
        parse_write_response(response, addr, value)
    }

    fn name(&self) -> &str {
        &self.address
    }
}
