//! PLC access
//!
//! The device reads its metrics from holding registers and applies operator
//! control commands as single register writes.

pub mod modbus;
mod simulated;

pub use modbus::{ModbusError, ModbusTcpLink};
pub use simulated::SimulatedPlc;

use async_trait::async_trait;
use securex_shared::Metrics;

/// First holding register of the metrics block
pub const METRICS_START_REGISTER: u16 = 0;

/// Registers in the metrics block: cpu, memory, temperature
pub const METRICS_REGISTER_COUNT: u16 = 3;

/// Register access to a PLC
#[async_trait]
pub trait PlcLink: Send + Sync {
    async fn read_holding_registers(&self, addr: u16, count: u16) -> Result<Vec<u16>, ModbusError>;

    async fn write_register(&self, addr: u16, value: u16) -> Result<(), ModbusError>;

    /// Human-readable name for logs
    fn name(&self) -> &str;
}

/// Convert the metrics register block to metrics.
///
/// cpu and memory are stored in hundredths, temperature in tenths of a degree.
pub fn metrics_from_registers(registers: &[u16]) -> Option<Metrics> {
    match registers {
        [cpu, memory, temperature, ..] => Some(Metrics::new(
            f64::from(*cpu) / 100.0,
            f64::from(*memory) / 100.0,
            f64::from(*temperature) / 10.0,
        )),
        _ => None,
    }
}

/// Read the metrics block from `plc`
pub async fn read_metrics(plc: &dyn PlcLink) -> Result<Metrics, ModbusError> {
    let registers = plc
        .read_holding_registers(METRICS_START_REGISTER, METRICS_REGISTER_COUNT)
        .await?;
    metrics_from_registers(&registers).ok_or_else(|| {
        ModbusError::InvalidFrame(format!("expected 3 registers, got {}", registers.len()))
    })
}
