//! In-memory PLC for running without hardware

use super::{ModbusError, PlcLink, METRICS_REGISTER_COUNT};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

/// Holding registers of the simulated PLC
const REGISTER_COUNT: usize = 64;

/// Register bank whose metrics block drifts on every read
pub struct SimulatedPlc {
    registers: Mutex<Vec<u16>>,
    ticks: AtomicU64,
    drift: bool,
}

impl SimulatedPlc {
    /// Plausible starting values: 35% cpu, 48% memory, 41.5 degrees
    pub fn new() -> Self {
        let mut registers = vec![0; REGISTER_COUNT];
        registers[..3].copy_from_slice(&[35, 48, 415]);
        Self {
            registers: Mutex::new(registers),
            ticks: AtomicU64::new(0),
            drift: true,
        }
    }

    /// Fixed register contents, no drift
    pub fn with_registers(mut registers: Vec<u16>) -> Self {
        if registers.len() < REGISTER_COUNT {
            registers.resize(REGISTER_COUNT, 0);
        }
        Self {
            registers: Mutex::new(registers),
            ticks: AtomicU64::new(0),
            drift: false,
        }
    }

    fn step(&self, registers: &mut [u16]) {
        let tick = self.ticks.fetch_add(1, Ordering::Relaxed);
        // Triangle waves keep the values inside realistic bounds
        let wave = |period: u64, amplitude: u64| -> u16 {
            let phase = tick % (2 * period);
            let pos = if phase < period { phase } else { 2 * period - phase };
            (pos * amplitude / period) as u16
        };
        registers[0] = 20 + wave(17, 60);
        registers[1] = 40 + wave(29, 30);
        registers[2] = 380 + wave(41, 120);
    }
}

impl Default for SimulatedPlc {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PlcLink for SimulatedPlc {
    async fn read_holding_registers(&self, addr: u16, count: u16) -> Result<Vec<u16>, ModbusError> {
        let mut registers = self.registers.lock().await;
        if self.drift && addr == 0 && count >= METRICS_REGISTER_COUNT {
            self.step(&mut registers);
        }

        let start = addr as usize;
        let end = start + count as usize;
        if count == 0 || end > registers.len() {
            return Err(ModbusError::Exception {
                function: super::modbus::FC_READ_HOLDING_REGISTERS,
                code: 0x02,
            });
        }
        Ok(registers[start..end].to_vec())
    }

    async fn write_register(&self, addr: u16, value: u16) -> Result<(), ModbusError> {
        let mut registers = self.registers.lock().await;
        match registers.get_mut(addr as usize) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(ModbusError::Exception {
                function: super::modbus::FC_WRITE_SINGLE_REGISTER,
                code: 0x02,
            }),
        }
    }

    fn name(&self) -> &str {
        "simulated"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plc::read_metrics;

    #[tokio::test]
    async fn test_write_then_read() {
        let plc = SimulatedPlc::with_registers(vec![]);
        plc.write_register(5, 100).await.unwrap();
        assert_eq!(plc.read_holding_registers(5, 1).await.unwrap(), vec![100]);
    }

    #[tokio::test]
    async fn test_out_of_range_is_exception() {
        let plc = SimulatedPlc::new();
        assert!(matches!(
            plc.write_register(1000, 1).await,
            Err(ModbusError::Exception { code: 0x02, .. })
        ));
        assert!(plc.read_holding_registers(63, 2).await.is_err());
    }

    #[tokio::test]
    async fn test_drift_stays_in_bounds() {
        let plc = SimulatedPlc::new();
        let mut seen = Vec::new();
        for _ in 0..200 {
            let metrics = read_metrics(&plc).await.unwrap();
            assert!((0.2..=0.8).contains(&metrics.cpu));
            assert!((0.4..=0.7).contains(&metrics.memory));
            assert!((38.0..=50.0).contains(&metrics.temperature));
            seen.push(metrics.cpu);
        }
        seen.dedup();
        assert!(seen.len() > 1);
    }
}
