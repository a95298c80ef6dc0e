//! Applies operator control commands to the PLC

use crate::plc::PlcLink;
use securex_shared::{ControlAck, ControlMessage};
use std::sync::Arc;
use tracing::{error, info};

/// Executes `CONTROL` messages as register writes
#[derive(Clone)]
pub struct ControlExecutor {
    device_id: String,
    plc: Arc<dyn PlcLink>,
}

impl ControlExecutor {
    pub fn new(device_id: impl Into<String>, plc: Arc<dyn PlcLink>) -> Self {
        Self {
            device_id: device_id.into(),
            plc,
        }
    }

    /// Write the register and build the acknowledgement for the gateway
    pub async fn execute(&self, command: &ControlMessage) -> ControlAck {
        info!(
            register = command.register,
            value = command.value,
            plc = self.plc.name(),
            "Executing control command"
        );

        match self.plc.write_register(command.register, command.value).await {
            Ok(()) => {
                info!(register = command.register, value = command.value, "Register written");
                ControlAck::succeeded(&self.device_id, command)
            }
            Err(e) => {
                error!(register = command.register, error = %e, "Register write failed");
                ControlAck::failed(&self.device_id, command, e.to_string())
            }
        }
    }
}
