//! Control dispatcher for sending register writes to devices

use crate::error::DispatchError;
use crate::session::SessionRegistry;
use securex_shared::ControlMessage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::time::Duration;
use tracing::{info, warn};

/// Operator request to write one device register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCommand {
    pub device_id: String,
    pub register: u16,
    pub value: u16,
}

impl ControlCommand {
    pub fn new(device_id: impl Into<String>, register: u16, value: u16) -> Self {
        Self {
            device_id: device_id.into(),
            register,
            value,
        }
    }
}

/// Routes control commands to active device sessions.
///
/// Delivery is fire-and-forget: the device reports the outcome later with a
/// `CONTROL_ACK`, which the caller correlates.
pub struct ControlDispatcher {
    registry: Arc<SessionRegistry>,
    write_timeout: Duration,
    dispatched: AtomicU64,
    failed: AtomicU64,
}

impl ControlDispatcher {
    pub fn new(registry: Arc<SessionRegistry>, write_timeout: Duration) -> Self {
        Self {
            registry,
            write_timeout,
            dispatched: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    /// Send a control command to a specific device
    pub async fn dispatch(&self, device_id: &str, command: ControlMessage) -> Result<(), DispatchError> {
        let (handle, sender) = self
            .registry
            .control_sender(device_id)
            .ok_or_else(|| DispatchError::DeviceNotConnected(device_id.to_string()))?;

        match sender.send_timeout(command, self.write_timeout).await {
            Ok(()) => {
                self.dispatched.fetch_add(1, Ordering::Relaxed);
                info!(
                    device_id,
                    register = command.register,
                    value = command.value,
                    ">>> Sent control command"
                );
                Ok(())
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                self.registry.mark_stale(&handle);
                let error = match e {
                    SendTimeoutError::Timeout(_) => DispatchError::WriteTimeout(device_id.to_string()),
                    SendTimeoutError::Closed(_) => DispatchError::ChannelClosed(device_id.to_string()),
                };
                warn!(device_id, error = %error, "Control command not delivered");
                Err(error)
            }
        }
    }

    /// Dispatch an operator command
    pub async fn dispatch_command(&self, command: &ControlCommand) -> Result<(), DispatchError> {
        self.dispatch(
            &command.device_id,
            ControlMessage::new(command.register, command.value),
        )
        .await
    }

    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{DeviceChannel, SessionStatus};
    use securex_shared::Metrics;

    fn setup() -> (Arc<SessionRegistry>, ControlDispatcher) {
        let registry = Arc::new(SessionRegistry::new());
        let dispatcher = ControlDispatcher::new(registry.clone(), Duration::from_millis(50));
        (registry, dispatcher)
    }

    #[tokio::test]
    async fn test_dispatch_to_active_device() {
        let (registry, dispatcher) = setup();
        let (channel, mut ends) = DeviceChannel::new(4);
        let handle = registry.register("DEV001", channel);
        registry.touch(&handle, Metrics::new(0.4, 0.5, 42.0), 1).unwrap();

        dispatcher
            .dispatch_command(&ControlCommand::new("DEV001", 5, 100))
            .await
            .unwrap();

        assert_eq!(ends.outbound.recv().await, Some(ControlMessage::new(5, 100)));
        assert_eq!(dispatcher.dispatched_count(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_device() {
        let (_registry, dispatcher) = setup();
        assert_eq!(
            dispatcher.dispatch("DEV404", ControlMessage::new(5, 100)).await,
            Err(DispatchError::DeviceNotConnected("DEV404".into()))
        );
    }

    #[tokio::test]
    async fn test_dispatch_before_first_telemetry() {
        let (registry, dispatcher) = setup();
        let (channel, _ends) = DeviceChannel::new(4);
        registry.register("DEV001", channel);

        assert!(matches!(
            dispatcher.dispatch("DEV001", ControlMessage::new(5, 100)).await,
            Err(DispatchError::DeviceNotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_dispatch_to_stale_device() {
        let (registry, dispatcher) = setup();
        let (channel, _ends) = DeviceChannel::new(4);
        let handle = registry.register("DEV001", channel);
        registry.touch(&handle, Metrics::new(0.4, 0.5, 42.0), 1).unwrap();
        registry.mark_stale(&handle);

        assert_eq!(
            dispatcher.dispatch("DEV001", ControlMessage::new(5, 100)).await,
            Err(DispatchError::DeviceNotConnected("DEV001".into()))
        );
    }

    #[tokio::test]
    async fn test_full_queue_marks_stale() {
        let (registry, dispatcher) = setup();
        let (channel, _ends) = DeviceChannel::new(1);
        let handle = registry.register("DEV001", channel);
        registry.touch(&handle, Metrics::new(0.4, 0.5, 42.0), 1).unwrap();

        dispatcher.dispatch("DEV001", ControlMessage::new(1, 1)).await.unwrap();
        let result = dispatcher.dispatch("DEV001", ControlMessage::new(2, 2)).await;

        assert_eq!(result, Err(DispatchError::WriteTimeout("DEV001".into())));
        let snapshot = registry.get("DEV001").expect("session kept");
        assert_eq!(snapshot.status, SessionStatus::Stale);
        assert_eq!(dispatcher.failed_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_channel_marks_stale() {
        let (registry, dispatcher) = setup();
        let (channel, ends) = DeviceChannel::new(4);
        let handle = registry.register("DEV001", channel);
        registry.touch(&handle, Metrics::new(0.4, 0.5, 42.0), 1).unwrap();
        drop(ends);

        let result = dispatcher.dispatch("DEV001", ControlMessage::new(5, 100)).await;
        assert_eq!(result, Err(DispatchError::ChannelClosed("DEV001".into())));
        assert_eq!(registry.get("DEV001").unwrap().status, SessionStatus::Stale);
    }
}
