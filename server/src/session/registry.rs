//! Session registry for tracking all connected devices

use super::connection::{DeviceChannel, DeviceSession, SessionHandle, SessionSnapshot, SessionStatus};
use crate::error::RegistryError;
use dashmap::DashMap;
use securex_shared::{ControlMessage, Metrics};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome of a liveness check on a single session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessTransition {
    MarkedStale,
    Evicted,
}

/// Session counts by status
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub connecting: usize,
    pub active: usize,
    pub stale: usize,
}

impl StatusCounts {
    pub fn total(&self) -> usize {
        self.connecting + self.active + self.stale
    }
}

/// Owns every device session.
///
/// Entries are locked per key, so work on one device never waits on a scan
/// or on another device's traffic.
pub struct SessionRegistry {
    sessions: DashMap<String, DeviceSession>,
    next_session_id: AtomicU64,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            next_session_id: AtomicU64::new(0),
        }
    }

    /// Create the session for `device_id`, closing any session it replaces
    pub fn register(&self, device_id: &str, channel: DeviceChannel) -> SessionHandle {
        let session_id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        let session = DeviceSession::new(device_id.to_string(), session_id, channel);
        let handle = session.handle();

        if let Some(mut previous) = self.sessions.insert(device_id.to_string(), session) {
            warn!(
                device_id,
                old_session = previous.session_id,
                new_session = session_id,
                "Device re-registered, closing previous session"
            );
            previous.close();
        } else {
            info!(device_id, session_id, "Device registered");
        }

        handle
    }

    /// Record accepted telemetry for the session `handle` refers to.
    ///
    /// Fails once the device has reconnected under a newer session, so a
    /// replaced connection cannot refresh its successor.
    pub fn touch(&self, handle: &SessionHandle, metrics: Metrics, timestamp: u64) -> Result<(), RegistryError> {
        let unknown = || RegistryError::UnknownDevice(handle.device_id.clone());
        let mut session = self.sessions.get_mut(&handle.device_id).ok_or_else(unknown)?;

        if session.session_id != handle.session_id || session.status == SessionStatus::Closed {
            return Err(unknown());
        }

        let previous = session.touch(metrics, timestamp, Instant::now());
        if previous != SessionStatus::Active {
            info!(device_id = %handle.device_id, from = %previous, "Device session active");
        }
        Ok(())
    }

    /// Get a snapshot of the session for a device
    pub fn get(&self, device_id: &str) -> Option<SessionSnapshot> {
        self.sessions.get(device_id).map(|s| s.snapshot())
    }

    /// Evict the session for a device and close its channel
    pub fn remove(&self, device_id: &str) -> Option<SessionSnapshot> {
        let (_, mut session) = self.sessions.remove(device_id)?;
        session.close();
        info!(device_id, session_id = session.session_id, "Device session removed");
        Some(session.snapshot())
    }

    /// Evict the session only if `handle` still owns the slot
    pub fn remove_session(&self, handle: &SessionHandle) -> bool {
        match self
            .sessions
            .remove_if(&handle.device_id, |_, s| s.session_id == handle.session_id)
        {
            Some((_, mut session)) => {
                session.close();
                info!(
                    device_id = %handle.device_id,
                    session_id = handle.session_id,
                    "Device disconnected"
                );
                true
            }
            None => false,
        }
    }

    /// Mark a session stale after a failed write
    pub fn mark_stale(&self, handle: &SessionHandle) {
        if let Some(mut session) = self.sessions.get_mut(&handle.device_id) {
            if session.session_id == handle.session_id && session.status == SessionStatus::Active {
                session.mark_stale(Instant::now());
                warn!(device_id = %handle.device_id, "Device session marked stale");
            }
        }
    }

    /// Control channel of an active session
    pub(crate) fn control_sender(
        &self,
        device_id: &str,
    ) -> Option<(SessionHandle, mpsc::Sender<ControlMessage>)> {
        let session = self.sessions.get(device_id)?;
        if session.status != SessionStatus::Active {
            return None;
        }
        Some((session.handle(), session.channel.sender()))
    }

    /// Handles of all sessions; each entry is locked only while it is read
    pub fn handles(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(|s| s.handle()).collect()
    }

    /// Apply liveness rules to one session as of `now`
    pub fn check_liveness(
        &self,
        handle: &SessionHandle,
        now: Instant,
        timeout: Duration,
        grace: Duration,
    ) -> Option<LivenessTransition> {
        if let Some((_, mut session)) = self.sessions.remove_if(&handle.device_id, |_, s| {
            s.session_id == handle.session_id && s.is_grace_expired(now, grace)
        }) {
            session.close();
            warn!(device_id = %handle.device_id, "Evicted stale device session");
            return Some(LivenessTransition::Evicted);
        }

        let mut session = self.sessions.get_mut(&handle.device_id)?;
        if session.session_id != handle.session_id || !session.is_timed_out(now, timeout) {
            return None;
        }
        session.mark_stale(now);
        warn!(device_id = %handle.device_id, "Device session stale (no telemetry)");
        Some(LivenessTransition::MarkedStale)
    }

    /// Snapshots of all sessions
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut list: Vec<_> = self.sessions.iter().map(|s| s.snapshot()).collect();
        list.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        list
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for session in self.sessions.iter() {
            match session.status {
                SessionStatus::Connecting => counts.connecting += 1,
                SessionStatus::Active => counts.active += 1,
                SessionStatus::Stale => counts.stale += 1,
                SessionStatus::Closed => debug!(device_id = %session.device_id, "Closed session still registered"),
            }
        }
        counts
    }

    /// Get the number of registered devices
    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Close every session (used on shutdown)
    pub fn close_all(&self) {
        for handle in self.handles() {
            self.remove_session(&handle);
        }
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ChannelEndpoints;
    use std::sync::Arc;

    fn channel() -> (DeviceChannel, ChannelEndpoints) {
        DeviceChannel::new(4)
    }

    fn metrics(cpu: f64) -> Metrics {
        Metrics::new(cpu, 0.5, 42.0)
    }

    #[test]
    fn test_register_starts_connecting() {
        let registry = SessionRegistry::new();
        let (ch, _ends) = channel();
        let handle = registry.register("DEV001", ch);

        let snapshot = registry.get("DEV001").expect("session");
        assert_eq!(snapshot.status, SessionStatus::Connecting);
        assert_eq!(snapshot.session_id, handle.session_id);
        assert!(snapshot.last_metrics.is_none());
    }

    #[test]
    fn test_touch_activates_and_records_metrics() {
        let registry = SessionRegistry::new();
        let (ch, _ends) = channel();
        let handle = registry.register("DEV001", ch);

        registry.touch(&handle, metrics(0.4), 1_000).unwrap();

        let snapshot = registry.get("DEV001").unwrap();
        assert_eq!(snapshot.status, SessionStatus::Active);
        assert_eq!(snapshot.last_metrics, Some(metrics(0.4)));
        assert_eq!(snapshot.last_timestamp, 1_000);
    }

    #[test]
    fn test_touch_unknown_device() {
        let registry = SessionRegistry::new();
        let handle = SessionHandle {
            device_id: "nope".into(),
            session_id: 1,
        };
        assert_eq!(
            registry.touch(&handle, metrics(0.1), 1),
            Err(RegistryError::UnknownDevice("nope".into()))
        );
    }

    #[test]
    fn test_touch_after_remove_fails() {
        let registry = SessionRegistry::new();
        let (ch, _ends) = channel();
        let handle = registry.register("DEV001", ch);
        registry.remove("DEV001");

        assert!(registry.touch(&handle, metrics(0.1), 1).is_err());
        assert!(registry.get("DEV001").is_none());
    }

    #[test]
    fn test_out_of_order_does_not_regress() {
        let registry = SessionRegistry::new();
        let (ch, _ends) = channel();
        let handle = registry.register("DEV001", ch);

        registry.touch(&handle, metrics(0.3), 2_000).unwrap();
        let first = registry.get("DEV001").unwrap();

        registry.touch(&handle, metrics(0.9), 1_000).unwrap();
        let second = registry.get("DEV001").unwrap();

        assert_eq!(second.last_timestamp, 2_000);
        assert_eq!(second.last_metrics, Some(metrics(0.3)));
        assert!(second.last_seen >= first.last_seen);
        assert_eq!(second.status, SessionStatus::Active);
    }

    #[test]
    fn test_reregister_closes_previous_channel() {
        let registry = SessionRegistry::new();
        let (old_ch, old_ends) = channel();
        let old = registry.register("DEV001", old_ch);

        let (new_ch, new_ends) = channel();
        let new = registry.register("DEV001", new_ch);

        assert!(old_ends.is_closed());
        assert!(!new_ends.is_closed());
        assert_ne!(old.session_id, new.session_id);
        assert_eq!(registry.count(), 1);
        assert_eq!(registry.get("DEV001").unwrap().session_id, new.session_id);
    }

    #[test]
    fn test_stale_teardown_does_not_evict_successor() {
        let registry = SessionRegistry::new();
        let (old_ch, _old_ends) = channel();
        let old = registry.register("DEV001", old_ch);
        let (new_ch, _new_ends) = channel();
        let new = registry.register("DEV001", new_ch);

        assert!(!registry.remove_session(&old));
        assert!(registry.get("DEV001").is_some());

        assert!(registry.remove_session(&new));
        assert!(registry.get("DEV001").is_none());
    }

    #[test]
    fn test_replaced_session_cannot_touch_successor() {
        let registry = SessionRegistry::new();
        let (old_ch, _old_ends) = channel();
        let old = registry.register("DEV001", old_ch);
        let (new_ch, _new_ends) = channel();
        let new = registry.register("DEV001", new_ch);

        assert_eq!(
            registry.touch(&old, metrics(0.9), 5_000),
            Err(RegistryError::UnknownDevice("DEV001".into()))
        );
        let snapshot = registry.get("DEV001").unwrap();
        assert_eq!(snapshot.status, SessionStatus::Connecting);
        assert!(snapshot.last_metrics.is_none());

        registry.touch(&new, metrics(0.4), 1_000).unwrap();
        assert_eq!(registry.get("DEV001").unwrap().last_metrics, Some(metrics(0.4)));
    }

    #[test]
    fn test_replaced_session_cannot_mark_successor_stale() {
        let registry = SessionRegistry::new();
        let (old_ch, _old_ends) = channel();
        let old = registry.register("DEV001", old_ch);
        let (new_ch, _new_ends) = channel();
        let new = registry.register("DEV001", new_ch);
        registry.touch(&new, metrics(0.4), 1).unwrap();

        registry.mark_stale(&old);
        assert_eq!(registry.get("DEV001").unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn test_remove_closes_channel() {
        let registry = SessionRegistry::new();
        let (ch, ends) = channel();
        registry.register("DEV001", ch);

        let removed = registry.remove("DEV001").unwrap();
        assert_eq!(removed.status, SessionStatus::Closed);
        assert!(ends.is_closed());
    }

    #[test]
    fn test_liveness_transitions() {
        let registry = SessionRegistry::new();
        let (ch, ends) = channel();
        let handle = registry.register("DEV001", ch);
        registry.touch(&handle, metrics(0.4), 1).unwrap();

        let t0 = Instant::now();
        let timeout = Duration::from_secs(15);
        let grace = Duration::from_secs(60);

        assert_eq!(registry.check_liveness(&handle, t0 + Duration::from_secs(5), timeout, grace), None);
        assert_eq!(
            registry.check_liveness(&handle, t0 + Duration::from_secs(20), timeout, grace),
            Some(LivenessTransition::MarkedStale)
        );
        assert_eq!(registry.get("DEV001").unwrap().status, SessionStatus::Stale);

        assert_eq!(registry.check_liveness(&handle, t0 + Duration::from_secs(50), timeout, grace), None);
        assert_eq!(
            registry.check_liveness(&handle, t0 + Duration::from_secs(80), timeout, grace),
            Some(LivenessTransition::Evicted)
        );
        assert!(registry.get("DEV001").is_none());
        assert!(ends.is_closed());
    }

    #[test]
    fn test_touch_recovers_stale_session() {
        let registry = SessionRegistry::new();
        let (ch, _ends) = channel();
        let handle = registry.register("DEV001", ch);
        registry.touch(&handle, metrics(0.4), 1).unwrap();
        registry.mark_stale(&handle);
        assert_eq!(registry.get("DEV001").unwrap().status, SessionStatus::Stale);

        registry.touch(&handle, metrics(0.5), 2).unwrap();
        assert_eq!(registry.get("DEV001").unwrap().status, SessionStatus::Active);
    }

    #[test]
    fn test_status_counts() {
        let registry = SessionRegistry::new();
        let mut ends = Vec::new();
        let mut handles = Vec::new();
        for id in ["A", "B", "C"] {
            let (ch, e) = channel();
            ends.push(e);
            handles.push(registry.register(id, ch));
        }
        registry.touch(&handles[0], metrics(0.1), 1).unwrap();
        registry.touch(&handles[1], metrics(0.1), 1).unwrap();
        registry.mark_stale(&handles[1]);

        let counts = registry.status_counts();
        assert_eq!(counts, StatusCounts { connecting: 1, active: 1, stale: 1 });
        assert_eq!(counts.total(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_register_single_session() {
        let registry = Arc::new(SessionRegistry::new());
        let mut tasks = Vec::new();

        for _ in 0..32 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let (ch, ends) = DeviceChannel::new(1);
                let handle = registry.register("DEV001", ch);
                (handle, ends)
            }));
        }

        let mut results = Vec::new();
        for task in tasks {
            results.push(task.await.unwrap());
        }

        assert_eq!(registry.count(), 1);
        let winner = registry.get("DEV001").unwrap().session_id;
        for (handle, ends) in &results {
            // Every loser was closed, the winner is still open
            assert_eq!(ends.is_closed(), handle.session_id != winner);
        }
    }
}
