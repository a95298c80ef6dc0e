//! Periodic liveness sweeper

use crate::config::LivenessConfig;
use crate::session::{LivenessTransition, SessionRegistry};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Timing rules applied by the sweeper
#[derive(Debug, Clone, Copy)]
pub struct LivenessPolicy {
    pub sweep_interval: Duration,
    pub timeout: Duration,
    pub grace: Duration,
}

impl From<&LivenessConfig> for LivenessPolicy {
    fn from(config: &LivenessConfig) -> Self {
        Self {
            sweep_interval: Duration::from_millis(config.sweep_interval_ms),
            timeout: Duration::from_millis(config.timeout_ms),
            grace: Duration::from_millis(config.grace_ms),
        }
    }
}

impl Default for LivenessPolicy {
    fn default() -> Self {
        Self::from(&LivenessConfig::default())
    }
}

/// Device ids affected by one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub stale: Vec<String>,
    pub evicted: Vec<String>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.evicted.is_empty()
    }
}

/// Expires sessions that stop sending telemetry
pub struct LivenessSweeper {
    registry: Arc<SessionRegistry>,
    policy: LivenessPolicy,
}

impl LivenessSweeper {
    pub fn new(registry: Arc<SessionRegistry>, policy: LivenessPolicy) -> Self {
        Self { registry, policy }
    }

    /// Run one sweep as of `now`.
    ///
    /// Works from a snapshot of handles; each session is re-checked under its
    /// own entry lock, so telemetry arriving mid-sweep wins.
    pub fn sweep_at(&self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for handle in self.registry.handles() {
            match self
                .registry
                .check_liveness(&handle, now, self.policy.timeout, self.policy.grace)
            {
                Some(LivenessTransition::MarkedStale) => report.stale.push(handle.device_id),
                Some(LivenessTransition::Evicted) => report.evicted.push(handle.device_id),
                None => {}
            }
        }

        report
    }

    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Start the sweep loop; returns when `shutdown` flips to true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.policy.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval_ms = self.policy.sweep_interval.as_millis() as u64,
            timeout_ms = self.policy.timeout.as_millis() as u64,
            grace_ms = self.policy.grace.as_millis() as u64,
            "Liveness sweeper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep();
                    if !report.is_empty() {
                        info!(
                            stale = report.stale.len(),
                            evicted = report.evicted.len(),
                            "Liveness sweep"
                        );
                    } else {
                        debug!("Liveness sweep: no changes");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Liveness sweeper stopped");
    }
}
