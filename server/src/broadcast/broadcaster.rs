//! Bounded, non-blocking broadcaster

use crate::config::BroadcastConfig;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};

pub type SubscriberId = u64;

/// Queue sizing and slow-consumer rules
#[derive(Debug, Clone, Copy)]
pub struct BackpressurePolicy {
    pub queue_capacity: usize,
    /// Publish attempts per measurement window
    pub drop_window: u32,
    /// Disconnect when drops / attempts in a window exceeds this
    pub max_drop_ratio: f64,
}

impl From<&BroadcastConfig> for BackpressurePolicy {
    fn from(config: &BroadcastConfig) -> Self {
        Self {
            queue_capacity: config.queue_capacity,
            drop_window: config.drop_window.max(1),
            max_drop_ratio: config.max_drop_ratio,
        }
    }
}

impl Default for BackpressurePolicy {
    fn default() -> Self {
        Self::from(&BroadcastConfig::default())
    }
}

struct Subscriber {
    label: String,
    tx: mpsc::Sender<Arc<str>>,
    delivered: u64,
    dropped: u64,
    window_attempts: u32,
    window_drops: u32,
}

impl Subscriber {
    /// Count one publish attempt. Returns the window's drop ratio when the
    /// window completes.
    fn record(&mut self, dropped: bool, window: u32) -> Option<f64> {
        if dropped {
            self.dropped += 1;
            self.window_drops += 1;
        } else {
            self.delivered += 1;
        }
        self.window_attempts += 1;

        if self.window_attempts < window {
            return None;
        }
        let ratio = f64::from(self.window_drops) / f64::from(self.window_attempts);
        self.window_attempts = 0;
        self.window_drops = 0;
        Some(ratio)
    }
}

/// Counters for one subscriber
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriberStats {
    pub id: SubscriberId,
    pub label: String,
    pub delivered: u64,
    pub dropped: u64,
}

/// Result of one `publish`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
    pub disconnected: Vec<SubscriberId>,
}

enum Disconnect {
    SlowConsumer(f64),
    ChannelClosed,
}

/// Distributes messages to monitoring subscribers
pub struct Broadcaster {
    subscribers: DashMap<SubscriberId, Subscriber>,
    next_id: AtomicU64,
    published: AtomicU64,
    policy: BackpressurePolicy,
}

impl Broadcaster {
    pub fn new(policy: BackpressurePolicy) -> Self {
        Self {
            subscribers: DashMap::new(),
            next_id: AtomicU64::new(0),
            published: AtomicU64::new(0),
            policy,
        }
    }

    /// Add a subscriber; the receiver yields every message published from now on
    pub fn subscribe(&self, label: impl Into<String>) -> (SubscriberId, mpsc::Receiver<Arc<str>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::channel(self.policy.queue_capacity);
        let label = label.into();

        info!(subscriber = id, label = %label, "Subscriber added");
        self.subscribers.insert(
            id,
            Subscriber {
                label,
                tx,
                delivered: 0,
                dropped: 0,
                window_attempts: 0,
                window_drops: 0,
            },
        );
        (id, rx)
    }

    /// Remove a subscriber. Its receiver drains and then closes.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        match self.subscribers.remove(&id) {
            Some((_, sub)) => {
                info!(
                    subscriber = id,
                    delivered = sub.delivered,
                    dropped = sub.dropped,
                    "Subscriber removed"
                );
                true
            }
            None => false,
        }
    }

    /// Deliver `message` to every subscriber without waiting on any of them
    pub fn publish(&self, message: Arc<str>) -> PublishReport {
        self.published.fetch_add(1, Ordering::Relaxed);
        let mut report = PublishReport::default();
        let mut evict = Vec::new();

        for mut entry in self.subscribers.iter_mut() {
            let id = *entry.key();
            let sub = entry.value_mut();

            let (dropped, closed) = match sub.tx.try_send(message.clone()) {
                Ok(()) => (false, false),
                Err(TrySendError::Full(_)) => (true, false),
                Err(TrySendError::Closed(_)) => (true, true),
            };

            if closed {
                evict.push((id, Disconnect::ChannelClosed));
                continue;
            }
            if dropped {
                report.dropped += 1;
                debug!(subscriber = id, "Subscriber queue full, message dropped");
            } else {
                report.delivered += 1;
            }

            if let Some(ratio) = sub.record(dropped, self.policy.drop_window) {
                if ratio > self.policy.max_drop_ratio {
                    evict.push((id, Disconnect::SlowConsumer(ratio)));
                }
            }
        }

        for (id, reason) in evict {
            if self.subscribers.remove(&id).is_none() {
                continue;
            }
            match reason {
                Disconnect::SlowConsumer(ratio) => {
                    warn!(subscriber = id, drop_ratio = ratio, "Disconnecting slow subscriber")
                }
                Disconnect::ChannelClosed => {
                    debug!(subscriber = id, "Subscriber channel closed")
                }
            }
            report.disconnected.push(id);
        }

        report
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Delivery counters of every current subscriber, ordered by id
    pub fn stats(&self) -> Vec<SubscriberStats> {
        let mut stats: Vec<_> = self
            .subscribers
            .iter()
            .map(|entry| SubscriberStats {
                id: *entry.key(),
                label: entry.label.clone(),
                delivered: entry.delivered,
                dropped: entry.dropped,
            })
            .collect();
        stats.sort_by_key(|s| s.id);
        stats
    }

    /// Disconnect every subscriber (used on shutdown)
    pub fn clear(&self) {
        self.subscribers.clear();
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(BackpressurePolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(capacity: usize, window: u32, ratio: f64) -> BackpressurePolicy {
        BackpressurePolicy {
            queue_capacity: capacity,
            drop_window: window,
            max_drop_ratio: ratio,
        }
    }

    fn msg(text: &str) -> Arc<str> {
        Arc::from(text)
    }

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let broadcaster = Broadcaster::new(policy(8, 64, 0.5));
        let mut receivers: Vec<_> = (0..3).map(|i| broadcaster.subscribe(format!("m{}", i)).1).collect();

        let report = broadcaster.publish(msg(r#"{"type":"TELEMETRY"}"#));
        assert_eq!(report.delivered, 3);
        assert_eq!(report.dropped, 0);

        for rx in receivers.iter_mut() {
            assert_eq!(&*rx.recv().await.unwrap(), r#"{"type":"TELEMETRY"}"#);
        }
    }

    #[tokio::test]
    async fn test_saturated_subscriber_does_not_block_others() {
        let broadcaster = Broadcaster::new(policy(2, 1000, 0.9));
        let (slow_id, _slow_rx) = broadcaster.subscribe("slow");
        let mut fast: Vec<_> = (0..4).map(|i| broadcaster.subscribe(format!("fast{}", i)).1).collect();

        for i in 0..5 {
            let report = broadcaster.publish(msg(&format!("m{}", i)));
            assert_eq!(report.delivered + report.dropped, 5);
            // Keep fast queues drained
            for rx in fast.iter_mut() {
                assert_eq!(&*rx.recv().await.unwrap(), format!("m{}", i));
            }
        }

        let stats = broadcaster.stats();
        assert_eq!(stats.len(), 5);
        let stats = stats.into_iter().find(|s| s.id == slow_id).unwrap();
        assert_eq!(stats.label, "slow");
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.dropped, 3);
    }

    #[tokio::test]
    async fn test_slow_consumer_disconnected() {
        let broadcaster = Broadcaster::new(policy(1, 4, 0.5));
        let (slow_id, mut slow_rx) = broadcaster.subscribe("slow");

        let mut disconnected = Vec::new();
        for i in 0..4 {
            disconnected.extend(broadcaster.publish(msg(&format!("m{}", i))).disconnected);
        }

        assert_eq!(disconnected, vec![slow_id]);
        assert_eq!(broadcaster.subscriber_count(), 0);
        // Queued message still drains, then the channel closes
        assert_eq!(&*slow_rx.recv().await.unwrap(), "m0");
        assert!(slow_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_occasional_drops_tolerated() {
        let broadcaster = Broadcaster::new(policy(1, 4, 0.5));
        let (id, mut rx) = broadcaster.subscribe("bursty");

        for round in 0..3 {
            // Two delivered, two dropped per window: ratio 0.5 is not above the limit
            broadcaster.publish(msg("a"));
            broadcaster.publish(msg("b"));
            rx.recv().await.unwrap();
            broadcaster.publish(msg("c"));
            let report = broadcaster.publish(msg("d"));
            assert!(report.disconnected.is_empty(), "round {}", round);
            rx.recv().await.unwrap();
        }
        let stats = broadcaster.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].id, id);
        assert_eq!(stats[0].dropped, 6);
    }

    #[test]
    fn test_closed_receiver_removed() {
        let broadcaster = Broadcaster::new(policy(4, 64, 0.5));
        let (id, rx) = broadcaster.subscribe("gone");
        drop(rx);

        let report = broadcaster.publish(msg("x"));
        assert_eq!(report.disconnected, vec![id]);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_unsubscribe() {
        let broadcaster = Broadcaster::default();
        let (id, _rx) = broadcaster.subscribe("m");
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert!(broadcaster.unsubscribe(id));
        assert!(!broadcaster.unsubscribe(id));
        assert_eq!(broadcaster.publish(msg("x")), PublishReport::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_subscribe_concurrent_with_publish() {
        let broadcaster = Arc::new(Broadcaster::new(policy(1024, 64, 0.5)));

        let publisher = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move {
                for i in 0..500 {
                    broadcaster.publish(msg(&i.to_string()));
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut ids = Vec::new();
        for i in 0..50 {
            let (id, rx) = broadcaster.subscribe(format!("m{}", i));
            ids.push((id, rx));
            tokio::task::yield_now().await;
        }
        for (id, _) in ids.iter().step_by(2) {
            broadcaster.unsubscribe(*id);
        }

        publisher.await.unwrap();
        assert_eq!(broadcaster.subscriber_count(), 25);
        assert_eq!(broadcaster.published_count(), 500);
    }
}
