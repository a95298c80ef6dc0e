//! Fan-out of validated telemetry to monitoring subscribers
//!
//! Each subscriber gets a bounded queue. A full queue drops the message for
//! that subscriber only; persistent slow consumers are disconnected.

mod broadcaster;

pub use broadcaster::{BackpressurePolicy, Broadcaster, PublishReport, SubscriberId, SubscriberStats};
