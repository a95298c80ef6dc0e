//! Control command dispatch for the gateway
//!
//! This module handles:
//! - Routing operator commands to the owning device session
//! - Bounded waits on the device's outbound queue
//! - Marking sessions stale when a write fails

mod dispatcher;

pub use dispatcher::{ControlCommand, ControlDispatcher};
