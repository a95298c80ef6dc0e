//! Gateway connection management
//!
//! This module handles:
//! - Persistent WebSocket connection to the gateway with automatic reconnection
//! - Exponential backoff between failed attempts
//! - Bidirectional message streaming

mod manager;

pub use manager::{ConnectionEvent, ConnectionManager};
