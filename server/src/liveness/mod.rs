//! Liveness tracking for device sessions
//!
//! A periodic sweep moves silent sessions to `stale` and evicts sessions
//! that stay stale past the grace period.

mod sweeper;

pub use sweeper::{LivenessPolicy, LivenessSweeper, SweepReport};
