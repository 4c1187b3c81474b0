//! Connection management for WebSocket connections
//!
//! This module provides:
//! - Connection handles and per-IP admission control
//! - Tab identity resolution with duplicate and auth-conflict detection
//! - Disconnect statistics

mod registry;
mod stats;
mod tabs;
mod types;

pub use registry::ConnectionManager;
pub use stats::{ConnectionStats, DisconnectReason, DisconnectStats, ReasonCount};
pub use tabs::{IdentifyOutcome, IdentifyRequest, TabResolver, TabSession};
pub use types::{ConnectionError, ConnectionHandle, ConnectionMeta};
