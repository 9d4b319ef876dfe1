//! Peer connection handling.
//!
//! This module provides:
//! - Connection and endpoint identification
//! - Connection state machine with the outbound ping driver
//! - Per-connection read/write task

pub mod connection;
pub mod info;
pub mod state;

// Re-export main types
pub use connection::{run_connection, spawn_inbound, ConnectionCommand, ConnectionEvent};
pub use info::{ConnectionDirection, ConnectionId, Endpoint};
pub use state::{Connection, ConnectionAction, ConnectionState};
