//! Connection management for the reporter's channel to the server
//!
//! This module handles:
//! - Persistent TCP connection with automatic reconnection and backoff
//! - The Hello/HelloAck handshake and Join
//! - Bidirectional message streaming
//! - Keepalive pings

mod manager;

pub use manager::{ConnectionConfig, ConnectionEvent, ConnectionManager};
