//! Session management for connected channel clients
//!
//! This module handles:
//! - The registry mapping online principals to their channel
//! - Per-connection handles, frame reading and the writer task

mod connection;
mod registry;

pub use connection::{spawn_writer, ChannelHandle, ChannelReader, ConnectionId, DeliveryError};
pub use registry::ConnectionRegistry;
