//! FleetSync Shared Protocol Types
//!
//! This crate provides the wire messages, frame codec and assignment lifecycle
//! shared between the FleetSync server and its channel clients.

pub mod codec;
pub mod proto;
pub mod state_machine;

use std::time::{SystemTime, UNIX_EPOCH};

// Re-export commonly used types at crate root
pub use proto::*;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Limits shared by the server and its clients
pub mod limits {
    /// Interval between client keepalive pings
    pub const PING_INTERVAL_MS: u64 = 5_000;

    /// A client that has not completed the handshake within this window is dropped
    pub const HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

    /// Battery levels are percentages
    pub const BATTERY_MIN: f64 = 0.0;
    pub const BATTERY_MAX: f64 = 100.0;

    pub const LATITUDE_LIMIT: f64 = 90.0;
    pub const LONGITUDE_LIMIT: f64 = 180.0;

    /// Tolerated clock skew when checking credential issue times
    pub const CREDENTIAL_CLOCK_SKEW_MS: u64 = 30_000;
}

/// Builder helpers for creating messages
impl Header {
    /// Create a new header with the given sender and message type
    pub fn new(sender: impl Into<String>, msg_type: MessageType, sequence_id: u64) -> Self {
        Self {
            sender: sender.into(),
            sequence_id,
            timestamp_ms: now_ms(),
            msg_type: msg_type.into(),
        }
    }
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Whether both coordinates are finite and inside the WGS84 ranges
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude.abs() <= limits::LATITUDE_LIMIT
            && self.longitude.abs() <= limits::LONGITUDE_LIMIT
    }
}

impl Envelope {
    /// Wrap a payload with a freshly stamped header
    pub fn new(sender: impl Into<String>, sequence_id: u64, payload: envelope::Payload) -> Self {
        let msg_type = match &payload {
            envelope::Payload::Hello(_) => MessageType::MsgHello,
            envelope::Payload::HelloAck(_) => MessageType::MsgHelloAck,
            envelope::Payload::Join(_) => MessageType::MsgJoin,
            envelope::Payload::UpdateLocation(_) => MessageType::MsgUpdateLocation,
            envelope::Payload::LocationUpdate(_) => MessageType::MsgLocationUpdate,
            envelope::Payload::Ping(_) => MessageType::MsgPing,
            envelope::Payload::Pong(_) => MessageType::MsgPong,
        };

        Self {
            header: Some(Header::new(sender, msg_type, sequence_id)),
            payload: Some(payload),
        }
    }
}

impl Role {
    /// Parse the lowercase role name used by tooling
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "admin" => Some(Role::Admin),
            "operator" => Some(Role::Operator),
            "viewer" => Some(Role::Viewer),
            "device" => Some(Role::Device),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Role::Unspecified => "unspecified",
            Role::Admin => "admin",
            Role::Operator => "operator",
            Role::Viewer => "viewer",
            Role::Device => "device",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_creation() {
        let header = Header::new("drone-001", MessageType::MsgUpdateLocation, 1);
        assert_eq!(header.sender, "drone-001");
        assert_eq!(header.sequence_id, 1);
        assert_eq!(header.msg_type(), MessageType::MsgUpdateLocation);
        assert!(header.timestamp_ms > 0);
    }

    #[test]
    fn test_envelope_stamps_message_type() {
        let envelope = Envelope::new("server", 7, envelope::Payload::Pong(Pong { nonce: 3 }));
        let header = envelope.header.expect("header");
        assert_eq!(header.msg_type(), MessageType::MsgPong);
        assert_eq!(header.sequence_id, 7);
    }

    #[test]
    fn test_geo_point_bounds() {
        assert!(GeoPoint::new(52.52, 13.40).is_valid());
        assert!(GeoPoint::new(-90.0, 180.0).is_valid());
        assert!(!GeoPoint::new(90.5, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.1).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_role_names() {
        assert_eq!(Role::from_name("operator"), Some(Role::Operator));
        assert_eq!(Role::from_name("pilot"), None);
        assert_eq!(Role::Device.name(), "device");
    }
}
