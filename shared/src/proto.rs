//! Wire messages exchanged over the FleetSync channel
//!
//! Messages are declared with the prost derives directly so the crate has no
//! build-time protoc dependency. Tags are part of the wire contract; never
//! renumber an existing field.

/// Message type carried in every header
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    MsgUnknown = 0,
    MsgHello = 1,
    MsgHelloAck = 2,
    MsgJoin = 3,
    MsgUpdateLocation = 4,
    MsgLocationUpdate = 5,
    MsgPing = 6,
    MsgPong = 7,
}

/// Role carried by an authenticated principal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum Role {
    Unspecified = 0,
    Admin = 1,
    Operator = 2,
    Viewer = 3,
    Device = 4,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Header {
    /// Principal or device that produced the frame ("server" for server frames)
    #[prost(string, tag = "1")]
    pub sender: String,
    #[prost(uint64, tag = "2")]
    pub sequence_id: u64,
    #[prost(uint64, tag = "3")]
    pub timestamp_ms: u64,
    #[prost(enumeration = "MessageType", tag = "4")]
    pub msg_type: i32,
}

#[derive(Clone, Copy, PartialEq, ::prost::Message)]
pub struct GeoPoint {
    #[prost(double, tag = "1")]
    pub latitude: f64,
    #[prost(double, tag = "2")]
    pub longitude: f64,
}

/// First frame on every channel; carries the bearer credential
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Hello {
    #[prost(string, tag = "1")]
    pub credential: String,
}

/// Sent by the server once the handshake credential validated
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HelloAck {
    #[prost(uint64, tag = "1")]
    pub connection_id: u64,
    #[prost(string, tag = "2")]
    pub principal_id: String,
    #[prost(enumeration = "Role", tag = "3")]
    pub role: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Join {
    #[prost(string, tag = "1")]
    pub principal_id: String,
}

/// Periodic telemetry from a device (client -> server)
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LocationReport {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(message, optional, tag = "2")]
    pub location: Option<GeoPoint>,
    #[prost(double, tag = "3")]
    pub battery_level: f64,
}

/// Broadcast to every registered channel after a report is applied
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct LocationUpdate {
    #[prost(string, tag = "1")]
    pub device_id: String,
    #[prost(message, optional, tag = "2")]
    pub location: Option<GeoPoint>,
    #[prost(double, tag = "3")]
    pub battery_level: f64,
    #[prost(string, tag = "4")]
    pub display_name: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Pong {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

/// Signed body of a bearer credential
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CredentialClaims {
    #[prost(string, tag = "1")]
    pub key_id: String,
    #[prost(string, tag = "2")]
    pub principal_id: String,
    #[prost(enumeration = "Role", tag = "3")]
    pub role: i32,
    #[prost(uint64, tag = "4")]
    pub issued_at_ms: u64,
    #[prost(uint64, tag = "5")]
    pub expires_at_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(message, optional, tag = "1")]
    pub header: Option<Header>,
    #[prost(oneof = "envelope::Payload", tags = "2, 3, 4, 5, 6, 7, 8")]
    pub payload: Option<envelope::Payload>,
}

pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Payload {
        #[prost(message, tag = "2")]
        Hello(super::Hello),
        #[prost(message, tag = "3")]
        HelloAck(super::HelloAck),
        #[prost(message, tag = "4")]
        Join(super::Join),
        #[prost(message, tag = "5")]
        UpdateLocation(super::LocationReport),
        #[prost(message, tag = "6")]
        LocationUpdate(super::LocationUpdate),
        #[prost(message, tag = "7")]
        Ping(super::Ping),
        #[prost(message, tag = "8")]
        Pong(super::Pong),
    }
}
