//! Error types for rako-mqttd

use thiserror::Error;

/// Main error type for the application
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("MQTT error: {0}")]
    Mqtt(#[from] MqttError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} exited unexpectedly")]
    TaskExited(&'static str),
}

/// Errors talking to the lighting bridge
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("transport is not open")]
    NotConnected,

    #[error("timeout waiting for the bridge")]
    Timeout,

    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("connection lost")]
    ConnectionLost,

    #[error("retry budget exhausted after {0} consecutive failures")]
    Exhausted(u32),

    #[error("transport has failed permanently")]
    Failed,

    #[error("HTTP request to the bridge failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether the transport can no longer be used
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exhausted(_) | Self::Failed)
    }
}

/// Malformed inbound frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,

    #[error("unsupported frame type 0x{0:02x}")]
    UnsupportedType(u8),

    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("checksum mismatch: expected 0x{expected:02x}, got 0x{actual:02x}")]
    Checksum { expected: u8, actual: u8 },

    #[error("unknown command 0x{0:02x}")]
    UnknownCommand(u8),

    #[error("command 0x{0:02x} is missing its data bytes")]
    MissingData(u8),
}

/// Topology document could not be loaded
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("failed to read topology: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to fetch topology: {0}")]
    Fetch(#[from] reqwest::Error),

    #[error("malformed topology XML: {0}")]
    Xml(#[from] roxmltree::Error),

    #[error("invalid {element} id {value:?}")]
    InvalidId { element: &'static str, value: String },

    #[error("duplicate channel {channel} in room {room}")]
    DuplicateChannel { room: u16, channel: u8 },
}

/// Bridge auto-discovery failed
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("no bridge answered the broadcast probe within {0} seconds")]
    NotFound(u64),
}

/// Rejected MQTT command payload
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("topic {0} is not a command topic")]
    UnknownTopic(String),

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: String },

    #[error("invalid payload: {0}")]
    Payload(String),

    #[error("unrecognized command {0:?}")]
    UnknownCommand(String),

    #[error("payload carries no state, brightness or scene")]
    Empty,
}

/// Errors related to MQTT operations
#[derive(Error, Debug)]
pub enum MqttError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("publish failed: {0}")]
    PublishFailed(String),

    #[error("publish timed out on {0}")]
    PublishTimeout(String),

    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
