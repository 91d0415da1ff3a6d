//! Protocol definitions and constants

use thiserror::Error;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid message type: {0}")]
    InvalidMessageType(u8),

    #[error("Invalid status byte {status} for {message:?}")]
    InvalidStatus { message: MessageType, status: u8 },

    #[error("Invalid port payload ({0} bytes)")]
    InvalidPortPayload(usize),

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Invalid subdomain: {0}")]
    InvalidSubdomain(String),
}

/// Well-known TCP port the server accepts control connections on
pub const CONTROL_PORT: u16 = 4225;

/// Connection ID reserved for control-plane frames
pub const CONTROL_CONNECTION_ID: u32 = 0;

/// Handshake timeout in seconds
pub const HANDSHAKE_TIMEOUT: u64 = 30;

/// Idle timeout in seconds
pub const IDLE_TIMEOUT: u64 = 90;

/// Keepalive interval in seconds
pub const KEEPALIVE_INTERVAL: u64 = 30;

/// Wire message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    NewConnection = 0,
    Data = 1,
    ConnectionClosed = 2,
    Keepalive = 3,
    PortRequest = 4,
    PortResponse = 5,
    PortAssigned = 6,
    SubdomainRequest = 7,
    SubdomainResponse = 8,
    SecretExchange = 9,
    CryptoExchange = 10,
}

impl MessageType {
    /// Whether a non-empty payload of this type travels encrypted.
    ///
    /// Key exchange happens before any key exists, and stream open/close
    /// frames never carry a payload.
    pub fn is_sealed(self) -> bool {
        !matches!(
            self,
            MessageType::CryptoExchange
                | MessageType::NewConnection
                | MessageType::ConnectionClosed
        )
    }
}

impl TryFrom<u8> for MessageType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::NewConnection),
            1 => Ok(MessageType::Data),
            2 => Ok(MessageType::ConnectionClosed),
            3 => Ok(MessageType::Keepalive),
            4 => Ok(MessageType::PortRequest),
            5 => Ok(MessageType::PortResponse),
            6 => Ok(MessageType::PortAssigned),
            7 => Ok(MessageType::SubdomainRequest),
            8 => Ok(MessageType::SubdomainResponse),
            9 => Ok(MessageType::SecretExchange),
            10 => Ok(MessageType::CryptoExchange),
            other => Err(ProtocolError::InvalidMessageType(other)),
        }
    }
}

/// Status byte of PORT_RESPONSE and SUBDOMAIN_RESPONSE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestStatus {
    Success = 0,
    Unavailable = 1,
    Unsupported = 2,
}

impl RequestStatus {
    /// Parse the leading status byte of a response payload
    pub fn from_payload(message: MessageType, payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload.first().copied() {
            Some(0) => Ok(RequestStatus::Success),
            Some(1) => Ok(RequestStatus::Unavailable),
            Some(2) => Ok(RequestStatus::Unsupported),
            Some(status) => Err(ProtocolError::InvalidStatus { message, status }),
            None => Err(ProtocolError::UnexpectedMessage(format!(
                "{:?} without status byte",
                message
            ))),
        }
    }
}

/// Status byte of a server SECRET_EXCHANGE reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SecretStatus {
    Success = 0,
    Rejected = 1,
    NotSet = 2,
}

impl SecretStatus {
    pub fn from_payload(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload.first().copied() {
            Some(0) => Ok(SecretStatus::Success),
            Some(1) => Ok(SecretStatus::Rejected),
            Some(2) => Ok(SecretStatus::NotSet),
            Some(status) => Err(ProtocolError::InvalidStatus {
                message: MessageType::SecretExchange,
                status,
            }),
            None => Err(ProtocolError::UnexpectedMessage(
                "SecretExchange without status byte".to_string(),
            )),
        }
    }
}

/// Port requested by a PORT_REQUEST payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortRequest {
    /// Let the server pick an ephemeral port
    Any,
    /// A specific port
    Specific(u16),
}

impl PortRequest {
    /// Decode a PORT_REQUEST payload: empty means any, otherwise 2 bytes big endian.
    /// A requested port of 0 is also treated as any.
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        match payload {
            [] => Ok(PortRequest::Any),
            [hi, lo] => match u16::from_be_bytes([*hi, *lo]) {
                0 => Ok(PortRequest::Any),
                port => Ok(PortRequest::Specific(port)),
            },
            other => Err(ProtocolError::InvalidPortPayload(other.len())),
        }
    }

    pub fn encode(self) -> Vec<u8> {
        match self {
            PortRequest::Any => Vec::new(),
            PortRequest::Specific(port) => port.to_be_bytes().to_vec(),
        }
    }
}

impl From<Option<u16>> for PortRequest {
    fn from(port: Option<u16>) -> Self {
        match port {
            Some(0) | None => PortRequest::Any,
            Some(port) => PortRequest::Specific(port),
        }
    }
}

/// Decode the 2-byte port carried by PORT_ASSIGNED
pub fn decode_assigned_port(payload: &[u8]) -> Result<u16, ProtocolError> {
    match payload {
        [hi, lo] => Ok(u16::from_be_bytes([*hi, *lo])),
        other => Err(ProtocolError::InvalidPortPayload(other.len())),
    }
}

/// Check that `label` is a usable subdomain label: ASCII letters, digits and hyphens.
pub fn validate_subdomain(label: &str) -> Result<(), ProtocolError> {
    if label.is_empty()
        || label.len() > 63
        || !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
    {
        return Err(ProtocolError::InvalidSubdomain(label.to_string()));
    }
    Ok(())
}
