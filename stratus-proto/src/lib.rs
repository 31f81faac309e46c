//! MQTT 3.1.1 wire protocol.
//!
//! [`Packet`] gives every control packet a typed representation, and
//! [`PacketCodec`] frames them over a byte stream for use with
//! `tokio_util::codec::Framed`. Bodies are only parsed once the fixed
//! header's declared length is fully buffered, so the per-packet readers in
//! [`packets`] work on complete buffers and never suspend mid-field.

use std::fmt;
use std::num::NonZeroU16;

mod codec;
mod packets;

pub use codec::{encoded_size, PacketCodec, MAX_REMAINING_LENGTH};
pub use packets::{
    ConnAck, Connect, LastWill, Packet, Publish, SubAck, Subscribe, SubscribeRequest,
    Unsubscribe,
};

/// Protocol name for MQTT 3.1.1 CONNECT packets.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol name sent by 3.1 clients. Decoded, so the server can answer
/// with a proper CONNACK instead of dropping the socket.
pub const PROTOCOL_NAME_LEGACY: &str = "MQIsdp";

/// Protocol level byte for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 0x04;

/// Delivery assurance level.
///
/// Ref: 4.3 Quality of Service levels and protocol flows
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
    ExactlyOnce,
}

impl QoS {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            2 => Some(QoS::ExactlyOnce),
            _ => None,
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
            QoS::ExactlyOnce => 2,
        }
    }
}

/// Identifier correlating a QoS > 0 publish with its acknowledgement.
///
/// Zero is not a legal identifier on the wire, which `NonZeroU16` encodes
/// directly in the type.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PacketId(NonZeroU16);

impl PacketId {
    pub fn new(raw: u16) -> Option<Self> {
        NonZeroU16::new(raw).map(PacketId)
    }

    pub fn get(self) -> u16 {
        self.0.get()
    }
}

impl fmt::Display for PacketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// CONNACK return code.
///
/// Ref: 3.2.2.3 Connect Return code
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectReturnCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadCredentials,
    NotAuthorized,
}

impl ConnectReturnCode {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(ConnectReturnCode::Accepted),
            1 => Some(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Some(ConnectReturnCode::IdentifierRejected),
            3 => Some(ConnectReturnCode::ServerUnavailable),
            4 => Some(ConnectReturnCode::BadCredentials),
            5 => Some(ConnectReturnCode::NotAuthorized),
            _ => None,
        }
    }
}

impl From<ConnectReturnCode> for u8 {
    fn from(code: ConnectReturnCode) -> Self {
        match code {
            ConnectReturnCode::Accepted => 0,
            ConnectReturnCode::UnacceptableProtocolVersion => 1,
            ConnectReturnCode::IdentifierRejected => 2,
            ConnectReturnCode::ServerUnavailable => 3,
            ConnectReturnCode::BadCredentials => 4,
            ConnectReturnCode::NotAuthorized => 5,
        }
    }
}

/// Per-filter SUBACK return code: the granted QoS, or 0x80 for a refused
/// filter.
///
/// Ref: 3.9.3 SUBACK payload
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SubscribeReturnCode {
    Success(QoS),
    Failure,
}

impl SubscribeReturnCode {
    pub(crate) fn from_u8(code: u8) -> Option<Self> {
        match code {
            0x80 => Some(SubscribeReturnCode::Failure),
            code => QoS::from_u8(code).map(SubscribeReturnCode::Success),
        }
    }
}

impl From<SubscribeReturnCode> for u8 {
    fn from(code: SubscribeReturnCode) -> Self {
        match code {
            SubscribeReturnCode::Success(qos) => qos.into(),
            SubscribeReturnCode::Failure => 0x80,
        }
    }
}

/// Everything that can go wrong turning bytes into packets.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("packet body ended in the middle of a field")]
    ShortRead,

    #[error("remaining length does not terminate within four bytes")]
    MalformedRemainingLength,

    #[error("malformed CONNECT packet: {0}")]
    MalformedConnect(&'static str),

    #[error("string field is not valid utf-8")]
    InvalidUtf8(#[source] std::str::Utf8Error),

    #[error("{0} bytes left over after the declared packet body")]
    TrailingBytes(usize),

    #[error("unknown control packet type {0}")]
    UnknownPacketType(u8),

    #[error("control packet type {packet_type} carries invalid flags 0x{flags:02X}")]
    InvalidFlags { packet_type: u8, flags: u8 },

    #[error("invalid QoS value {0}")]
    InvalidQoS(u8),

    #[error("packet identifier must not be zero")]
    ZeroPacketId,

    #[error("unknown CONNACK return code {0}")]
    UnknownReturnCode(u8),

    #[error("CONNACK acknowledge flags must be 0 or 1")]
    MalformedConnAck,

    #[error("declared packet length {0} exceeds the limit of {1} bytes")]
    PacketTooLarge(usize, usize),

    #[error("a SUBSCRIBE or UNSUBSCRIBE packet must name at least one topic")]
    NoTopics,

    #[error("PUBLISH with QoS 0 must not set the dup flag")]
    DupOnQoS0,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything that can go wrong turning packets into bytes.
#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    #[error("string of {0} bytes does not fit a two-byte length prefix")]
    StringTooLong(usize),

    #[error("binary field of {0} bytes does not fit a two-byte length prefix")]
    BinaryTooLong(usize),

    #[error("packet body of {0} bytes exceeds the maximum remaining length")]
    PacketTooLong(usize),

    #[error("a QoS 1 or 2 PUBLISH needs a packet identifier")]
    MissingPacketId,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
