//! Frame structure and the payloads it carries.

use crate::error::{Error, Result};
use crate::message::Message;
use crate::topic::Topic;
use crate::types::EndpointId;
use bytes::{BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Current protocol version. Endpoints refuse peers announcing a different
/// identifier during the handshake.
pub const PROTOCOL_VERSION: u8 = 1;

/// The protocol identifier exchanged in `hello` frames.
pub fn protocol_ident() -> String {
    format!("broker.v{PROTOCOL_VERSION}")
}

/// Frame header size in bytes: 1-byte type, 8-byte sequence, 4-byte length.
pub const FRAME_HEADER_SIZE: usize = 13;

/// Maximum payload size in bytes (16 MiB).
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Frame type discriminator, the first byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    /// Handshake announcement; first frame in both directions.
    Hello = 0x01,
    /// A routed item: message, TTL, and traversal path.
    Item = 0x02,
    /// Subscription advertisement for the path-vector protocol.
    SubUpdate = 0x03,
    /// Path withdrawal for destinations that became unreachable.
    PathUpdate = 0x04,
    /// Liveness probe.
    Heartbeat = 0x05,
    /// Cumulative acknowledgment plus credit grant.
    Ack = 0x06,
    /// Gap report asking for retransmission.
    Nack = 0x07,
    /// Graceful stream termination.
    Fin = 0x08,
}

impl FrameType {
    /// Parse the wire discriminator.
    ///
    /// # Errors
    /// Returns [`Error::ProtocolViolation`] for unknown values.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::Item),
            0x03 => Ok(Self::SubUpdate),
            0x04 => Ok(Self::PathUpdate),
            0x05 => Ok(Self::Heartbeat),
            0x06 => Ok(Self::Ack),
            0x07 => Ok(Self::Nack),
            0x08 => Ok(Self::Fin),
            _ => Err(Error::protocol(format!("unknown frame type 0x{value:02x}"))),
        }
    }

    /// The wire discriminator.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether frames of this type occupy the per-link sequence space and
    /// therefore participate in gap detection and retransmission.
    #[must_use]
    pub const fn takes_sequence(self) -> bool {
        matches!(self, Self::Item | Self::SubUpdate | Self::PathUpdate | Self::Fin)
    }

    /// Whether frames of this type consume one flow-control credit.
    #[must_use]
    pub const fn consumes_credit(self) -> bool {
        matches!(self, Self::Item)
    }
}

/// A single protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    frame_type: FrameType,
    sequence: u64,
    payload: Bytes,
}

impl Frame {
    /// Create a frame with the given type, sequence, and payload.
    ///
    /// # Errors
    /// Returns [`Error::ProtocolViolation`] if the payload exceeds
    /// [`MAX_PAYLOAD_SIZE`].
    pub fn new(frame_type: FrameType, sequence: u64, payload: Bytes) -> Result<Self> {
        if payload.len() > MAX_PAYLOAD_SIZE as usize {
            return Err(Error::protocol(format!(
                "payload of {} bytes exceeds the {MAX_PAYLOAD_SIZE}-byte cap",
                payload.len()
            )));
        }
        Ok(Self { frame_type, sequence, payload })
    }

    /// Create a heartbeat frame.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self { frame_type: FrameType::Heartbeat, sequence: 0, payload: Bytes::new() }
    }

    /// Create a graceful-termination frame.
    #[must_use]
    pub fn fin(sequence: u64) -> Self {
        Self { frame_type: FrameType::Fin, sequence, payload: Bytes::new() }
    }

    /// Create a handshake frame.
    ///
    /// # Errors
    /// Returns an error if the handshake fails to serialize.
    pub fn hello(handshake: &Handshake) -> Result<Self> {
        Self::with_encoded(FrameType::Hello, 0, handshake)
    }

    /// Create an item frame.
    ///
    /// # Errors
    /// Returns an error if the message fails to serialize or exceeds the
    /// payload cap.
    pub fn item(sequence: u64, message: &NodeMessage) -> Result<Self> {
        Self::with_encoded(FrameType::Item, sequence, message)
    }

    /// Create a subscription-advertisement frame.
    ///
    /// # Errors
    /// Returns an error if the advertisement fails to serialize.
    pub fn sub_update(sequence: u64, advert: &SubscriptionAdvert) -> Result<Self> {
        Self::with_encoded(FrameType::SubUpdate, sequence, advert)
    }

    /// Create a path-withdrawal frame.
    ///
    /// # Errors
    /// Returns an error if the withdrawal fails to serialize.
    pub fn path_update(sequence: u64, withdrawal: &PathWithdrawal) -> Result<Self> {
        Self::with_encoded(FrameType::PathUpdate, sequence, withdrawal)
    }

    /// Create an acknowledgment frame.
    ///
    /// # Errors
    /// Returns an error if the grant fails to serialize.
    pub fn ack(grant: &CreditGrant) -> Result<Self> {
        Self::with_encoded(FrameType::Ack, 0, grant)
    }

    /// Create a gap-report frame.
    ///
    /// # Errors
    /// Returns an error if the report fails to serialize.
    pub fn nack(report: &GapReport) -> Result<Self> {
        Self::with_encoded(FrameType::Nack, 0, report)
    }

    fn with_encoded<T: Serialize>(frame_type: FrameType, sequence: u64, value: &T) -> Result<Self> {
        let payload = Bytes::from(bincode::serialize(value)?);
        Self::new(frame_type, sequence, payload)
    }

    /// Decode the payload as the given structure.
    ///
    /// # Errors
    /// Returns [`Error::ProtocolViolation`] on malformed payloads.
    pub fn decode_payload<T: DeserializeOwned>(&self) -> Result<T> {
        bincode::deserialize(&self.payload).map_err(|e| {
            Error::protocol(format!("malformed {:?} payload: {e}", self.frame_type))
        })
    }

    /// The frame type.
    #[must_use]
    pub const fn frame_type(&self) -> FrameType {
        self.frame_type
    }

    /// The sequence number. Zero for control frames.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// The raw payload.
    #[must_use]
    pub const fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Total size on the wire, header included.
    #[must_use]
    pub const fn encoded_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Append the wire representation to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u8(self.frame_type.as_u8());
        buf.put_u64(self.sequence);
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
    }

    /// The wire representation as a standalone buffer.
    #[must_use]
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }
}

/// Payload of a `hello` frame: both sides announce themselves before any
/// other traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Protocol identifier, see [`protocol_ident`].
    pub ident: String,
    /// The announcing endpoint.
    pub endpoint: EndpointId,
    /// Credit window this side grants to the sender, in items.
    pub credit_window: u32,
}

/// Payload of an `item` frame: one message with its forwarding metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMessage {
    /// The routed message.
    pub message: Message,
    /// Remaining hops. Decremented by the sender at each forward.
    pub ttl: u16,
    /// Endpoints the item has visited, origin first. Used for loop
    /// suppression.
    pub path: Vec<EndpointId>,
}

/// Payload of a `sub_update` frame: a versioned filter announcement that is
/// flooded through the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionAdvert {
    /// The endpoint whose filter this is.
    pub origin: EndpointId,
    /// The origin's effective subscription prefixes.
    pub filter: Vec<Topic>,
    /// Monotonically increasing per-origin version.
    pub version: u64,
    /// Relay endpoints the announcement traveled through, oldest first. The
    /// origin itself is not part of the path, so an advert received directly
    /// carries an empty path.
    pub path: Vec<EndpointId>,
}

/// Payload of a `path_update` frame: destinations the sender can no longer
/// reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathWithdrawal {
    /// The endpoint issuing the withdrawal.
    pub origin: EndpointId,
    /// Monotonically increasing per-origin version, shared with adverts.
    pub version: u64,
    /// Destinations withdrawn by the origin.
    pub destinations: Vec<EndpointId>,
    /// Relay endpoints the withdrawal traveled through, oldest first.
    pub path: Vec<EndpointId>,
}

/// Payload of an `ack` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditGrant {
    /// Highest sequence received in order.
    pub acked: u64,
    /// Credit window granted to the sender, in items.
    pub window: u32,
}

/// Payload of a `nack` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapReport {
    /// First sequence number the receiver is missing.
    pub missing_from: u64,
}
