//! Status and error events surfaced on the internal topics.
//!
//! Events are delivered as data messages on `<$>/local/data/statuses` and
//! `<$>/local/data/errors`, so applications observe them through a normal
//! subscription. They are local-only by construction and never cross a peer
//! boundary.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use weft_core::topic::well_known;
use weft_core::{EndpointId, Error, Message};

/// Classification of a status event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    /// A direct peering was established.
    PeerAdded,
    /// A direct peering was closed gracefully.
    PeerRemoved,
    /// A direct peering was lost to an error or timeout.
    PeerLost,
    /// A configured peer could not be reached within the retry bound.
    PeerUnavailable,
    /// A new endpoint was learned through routing announcements.
    EndpointDiscovered,
    /// The last route to an endpoint went away.
    EndpointUnreachable,
}

/// A status event published on the statuses topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// What happened.
    pub code: StatusCode,
    /// The peer or endpoint concerned, when known.
    pub peer: Option<EndpointId>,
    /// Human-readable context.
    pub message: String,
}

impl Status {
    /// Create a status event.
    pub fn new(code: StatusCode, peer: Option<EndpointId>, message: impl Into<String>) -> Self {
        Self { code, peer, message: message.into() }
    }

    /// Render as a data message on the statuses topic.
    pub fn to_message(&self) -> Message {
        let payload = serde_json::to_vec(self).unwrap_or_default();
        Message::data(well_known::STATUSES.clone(), Bytes::from(payload))
    }

    /// Parse a status event back out of a payload.
    pub fn from_payload(payload: &Bytes) -> Option<Self> {
        serde_json::from_slice(payload).ok()
    }
}

/// Render an error as a data message on the errors topic.
pub fn error_message(error: &Error) -> Message {
    #[derive(Serialize)]
    struct ErrorEvent<'a> {
        kind: &'a str,
        description: String,
    }
    let kind = match error {
        Error::InvalidTopic { .. } => "invalid_topic",
        Error::Backpressure => "backpressure",
        Error::PeerUnavailable { .. } => "peer_unavailable",
        Error::PeerIncompatible { .. } => "peer_incompatible",
        Error::ProtocolViolation { .. } => "protocol_violation",
        Error::NackExhausted { .. } => "nack_exhausted",
        Error::Shutdown => "shutdown",
        Error::Config { .. } => "config",
        Error::Io { .. } => "io",
    };
    let payload = serde_json::to_vec(&ErrorEvent { kind, description: error.to_string() })
        .unwrap_or_default();
    Message::data(well_known::ERRORS.clone(), Bytes::from(payload))
}
