//! Message types carried through the mesh.

use crate::topic::Topic;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A message routed through the mesh: either application data or a command
/// destined for a replicated data store.
///
/// Payloads are opaque to the routing core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Application data published on a topic.
    Data {
        /// The topic the payload was published on.
        topic: Topic,
        /// Opaque application payload.
        payload: Bytes,
    },
    /// A store command addressed to the master or clones listening on `topic`.
    Command {
        /// The store's command topic.
        topic: Topic,
        /// The command envelope.
        command: StoreCommand,
    },
}

impl Message {
    /// Create a data message.
    pub const fn data(topic: Topic, payload: Bytes) -> Self {
        Self::Data { topic, payload }
    }

    /// Create a command message.
    pub const fn command(topic: Topic, command: StoreCommand) -> Self {
        Self::Command { topic, command }
    }

    /// The topic this message was published on.
    pub const fn topic(&self) -> &Topic {
        match self {
            Self::Data { topic, .. } | Self::Command { topic, .. } => topic,
        }
    }

    /// Whether this is a data message.
    pub const fn is_data(&self) -> bool {
        matches!(self, Self::Data { .. })
    }

    /// Whether this is a command message.
    pub const fn is_command(&self) -> bool {
        matches!(self, Self::Command { .. })
    }

    /// The data payload, if this is a data message.
    pub const fn payload(&self) -> Option<&Bytes> {
        match self {
            Self::Data { payload, .. } => Some(payload),
            Self::Command { .. } => None,
        }
    }
}

/// An opaque command for the replicated data-store layer.
///
/// The store actors en- and decode this envelope; the routing core only moves
/// it between endpoints.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCommand(pub Bytes);

impl StoreCommand {
    /// Wrap raw command bytes.
    pub const fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// The raw command bytes.
    pub const fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Data { topic, payload } => {
                write!(f, "data({topic}, {} bytes)", payload.len())
            }
            Self::Command { topic, command } => {
                write!(f, "command({topic}, {} bytes)", command.0.len())
            }
        }
    }
}
