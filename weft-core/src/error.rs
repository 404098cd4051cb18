//! Error types for the weft core library.

use thiserror::Error;

/// Main error type for weft operations.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// Bad input to topic construction.
    #[error("invalid topic: {reason}")]
    InvalidTopic {
        /// Why the topic was rejected.
        reason: String,
    },

    /// A bounded queue or the item pool is full; the caller may retry.
    #[error("backpressure: bounded capacity exhausted")]
    Backpressure,

    /// The transport could not reach a configured peer after retries.
    #[error("peer unavailable: {addr}")]
    PeerUnavailable {
        /// The address that could not be reached.
        addr: String,
    },

    /// Protocol-version mismatch during the peer handshake.
    #[error("incompatible peer: expected protocol {expected}, got {actual}")]
    PeerIncompatible {
        /// The locally spoken protocol identifier.
        expected: String,
        /// The identifier announced by the remote peer.
        actual: String,
    },

    /// Malformed frame or invalid advertisement from a peer.
    #[error("protocol violation: {reason}")]
    ProtocolViolation {
        /// What the peer sent that broke the protocol.
        reason: String,
    },

    /// The retransmit buffer could not satisfy a NACK.
    #[error("nack exhausted: sequence {sequence} no longer buffered")]
    NackExhausted {
        /// First sequence number the receiver asked for.
        sequence: u64,
    },

    /// Operation rejected because the endpoint is terminating.
    #[error("endpoint is shutting down")]
    Shutdown,

    /// Configuration errors.
    #[error("configuration error: {reason}")]
    Config {
        /// Description of the invalid setting.
        reason: String,
    },

    /// I/O errors from the transport or the recorder.
    #[error("i/o error: {reason}")]
    Io {
        /// Stringified source error.
        reason: String,
    },
}

/// Result type alias for weft operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for a [`Error::ProtocolViolation`].
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::ProtocolViolation { reason: reason.into() }
    }

    /// Shorthand for a [`Error::Config`].
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config { reason: reason.into() }
    }

    /// Shorthand for an [`Error::InvalidTopic`].
    pub fn invalid_topic(reason: impl Into<String>) -> Self {
        Self::InvalidTopic { reason: reason.into() }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io { reason: err.to_string() }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Self::ProtocolViolation { reason: err.to_string() }
    }
}
