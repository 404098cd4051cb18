//! Binary frame protocol spoken between directly connected peers.
//!
//! Frames are big-endian and length-prefixed: a 1-byte frame type, an 8-byte
//! sequence number, a 4-byte payload length, then the payload. Payloads are
//! bincode-encoded structures defined in [`frame`].
//!
//! ```text
//! +------+----------------------------+--------------+-----------------+
//! | type | sequence (8 bytes, BE)     | length (BE)  | payload ...     |
//! +------+----------------------------+--------------+-----------------+
//! ```
//!
//! Sequence numbers cover the frame kinds that participate in gap detection
//! (`item`, `sub_update`, `path_update`, `fin`); control frames carry zero.
//! Only `item` frames consume flow-control credit.

pub mod codec;
pub mod frame;

pub use codec::{DecoderStats, FrameDecoder, FrameEncoder};
pub use frame::{
    protocol_ident, CreditGrant, Frame, FrameType, GapReport, Handshake, NodeMessage,
    PathWithdrawal, SubscriptionAdvert, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION,
};
