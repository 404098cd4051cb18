//! # Weft Core
//!
//! Core building blocks for the weft peer-to-peer publish/subscribe mesh.
//!
//! This crate provides:
//! - Hierarchical topics and prefix-based subscription filters
//! - Reference-counted item envelopes backed by a bounded pool
//! - The binary frame protocol spoken between peers
//! - Endpoint configuration with file and environment loading
//! - Logging bootstrap
//!
//! ## Examples
//!
//! ```rust
//! use weft_core::{Topic, Filter};
//!
//! let topic = Topic::parse("sensors/rack1/temp").unwrap();
//! let filter = Filter::from_topics([Topic::parse("sensors").unwrap()]);
//! assert!(filter.matches(&topic));
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod item;
pub mod message;
pub mod protocol;
pub mod telemetry;
pub mod topic;
pub mod types;

pub use config::{Config, Verbosity};
pub use error::{Error, Result};
pub use item::{ItemOrigin, ItemPool, ItemRef, ItemScope};
pub use message::{Message, StoreCommand};
pub use topic::{Filter, Topic};
pub use types::{EndpointId, SequenceNumber};

/// Re-export of commonly used types.
pub mod prelude {
    pub use crate::protocol::{Frame, FrameDecoder, FrameEncoder, FrameType};
    pub use crate::{Config, EndpointId, Error, Filter, Message, Result, Topic};
    pub use bytes::Bytes;
}
