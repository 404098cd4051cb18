//! # Weft Mesh
//!
//! The endpoint side of the weft peer-to-peer publish/subscribe mesh:
//! path-vector routing over direct peerings, a credit-flow-controlled frame
//! transport, and a reference-counted dispatch pipeline between local
//! producers/consumers and the mesh.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use weft_mesh::{Endpoint, Topic};
//! use bytes::Bytes;
//!
//! # async fn example() -> weft_mesh::Result<()> {
//! let endpoint = Endpoint::new(weft_mesh::Config::default())?;
//! let port = endpoint.listen("127.0.0.1", 0).await?;
//! println!("listening on {port}");
//!
//! let subscriber = endpoint.subscribe([Topic::parse("sensors")?])?;
//! endpoint.publish(Topic::parse("sensors/temp")?, Bytes::from_static(b"21.5"))?;
//! let item = subscriber.recv().await.expect("one delivery");
//! assert_eq!(item.topic().as_str(), "sensors/temp");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod connector;
mod dispatch;
mod queue;
mod recorder;
mod transport;

pub mod endpoint;
pub mod routing;
pub mod status;

pub use endpoint::{Endpoint, Publisher, Subscriber};
pub use status::{Status, StatusCode};

// Core types applications need alongside the endpoint.
pub use weft_core::{
    Config, EndpointId, Error, Filter, ItemRef, Message, Result, StoreCommand, Topic, Verbosity,
};
