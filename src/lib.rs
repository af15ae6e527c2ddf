//! Streaming packet protocol for live tomographic reconstruction.
//!
//! Acquisition software pushes geometry, calibration frames and projections
//! to a reconstruction server, while viewers request arbitrary slices and get
//! exactly one reconstructed `slice_data` packet back per request.
//!
//! # Features
//!
//! - **Packet codec**: length-prefixed little-endian frames with strict decoding
//! - **Scene store**: per-scene state with copy-on-write snapshots
//! - **Dispatch**: a single serialized worker or a fan-out pool of worker threads
//! - **Plugins**: optional post-processing of slices over a side channel
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use tomostream::client::VisualizationClient;
//! use tomostream::publisher::{PublishMode, Publisher};
//! use tomostream::transport::Endpoint;
//! use tomostream::types::{Orientation, SliceRequest};
//!
//! # async fn example(packets: Vec<tomostream::packet::Packet>) -> tomostream::Result<()> {
//! let mut publisher = Publisher::connect(&Endpoint::localhost(5558), PublishMode::RequestConfirm).await?;
//! publisher.send_acquisition(packets).await?;
//!
//! let mut viewer = VisualizationClient::connect(&Endpoint::localhost(5555)).await?;
//! let slice_id = viewer.next_slice_id();
//! let request = SliceRequest::new(slice_id, Orientation::axial([0.0, 0.0, 0.5]), [256, 256]);
//! let slice = viewer.request_slice(0, request).await?;
//! println!("slice {} has {} pixels", slice.slice_id, slice.data.len());
//! # Ok(())
//! # }
//! ```

mod error;
#[cfg(any(test, feature = "benchmark"))]
pub mod test_utils;

pub mod client;
pub mod config;
pub mod dispatch;
pub mod logging;
pub mod packet;
pub mod plugin;
pub mod publisher;
pub mod reconstructor;
pub mod scene;
pub mod server;
pub mod transport;
pub mod types;

pub use error::*;

pub use client::VisualizationClient;
pub use config::ServerConfig;
pub use dispatch::Dispatcher;
pub use packet::{DecodeError, Packet, PacketKind};
pub use publisher::{PublishMode, Publisher};
pub use reconstructor::SliceReconstructor;
pub use scene::{SceneSnapshot, SceneStore};
pub use server::{Server, ServerState, ShutdownHandle};
pub use transport::Endpoint;
