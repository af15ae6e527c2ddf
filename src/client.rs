//! Request/reply client for viewers.
//!
//! Each request is answered by exactly one `slice_data` packet carrying the
//! request's `slice_id`. A timeout or transport failure drops the connection,
//! so a late reply can never be read as the answer to a later request; the
//! next call connects again.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::packet::frame::{self, DEFAULT_MAX_FRAME_LEN};
use crate::packet::{Packet, RemoveSlicePacket, SetSlicePacket, SliceDataPacket};
use crate::transport::Endpoint;
use crate::types::{SceneId, SliceId, SliceRequest};
use crate::{Result, StreamError};

pub struct VisualizationClient {
    endpoint: Endpoint,
    stream: Option<TcpStream>,
    next_slice_id: SliceId,
    timeout: Option<Duration>,
}

impl VisualizationClient {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self> {
        let stream = endpoint.connect().await?;
        debug!(endpoint = %endpoint, "Viewer connected");
        Ok(Self { endpoint: endpoint.clone(), stream: Some(stream), next_slice_id: 0, timeout: None })
    }

    /// Bound the wait for each reply.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Whether a connection is open; `false` after a failed round trip.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// A fresh slice id, unique for this client.
    pub fn next_slice_id(&mut self) -> SliceId {
        let id = self.next_slice_id;
        self.next_slice_id = self.next_slice_id.wrapping_add(1).max(0);
        id
    }

    /// Request one slice and wait for its reply.
    pub async fn request_slice(&mut self, scene_id: SceneId, request: SliceRequest) -> Result<SliceDataPacket> {
        let slice_id = request.slice_id;
        let reply = self.round_trip(SetSlicePacket { scene_id, request }.into()).await?;
        if reply.slice_id != slice_id {
            return Err(StreamError::transport(format!(
                "reply for slice {} does not match request {}",
                reply.slice_id, slice_id
            )));
        }
        trace!(scene_id, slice_id, shape = ?reply.shape, "Slice received");
        Ok(reply)
    }

    /// Drop a slice from the server's registry.
    pub async fn remove_slice(&mut self, scene_id: SceneId, slice_id: SliceId) -> Result<()> {
        self.round_trip(RemoveSlicePacket { scene_id, slice_id }.into()).await?;
        Ok(())
    }

    /// Send any packet and return the `slice_data` answer.
    pub async fn round_trip(&mut self, packet: Packet) -> Result<SliceDataPacket> {
        let bytes = packet.encode()?;
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => {
                debug!(endpoint = %self.endpoint, "Reconnecting viewer");
                self.endpoint.connect().await?
            }
        };

        let result = match self.timeout {
            Some(duration) => tokio::time::timeout(duration, Self::exchange(&mut stream, &bytes, &self.endpoint))
                .await
                .unwrap_or_else(|_| Err(StreamError::Timeout { duration })),
            None => Self::exchange(&mut stream, &bytes, &self.endpoint).await,
        };

        match &result {
            Ok(_) => self.stream = Some(stream),
            Err(e) => warn!(endpoint = %self.endpoint, error = %e, "Dropping viewer connection"),
        }
        result
    }

    async fn exchange(stream: &mut TcpStream, bytes: &[u8], endpoint: &Endpoint) -> Result<SliceDataPacket> {
        frame::write_frame(stream, bytes).await?;
        let payload = frame::read_frame(stream, DEFAULT_MAX_FRAME_LEN)
            .await?
            .ok_or_else(|| StreamError::transport(format!("{endpoint} closed the connection")))?;
        match Packet::decode(&payload)? {
            Packet::SliceData(reply) => Ok(reply),
            other => Err(StreamError::transport(format!("expected slice_data, received {}", other.kind()))),
        }
    }
}
