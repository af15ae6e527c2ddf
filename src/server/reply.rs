//! Viewer request/reply handling.
//!
//! Slice registrations are not written here: `set_slice` and `remove_slice`
//! are forwarded to the ingest loop, the only writer of scene state. Each
//! connection tracks what it registered, evicts the oldest entry past
//! [`MAX_SLICES_PER_VIEWER`] and unregisters everything when it closes.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use super::ShutdownHandle;
use crate::Result;
use crate::dispatch::Dispatcher;
use crate::packet::frame;
use crate::packet::{Packet, RemoveSlicePacket, SetSlicePacket, SliceDataPacket};
use crate::plugin::{SlicePlugin, process_or_passthrough};
use crate::scene::SceneStore;
use crate::types::{SceneId, SliceId};

/// Slice id used when a reply cannot be correlated with a request.
pub const UNCORRELATED_SLICE_ID: i32 = -1;

/// Registered slices one viewer connection may hold at a time.
pub const MAX_SLICES_PER_VIEWER: usize = 64;

/// Everything a reply connection needs, shared across connections.
pub(super) struct ReplyContext {
    pub scenes: Arc<SceneStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub plugin: Arc<dyn SlicePlugin>,
    /// Feeds slice registrations to the ingest loop.
    pub registry: mpsc::Sender<Packet>,
    pub slice_size: u32,
    pub max_frame_len: u32,
}

/// Slices registered by one viewer connection, oldest first.
#[derive(Debug, Default)]
pub(super) struct ViewerSlices {
    active: VecDeque<(SceneId, SliceId)>,
}

impl ViewerSlices {
    /// Track a registration; returns the entry evicted to stay within the cap.
    fn track(&mut self, scene_id: SceneId, slice_id: SliceId) -> Option<(SceneId, SliceId)> {
        self.forget(scene_id, slice_id);
        self.active.push_back((scene_id, slice_id));
        if self.active.len() > MAX_SLICES_PER_VIEWER { self.active.pop_front() } else { None }
    }

    fn forget(&mut self, scene_id: SceneId, slice_id: SliceId) {
        self.active.retain(|entry| *entry != (scene_id, slice_id));
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }
}

impl ReplyContext {
    /// Answer one request with exactly one `slice_data` packet.
    pub async fn answer(&self, packet: Packet, slices: &mut ViewerSlices) -> SliceDataPacket {
        match packet {
            Packet::SetSlice(set) => {
                let scene_id = set.scene_id;
                let request = set.request.with_default_shape(self.slice_size);
                let slice_id = request.slice_id;

                self.register(SetSlicePacket { scene_id, request: request.clone() }.into()).await;
                if let Some((scene_id, slice_id)) = slices.track(scene_id, slice_id) {
                    debug!(scene_id, slice_id, "Viewer slice limit reached, unregistering the oldest");
                    self.register(RemoveSlicePacket { scene_id, slice_id }.into()).await;
                }
                let reply = self.dispatcher.dispatch(self.scenes.snapshot(scene_id), request).await;

                let slice = SliceDataPacket::from_reply(scene_id, slice_id, reply);
                if slice.is_empty() {
                    slice
                } else {
                    process_or_passthrough(self.plugin.as_ref(), slice).await
                }
            }
            Packet::RemoveSlice(remove) => {
                slices.forget(remove.scene_id, remove.slice_id);
                self.register(remove.clone().into()).await;
                debug!(scene_id = remove.scene_id, slice_id = remove.slice_id, "Removed slice");
                SliceDataPacket::empty(remove.scene_id, remove.slice_id)
            }
            other => {
                warn!(kind = %other.kind(), scene_id = other.scene_id(), "Unexpected packet on the reply channel");
                SliceDataPacket::empty(other.scene_id(), UNCORRELATED_SLICE_ID)
            }
        }
    }

    /// Unregister everything a closing connection still holds.
    pub async fn release(&self, slices: ViewerSlices) {
        for (scene_id, slice_id) in slices.active {
            self.register(RemoveSlicePacket { scene_id, slice_id }.into()).await;
        }
    }

    async fn register(&self, packet: Packet) {
        if self.registry.send(packet).await.is_err() {
            debug!("Ingest loop has stopped, slice registry update dropped");
        }
    }
}

/// Serve one viewer: read a request, write its reply, repeat.
pub(super) async fn serve_viewer(
    mut stream: TcpStream,
    peer: SocketAddr,
    context: Arc<ReplyContext>,
    shutdown: ShutdownHandle,
) -> Result<()> {
    let mut slices = ViewerSlices::default();
    let result = answer_requests(&mut stream, peer, &context, &mut slices, &shutdown).await;
    debug!(%peer, registered = slices.len(), "Releasing viewer slices");
    context.release(slices).await;
    result
}

async fn answer_requests(
    stream: &mut TcpStream,
    peer: SocketAddr,
    context: &ReplyContext,
    slices: &mut ViewerSlices,
    shutdown: &ShutdownHandle,
) -> Result<()> {
    let mut answered = 0u64;

    loop {
        let payload = tokio::select! {
            _ = shutdown.cancelled() => break,
            payload = frame::read_frame(stream, context.max_frame_len) => payload?,
        };
        let Some(payload) = payload else {
            break;
        };

        let reply = match Packet::decode(&payload) {
            Ok(packet) => {
                trace!(%peer, kind = %packet.kind(), "Received request");
                context.answer(packet, slices).await
            }
            Err(e) => {
                warn!(%peer, error = %e, "Malformed request, replying empty");
                SliceDataPacket::empty(0, UNCORRELATED_SLICE_ID)
            }
        };

        let bytes = match Packet::from(reply).encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(%peer, error = %e, "Reply cannot be encoded, replying empty");
                Packet::from(SliceDataPacket::empty(0, UNCORRELATED_SLICE_ID)).encode()?
            }
        };
        frame::write_frame(stream, &bytes).await?;
        answered += 1;
    }

    debug!(%peer, answered, "Viewer disconnected");
    Ok(())
}
