//! Acquisition ingest: per-connection readers feeding the single ingest loop.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::ShutdownHandle;
use super::refresh::RefreshQueue;
use crate::packet::frame::{self, CONFIRM};
use crate::packet::Packet;
use crate::publisher::PublishMode;
use crate::scene::{ApplyOutcome, SceneStore};
use crate::types::FrameClass;
use crate::{Result, StreamError};

/// Counters of one ingest loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub applied: u64,
    pub ignored: u64,
    pub rejected: u64,
}

/// Read frames from one publisher in order and forward the decoded packets.
///
/// Malformed frames are logged and skipped. In request/confirm mode every
/// frame is confirmed, a decoded one only after it was queued.
pub(super) async fn serve_publisher(
    mut stream: TcpStream,
    peer: SocketAddr,
    mode: PublishMode,
    max_frame_len: u32,
    packets: mpsc::Sender<Packet>,
    shutdown: ShutdownHandle,
) -> Result<()> {
    let mut received = 0u64;
    let mut malformed = 0u64;

    loop {
        let payload = tokio::select! {
            _ = shutdown.cancelled() => break,
            payload = frame::read_frame(&mut stream, max_frame_len) => payload?,
        };
        let Some(payload) = payload else {
            break;
        };
        received += 1;

        match Packet::decode(&payload) {
            Ok(packet) => {
                trace!(%peer, kind = %packet.kind(), scene_id = packet.scene_id(), "Received packet");
                packets
                    .send(packet)
                    .await
                    .map_err(|_| StreamError::transport("ingest loop has stopped"))?;
            }
            Err(e) => {
                malformed += 1;
                warn!(%peer, error = %e, bytes = payload.len(), "Skipping malformed packet");
            }
        }

        if mode == PublishMode::RequestConfirm {
            frame::write_frame(&mut stream, &CONFIRM).await?;
        }
    }

    debug!(%peer, received, malformed, "Publisher disconnected");
    Ok(())
}

/// Apply queued packets to the store until every sender is gone.
///
/// Publishers and viewer connections (slice registrations) share the queue.
/// Scenes that received a projection are marked on `refresh` when given.
pub(super) async fn run_ingest_loop(
    mut packets: mpsc::Receiver<Packet>,
    scenes: Arc<SceneStore>,
    refresh: Option<Arc<RefreshQueue>>,
) -> IngestStats {
    info!("Ingest loop started");
    let mut stats = IngestStats::default();

    while let Some(packet) = packets.recv().await {
        match scenes.apply(&packet) {
            Ok(ApplyOutcome::Applied { scene_id, revision }) => {
                stats.applied += 1;
                trace!(scene_id, revision, kind = %packet.kind(), "Ingested");
                if let Some(refresh) = refresh.as_deref().filter(|_| carries_projection(&packet)) {
                    refresh.mark(scene_id);
                }
            }
            Ok(ApplyOutcome::Ignored { kind }) => {
                stats.ignored += 1;
                debug!(%kind, "Ignoring packet without scene state");
            }
            Err(e) => {
                stats.rejected += 1;
                warn!(kind = %packet.kind(), scene_id = packet.scene_id(), error = %e, "Rejected packet");
            }
        }
    }

    info!(applied = stats.applied, ignored = stats.ignored, rejected = stats.rejected, "Ingest loop ended");
    stats
}

fn carries_projection(packet: &Packet) -> bool {
    match packet {
        Packet::Projection(p) => p.class == FrameClass::Projection,
        Packet::ProjectionData(_) => true,
        _ => false,
    }
}
