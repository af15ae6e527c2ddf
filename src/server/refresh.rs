//! Pushes refreshed slices and a coarse preview after new projections.
//!
//! The ingest loop marks a scene whenever it stores a projection-class frame.
//! Marks coalesce: a burst of projections for one scene triggers one refresh.
//! A refresh re-dispatches every registered slice of the scene, runs the
//! results through the plugin and pushes them, followed by a `preview_size`³
//! volume, to the refresh endpoint over a push publisher.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::ShutdownHandle;
use crate::dispatch::Dispatcher;
use crate::packet::{Packet, SliceDataPacket, VolumeDataPacket};
use crate::plugin::{SlicePlugin, process_or_passthrough};
use crate::publisher::{PublishMode, Publisher};
use crate::scene::SceneStore;
use crate::transport::Endpoint;
use crate::types::SceneId;
use crate::{Result, StreamError};

/// Scenes with projections newer than their last refresh.
#[derive(Debug, Default)]
pub(super) struct RefreshQueue {
    pending: Mutex<BTreeSet<SceneId>>,
    wake: Notify,
}

impl RefreshQueue {
    pub fn mark(&self, scene_id: SceneId) {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).insert(scene_id);
        self.wake.notify_one();
    }

    pub(super) fn take(&self) -> BTreeSet<SceneId> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Counters of one refresh loop run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshStats {
    pub refreshes: u64,
    pub published: u64,
    pub failed: u64,
}

pub(super) struct Refresher {
    pub scenes: Arc<SceneStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub plugin: Arc<dyn SlicePlugin>,
    pub endpoint: Endpoint,
    pub preview_size: u32,
}

impl Refresher {
    /// Everything a refresh of `scene_id` publishes, slices first.
    async fn packets(&self, scene_id: SceneId) -> Vec<Packet> {
        let scene = self.scenes.snapshot(scene_id);
        let requests: Vec<_> = scene.active_slices().cloned().collect();
        let mut packets = Vec::with_capacity(requests.len() + 1);

        for request in requests {
            let slice_id = request.slice_id;
            let reply = self.dispatcher.dispatch(scene.clone(), request).await;
            let slice = SliceDataPacket::from_reply(scene_id, slice_id, reply);
            if !slice.is_empty() {
                packets.push(process_or_passthrough(self.plugin.as_ref(), slice).await.into());
            }
        }
        if self.preview_size == 0 {
            return packets;
        }
        // a volume published on the ingest channel stands in for a missing backend preview
        let stored = scene.preview().cloned();
        if let Some(volume) = self.dispatcher.preview(scene, self.preview_size).await.or(stored) {
            packets.push(VolumeDataPacket { scene_id, volume }.into());
        }
        packets
    }

    async fn publish(&self, publisher: &mut Option<Publisher>, packets: &[Packet]) -> Result<()> {
        if !matches!(publisher, Some(p) if !p.is_poisoned()) {
            *publisher = Some(Publisher::connect(&self.endpoint, PublishMode::Push).await?);
            debug!(endpoint = %self.endpoint, "Connected refresh publisher");
        }
        let Some(publisher) = publisher.as_mut() else {
            return Err(StreamError::transport("refresh publisher unavailable"));
        };
        publisher.send_all(packets).await
    }
}

/// Refresh marked scenes until shut down.
pub(super) async fn run_refresh_loop(
    queue: Arc<RefreshQueue>,
    refresher: Refresher,
    shutdown: ShutdownHandle,
) -> RefreshStats {
    info!(endpoint = %refresher.endpoint, preview_size = refresher.preview_size, "Refresh loop started");
    let mut stats = RefreshStats::default();
    let mut publisher = None;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = queue.wake.notified() => {}
        }

        for scene_id in queue.take() {
            let packets = refresher.packets(scene_id).await;
            stats.refreshes += 1;
            if packets.is_empty() {
                continue;
            }
            match refresher.publish(&mut publisher, &packets).await {
                Ok(()) => {
                    stats.published += packets.len() as u64;
                    debug!(scene_id, packets = packets.len(), "Published refresh");
                }
                Err(e) => {
                    stats.failed += 1;
                    warn!(scene_id, endpoint = %refresher.endpoint, error = %e, "Refresh publish failed");
                    publisher = None;
                }
            }
        }
    }

    info!(refreshes = stats.refreshes, published = stats.published, failed = stats.failed, "Refresh loop ended");
    stats
}
