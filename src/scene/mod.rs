//! Per-scene acquisition state.
//!
//! The [`SceneStore`] is owned by the server; there is no global registry.
//! Scenes are created on first reference and live as long as the store.
//!
//! ## Architecture
//!
//! - One writer (the ingest loop) applies packets through [`SceneStore::apply`]
//! - Readers take a [`SceneSnapshot`]: an immutable, `Arc`-shared view that later
//!   writes never disturb
//! - Writes are copy-on-write: a scene is only cloned while a snapshot of it is
//!   still alive, and frames themselves are `Arc`-shared between versions
//! - A store-wide revision counter is published on a watch channel so callers
//!   can wait for ingest to catch up
//!
//! ## Semantics
//!
//! Application is idempotent per field: geometry and settings overwrite, a frame
//! with an existing `(class, index)` key replaces the stored one.

mod processing;

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, trace, warn};

use crate::packet::{DecodeError, Packet, PacketKind};
use crate::types::{
    AcquisitionGeometry, Frame, FrameClass, FrameKey, ScanSettings, SceneId, SliceId, SliceRequest, Volume,
    VolumeWindow,
};
use crate::{Result, StreamError};

/// State of one scene at one revision.
#[derive(Debug, Clone, Default)]
pub struct Scene {
    scene_id: SceneId,
    window: VolumeWindow,
    geometry: Option<Arc<AcquisitionGeometry>>,
    settings: ScanSettings,
    frames: BTreeMap<FrameKey, Arc<Frame>>,
    /// Per-pixel means of darks and flats, keyed by detector shape.
    averages: HashMap<(FrameClass, [u32; 2]), Arc<[f32]>>,
    preview: Option<Arc<Volume>>,
    slices: BTreeMap<SliceId, SliceRequest>,
    revision: u64,
}

impl Scene {
    fn new(scene_id: SceneId) -> Self {
        Self { scene_id, ..Self::default() }
    }

    pub fn scene_id(&self) -> SceneId {
        self.scene_id
    }

    pub fn window(&self) -> VolumeWindow {
        self.window
    }

    pub fn geometry(&self) -> Option<&AcquisitionGeometry> {
        self.geometry.as_deref()
    }

    pub fn settings(&self) -> ScanSettings {
        self.settings
    }

    pub fn frame(&self, class: FrameClass, index: u32) -> Option<&Arc<Frame>> {
        self.frames.get(&FrameKey::new(class, index))
    }

    /// Frames of one class in index order.
    pub fn frames(&self, class: FrameClass) -> impl Iterator<Item = (u32, &Arc<Frame>)> {
        self.frames
            .range(FrameKey::new(class, 0)..=FrameKey::new(class, u32::MAX))
            .map(|(key, frame)| (key.index, frame))
    }

    pub fn frame_count(&self, class: FrameClass) -> usize {
        self.frames(class).count()
    }

    pub fn preview(&self) -> Option<&Volume> {
        self.preview.as_deref()
    }

    /// Slices currently registered by viewers.
    pub fn active_slices(&self) -> impl Iterator<Item = &SliceRequest> {
        self.slices.values()
    }

    pub fn slice(&self, slice_id: SliceId) -> Option<&SliceRequest> {
        self.slices.get(&slice_id)
    }

    /// Number of packets applied to this scene.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    fn store_frame(&mut self, key: FrameKey, frame: Frame) -> Result<()> {
        let expected = frame.shape[0] as u64 * frame.shape[1] as u64;
        if expected != frame.data.len() as u64 {
            return Err(DecodeError::ShapeMismatch { field: "frame.data", expected, actual: frame.data.len() as u64 }
                .into());
        }

        match self.geometry.as_deref() {
            Some(geometry) if frame.shape != [geometry.rows, geometry.cols] => {
                return Err(DecodeError::ShapeMismatch {
                    field: "frame.shape",
                    expected: geometry.pixels() as u64,
                    actual: expected,
                }
                .into());
            }
            Some(_) => {}
            None => warn!(
                scene_id = self.scene_id,
                class = %key.class,
                index = key.index,
                "Frame arrived before the acquisition geometry, storing anyway"
            ),
        }

        let shape = frame.shape;
        if self.frames.insert(key, Arc::new(frame)).is_some() {
            trace!(scene_id = self.scene_id, class = %key.class, index = key.index, "Replaced frame");
        }
        if key.class != FrameClass::Projection {
            self.refresh_average(key.class, shape);
        }
        Ok(())
    }

    /// Apply one packet; `Ok(false)` means the packet carries no scene state.
    ///
    /// Every check runs before the first mutation, so a rejected packet
    /// leaves the scene as it was.
    fn apply(&mut self, packet: &Packet) -> Result<bool> {
        match packet {
            Packet::GeometrySpecification(p) => self.window = p.window,
            Packet::Geometry(p) => {
                let previous = self.geometry.as_deref().map(|g| [g.rows, g.cols]);
                if previous.is_some_and(|shape| shape != [p.geometry.rows, p.geometry.cols]) {
                    debug!(
                        scene_id = self.scene_id,
                        rows = p.geometry.rows,
                        cols = p.geometry.cols,
                        "Detector shape changed"
                    );
                }
                self.geometry = Some(Arc::new(p.geometry.clone()));
            }
            Packet::ScanSettings(p) => self.settings = p.settings,
            Packet::Projection(p) => {
                let frame = Frame { shape: p.shape, data: p.data.clone(), pose: None };
                self.store_frame(FrameKey::new(p.class, p.frame_index), frame)?;
            }
            Packet::ProjectionData(p) => {
                let frame = Frame { shape: p.shape, data: p.data.clone(), pose: Some(p.pose) };
                self.store_frame(FrameKey::new(FrameClass::Projection, p.frame_index), frame)?;
            }
            Packet::VolumeData(p) => {
                let expected = p.volume.voxels() as u64;
                if expected != p.volume.data.len() as u64 {
                    return Err(DecodeError::ShapeMismatch {
                        field: "volume_data.data",
                        expected,
                        actual: p.volume.data.len() as u64,
                    }
                    .into());
                }
                self.preview = Some(Arc::new(p.volume.clone()));
            }
            Packet::SetSlice(p) => {
                self.slices.insert(p.request.slice_id, p.request.clone());
            }
            Packet::RemoveSlice(p) => {
                self.slices.remove(&p.slice_id);
            }
            Packet::SliceData(_) => return Ok(false),
        }
        self.revision += 1;
        Ok(true)
    }
}

/// Immutable view of a scene, cheap to clone and safe to hold across awaits.
#[derive(Debug, Clone)]
pub struct SceneSnapshot(Arc<Scene>);

impl SceneSnapshot {
    /// A snapshot of an empty scene, for requests against unknown scenes.
    pub fn empty(scene_id: SceneId) -> Self {
        Self(Arc::new(Scene::new(scene_id)))
    }
}

impl Deref for SceneSnapshot {
    type Target = Scene;

    fn deref(&self) -> &Scene {
        &self.0
    }
}

/// Shared handle to one scene.
#[derive(Debug, Clone)]
pub struct SceneHandle {
    scene_id: SceneId,
    state: Arc<RwLock<Arc<Scene>>>,
}

impl SceneHandle {
    fn new(scene_id: SceneId) -> Self {
        Self { scene_id, state: Arc::new(RwLock::new(Arc::new(Scene::new(scene_id)))) }
    }

    pub fn scene_id(&self) -> SceneId {
        self.scene_id
    }

    pub fn snapshot(&self) -> SceneSnapshot {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        SceneSnapshot(Arc::clone(&state))
    }

    fn update<T>(&self, f: impl FnOnce(&mut Scene) -> T) -> T {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(Arc::make_mut(&mut *state))
    }

    pub fn active_slices(&self) -> Vec<SliceRequest> {
        self.snapshot().active_slices().cloned().collect()
    }
}

/// What [`SceneStore::apply`] did with a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { scene_id: SceneId, revision: u64 },
    /// Reply-only packets carry no scene state.
    Ignored { kind: PacketKind },
}

/// Registry of scenes keyed by `scene_id`.
#[derive(Debug)]
pub struct SceneStore {
    scenes: RwLock<HashMap<SceneId, SceneHandle>>,
    revision: watch::Sender<u64>,
}

impl Default for SceneStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SceneStore {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self { scenes: RwLock::new(HashMap::new()), revision }
    }

    pub fn get(&self, scene_id: SceneId) -> Option<SceneHandle> {
        self.scenes.read().unwrap_or_else(PoisonError::into_inner).get(&scene_id).cloned()
    }

    pub fn get_or_create(&self, scene_id: SceneId) -> SceneHandle {
        if let Some(handle) = self.get(scene_id) {
            return handle;
        }
        let mut scenes = self.scenes.write().unwrap_or_else(PoisonError::into_inner);
        scenes
            .entry(scene_id)
            .or_insert_with(|| {
                debug!(scene_id, "Created scene");
                SceneHandle::new(scene_id)
            })
            .clone()
    }

    /// Snapshot of a scene, or of an empty scene if it does not exist yet.
    pub fn snapshot(&self, scene_id: SceneId) -> SceneSnapshot {
        self.get(scene_id).map(|h| h.snapshot()).unwrap_or_else(|| SceneSnapshot::empty(scene_id))
    }

    /// Apply one packet to its scene.
    ///
    /// Rejected packets leave the scene untouched and do not bump any revision.
    pub fn apply(&self, packet: &Packet) -> Result<ApplyOutcome> {
        if packet.kind() == PacketKind::SliceData {
            return Ok(ApplyOutcome::Ignored { kind: packet.kind() });
        }

        let scene_id = packet.scene_id();
        if scene_id < 0 {
            return Err(DecodeError::NegativeDimension { field: "scene_id", value: scene_id }.into());
        }
        let handle = self.get_or_create(scene_id);
        let revision = handle.update(|scene| {
            let changed = scene.apply(packet)?;
            Ok::<_, StreamError>(changed.then_some(scene.revision))
        })?;

        match revision {
            Some(revision) => {
                self.revision.send_modify(|r| *r += 1);
                trace!(scene_id, kind = %packet.kind(), revision, "Applied packet");
                Ok(ApplyOutcome::Applied { scene_id, revision })
            }
            None => Ok(ApplyOutcome::Ignored { kind: packet.kind() }),
        }
    }

    pub fn scene_ids(&self) -> Vec<SceneId> {
        let mut ids: Vec<_> = self.scenes.read().unwrap_or_else(PoisonError::into_inner).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.scenes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total packets applied across all scenes.
    pub fn revision(&self) -> u64 {
        *self.revision.borrow()
    }

    /// Stream of store revisions, starting with the current one.
    pub fn updates(&self) -> WatchStream<u64> {
        WatchStream::new(self.revision.subscribe())
    }

    /// Wait until at least `revision` packets have been applied.
    pub async fn wait_until(&self, revision: u64) {
        let mut rx = self.revision.subscribe();
        // the sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|current| *current >= revision).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{
        GeometrySpecificationPacket, RemoveSlicePacket, ScanSettingsPacket, SetSlicePacket, SliceDataPacket,
    };
    use crate::test_utils::{acquisition_scenario, axial_request, parallel_geometry, projection};
    use futures::StreamExt;

    #[test]
    fn scenes_are_created_on_first_reference() {
        let store = SceneStore::new();
        assert!(store.is_empty());
        assert!(store.get(3).is_none());

        let handle = store.get_or_create(3);
        assert_eq!(handle.scene_id(), 3);
        store.get_or_create(3);
        store.apply(&parallel_geometry(1, 2, 2, 2)).unwrap();

        assert_eq!(store.scene_ids(), vec![1, 3]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn frames_overwrite_per_class_and_index() {
        let store = SceneStore::new();
        store.apply(&parallel_geometry(0, 2, 2, 4)).unwrap();

        store.apply(&projection(0, FrameClass::Projection, 1, [2, 2], 1.0)).unwrap();
        let first = store.snapshot(0);
        store.apply(&projection(0, FrameClass::Projection, 1, [2, 2], 5.0)).unwrap();
        store.apply(&projection(0, FrameClass::Dark, 1, [2, 2], 0.0)).unwrap();

        let snapshot = store.snapshot(0);
        assert_eq!(snapshot.frame_count(FrameClass::Projection), 1);
        assert_eq!(snapshot.frame_count(FrameClass::Dark), 1);
        assert_eq!(snapshot.frame(FrameClass::Projection, 1).unwrap().data, vec![5.0; 4]);

        // snapshots taken earlier are unaffected
        assert_eq!(first.frame(FrameClass::Projection, 1).unwrap().data, vec![1.0; 4]);
        assert_eq!(first.frame_count(FrameClass::Dark), 0);
    }

    #[test]
    fn applying_the_same_packet_twice_is_idempotent() {
        let store = SceneStore::new();
        let packets = acquisition_scenario(0);
        for packet in &packets {
            store.apply(packet).unwrap();
        }
        let once = store.snapshot(0);
        for packet in &packets {
            store.apply(packet).unwrap();
        }
        let twice = store.snapshot(0);

        assert_eq!(once.window(), twice.window());
        assert_eq!(once.geometry(), twice.geometry());
        assert_eq!(once.settings(), twice.settings());
        for class in [FrameClass::Dark, FrameClass::Flat, FrameClass::Projection] {
            let a: Vec<_> = once.frames(class).map(|(i, f)| (i, f.data.clone())).collect();
            let b: Vec<_> = twice.frames(class).map(|(i, f)| (i, f.data.clone())).collect();
            assert_eq!(a, b);
        }
        assert_eq!(twice.revision(), 2 * once.revision());
    }

    #[test]
    fn mismatched_projection_is_rejected_without_side_effects() {
        let store = SceneStore::new();
        store.apply(&parallel_geometry(0, 4, 4, 8)).unwrap();
        let before = store.revision();

        let result = store.apply(&projection(0, FrameClass::Projection, 0, [2, 2], 1.0));
        assert!(matches!(result, Err(StreamError::Protocol(DecodeError::ShapeMismatch { .. }))));
        assert_eq!(store.snapshot(0).frame_count(FrameClass::Projection), 0);
        assert_eq!(store.revision(), before);
    }

    #[test]
    fn projection_before_geometry_is_stored() {
        let store = SceneStore::new();
        let outcome = store.apply(&projection(5, FrameClass::Projection, 0, [3, 3], 1.0)).unwrap();
        assert_eq!(outcome, ApplyOutcome::Applied { scene_id: 5, revision: 1 });
        assert_eq!(store.snapshot(5).frame_count(FrameClass::Projection), 1);
    }

    #[test]
    fn slice_registry_follows_requests() {
        let store = SceneStore::new();
        for (slice_id, edge) in [(1, 4), (2, 8), (1, 16)] {
            store.apply(&SetSlicePacket { scene_id: 0, request: axial_request(slice_id, [edge, edge]) }.into()).unwrap();
        }
        let handle = store.get(0).unwrap();
        assert_eq!(handle.active_slices().len(), 2);
        assert_eq!(handle.snapshot().slice(1).unwrap().shape, [16, 16]);

        store.apply(&RemoveSlicePacket { scene_id: 0, slice_id: 1 }.into()).unwrap();
        store.apply(&RemoveSlicePacket { scene_id: 0, slice_id: 1 }.into()).unwrap();
        assert_eq!(handle.active_slices().len(), 1);
        assert!(handle.snapshot().slice(1).is_none());
    }

    #[test]
    fn negative_scene_ids_are_rejected() {
        let store = SceneStore::new();
        let result = store.apply(&parallel_geometry(-2, 4, 4, 8));
        assert!(matches!(result, Err(StreamError::Protocol(DecodeError::NegativeDimension { field: "scene_id", .. }))));
        assert!(store.is_empty());
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn frames_of_one_class_come_from_a_range() {
        let store = SceneStore::new();
        store.apply(&parallel_geometry(0, 1, 1, 4)).unwrap();
        for index in [3, 0, 2] {
            store.apply(&projection(0, FrameClass::Projection, index, [1, 1], 1.0)).unwrap();
        }
        store.apply(&projection(0, FrameClass::Dark, 9, [1, 1], 0.0)).unwrap();
        store.apply(&projection(0, FrameClass::Flat, u32::MAX, [1, 1], 1.0)).unwrap();

        let snapshot = store.snapshot(0);
        let indices: Vec<_> = snapshot.frames(FrameClass::Projection).map(|(i, _)| i).collect();
        assert_eq!(indices, vec![0, 2, 3]);
        assert_eq!(snapshot.frames(FrameClass::Dark).map(|(i, _)| i).collect::<Vec<_>>(), vec![9]);
        assert_eq!(snapshot.frames(FrameClass::Flat).map(|(i, _)| i).collect::<Vec<_>>(), vec![u32::MAX]);
    }

    #[test]
    fn reply_packets_are_ignored() {
        let store = SceneStore::new();
        let outcome = store.apply(&SliceDataPacket::empty(0, 0).into()).unwrap();
        assert_eq!(outcome, ApplyOutcome::Ignored { kind: PacketKind::SliceData });
        assert!(store.is_empty());
        assert_eq!(store.revision(), 0);
    }

    #[test]
    fn settings_and_window_overwrite() {
        let store = SceneStore::new();
        let window = VolumeWindow { min: [-1.0; 3], max: [1.0; 3] };
        store.apply(&GeometrySpecificationPacket { scene_id: 0, window }.into()).unwrap();
        let settings = ScanSettings { dark_count: 3, flat_count: 4, already_linear: true };
        store.apply(&ScanSettingsPacket { scene_id: 0, settings }.into()).unwrap();

        let snapshot = store.snapshot(0);
        assert_eq!(snapshot.window(), window);
        assert_eq!(snapshot.settings(), settings);
    }

    #[tokio::test]
    async fn revision_updates_are_observable() {
        let store = Arc::new(SceneStore::new());
        let mut updates = store.updates();
        assert_eq!(updates.next().await, Some(0));

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait_until(3).await })
        };
        for packet in acquisition_scenario(0).iter().take(3) {
            store.apply(packet).unwrap();
        }
        waiter.await.unwrap();
        assert_eq!(store.revision(), 3);
        assert!(updates.next().await.unwrap() >= 1);
    }
}
