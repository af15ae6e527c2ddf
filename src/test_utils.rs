//! Fixtures shared by unit tests, integration tests and benchmarks.

#![cfg(any(test, feature = "benchmark"))]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crate::Result;
use crate::packet::{GeometryPacket, GeometrySpecificationPacket, Packet, ProjectionPacket, ScanSettingsPacket};
use crate::reconstructor::SliceReconstructor;
use crate::scene::SceneSnapshot;
use crate::transport::Endpoint;
use crate::types::{
    AcquisitionGeometry, BeamGeometry, FrameClass, Orientation, ScanSettings, SceneId, SliceId, SliceReply,
    SliceRequest, Volume, VolumeWindow,
};

/// Loopback endpoint on an ephemeral port.
pub fn local_endpoint() -> Endpoint {
    Endpoint::new("127.0.0.1", 0)
}

/// Endpoint for a bound listener's address.
pub fn endpoint_for(addr: SocketAddr) -> Endpoint {
    Endpoint::from_socket_addr(addr)
}

/// Axial slice through the volume center.
pub fn axial_request(slice_id: SliceId, shape: [u32; 2]) -> SliceRequest {
    SliceRequest::new(slice_id, Orientation::axial([0.0, 0.0, 0.5]), shape)
}

/// Parallel-beam geometry with angles spread evenly over half a turn.
pub fn parallel_geometry(scene_id: SceneId, rows: u32, cols: u32, proj_count: u32) -> Packet {
    let angles = (0..proj_count).map(|i| std::f32::consts::PI * i as f32 / proj_count.max(1) as f32).collect();
    GeometryPacket {
        scene_id,
        geometry: AcquisitionGeometry { rows, cols, proj_count, beam: BeamGeometry::Parallel { angles } },
    }
    .into()
}

/// Frame of the given class filled with `value`.
pub fn projection(scene_id: SceneId, class: FrameClass, frame_index: u32, shape: [u32; 2], value: f32) -> Packet {
    let len = shape[0] as usize * shape[1] as usize;
    ProjectionPacket { scene_id, class, frame_index, shape, data: vec![value; len] }.into()
}

/// A complete 4x4 acquisition in canonical order: window, geometry, settings,
/// one dark, one flat and eight projections.
pub fn acquisition_scenario(scene_id: SceneId) -> Vec<Packet> {
    let shape = [4, 4];
    let mut packets = vec![
        GeometrySpecificationPacket { scene_id, window: VolumeWindow::default() }.into(),
        parallel_geometry(scene_id, 4, 4, 8),
        ScanSettingsPacket { scene_id, settings: ScanSettings { dark_count: 1, flat_count: 1, already_linear: false } }
            .into(),
        projection(scene_id, FrameClass::Dark, 0, shape, 0.0),
        projection(scene_id, FrameClass::Flat, 0, shape, 1.0),
    ];
    packets.extend((0..8).map(|i| projection(scene_id, FrameClass::Projection, i, shape, 0.5)));
    packets
}

/// Answers every request, preview included, with the wrapped value.
#[derive(Debug, Clone, Copy)]
pub struct ConstantReconstructor(pub f32);

impl SliceReconstructor for ConstantReconstructor {
    fn reconstruct(&self, _scene: &SceneSnapshot, request: &SliceRequest) -> Result<SliceReply> {
        SliceReply::new(request.shape, vec![self.0; request.pixels()])
    }

    fn reconstruct_preview(&self, _scene: &SceneSnapshot, size: u32) -> Result<Option<Volume>> {
        let mut volume = Volume::cube(size);
        volume.data.fill(self.0);
        Ok(Some(volume))
    }
}

#[derive(Debug, Default)]
pub struct CallStats {
    pub calls: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    in_flight: AtomicUsize,
}

/// Sleeps for a fixed delay per call and records call concurrency.
#[derive(Debug, Clone)]
pub struct CountingReconstructor {
    delay: Duration,
    stats: Arc<CallStats>,
}

impl CountingReconstructor {
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay, stats: Arc::default() }
    }

    pub fn stats(&self) -> Arc<CallStats> {
        Arc::clone(&self.stats)
    }
}

impl SliceReconstructor for CountingReconstructor {
    fn reconstruct(&self, _scene: &SceneSnapshot, request: &SliceRequest) -> Result<SliceReply> {
        let current = self.stats.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.max_concurrent.fetch_max(current, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        self.stats.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(SliceReply::zeros(request.shape))
    }
}
