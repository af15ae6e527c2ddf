//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use tomostream::dispatch::Dispatcher;
use tomostream::packet::{GeometryPacket, GeometrySpecificationPacket, Packet, ProjectionPacket, ScanSettingsPacket};
use tomostream::server::{Server, ServerState, ShutdownHandle};
use tomostream::transport::Endpoint;
use tomostream::types::{
    AcquisitionGeometry, BeamGeometry, FrameClass, Orientation, ScanSettings, SceneId, SliceId, SliceRequest,
    VolumeWindow,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// A server running on loopback ports in a background task.
pub struct RunningServer {
    pub ingest: Endpoint,
    pub reply: Endpoint,
    pub scenes: std::sync::Arc<tomostream::scene::SceneStore>,
    pub shutdown: ShutdownHandle,
    pub state: watch::Receiver<ServerState>,
    pub task: JoinHandle<tomostream::Result<()>>,
}

impl RunningServer {
    pub async fn start(server: Server) -> anyhow::Result<Self> {
        let ingest = endpoint_for(server.ingest_addr()?);
        let reply = endpoint_for(server.reply_addr()?);
        let scenes = server.scenes();
        let shutdown = server.shutdown_handle();
        let mut state = server.state();
        let task = tokio::spawn(server.serve());
        tokio::time::timeout(TIMEOUT, state.wait_for(|s| *s == ServerState::Listening)).await??;
        Ok(Self { ingest, reply, scenes, shutdown, state, task })
    }

    pub async fn stop(mut self) -> anyhow::Result<()> {
        self.shutdown.shutdown();
        tokio::time::timeout(TIMEOUT, self.task).await???;
        assert_eq!(*self.state.borrow_and_update(), ServerState::Closed);
        Ok(())
    }
}

pub async fn bind_server(dispatcher: Dispatcher) -> anyhow::Result<Server> {
    Ok(Server::bind(&local_endpoint(), &local_endpoint()).await?.on_slice_request(dispatcher))
}

pub fn local_endpoint() -> Endpoint {
    Endpoint::new("127.0.0.1", 0)
}

pub fn endpoint_for(addr: SocketAddr) -> Endpoint {
    Endpoint::from_socket_addr(addr)
}

pub fn axial_request(slice_id: SliceId, shape: [u32; 2]) -> SliceRequest {
    SliceRequest::new(slice_id, Orientation::axial([0.0, 0.0, 0.5]), shape)
}

pub fn projection(scene_id: SceneId, class: FrameClass, frame_index: u32, value: f32) -> Packet {
    ProjectionPacket { scene_id, class, frame_index, shape: [4, 4], data: vec![value; 16] }.into()
}

/// Window, 4x4 parallel geometry with eight projections, settings, one dark,
/// one flat and the eight projections: thirteen packets.
pub fn acquisition(scene_id: SceneId) -> Vec<Packet> {
    let angles = (0..8).map(|i| std::f32::consts::PI * i as f32 / 8.0).collect();
    let mut packets: Vec<Packet> = vec![
        GeometrySpecificationPacket { scene_id, window: VolumeWindow::default() }.into(),
        GeometryPacket {
            scene_id,
            geometry: AcquisitionGeometry { rows: 4, cols: 4, proj_count: 8, beam: BeamGeometry::Parallel { angles } },
        }
        .into(),
        ScanSettingsPacket { scene_id, settings: ScanSettings { dark_count: 1, flat_count: 1, already_linear: false } }
            .into(),
        projection(scene_id, FrameClass::Dark, 0, 0.0),
        projection(scene_id, FrameClass::Flat, 0, 1.0),
    ];
    packets.extend((0..8).map(|i| projection(scene_id, FrameClass::Projection, i, 0.5)));
    packets
}
