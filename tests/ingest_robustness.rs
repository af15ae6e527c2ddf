//! Malformed input, early requests, plugins and bind failures.

mod common;

use std::sync::Arc;

use common::{RunningServer, TIMEOUT, axial_request, bind_server, endpoint_for, local_endpoint, projection};
use tokio::net::TcpListener;
use tomostream::StreamError;
use tomostream::client::VisualizationClient;
use tomostream::dispatch::Dispatcher;
use tomostream::packet::frame::{self, CONFIRM, DEFAULT_MAX_FRAME_LEN};
use tomostream::packet::{GeometrySpecificationPacket, Packet, PacketKind};
use tomostream::plugin::{PluginHost, RemotePlugin};
use tomostream::publisher::PublishMode;
use tomostream::reconstructor::ZeroReconstructor;
use tomostream::scene::SceneSnapshot;
use tomostream::server::{Server, UNCORRELATED_SLICE_ID};
use tomostream::types::{FrameClass, SliceReply, SliceRequest, VolumeWindow};

#[tokio::test]
async fn malformed_frames_are_confirmed_and_skipped() -> anyhow::Result<()> {
    let server = bind_server(Dispatcher::single(ZeroReconstructor)).await?.with_ingest_mode(PublishMode::RequestConfirm);
    let server = RunningServer::start(server).await?;

    let mut stream = server.ingest.connect().await?;
    for payload in [vec![0xff; 8], vec![0x01, 0x03]] {
        frame::write_frame(&mut stream, &payload).await?;
        let confirm = frame::read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await?;
        assert_eq!(confirm.as_deref(), Some(&CONFIRM[..]));
    }

    let valid: Packet = GeometrySpecificationPacket { scene_id: 2, window: VolumeWindow::default() }.into();
    frame::write_frame(&mut stream, &valid.encode()?).await?;
    let confirm = frame::read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN).await?;
    assert_eq!(confirm.as_deref(), Some(&CONFIRM[..]));

    tokio::time::timeout(TIMEOUT, server.scenes.wait_until(1)).await?;
    assert_eq!(server.scenes.scene_ids(), vec![2]);
    drop(stream);

    server.stop().await
}

#[tokio::test]
async fn requests_before_any_data_still_get_a_reply() -> anyhow::Result<()> {
    let server = RunningServer::start(bind_server(Dispatcher::single(ZeroReconstructor)).await?).await?;

    let mut client = VisualizationClient::connect(&server.reply).await?.with_timeout(TIMEOUT);
    let slice = client.request_slice(9, axial_request(4, [2, 3])).await?;
    assert_eq!((slice.scene_id, slice.slice_id, slice.shape), (9, 4, [2, 3]));
    assert_eq!(slice.data, vec![0.0; 6]);

    server.stop().await
}

#[tokio::test]
async fn failing_reconstruction_replies_empty() -> anyhow::Result<()> {
    let failing = |_: &SceneSnapshot, _: &SliceRequest| -> tomostream::Result<SliceReply> {
        Err(StreamError::reconstruction("no projections yet"))
    };
    let server = RunningServer::start(bind_server(Dispatcher::single(failing)).await?).await?;

    let mut client = VisualizationClient::connect(&server.reply).await?.with_timeout(TIMEOUT);
    let slice = client.request_slice(0, axial_request(8, [4, 4])).await?;
    assert_eq!(slice.slice_id, 8);
    assert!(slice.is_empty());

    server.stop().await
}

#[tokio::test]
async fn acquisition_packets_on_the_reply_channel_are_answered_uncorrelated() -> anyhow::Result<()> {
    let server = RunningServer::start(bind_server(Dispatcher::single(ZeroReconstructor)).await?).await?;

    let mut client = VisualizationClient::connect(&server.reply).await?.with_timeout(TIMEOUT);
    let reply = client.round_trip(projection(1, FrameClass::Dark, 0, 0.0)).await?;
    assert_eq!(reply.slice_id, UNCORRELATED_SLICE_ID);
    assert!(reply.is_empty());

    // the connection survives and keeps answering requests
    let slice = client.request_slice(1, axial_request(2, [1, 1])).await?;
    assert_eq!(slice.slice_id, 2);
    assert_eq!(server.scenes.snapshot(1).frame_count(FrameClass::Dark), 0);

    server.stop().await
}

#[tokio::test]
async fn plugin_post_processes_slices() -> anyhow::Result<()> {
    let host = PluginHost::bind(&local_endpoint()).await?;
    let plugin_endpoint = endpoint_for(host.local_addr()?);
    let host_shutdown = host.shutdown_handle();
    let host_task = tokio::spawn(host.serve(|shape, data: Vec<f32>, _slice_id| {
        (shape, data.into_iter().map(|v| v * 2.0).collect())
    }));

    let constant = |_: &SceneSnapshot, request: &SliceRequest| -> tomostream::Result<SliceReply> {
        SliceReply::new(request.shape, vec![1.5; request.pixels()])
    };
    let server = bind_server(Dispatcher::single(constant))
        .await?
        .with_plugin(Arc::new(RemotePlugin::new(plugin_endpoint)));
    let server = RunningServer::start(server).await?;

    let mut client = VisualizationClient::connect(&server.reply).await?.with_timeout(TIMEOUT);
    let slice = client.request_slice(0, axial_request(3, [2, 2])).await?;
    assert_eq!(slice.slice_id, 3);
    assert_eq!(slice.data, vec![3.0; 4]);

    server.stop().await?;
    host_shutdown.shutdown();
    host_task.await??;
    Ok(())
}

#[tokio::test]
async fn unreachable_plugin_falls_back_to_the_raw_slice() -> anyhow::Result<()> {
    // reserve a port, then free it so nothing listens there
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let dead_endpoint = endpoint_for(listener.local_addr()?);
    drop(listener);

    let server = bind_server(Dispatcher::single(ZeroReconstructor))
        .await?
        .with_plugin(Arc::new(RemotePlugin::new(dead_endpoint)));
    let server = RunningServer::start(server).await?;

    let mut client = VisualizationClient::connect(&server.reply).await?.with_timeout(TIMEOUT);
    let slice = client.request_slice(0, axial_request(5, [2, 2])).await?;
    assert_eq!((slice.slice_id, slice.data.len()), (5, 4));

    server.stop().await
}

#[tokio::test]
async fn bind_conflict_is_a_transport_error() -> anyhow::Result<()> {
    let taken = TcpListener::bind("127.0.0.1:0").await?;
    let result = Server::bind(&endpoint_for(taken.local_addr()?), &local_endpoint()).await;
    assert!(matches!(result, Err(StreamError::Transport { .. })));
    Ok(())
}

#[test]
fn packet_kinds_name_their_wire_tags() {
    assert_eq!(PacketKind::SetSlice.tag(), 0x205);
    assert_eq!(PacketKind::SliceData.tag(), 0x201);
}
