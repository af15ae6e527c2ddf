//! Reconstruction server: acquisition ingest plus viewer request/reply.
//!
//! ## Architecture
//!
//! - One accept loop serves both listeners; every connection gets its own task
//! - Publisher connections decode frames in order and push packets into a
//!   bounded channel drained by the single ingest loop, the only writer of the
//!   [`SceneStore`]
//! - Viewer connections answer each request with exactly one `slice_data`
//!   packet produced by the [`Dispatcher`] and the optional plugin; their
//!   slice registrations travel through the same ingest queue
//! - With a refresh endpoint, scenes that received projections get their
//!   registered slices and a preview volume pushed by the refresh loop
//! - State moves `Idle → Listening → Draining → Closed` and is observable
//!   through [`Server::state`]
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use tomostream::dispatch::Dispatcher;
//! use tomostream::reconstructor::ZeroReconstructor;
//! use tomostream::server::Server;
//! use tomostream::transport::Endpoint;
//!
//! # async fn example() -> tomostream::Result<()> {
//! let server = Server::bind(&Endpoint::default_ingest(), &Endpoint::default_reply())
//!     .await?
//!     .on_slice_request(Dispatcher::single(ZeroReconstructor));
//!
//! let shutdown = server.shutdown_handle();
//! tokio::spawn(async move {
//!     let _ = tokio::signal::ctrl_c().await;
//!     shutdown.shutdown();
//! });
//! server.serve().await?;
//! # Ok(())
//! # }
//! ```

mod ingest;
mod refresh;
mod reply;

pub use ingest::IngestStats;
pub use refresh::RefreshStats;
pub use reply::{MAX_SLICES_PER_VIEWER, UNCORRELATED_SLICE_ID};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dispatch::Dispatcher;
use crate::packet::frame::DEFAULT_MAX_FRAME_LEN;
use crate::plugin::{IdentityPlugin, RemotePlugin, SlicePlugin};
use crate::publisher::PublishMode;
use crate::scene::SceneStore;
use crate::transport::Endpoint;
use crate::{Result, StreamError};

use ingest::{run_ingest_loop, serve_publisher};
use refresh::{RefreshQueue, Refresher, run_refresh_loop};
use reply::{ReplyContext, serve_viewer};

const MAX_ACCEPT_ERRORS: u32 = 10;

/// Lifecycle of a [`Server`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Idle,
    Listening,
    Draining,
    Closed,
}

/// Requests a graceful shutdown. Clones share one signal.
#[derive(Debug, Clone, Default)]
pub struct ShutdownHandle(CancellationToken);

impl ShutdownHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shutdown(&self) {
        self.0.cancel();
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.is_cancelled()
    }

    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.0.cancelled()
    }
}

pub struct Server {
    ingest: TcpListener,
    reply: TcpListener,
    ingest_mode: PublishMode,
    ingest_queue_depth: usize,
    max_frame_len: u32,
    drain_timeout: Duration,
    slice_size: u32,
    preview_size: u32,
    refresh_endpoint: Option<Endpoint>,
    scenes: Arc<SceneStore>,
    dispatcher: Option<Dispatcher>,
    plugin: Arc<dyn SlicePlugin>,
    shutdown: ShutdownHandle,
    state: watch::Sender<ServerState>,
}

enum Accepted {
    Publisher(TcpStream, SocketAddr),
    Viewer(TcpStream, SocketAddr),
}

impl Server {
    /// Bind both listeners. A bind failure is fatal.
    pub async fn bind(ingest: &Endpoint, reply: &Endpoint) -> Result<Self> {
        let defaults = ServerConfig::default();
        let ingest = ingest.bind().await?;
        let reply = reply.bind().await?;
        let (state, _) = watch::channel(ServerState::Idle);

        Ok(Self {
            ingest,
            reply,
            ingest_mode: defaults.ingest_mode,
            ingest_queue_depth: defaults.ingest_queue_depth,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            drain_timeout: defaults.drain_timeout(),
            slice_size: defaults.reconstruction.slice_size,
            preview_size: defaults.reconstruction.preview_size,
            refresh_endpoint: None,
            scenes: Arc::new(SceneStore::new()),
            dispatcher: None,
            plugin: Arc::new(IdentityPlugin),
            shutdown: ShutdownHandle::new(),
            state,
        })
    }

    /// Bind and apply every server-side setting of `config`.
    ///
    /// The dispatcher is not part of this: register it with
    /// [`on_slice_request`](Self::on_slice_request).
    pub async fn from_config(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        let mut server = Self::bind(&config.ingest_endpoint, &config.reply_endpoint).await?;
        server.ingest_mode = config.ingest_mode;
        server.ingest_queue_depth = config.ingest_queue_depth;
        server.max_frame_len = config.max_frame_len;
        server.drain_timeout = config.drain_timeout();
        server.slice_size = config.reconstruction.slice_size;
        server.preview_size = config.reconstruction.preview_size;
        server.refresh_endpoint = config.refresh_endpoint.clone();
        if let Some(endpoint) = &config.plugin_endpoint {
            server.plugin = Arc::new(RemotePlugin::new(endpoint.clone()));
        }
        Ok(server)
    }

    pub fn with_ingest_mode(mut self, mode: PublishMode) -> Self {
        self.ingest_mode = mode;
        self
    }

    pub fn with_slice_size(mut self, slice_size: u32) -> Self {
        self.slice_size = slice_size;
        self
    }

    /// Push refreshed slices and a `preview_size`³ preview to `endpoint`
    /// whenever a scene receives projections. A zero size skips the preview.
    pub fn with_refresh(mut self, endpoint: Endpoint, preview_size: u32) -> Self {
        self.refresh_endpoint = Some(endpoint);
        self.preview_size = preview_size;
        self
    }

    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Register the reconstruction capability. Replaces any earlier one.
    pub fn on_slice_request(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_plugin(mut self, plugin: Arc<dyn SlicePlugin>) -> Self {
        self.plugin = plugin;
        self
    }

    pub fn ingest_addr(&self) -> Result<SocketAddr> {
        Ok(self.ingest.local_addr()?)
    }

    pub fn reply_addr(&self) -> Result<SocketAddr> {
        Ok(self.reply.local_addr()?)
    }

    pub fn scenes(&self) -> Arc<SceneStore> {
        Arc::clone(&self.scenes)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn state(&self) -> watch::Receiver<ServerState> {
        self.state.subscribe()
    }

    /// Run until shut down, then drain.
    ///
    /// Fails immediately if no dispatcher was registered, and after repeated
    /// accept failures.
    pub async fn serve(self) -> Result<()> {
        let Server {
            ingest,
            reply,
            ingest_mode,
            ingest_queue_depth,
            max_frame_len,
            drain_timeout,
            slice_size,
            preview_size,
            refresh_endpoint,
            scenes,
            dispatcher,
            plugin,
            shutdown,
            state,
        } = self;

        let dispatcher = Arc::new(
            dispatcher.ok_or_else(|| StreamError::config("no slice request handler registered"))?,
        );

        let refresh = refresh_endpoint.map(|endpoint| {
            let queue = Arc::new(RefreshQueue::default());
            let refresher = Refresher {
                scenes: Arc::clone(&scenes),
                dispatcher: Arc::clone(&dispatcher),
                plugin: Arc::clone(&plugin),
                endpoint,
                preview_size,
            };
            let task = tokio::spawn(run_refresh_loop(Arc::clone(&queue), refresher, shutdown.clone()));
            (queue, task)
        });

        let (packets, queue) = mpsc::channel(ingest_queue_depth);
        let ingest_loop =
            tokio::spawn(run_ingest_loop(queue, Arc::clone(&scenes), refresh.as_ref().map(|(q, _)| Arc::clone(q))));
        let context = Arc::new(ReplyContext {
            scenes: Arc::clone(&scenes),
            dispatcher: Arc::clone(&dispatcher),
            plugin,
            registry: packets.clone(),
            slice_size,
            max_frame_len,
        });
        let connections = TaskTracker::new();

        state.send_replace(ServerState::Listening);
        info!(
            ingest = ?ingest.local_addr().ok(),
            reply = ?reply.local_addr().ok(),
            mode = ?ingest_mode,
            workers = dispatcher.worker_count(),
            "Server listening"
        );

        let mut error_count = 0u32;
        let outcome = loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    break Ok(());
                }
                result = ingest.accept() => result.map(|(s, peer)| Accepted::Publisher(s, peer)),
                result = reply.accept() => result.map(|(s, peer)| Accepted::Viewer(s, peer)),
            };

            match accepted {
                Ok(Accepted::Publisher(stream, peer)) => {
                    error_count = 0;
                    debug!(%peer, "Publisher connected");
                    let (packets, shutdown) = (packets.clone(), shutdown.clone());
                    connections.spawn(async move {
                        if let Err(e) = serve_publisher(stream, peer, ingest_mode, max_frame_len, packets, shutdown).await {
                            warn!(%peer, error = %e, "Publisher connection closed with error");
                        }
                    });
                }
                Ok(Accepted::Viewer(stream, peer)) => {
                    error_count = 0;
                    debug!(%peer, "Viewer connected");
                    let (context, shutdown) = (Arc::clone(&context), shutdown.clone());
                    connections.spawn(async move {
                        if let Err(e) = serve_viewer(stream, peer, context, shutdown).await {
                            warn!(%peer, error = %e, "Viewer connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    error_count += 1;
                    error!("Accept error ({}/{}): {}", error_count, MAX_ACCEPT_ERRORS, e);
                    if error_count >= MAX_ACCEPT_ERRORS {
                        break Err(StreamError::transport_with_source("too many accept errors", e));
                    }
                    // Exponential backoff: 50ms, 100ms, 200ms, ...
                    let backoff = Duration::from_millis(50 * (1 << error_count.min(5)));
                    tokio::time::sleep(backoff).await;
                }
            }
        };

        // stop accepting and make sure every connection task winds down
        state.send_replace(ServerState::Draining);
        shutdown.shutdown();
        drop((ingest, reply));
        drop(packets);
        drop(context);

        connections.close();
        if tokio::time::timeout(drain_timeout, connections.wait()).await.is_err() {
            warn!(open = connections.len(), "Drain timeout expired with connections still open");
        }
        match tokio::time::timeout(drain_timeout, ingest_loop).await {
            Ok(Ok(stats)) => debug!(?stats, "Ingest loop drained"),
            Ok(Err(e)) => warn!(error = %e, "Ingest loop task failed"),
            Err(_) => warn!("Ingest loop did not drain in time"),
        }
        if let Some((_, task)) = refresh {
            match tokio::time::timeout(drain_timeout, task).await {
                Ok(Ok(stats)) => debug!(?stats, "Refresh loop stopped"),
                Ok(Err(e)) => warn!(error = %e, "Refresh loop task failed"),
                Err(_) => warn!("Refresh loop did not stop in time"),
            }
        }

        match Arc::try_unwrap(dispatcher) {
            Ok(dispatcher) => dispatcher.shutdown().await,
            Err(_) => warn!("Dispatcher still in use after drain, leaving workers detached"),
        }

        state.send_replace(ServerState::Closed);
        info!(scenes = scenes.len(), revision = scenes.revision(), "Server closed");
        outcome
    }
}
