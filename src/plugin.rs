//! Optional slice post-processing between reconstruction and the viewer.
//!
//! The server hands every reconstructed `slice_data` packet to its
//! [`SlicePlugin`] before replying. [`RemotePlugin`] forwards the packet to an
//! external endpoint served by a [`PluginHost`]. A plugin reply whose payload
//! does not match its shape, or any plugin failure, falls back to the
//! unprocessed slice.
//!
//! # Example
//!
//! ```rust,no_run
//! use tomostream::plugin::PluginHost;
//! use tomostream::transport::Endpoint;
//!
//! # async fn example() -> tomostream::Result<()> {
//! let host = PluginHost::bind(&Endpoint::default_plugin()).await?;
//! host.serve(|shape, data, _slice_id| (shape, data.iter().map(|v| v.max(0.0)).collect()))
//!     .await?;
//! # Ok(())
//! # }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::packet::frame::{self, DEFAULT_MAX_FRAME_LEN};
use crate::packet::{Packet, SliceDataPacket};
use crate::server::ShutdownHandle;
use crate::transport::Endpoint;
use crate::types::SliceId;
use crate::{Result, StreamError};

/// Transforms a reconstructed slice on its way to the viewer.
#[async_trait]
pub trait SlicePlugin: Send + Sync + 'static {
    async fn process(&self, slice: SliceDataPacket) -> Result<SliceDataPacket>;
}

/// Returns every slice unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPlugin;

#[async_trait]
impl SlicePlugin for IdentityPlugin {
    async fn process(&self, slice: SliceDataPacket) -> Result<SliceDataPacket> {
        Ok(slice)
    }
}

/// Run `slice` through `plugin`, keeping the original on any violation.
///
/// Scene and slice ids always come from the original packet.
pub async fn process_or_passthrough(plugin: &dyn SlicePlugin, slice: SliceDataPacket) -> SliceDataPacket {
    let (scene_id, slice_id, is_final) = (slice.scene_id, slice.slice_id, slice.is_final);
    match plugin.process(slice.clone()).await {
        Ok(processed) if processed.is_consistent() => {
            SliceDataPacket { scene_id, slice_id, is_final, ..processed }
        }
        Ok(processed) => {
            warn!(
                scene_id,
                slice_id,
                shape = ?processed.shape,
                len = processed.data.len(),
                "Plugin returned an inconsistent slice, using the unprocessed one"
            );
            slice
        }
        Err(e) => {
            warn!(scene_id, slice_id, error = %e, "Plugin failed, using the unprocessed slice");
            slice
        }
    }
}

/// Forwards slices to a plugin endpoint over one lazily opened connection.
///
/// The timeout covers connecting as well as the exchange. A failed exchange
/// drops the connection; the next slice reconnects.
pub struct RemotePlugin {
    endpoint: Endpoint,
    connection: Mutex<Option<TcpStream>>,
    timeout: Duration,
}

impl RemotePlugin {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint, connection: Mutex::new(None), timeout: Self::DEFAULT_TIMEOUT }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn connect_and_exchange(
        &self,
        connection: &mut Option<TcpStream>,
        slice: &SliceDataPacket,
    ) -> Result<SliceDataPacket> {
        if connection.is_none() {
            *connection = Some(self.endpoint.connect().await?);
            debug!(endpoint = %self.endpoint, "Connected to plugin");
        }
        let Some(stream) = connection.as_mut() else {
            return Err(StreamError::transport("plugin connection unavailable"));
        };
        self.exchange(stream, slice).await
    }

    async fn exchange(&self, stream: &mut TcpStream, slice: &SliceDataPacket) -> Result<SliceDataPacket> {
        let request: Packet = slice.clone().into();
        frame::write_frame(stream, &request.encode()?).await?;
        let payload = frame::read_frame(stream, DEFAULT_MAX_FRAME_LEN)
            .await?
            .ok_or_else(|| StreamError::transport(format!("plugin at {} closed the connection", self.endpoint)))?;
        match Packet::decode(&payload)? {
            Packet::SliceData(processed) => Ok(processed),
            other => Err(StreamError::transport(format!(
                "plugin at {} answered with {} instead of slice_data",
                self.endpoint,
                other.kind()
            ))),
        }
    }
}

#[async_trait]
impl SlicePlugin for RemotePlugin {
    async fn process(&self, slice: SliceDataPacket) -> Result<SliceDataPacket> {
        let mut connection = self.connection.lock().await;
        let result = tokio::time::timeout(self.timeout, self.connect_and_exchange(&mut connection, &slice))
            .await
            .unwrap_or_else(|_| Err(StreamError::Timeout { duration: self.timeout }));
        if result.is_err() {
            *connection = None;
        }
        result
    }
}

/// Hosts a slice-processing callback on an endpoint.
pub struct PluginHost {
    listener: TcpListener,
    shutdown: ShutdownHandle,
}

impl PluginHost {
    pub async fn bind(endpoint: &Endpoint) -> Result<Self> {
        let listener = endpoint.bind().await?;
        Ok(Self { listener, shutdown: ShutdownHandle::new() })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Serve until shut down. `callback` receives `(shape, data, slice_id)` and
    /// returns the processed `(shape, data)`.
    pub async fn serve<F>(self, callback: F) -> Result<()>
    where
        F: Fn([u32; 2], Vec<f32>, SliceId) -> ([u32; 2], Vec<f32>) + Send + Sync + 'static,
    {
        let callback = Arc::new(callback);
        let tracker = TaskTracker::new();
        info!(local_addr = ?self.listener.local_addr().ok(), "Plugin host listening");

        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Plugin client connected");
                    let callback = Arc::clone(&callback);
                    let shutdown = self.shutdown.clone();
                    tracker.spawn(async move {
                        if let Err(e) = serve_connection(stream, callback, shutdown).await {
                            warn!(%peer, error = %e, "Plugin connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "Plugin host accept failed"),
            }
        }

        tracker.close();
        tracker.wait().await;
        info!("Plugin host stopped");
        Ok(())
    }
}

async fn serve_connection<F>(mut stream: TcpStream, callback: Arc<F>, shutdown: ShutdownHandle) -> Result<()>
where
    F: Fn([u32; 2], Vec<f32>, SliceId) -> ([u32; 2], Vec<f32>) + Send + Sync + 'static,
{
    loop {
        let payload = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            payload = frame::read_frame(&mut stream, DEFAULT_MAX_FRAME_LEN) => payload?,
        };
        let Some(payload) = payload else {
            return Ok(());
        };

        let slice = match Packet::decode(&payload)? {
            Packet::SliceData(slice) => slice,
            other => {
                return Err(StreamError::transport(format!("plugin clients must send slice_data, got {}", other.kind())));
            }
        };

        let input = slice.clone();
        let callback = Arc::clone(&callback);
        let (shape, data) = tokio::task::spawn_blocking(move || callback(slice.shape, slice.data, slice.slice_id))
            .await
            .map_err(|e| StreamError::reconstruction(format!("plugin callback failed: {e}")))?;

        let processed = SliceDataPacket { shape, data, ..input.clone() };
        let reply = if processed.is_consistent() {
            processed
        } else {
            warn!(slice_id = input.slice_id, shape = ?shape, "Plugin callback broke the shape contract");
            input
        };
        trace!(slice_id = reply.slice_id, shape = ?reply.shape, "Plugin processed slice");
        frame::write_frame(&mut stream, &Packet::from(reply).encode()?).await?;
    }
}
