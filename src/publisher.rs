//! Pushes acquisition packets to a server's ingest endpoint.
//!
//! A publisher owns one connection. In [`PublishMode::Push`] `send` returns as
//! soon as the frame is written; in [`PublishMode::RequestConfirm`] it waits for
//! the server's confirm frame, at most [`DEFAULT_CONFIRM_TIMEOUT`] unless
//! configured otherwise. The first transport failure poisons the publisher:
//! there is no internal retry or reconnect.
//!
//! A push publisher talking to a confirming server discards the confirms it
//! never asked for, so the server never blocks on a full socket buffer.
//!
//! # Example
//!
//! ```rust,no_run
//! use tomostream::publisher::{PublishMode, Publisher};
//! use tomostream::packet::{GeometrySpecificationPacket, Packet};
//! use tomostream::transport::Endpoint;
//! use tomostream::types::VolumeWindow;
//!
//! # async fn example() -> tomostream::Result<()> {
//! let endpoint: Endpoint = "tcp://localhost:5558".parse()?;
//! let mut publisher = Publisher::connect(&endpoint, PublishMode::RequestConfirm).await?;
//!
//! let packet: Packet = GeometrySpecificationPacket { scene_id: 0, window: VolumeWindow::default() }.into();
//! publisher.send(&packet).await?;
//! # Ok(())
//! # }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tracing::{debug, trace, warn};

use crate::packet::frame::{self, CONFIRM, DEFAULT_MAX_FRAME_LEN};
use crate::packet::{Packet, sort_acquisition_order};
use crate::transport::Endpoint;
use crate::{Result, StreamError};

/// How a publisher and the ingest endpoint hand off frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishMode {
    /// Fire and forget; `send` returns once the frame is written.
    #[default]
    Push,
    /// Every frame is acknowledged with a 4-byte confirm frame.
    RequestConfirm,
}

/// Upper bound on waiting for one confirm frame.
pub const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(5);

/// Length prefix plus payload of one confirm frame.
const CONFIRM_FRAME_LEN: u64 = 4 + CONFIRM.len() as u64;

/// Client side of the ingest channel.
pub struct Publisher {
    endpoint: Endpoint,
    mode: PublishMode,
    stream: Option<TcpStream>,
    confirm_timeout: Duration,
    sent: u64,
    /// Bytes read and dropped in push mode.
    discarded: u64,
}

impl Publisher {
    pub async fn connect(endpoint: &Endpoint, mode: PublishMode) -> Result<Self> {
        let stream = endpoint.connect().await?;
        debug!(endpoint = %endpoint, ?mode, "Publisher connected");
        Ok(Self {
            endpoint: endpoint.clone(),
            mode,
            stream: Some(stream),
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
            sent: 0,
            discarded: 0,
        })
    }

    /// Bound the wait for each confirm frame. Expiry poisons the publisher.
    pub fn with_confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    pub fn confirm_timeout(&self) -> Duration {
        self.confirm_timeout
    }

    /// Confirm frames a push publisher received and discarded, which means
    /// the server runs in request/confirm mode.
    pub fn unsolicited_confirms(&self) -> u64 {
        self.discarded / CONFIRM_FRAME_LEN
    }

    pub fn mode(&self) -> PublishMode {
        self.mode
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Packets accepted so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn is_poisoned(&self) -> bool {
        self.stream.is_none()
    }

    /// Send one packet.
    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(StreamError::transport(format!(
                "publisher to {} is unusable after an earlier failure",
                self.endpoint
            )));
        };

        let bytes = match packet.encode() {
            Ok(bytes) => bytes,
            // nothing was written, the connection is still usable
            Err(e) => return Err(e.into()),
        };
        let result = match self.mode {
            PublishMode::Push => Self::push(stream, &bytes, &mut self.discarded, &self.endpoint).await,
            PublishMode::RequestConfirm => Self::exchange(stream, &bytes, self.confirm_timeout).await,
        };
        match result {
            Ok(()) => {
                self.sent += 1;
                trace!(kind = %packet.kind(), scene_id = packet.scene_id(), bytes = bytes.len(), "Sent packet");
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %self.endpoint, error = %e, "Publisher failed, closing connection");
                self.stream = None;
                Err(e)
            }
        }
    }

    /// Send packets in the given order.
    pub async fn send_all(&mut self, packets: &[Packet]) -> Result<()> {
        for packet in packets {
            self.send(packet).await?;
        }
        Ok(())
    }

    /// Send packets after a stable reorder into the canonical acquisition order.
    pub async fn send_acquisition(&mut self, mut packets: Vec<Packet>) -> Result<()> {
        sort_acquisition_order(&mut packets);
        self.send_all(&packets).await
    }

    /// Close the connection. Later sends fail.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            use tokio::io::AsyncWriteExt;
            let _ = stream.shutdown().await;
        }
    }

    async fn push(stream: &mut TcpStream, bytes: &[u8], discarded: &mut u64, endpoint: &Endpoint) -> Result<()> {
        Self::discard_pending(stream, discarded, endpoint)?;
        frame::write_frame(stream, bytes).await?;
        Self::discard_pending(stream, discarded, endpoint)
    }

    /// Drop whatever the server sent without blocking.
    fn discard_pending(stream: &mut TcpStream, discarded: &mut u64, endpoint: &Endpoint) -> Result<()> {
        let mut buf = [0u8; 256];
        loop {
            match stream.try_read(&mut buf) {
                Ok(0) => return Err(StreamError::transport("server closed the connection")),
                Ok(n) => {
                    if *discarded == 0 {
                        warn!(
                            endpoint = %endpoint,
                            "Server sends confirms to a push publisher, its ingest mode is request_confirm"
                        );
                    }
                    *discarded += n as u64;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn exchange(stream: &mut TcpStream, bytes: &[u8], confirm_timeout: Duration) -> Result<()> {
        frame::write_frame(stream, bytes).await?;

        let reply = tokio::time::timeout(confirm_timeout, frame::read_frame(stream, DEFAULT_MAX_FRAME_LEN))
            .await
            .map_err(|_| StreamError::Timeout { duration: confirm_timeout })??;

        match reply {
            Some(payload) if payload[..] == CONFIRM => Ok(()),
            Some(payload) => Err(StreamError::transport(format!(
                "unexpected confirm payload of {} bytes",
                payload.len()
            ))),
            None => Err(StreamError::transport("server closed the connection before confirming")),
        }
    }
}
