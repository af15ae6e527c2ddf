//! TCP endpoints in `tcp://host:port` form.
//!
//! `*` as host binds all interfaces. Host names are resolved by the runtime.
//!
//! # Example
//!
//! ```rust
//! use tomostream::transport::Endpoint;
//!
//! let endpoint: Endpoint = "tcp://*:5558".parse().unwrap();
//! assert_eq!(endpoint.port(), 5558);
//! assert_eq!(endpoint.to_string(), "tcp://*:5558");
//! ```

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::{Result, StreamError};

pub const DEFAULT_INGEST_PORT: u16 = 5558;
pub const DEFAULT_REPLY_PORT: u16 = 5555;
pub const DEFAULT_PLUGIN_PORT: u16 = 5652;

const SCHEME: &str = "tcp://";
const ANY_HOST: &str = "*";

/// A `tcp://host:port` address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self { host: host.into(), port }
    }

    /// Endpoint bound on every interface.
    pub fn any(port: u16) -> Self {
        Self::new(ANY_HOST, port)
    }

    pub fn localhost(port: u16) -> Self {
        Self::new("localhost", port)
    }

    pub fn default_ingest() -> Self {
        Self::any(DEFAULT_INGEST_PORT)
    }

    pub fn default_reply() -> Self {
        Self::any(DEFAULT_REPLY_PORT)
    }

    pub fn default_plugin() -> Self {
        Self::localhost(DEFAULT_PLUGIN_PORT)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The endpoint of an already bound socket.
    pub fn from_socket_addr(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }

    fn socket_host(&self) -> &str {
        if self.host == ANY_HOST { "0.0.0.0" } else { &self.host }
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let listener = TcpListener::bind((self.socket_host(), self.port))
            .await
            .map_err(|e| StreamError::transport_with_source(format!("failed to bind {}", self), e))?;
        debug!(endpoint = %self, local_addr = ?listener.local_addr().ok(), "Bound listener");
        Ok(listener)
    }

    pub async fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect((self.socket_host(), self.port))
            .await
            .map_err(|e| StreamError::transport_with_source(format!("failed to connect to {}", self), e))?;
        // packets are written as one frame each; do not wait for more
        stream
            .set_nodelay(true)
            .map_err(|e| StreamError::transport_with_source(format!("failed to configure {}", self), e))?;
        debug!(endpoint = %self, "Connected");
        Ok(stream)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{SCHEME}[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{SCHEME}{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        let rest = s
            .strip_prefix(SCHEME)
            .ok_or_else(|| StreamError::config(format!("endpoint '{s}' must start with {SCHEME}")))?;
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| StreamError::config(format!("endpoint '{s}' is missing a port")))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(StreamError::config(format!("endpoint '{s}' is missing a host")));
        }
        let port = port
            .parse::<u16>()
            .map_err(|e| StreamError::config_with_source(format!("endpoint '{s}' has an invalid port"), e))?;
        Ok(Self::new(host, port))
    }
}

impl TryFrom<String> for Endpoint {
    type Error = StreamError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Endpoint> for String {
    fn from(endpoint: Endpoint) -> Self {
        endpoint.to_string()
    }
}
