//! Error types for the streaming core.
//!
//! All errors implement `std::error::Error` and carry enough context to tell a
//! broken connection apart from a rejected packet or a failed reconstruction.
//!
//! ## Error Categories
//!
//! - **Transport Errors**: bind/connect/send/receive failures, fatal to the connection
//! - **Protocol Errors**: a single packet failed to decode or disagreed with scene state
//! - **Reconstruction Errors**: a worker failed; surfaced to viewers as an empty reply
//! - **Timeouts**: a bounded wait (dispatch join, confirm) expired
//! - **Configuration Errors**: invalid or unreadable server configuration
//!
//! ## Recovery and Retry
//!
//! ```rust
//! use tomostream::StreamError;
//!
//! let error = StreamError::transport("connection reset by peer");
//! if error.is_retryable() {
//!     for suggestion in error.recovery_suggestions() {
//!         println!("  - {}", suggestion);
//!     }
//! }
//! ```

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::packet::DecodeError;
use crate::packet::frame::FrameError;

/// Result type alias for streaming operations.
pub type Result<T, E = StreamError> = std::result::Result<T, E>;

/// Main error type for streaming operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StreamError {
    #[error("Transport failure: {reason}")]
    Transport {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Protocol error: {0}")]
    Protocol(#[from] DecodeError),

    #[error("Reconstruction failed: {reason}")]
    Reconstruction { reason: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Invalid configuration: {reason}")]
    Config {
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Configuration file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StreamError {
    /// Returns whether this error is potentially recoverable through retry.
    ///
    /// The core never retries on its own; this only informs callers that wrap
    /// a `Publisher` or client with their own policy.
    pub fn is_retryable(&self) -> bool {
        match self {
            StreamError::Transport { .. } => true,
            StreamError::Timeout { .. } => true,
            StreamError::Reconstruction { .. } => true,
            StreamError::Protocol(_) => false,
            StreamError::Config { .. } => false,
            StreamError::File { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            StreamError::Transport { .. } => vec![
                "Check that the server is running and the endpoint is reachable",
                "Verify the port is not already bound by another process",
                "Reconnect with a fresh publisher or client",
            ],
            StreamError::Protocol(_) => vec![
                "Check that publisher and server use the same packet catalogue",
                "Verify declared shapes match the payload length",
                "Send geometry and scan settings before projections",
            ],
            StreamError::Reconstruction { .. } => vec![
                "Check the reconstruction backend logs",
                "Verify the slice orientation is not degenerate",
                "Retry once more projection data has arrived",
            ],
            StreamError::Timeout { .. } => vec![
                "Increase the join timeout for pooled dispatch",
                "Reduce the requested slice resolution",
                "Check worker load and device availability",
            ],
            StreamError::Config { .. } => vec![
                "Check the configuration keys and value ranges",
                "Compare against the default configuration",
            ],
            StreamError::File { .. } => vec![
                "Check the configuration file exists and is readable",
                "Check file permissions",
            ],
        }
    }

    /// Helper constructor for transport errors.
    pub fn transport(reason: impl Into<String>) -> Self {
        StreamError::Transport { reason: reason.into(), source: None }
    }

    /// Helper constructor for transport errors with source.
    pub fn transport_with_source(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        StreamError::Transport { reason: reason.into(), source: Some(Box::new(source)) }
    }

    /// Helper constructor for reconstruction errors.
    pub fn reconstruction(reason: impl Into<String>) -> Self {
        StreamError::Reconstruction { reason: reason.into() }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        StreamError::Config { reason: reason.into(), source: None }
    }

    /// Helper constructor for configuration errors with source.
    pub fn config_with_source(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        StreamError::Config { reason: reason.into(), source: Some(Box::new(source)) }
    }

    /// Helper constructor for configuration file errors.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        StreamError::File { path, source }
    }
}

impl From<std::io::Error> for StreamError {
    fn from(err: std::io::Error) -> Self {
        StreamError::Transport { reason: err.to_string(), source: Some(Box::new(err)) }
    }
}

impl From<FrameError> for StreamError {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::TooLarge { len, max } => {
                StreamError::Protocol(DecodeError::FrameTooLarge { len, max })
            }
            other => StreamError::Transport { reason: other.to_string(), source: Some(Box::new(other)) },
        }
    }
}
