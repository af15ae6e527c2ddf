//! Server configuration loaded from YAML.
//!
//! Every field has a default, so an empty document is a valid configuration.
//!
//! ```yaml
//! ingest_endpoint: "tcp://*:5558"
//! reply_endpoint: "tcp://*:5555"
//! plugin_endpoint: "tcp://localhost:5652"
//! refresh_endpoint: "tcp://localhost:5556"
//! ingest_mode: request_confirm
//! dispatch:
//!   policy: pooled
//!   workers: 4
//!   join_timeout_ms: 2000
//!   fan_in: sum
//! reconstruction:
//!   slice_size: 512
//!   preview_size: 128
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::DispatchConfig;
use crate::packet::frame::DEFAULT_MAX_FRAME_LEN;
use crate::publisher::PublishMode;
use crate::transport::Endpoint;
use crate::{Result, StreamError};

/// Parameters shared with reconstruction backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconstructionSettings {
    /// Edge length of a slice requested with an unspecified shape.
    pub slice_size: u32,
    /// Edge length of the coarse preview volume pushed after new projections.
    /// Zero disables previews.
    pub preview_size: u32,
    /// Frequency-domain filter replacing the backend's default ramp filter.
    pub custom_filter: Option<Vec<f32>>,
}

impl Default for ReconstructionSettings {
    fn default() -> Self {
        Self { slice_size: 512, preview_size: 128, custom_filter: None }
    }
}

impl ReconstructionSettings {
    pub fn validate(&self) -> Result<()> {
        if self.slice_size == 0 {
            return Err(StreamError::config("reconstruction.slice_size must be positive"));
        }
        if self.custom_filter.as_ref().is_some_and(|f| f.is_empty()) {
            return Err(StreamError::config("reconstruction.custom_filter must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub ingest_endpoint: Endpoint,
    pub reply_endpoint: Endpoint,
    /// Slices are post-processed by the plugin at this endpoint when set.
    pub plugin_endpoint: Option<Endpoint>,
    /// Refreshed slices and previews are pushed here after new projections.
    pub refresh_endpoint: Option<Endpoint>,
    pub ingest_mode: PublishMode,
    /// Decoded packets buffered between connection readers and the ingest loop.
    pub ingest_queue_depth: usize,
    pub max_frame_len: u32,
    /// How long shutdown waits for in-flight work.
    pub drain_timeout_ms: u64,
    pub dispatch: DispatchConfig,
    pub reconstruction: ReconstructionSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ingest_endpoint: Endpoint::default_ingest(),
            reply_endpoint: Endpoint::default_reply(),
            plugin_endpoint: None,
            refresh_endpoint: None,
            ingest_mode: PublishMode::Push,
            ingest_queue_depth: 1024,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            drain_timeout_ms: 5_000,
            dispatch: DispatchConfig::default(),
            reconstruction: ReconstructionSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        // an empty document deserializes as unit, not as an empty map
        let config: Self = if yaml.trim().is_empty() {
            Self::default()
        } else {
            serde_yaml_ng::from_str(yaml)
                .map_err(|e| StreamError::config_with_source("failed to parse server configuration", e))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| StreamError::file_error(path.to_path_buf(), e))?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml_ng::to_string(self)
            .map_err(|e| StreamError::config_with_source("failed to serialize server configuration", e))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.dispatch.validate()?;
        if self.ingest_queue_depth == 0 {
            return Err(StreamError::config("ingest_queue_depth must be positive"));
        }
        if self.max_frame_len == 0 {
            return Err(StreamError::config("max_frame_len must be positive"));
        }
        if self.drain_timeout_ms == 0 {
            return Err(StreamError::config("drain_timeout_ms must be positive"));
        }
        self.reconstruction.validate()
    }
}
