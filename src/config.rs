//! Application configuration
//!
//! Every section falls back to its defaults, so an empty file (or no file at
//! all) is a valid configuration.

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::constants::{
    CAPACITY_MULTIPLIER, DEFAULT_PORT, DEFAULT_STREAM_NAME, DRAIN_INTERVAL_MS, MAX_READ_SIZE,
    OUTPUT_FILE_NAME,
};
use crate::error::{Error, Result};

const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub peer: PeerConfig,
    pub network: NetworkConfig,
    pub stream: StreamConfig,
    pub recording: RecordingConfig,
}

/// How this node presents itself to others
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub display_name: String,
}

impl Default for PeerConfig {
    fn default() -> Self {
        let display_name = std::env::var("HOSTNAME")
            .ok()
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| "peer".to_string());
        Self { display_name }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub port: u16,
    /// `host:port` dialled when browsing for a peer.
    pub connect_to: Option<String>,
    pub nodelay: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            connect_to: None,
            nodelay: true,
        }
    }
}

/// Audio stream sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Name of the byte stream opened towards the recorder.
    pub name: String,
    /// Largest single read from or write to a stream, in bytes.
    pub max_read_size: usize,
    /// Ring buffer capacity as a multiple of `max_read_size`.
    pub capacity_multiplier: usize,
    pub drain_interval_ms: u64,
}

impl StreamConfig {
    /// Ring buffer capacity in bytes.
    pub fn ring_capacity(&self) -> usize {
        self.max_read_size.max(1) * self.capacity_multiplier.max(1)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_STREAM_NAME.to_string(),
            max_read_size: MAX_READ_SIZE,
            capacity_multiplier: CAPACITY_MULTIPLIER,
            drain_interval_ms: DRAIN_INTERVAL_MS,
        }
    }
}

/// Where received audio is written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub output_dir: PathBuf,
    /// File stem; the sink adds its own extension.
    pub file_name: String,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            output_dir: std::env::temp_dir(),
            file_name: OUTPUT_FILE_NAME.to_string(),
        }
    }
}

impl RecordingConfig {
    /// Full path of the recording, overwritten each session.
    pub fn output_path(&self) -> PathBuf {
        self.output_dir.join(format!("{}.wav", self.file_name))
    }
}

impl AppConfig {
    /// Parse configuration text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Read configuration from `path`.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Load `config.toml` from the platform config directory, or defaults
    /// when there is none.
    pub fn load() -> Result<Self> {
        match Self::default_path() {
            Some(path) if path.exists() => {
                tracing::info!(path = %path.display(), "Loading configuration");
                Self::from_file(&path)
            }
            _ => Ok(Self::default()),
        }
    }

    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("net", "peer-mic", "peer-mic-streamer")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE))
    }
}
