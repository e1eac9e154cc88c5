use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::platform;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub socket: SocketConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub stations: StationsConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub preload: PreloadConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Framed TCP socket for push-style UI clients.  Shares `http.bind_address`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_socket_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Output device name; `None` uses the system default.
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default = "default_volume")]
    pub default_volume: f32,
    /// Duration of scheduled gain/EQ ramps.
    #[serde(default = "default_ramp_ms")]
    pub ramp_ms: u32,
    /// Decoded audio kept per source; older samples are dropped.
    #[serde(default = "default_buffer_secs")]
    pub buffer_secs: u32,
    /// Buffered audio required before a source reports ready.
    #[serde(default = "default_preroll_ms")]
    pub preroll_ms: u32,
}

/// Station list source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationsConfig {
    /// Path to a local TOML station file (highest priority).
    #[serde(default = "default_stations_toml")]
    pub stations_toml: PathBuf,
    /// Optional m3u playlist, either an https:// URL or a file path.
    #[serde(default)]
    pub m3u: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Live streams never end; stop reading after this many bytes.
    #[serde(default = "default_read_limit_bytes")]
    pub read_limit_bytes: usize,
    #[serde(default = "default_metadata_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreloadConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Measured throughput above which every station is buffered eagerly.
    #[serde(default = "default_threshold_kbps")]
    pub threshold_kbps: u32,
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_probe_bytes")]
    pub probe_bytes: usize,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            bind_address: default_bind_address(),
            port: default_port(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            port: default_socket_port(),
        }
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            default_volume: default_volume(),
            ramp_ms: default_ramp_ms(),
            buffer_secs: default_buffer_secs(),
            preroll_ms: default_preroll_ms(),
        }
    }
}

impl Default for StationsConfig {
    fn default() -> Self {
        Self {
            stations_toml: default_stations_toml(),
            m3u: None,
        }
    }
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            read_limit_bytes: default_read_limit_bytes(),
            timeout_secs: default_metadata_timeout_secs(),
        }
    }
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            threshold_kbps: default_threshold_kbps(),
            probe_url: default_probe_url(),
            probe_bytes: default_probe_bytes(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8989
}

fn default_socket_port() -> u16 {
    platform::DAEMON_TCP_PORT
}

fn default_volume() -> f32 {
    1.0
}

fn default_ramp_ms() -> u32 {
    25
}

fn default_buffer_secs() -> u32 {
    4
}

fn default_preroll_ms() -> u32 {
    250
}

fn default_stations_toml() -> PathBuf {
    platform::config_dir().join("stations.toml")
}

fn default_poll_interval_secs() -> u64 {
    10
}

fn default_read_limit_bytes() -> usize {
    64 * 1024
}

fn default_metadata_timeout_secs() -> u64 {
    8
}

fn default_threshold_kbps() -> u32 {
    2048
}

fn default_probe_url() -> String {
    "https://speed.cloudflare.com/__down?bytes=1000000".to_string()
}

fn default_probe_bytes() -> usize {
    1_000_000
}

fn default_probe_timeout_secs() -> u64 {
    5
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&config_path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        platform::config_dir().join("config.toml")
    }
}
