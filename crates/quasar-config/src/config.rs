//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Top-level node configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Identity and listening address of this node.
    pub node: NodeConfig,
    /// Settings applied to every session this node opens or accepts.
    pub session: SessionSettings,
    /// Nodes to connect to at startup.
    pub peers: Vec<PeerConfig>,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Identity and listener of this node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NodeConfig {
    /// Endpoint id, unique across the cluster.
    pub id: String,
    /// Role of this node, e.g. "gate" or "battle".
    pub role: String,
    /// Address to accept sessions on.
    pub listen_address: String,
    /// Port to accept sessions on. 0 picks a free port.
    pub listen_port: u16,
    /// Session loop tick in milliseconds.
    pub tick_interval_ms: u64,
}

/// How sessions authenticate their handshake.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum HandshakeModeSetting {
    /// Fixed sentinels, no resume.
    #[default]
    Trusted,
    /// Attempt counters, resumable after transport loss.
    Verified,
}

/// Per-session settings, in plain units so the file stays readable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    /// Handshake mode.
    pub mode: HandshakeModeSetting,
    /// Time allowed to establish the raw connection, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Time allowed for the handshake exchange, in milliseconds.
    pub verify_timeout_ms: u64,
    /// Write-idle time before a ping, in milliseconds.
    pub ping_interval_ms: u64,
    /// Read-idle time before the session closes, in milliseconds.
    pub session_timeout_ms: u64,
    /// Buffered messages that trigger an automatic flush.
    pub flush_threshold: usize,
    /// Unacknowledged messages retained in verified mode.
    pub max_unacked: usize,
    /// Enable request/response support.
    pub rpc_enabled: bool,
    /// Redial lost transports of verified sessions.
    pub auto_reconnect: bool,
}

/// A node to connect to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PeerConfig {
    /// Endpoint id of the peer.
    pub id: String,
    /// Role of the peer.
    pub role: String,
    /// Socket address of the peer's listener.
    pub address: String,
    /// Distinguishes parallel sessions to the same peer.
    pub discriminator: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log filter override (e.g., "debug", "info,quasar_session=trace").
    pub log_level: String,
    /// Log every application event the node receives.
    pub log_events: bool,
}

// --- Default implementations ---

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: "node".to_string(),
            role: "server".to_string(),
            listen_address: "127.0.0.1".to_string(),
            listen_port: 7800,
            tick_interval_ms: 10,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            mode: HandshakeModeSetting::Trusted,
            connect_timeout_ms: 5_000,
            verify_timeout_ms: 5_000,
            ping_interval_ms: 5_000,
            session_timeout_ms: 30_000,
            flush_threshold: 32,
            max_unacked: 4096,
            rpc_enabled: false,
            auto_reconnect: true,
        }
    }
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            role: "server".to_string(),
            address: "127.0.0.1:7800".to_string(),
            discriminator: 0,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_events: true,
        }
    }
}

/// Platform config directory for quasar, e.g. `~/.config/quasar` on Linux.
pub fn default_config_dir() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("quasar"))
        .ok_or(ConfigError::NoConfigDir)
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.ron");

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join("config.ron");
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join("config.ron");
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }
}
