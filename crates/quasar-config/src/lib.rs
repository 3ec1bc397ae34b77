//! Configuration for quasar nodes.
//!
//! Settings persist to disk as `config.ron` and every section falls back to
//! its defaults when missing, so older files keep loading. Command-line
//! arguments parsed with clap override whatever the file says.

mod cli;
mod config;
mod error;

pub use cli::{CliArgs, parse_peer};
pub use config::{
    Config, DebugConfig, HandshakeModeSetting, NodeConfig, PeerConfig, SessionSettings,
    default_config_dir,
};
pub use error::ConfigError;
