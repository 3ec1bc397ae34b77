//! Command-line argument parsing for quasar nodes.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{HandshakeModeSetting, PeerConfig};
use crate::error::ConfigError;
use crate::Config;

/// Quasar node command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug, Default)]
#[command(name = "quasar-node", about = "Quasar session node")]
pub struct CliArgs {
    /// Endpoint id of this node.
    #[arg(long)]
    pub id: Option<String>,

    /// Role of this node.
    #[arg(long)]
    pub role: Option<String>,

    /// Address to listen on.
    #[arg(long)]
    pub listen: Option<String>,

    /// Port to listen on.
    #[arg(long)]
    pub port: Option<u16>,

    /// Use verified, resumable handshakes.
    #[arg(long)]
    pub verified: Option<bool>,

    /// Peer to connect to, as `id@host:port`. Repeatable; replaces configured peers.
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Parse `id@host:port` into a peer with the default role.
pub fn parse_peer(arg: &str) -> Result<PeerConfig, ConfigError> {
    match arg.split_once('@') {
        Some((id, address)) if !id.is_empty() && address.contains(':') => Ok(PeerConfig {
            id: id.to_string(),
            address: address.to_string(),
            ..PeerConfig::default()
        }),
        _ => Err(ConfigError::InvalidPeer(arg.to_string())),
    }
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) -> Result<(), ConfigError> {
        if let Some(ref id) = args.id {
            self.node.id = id.clone();
        }
        if let Some(ref role) = args.role {
            self.node.role = role.clone();
        }
        if let Some(ref addr) = args.listen {
            self.node.listen_address = addr.clone();
        }
        if let Some(port) = args.port {
            self.node.listen_port = port;
        }
        if let Some(verified) = args.verified {
            self.session.mode = if verified {
                HandshakeModeSetting::Verified
            } else {
                HandshakeModeSetting::Trusted
            };
        }
        if !args.peers.is_empty() {
            self.peers = args
                .peers
                .iter()
                .map(|arg| parse_peer(arg.as_str()))
                .collect::<Result<Vec<_>, _>>()?;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_override() {
        let mut config = Config::default();
        let args = CliArgs {
            id: Some("gate-1".to_string()),
            port: Some(9000),
            verified: Some(true),
            peers: vec!["battle-1@10.0.0.2:7800".to_string()],
            ..CliArgs::default()
        };
        config.apply_cli_overrides(&args).unwrap();
        assert_eq!(config.node.id, "gate-1");
        assert_eq!(config.node.listen_port, 9000);
        assert_eq!(config.session.mode, HandshakeModeSetting::Verified);
        assert_eq!(config.peers[0].id, "battle-1");
        assert_eq!(config.peers[0].address, "10.0.0.2:7800");
        // Non-overridden fields retain defaults
        assert_eq!(config.node.listen_address, "127.0.0.1");
    }

    #[test]
    fn test_cli_no_override() {
        let original = Config::default();
        let mut config = Config::default();
        config.apply_cli_overrides(&CliArgs::default()).unwrap();
        assert_eq!(config, original);
    }

    #[test]
    fn test_bad_peer_rejected() {
        assert!(matches!(parse_peer("no-address"), Err(ConfigError::InvalidPeer(_))));
        assert!(matches!(parse_peer("@host:1"), Err(ConfigError::InvalidPeer(_))));
        let args = CliArgs {
            peers: vec!["battle-1".to_string()],
            ..CliArgs::default()
        };
        assert!(Config::default().apply_cli_overrides(&args).is_err());
    }

    #[test]
    fn test_args_parse_repeated_peers() {
        let args = CliArgs::parse_from([
            "quasar-node",
            "--id",
            "gate-1",
            "--peer",
            "a@127.0.0.1:1",
            "--peer",
            "b@127.0.0.1:2",
        ]);
        assert_eq!(args.id.as_deref(), Some("gate-1"));
        assert_eq!(args.peers.len(), 2);
    }
}
