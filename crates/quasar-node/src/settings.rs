//! Translation from file settings to engine settings.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use quasar_config::{Config, HandshakeModeSetting, NodeConfig, PeerConfig, SessionSettings};
use quasar_session::{AcceptorConfig, ConnectTarget, Endpoint, HandshakeMode, LoopConfig, SessionConfig};

/// This node's endpoint.
pub fn local_endpoint(node: &NodeConfig) -> Endpoint {
    Endpoint::new(node.id.clone(), node.role.clone())
}

/// Session settings in engine units.
pub fn session_config(settings: &SessionSettings) -> SessionConfig {
    SessionConfig {
        mode: match settings.mode {
            HandshakeModeSetting::Trusted => HandshakeMode::Trusted,
            HandshakeModeSetting::Verified => HandshakeMode::Verified,
        },
        connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
        verify_timeout: Duration::from_millis(settings.verify_timeout_ms),
        ping_interval: Duration::from_millis(settings.ping_interval_ms),
        session_timeout: Duration::from_millis(settings.session_timeout_ms),
        flush_threshold: settings.flush_threshold,
        max_unacked: settings.max_unacked,
        rpc_enabled: settings.rpc_enabled,
        auto_reconnect: settings.auto_reconnect,
        ..SessionConfig::default()
    }
}

/// Loop settings for `node`, with the thread named after the node.
pub fn loop_config(node: &NodeConfig) -> LoopConfig {
    LoopConfig {
        tick_interval: Duration::from_millis(node.tick_interval_ms.max(1)),
        thread_name: format!("quasar-{}", node.id),
        ..LoopConfig::default()
    }
}

/// Listener address and acceptor settings.
pub fn acceptor(config: &Config) -> Result<(SocketAddr, AcceptorConfig)> {
    let addr = format!("{}:{}", config.node.listen_address, config.node.listen_port);
    let addr = addr
        .parse()
        .with_context(|| format!("invalid listen address {addr}"))?;
    let acceptor = AcceptorConfig {
        local: local_endpoint(&config.node),
        session: session_config(&config.session),
    };
    Ok((addr, acceptor))
}

/// Dial address and target for a configured peer.
pub fn peer_target(node: &NodeConfig, peer: &PeerConfig) -> Result<(SocketAddr, ConnectTarget)> {
    let addr = peer
        .address
        .parse()
        .with_context(|| format!("invalid address {} for peer {}", peer.address, peer.id))?;
    let target = ConnectTarget::new(local_endpoint(node), Endpoint::new(peer.id.clone(), peer.role.clone()))
        .with_discriminator(peer.discriminator);
    Ok((addr, target))
}
