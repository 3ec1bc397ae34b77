//! Quasar node: hosts a session loop, accepts sessions from other nodes and
//! connects to the peers named in its config.
//!
//! Run with: `cargo run -p quasar-node -- --id gate-1 --peer battle-1@127.0.0.1:7801`

mod node;
mod settings;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use quasar_config::{CliArgs, Config, default_config_dir};
use quasar_session::{PostcardCodec, SessionLoop, drain_app_events};
use tracing::{error, info, warn};

use crate::node::{Node, NodeMessage};

/// How often application events are drained.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How often `config.ron` is checked for edits.
const CONFIG_RELOAD_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let config_dir = match args.config.clone() {
        Some(dir) => dir,
        None => default_config_dir()?,
    };
    let mut file_config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    let mut config = file_config.clone();
    config.apply_cli_overrides(&args)?;

    let log_dir = config_dir.join("logs");
    quasar_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));
    info!(
        "Starting node {} ({}) with {} peer(s)",
        config.node.id,
        config.node.role,
        config.peers.len()
    );

    let (session_loop, events) = SessionLoop::<NodeMessage>::spawn(
        settings::loop_config(&config.node),
        Arc::new(PostcardCodec),
    )
    .context("failed to start session loop")?;
    let loop_handle = session_loop.handle().clone();

    let (listen_addr, acceptor) = settings::acceptor(&config)?;
    let bound = loop_handle
        .listen(listen_addr, acceptor)
        .await
        .context("session loop stopped before listening")?
        .with_context(|| format!("failed to listen on {listen_addr}"))?;
    info!("Accepting sessions on {bound}");

    let session_config = settings::session_config(&config.session);
    for peer in &config.peers {
        let (addr, target) = settings::peer_target(&config.node, peer)?;
        let connecting = loop_handle.connect(addr, target, session_config.clone());
        let peer_id = peer.id.clone();
        tokio::spawn(async move {
            match connecting.await {
                Ok(session) => info!("Connected to {peer_id} as {}", session.session_id()),
                Err(e) => warn!("Could not connect to {peer_id} at {addr}: {e}"),
            }
        });
    }

    let mut node = Node::new(settings::local_endpoint(&config.node), config.debug.log_events);
    let mut poll = tokio::time::interval(EVENT_POLL_INTERVAL);
    let mut reload = tokio::time::interval(CONFIG_RELOAD_INTERVAL);
    loop {
        tokio::select! {
            _ = poll.tick() => {
                for event in drain_app_events(&events) {
                    node.handle_event(event);
                }
            }
            _ = reload.tick() => match file_config.reload(&config_dir) {
                Ok(Some(changed)) => {
                    node.apply_reloaded(&changed);
                    file_config = changed;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to reload config: {e}"),
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!("Failed to listen for shutdown signal: {e}");
                }
                break;
            }
        }
    }

    info!("Shutting down with {} active session(s)", node.session_count());
    node.close_all().await;
    tokio::task::spawn_blocking(move || session_loop.shutdown()).await?;
    Ok(())
}
