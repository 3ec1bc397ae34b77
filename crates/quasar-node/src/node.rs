//! What a node does with its sessions.

use std::collections::HashMap;

use quasar_config::Config;
use quasar_session::{AppEvent, Endpoint, SessionHandle, SessionKey};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Messages exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeMessage {
    /// First message on every session, naming the sender.
    Hello {
        /// Sender's endpoint id.
        id: String,
        /// Sender's role.
        role: String,
    },
    /// Free-form text.
    Text(String),
    /// Number of sessions the sender currently holds.
    Status {
        /// Active sessions.
        sessions: usize,
    },
}

/// Tracks active sessions and reacts to application events.
pub struct Node {
    local: Endpoint,
    log_events: bool,
    sessions: HashMap<SessionKey, SessionHandle<NodeMessage>>,
}

impl Node {
    /// A node speaking as `local`.
    pub fn new(local: Endpoint, log_events: bool) -> Self {
        Self {
            local,
            log_events,
            sessions: HashMap::new(),
        }
    }

    /// Active sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Pick up settings that can change while the node runs.
    pub fn apply_reloaded(&mut self, config: &Config) {
        if self.log_events != config.debug.log_events {
            info!("Event logging turned {}", if config.debug.log_events { "on" } else { "off" });
            self.log_events = config.debug.log_events;
        }
    }

    /// React to one event from the session loop.
    pub fn handle_event(&mut self, event: AppEvent<NodeMessage>) {
        match event {
            AppEvent::Connected(session) => {
                info!("Session {} with {} is up", session.key(), session.remote_identity());
                let hello = NodeMessage::Hello {
                    id: self.local.id.clone(),
                    role: self.local.role.clone(),
                };
                if let Err(e) = session.send_and_flush(hello) {
                    warn!("Failed to greet {}: {e}", session.remote_identity());
                }
                self.sessions.insert(session.key().clone(), session);
            }
            AppEvent::Disconnected { key, remote } => {
                self.sessions.remove(&key);
                match remote {
                    Some(remote) => info!("Session {key} with {remote} is down"),
                    None => info!("Session {key} is down"),
                }
            }
            AppEvent::Message { key, payload } => self.on_message(&key, payload),
            AppEvent::Request { key, request_id, body } => {
                if self.log_events {
                    debug!("Request {request_id} on {key}: {body:?}");
                }
                let Some(session) = self.sessions.get(&key) else {
                    return;
                };
                let reply = NodeMessage::Status {
                    sessions: self.sessions.len(),
                };
                if let Err(e) = session.send_response(request_id, reply) {
                    warn!("Failed to answer request {request_id} on {key}: {e}");
                }
            }
            AppEvent::Response { key, request_id, body } => {
                if self.log_events {
                    info!("Response {request_id} on {key}: {body:?}");
                }
            }
        }
    }

    fn on_message(&self, key: &SessionKey, message: NodeMessage) {
        if !self.log_events {
            return;
        }
        match message {
            NodeMessage::Hello { id, role } => info!("{key}: hello from {id} ({role})"),
            NodeMessage::Text(text) => info!("{key}: {text}"),
            NodeMessage::Status { sessions } => info!("{key}: peer holds {sessions} session(s)"),
        }
    }

    /// Close every session this node tracks.
    pub async fn close_all(&mut self) {
        for (key, session) in self.sessions.drain() {
            if session.close().await.is_err() {
                debug!("Session loop already gone while closing {key}");
            }
        }
    }
}
