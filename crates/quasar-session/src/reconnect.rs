//! Redialing verified sessions after transport loss.
//!
//! When the transport under a verified initiator session drops, the session
//! stays active while [`redial`] retries the acceptor's address with
//! exponential backoff and jitter. A new stream is handed to the transfer
//! handler as a resume, which replays whatever the acceptor has not yet
//! acknowledged. Acceptors never redial; they wait for the initiator to come
//! back, and the heartbeat timeout bounds how long they wait.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::event_loop::LoopContext;
use crate::handshake::HandshakeMode;
use crate::pipeline::ReadEvent;
use crate::protocol::ConnectRequest;
use crate::session::{SessionKey, SessionState, Side};
use crate::transfer::{ResumeLink, ResumeRole};

/// Backoff settings for redialing a lost transport.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first redial. Default: 1 s.
    pub initial_delay: Duration,
    /// Multiplier applied to the delay after each failed redial. Default: 2.0.
    pub backoff_multiplier: f64,
    /// Upper bound on the delay between redials. Default: 30 s.
    pub max_delay: Duration,
    /// Redials before the session is closed. Default: 20.
    pub max_attempts: u32,
    /// Jitter factor (0.0 to 1.0), applied as ±jitter to each delay. Default: 0.25.
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            max_attempts: 20,
            jitter: 0.25,
        }
    }
}

/// Attempt count and next backoff delay.
pub struct ReconnectState {
    config: ReconnectConfig,
    attempts: u32,
    current_delay: Duration,
}

impl ReconnectState {
    /// Start counting from the first attempt.
    pub fn new(config: ReconnectConfig) -> Self {
        let initial = config.initial_delay;
        Self {
            config,
            attempts: 0,
            current_delay: initial,
        }
    }

    /// Delay before the next attempt, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.config.max_attempts {
            return None;
        }

        let base = self.current_delay;
        self.attempts += 1;

        let jittered = if self.config.jitter > 0.0 {
            let factor = rand::rng().random_range((1.0 - self.config.jitter)..=(1.0 + self.config.jitter));
            base.mul_f64(factor)
        } else {
            base
        };

        let next = self.current_delay.mul_f64(self.config.backoff_multiplier);
        self.current_delay = next.min(self.config.max_delay);

        Some(jittered.min(self.config.max_delay))
    }

    /// Start over after a successful redial.
    pub fn reset(&mut self) {
        self.attempts = 0;
        self.current_delay = self.config.initial_delay;
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Why redialing stopped without a stream.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ReconnectError {
    /// Every configured attempt failed.
    #[error("maximum reconnection attempts exhausted")]
    MaxAttemptsExhausted,
    /// The session closed while waiting to redial.
    #[error("session closed during reconnection")]
    Abandoned,
}

/// Redial `addr` with backoff until it answers, attempts run out, or `state`
/// reports the session closed.
pub async fn redial(
    addr: SocketAddr,
    config: ReconnectConfig,
    connect_timeout: Duration,
    mut state: watch::Receiver<SessionState>,
) -> Result<TcpStream, ReconnectError> {
    let mut backoff = ReconnectState::new(config);
    loop {
        let Some(delay) = backoff.next_delay() else {
            return Err(ReconnectError::MaxAttemptsExhausted);
        };
        tracing::info!("Reconnection attempt {} to {addr} in {delay:?}", backoff.attempts());
        let closed = async {
            let _ = state.wait_for(|s| *s == SessionState::Closed).await;
        };
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = closed => return Err(ReconnectError::Abandoned),
        }

        match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                tracing::info!("Reconnected to {addr} after {} attempt(s)", backoff.attempts());
                return Ok(stream);
            }
            Ok(Err(e)) => tracing::warn!("Reconnection attempt {} failed: {e}", backoff.attempts()),
            Err(_) => tracing::warn!("Reconnection attempt {} timed out", backoff.attempts()),
        }
    }
}

impl<P: Send + 'static> LoopContext<P> {
    /// React to a verified session losing its transport.
    pub(crate) fn on_transport_lost(&mut self, key: &SessionKey) {
        let Some(session) = self.registry.get(key) else {
            return;
        };
        let config = session.config();
        if key.side == Side::Acceptor {
            tracing::info!("Session {key} lost its transport, waiting for the initiator to resume");
            return;
        }
        let Some(addr) = session.remote_addr().filter(|_| config.auto_reconnect) else {
            tracing::info!("Session {key} lost its transport and will not redial, closing");
            self.close_session(key);
            return;
        };

        let reconnect = config.reconnect.clone();
        let connect_timeout = config.connect_timeout;
        let state = session.subscribe();
        let handle = self.handle().clone();
        let key = key.clone();
        self.tasks.spawn(async move {
            let outcome = redial(addr, reconnect, connect_timeout, state).await;
            let _ = handle.post(move |cx| match outcome {
                Ok(stream) => cx.on_redialed(key, stream),
                Err(ReconnectError::Abandoned) => {}
                Err(e) => {
                    tracing::warn!("Session {key} could not be resumed: {e}");
                    cx.close_session(&key);
                }
            });
        });
    }

    fn on_redialed(&mut self, key: SessionKey, stream: TcpStream) {
        let Some(session) = self.registry.get_mut(&key).filter(|s| s.is_active()) else {
            tracing::debug!("Session {key} gone before its redial completed");
            return;
        };
        if session.config().mode != HandshakeMode::Verified {
            return;
        }
        let Some(remote) = session.remote().cloned() else {
            return;
        };
        let counters = session.counters().next_attempt();
        session.set_counters(counters, &self.token);
        let request = ConnectRequest::verified(
            session.local().clone(),
            remote,
            session.discriminator(),
            counters.verifying,
            counters.verified,
        );

        let transport = self.open_socket(stream);
        self.bind(transport.id(), key.clone());
        if let Some(session) = self.registry.get_mut(&key) {
            session.set_remote_addr(transport.peer_addr());
        }
        tracing::info!(
            "Resuming session {key} on {:?} (attempt {})",
            transport.id(),
            counters.verifying
        );
        let link = ResumeLink {
            transport,
            role: ResumeRole::Initiate(request),
        };
        let effects = self.with_session(&key, |session, env| session.fire_read(ReadEvent::Resume(link), env));
        self.settle(effects.unwrap_or_default());
    }
}
