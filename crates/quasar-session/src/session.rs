//! Sessions: one logical conversation between two endpoints.
//!
//! A [`Session`] is owned by its session loop and mutated only there. Other
//! threads interact with it through a cloneable [`SessionHandle`], which
//! submits work to the loop and observes state through a `watch` channel.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::event_loop::{LoopHandle, LoopToken, TaskHandle};
use crate::handshake::{HandshakeMode, VerifyCounters};
use crate::heartbeat::HeartbeatHandler;
use crate::pipeline::{Env, Handler, Pipeline, ReadEvent};
use crate::protocol::{Endpoint, Payload, SessionId};
use crate::reconnect::ReconnectConfig;
use crate::registry::RegistryError;
use crate::support::{OneWaySupport, RpcSupport};
use crate::transfer::{Link, TransferHandler};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Which end of the session this process holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Side {
    /// Sent the connect request.
    Initiator,
    /// Answered the connect request.
    Acceptor,
}

/// Registry key: the shared session id plus the local side.
///
/// Both halves of a co-located pair share one id, so the side keeps them apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    /// Shared session id.
    pub session_id: SessionId,
    /// Local side.
    pub side: Side,
}

impl SessionKey {
    /// Build a key.
    pub fn new(session_id: SessionId, side: Side) -> Self {
        Self { session_id, side }
    }

    /// Key of the initiator half of `session_id`.
    pub fn initiator(session_id: SessionId) -> Self {
        Self::new(session_id, Side::Initiator)
    }

    /// Key of the acceptor half of `session_id`.
    pub fn acceptor(session_id: SessionId) -> Self {
        Self::new(session_id, Side::Acceptor)
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let side = match self.side {
            Side::Initiator => "initiator",
            Side::Acceptor => "acceptor",
        };
        write!(f, "{}@{side}", self.session_id)
    }
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// Handshake in progress.
    Connecting,
    /// Handshake done; traffic flows.
    Active,
    /// Terminal.
    Closed,
}

/// Immutable per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Trusted or verified (resumable) handshake. Default: trusted.
    pub mode: HandshakeMode,
    /// Time allowed to establish the raw connection. Default: 5s.
    pub connect_timeout: Duration,
    /// Time allowed for the handshake exchange. Default: 5s.
    pub verify_timeout: Duration,
    /// Write-idle time after which a ping is sent. Default: 5s.
    pub ping_interval: Duration,
    /// Read-idle time after which the session is closed. Default: 30s.
    pub session_timeout: Duration,
    /// Buffered outbound messages that trigger an automatic flush. Default: 32.
    pub flush_threshold: usize,
    /// Sent-but-unacknowledged messages kept for replay in verified mode.
    /// Exceeding it closes the session. Default: 4096.
    pub max_unacked: usize,
    /// Attach request/response support to the chain. Default: false.
    pub rpc_enabled: bool,
    /// Initiators in verified mode redial after transport loss. Default: true.
    pub auto_reconnect: bool,
    /// Backoff used when redialing.
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            mode: HandshakeMode::Trusted,
            connect_timeout: Duration::from_secs(5),
            verify_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(5),
            session_timeout: Duration::from_secs(30),
            flush_threshold: 32,
            max_unacked: 4096,
            rpc_enabled: false,
            auto_reconnect: true,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    /// Total budget for a connect attempt: dial plus handshake.
    pub fn handshake_deadline(&self, start: Instant) -> Instant {
        start + self.connect_timeout + self.verify_timeout
    }
}

/// Errors returned by [`SessionHandle`] operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// The session is not active.
    #[error("session {0} is not active")]
    NotActive(SessionId),

    /// The owning session loop has shut down.
    #[error("session loop is shut down")]
    LoopClosed,

    /// The session could not be registered.
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Read-only session facts shared with handlers.
pub(crate) struct SessionInfo {
    pub(crate) key: SessionKey,
    pub(crate) local: Endpoint,
    pub(crate) remote: Option<Endpoint>,
    pub(crate) config: Arc<SessionConfig>,
    pub(crate) state: watch::Receiver<SessionState>,
}

impl SessionInfo {
    pub(crate) fn handle<P: Send + 'static>(&self, loop_handle: &LoopHandle<P>) -> Option<SessionHandle<P>> {
        let remote = self.remote.clone()?;
        Some(SessionHandle {
            key: self.key.clone(),
            local: self.local.clone(),
            remote,
            state: self.state.clone(),
            loop_handle: loop_handle.clone(),
        })
    }
}

/// A session owned by a session loop.
pub struct Session<P> {
    info: SessionInfo,
    state: watch::Sender<SessionState>,
    pipeline: Pipeline<P>,
    counters: VerifyCounters,
    discriminator: u32,
    remote_addr: Option<SocketAddr>,
}

impl<P: Send + 'static> Session<P> {
    pub(crate) fn new(
        key: SessionKey,
        local: Endpoint,
        config: Arc<SessionConfig>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        let (state, state_rx) = watch::channel(SessionState::Connecting);
        Self {
            info: SessionInfo {
                key,
                local,
                remote: None,
                config,
                state: state_rx,
            },
            state,
            pipeline: Pipeline::new(),
            counters: VerifyCounters::default(),
            discriminator: 0,
            remote_addr,
        }
    }

    pub(crate) fn with_discriminator(mut self, discriminator: u32) -> Self {
        self.discriminator = discriminator;
        self
    }

    /// Registry key.
    pub fn key(&self) -> &SessionKey {
        &self.info.key
    }

    /// Shared session id.
    pub fn id(&self) -> &SessionId {
        &self.info.key.session_id
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether the session is active.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Local endpoint.
    pub fn local(&self) -> &Endpoint {
        &self.info.local
    }

    /// Remote endpoint, known once the handshake completes.
    pub fn remote(&self) -> Option<&Endpoint> {
        self.info.remote.as_ref()
    }

    /// Settings the session was created with.
    pub fn config(&self) -> &SessionConfig {
        &self.info.config
    }

    /// Socket address of the peer, for sessions backed by TCP.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Handler names from head to tail.
    pub fn handler_names(&self) -> Vec<&'static str> {
        self.pipeline.names()
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Cross-thread handle, available once the remote endpoint is known.
    pub fn handle(&self, loop_handle: &LoopHandle<P>) -> Option<SessionHandle<P>> {
        self.info.handle(loop_handle)
    }

    /// Distinguishes parallel sessions between the same pair of endpoints.
    pub fn discriminator(&self) -> u32 {
        self.discriminator
    }

    pub(crate) fn counters(&self) -> VerifyCounters {
        self.counters
    }

    pub(crate) fn set_counters(&mut self, counters: VerifyCounters, _token: &LoopToken) {
        self.counters = counters;
    }

    pub(crate) fn set_remote_addr(&mut self, addr: Option<SocketAddr>) {
        if addr.is_some() {
            self.remote_addr = addr;
        }
    }

    /// Move from connecting to active. Returns false if the session already left
    /// the connecting state.
    pub(crate) fn activate(&mut self, remote: Endpoint, _token: &LoopToken) -> bool {
        if self.state() != SessionState::Connecting {
            return false;
        }
        self.info.remote = Some(remote);
        self.state.send_replace(SessionState::Active);
        true
    }

    /// Move to closed, returning the state the session was in before.
    pub(crate) fn mark_closed(&mut self, _token: &LoopToken) -> SessionState {
        self.state.send_replace(SessionState::Closed)
    }

    /// Assemble the standard chain: transfer, heartbeat, one-way support and,
    /// if enabled, request/response support.
    pub(crate) fn install_chain(&mut self, link: Link, env: &mut Env<'_, P>) {
        let config = Arc::clone(&self.info.config);
        self.add_handler(Box::new(TransferHandler::new(link, &config)), env);
        self.add_handler(Box::new(HeartbeatHandler::new(&config)), env);
        self.add_handler(Box::new(OneWaySupport), env);
        if config.rpc_enabled {
            self.add_handler(Box::new(RpcSupport), env);
        }
    }

    pub(crate) fn add_handler(&mut self, handler: Box<dyn Handler<P>>, env: &mut Env<'_, P>) {
        self.pipeline.add_last(handler, &self.info, env);
    }

    pub(crate) fn remove_handler(&mut self, name: &str) -> Option<Box<dyn Handler<P>>> {
        self.pipeline.remove(name)
    }

    pub(crate) fn fire_active(&mut self, env: &mut Env<'_, P>) {
        self.pipeline.fire_active(&self.info, env);
    }

    pub(crate) fn fire_inactive(&mut self, env: &mut Env<'_, P>) {
        self.pipeline.fire_inactive(&self.info, env);
    }

    pub(crate) fn fire_read(&mut self, event: ReadEvent<P>, env: &mut Env<'_, P>) {
        self.pipeline.fire_read(event, &self.info, env);
    }

    pub(crate) fn fire_write(&mut self, payload: Payload<P>, env: &mut Env<'_, P>) {
        self.pipeline.fire_write(payload, &self.info, env);
    }

    pub(crate) fn fire_flush(&mut self, env: &mut Env<'_, P>) {
        self.pipeline.fire_flush(&self.info, env);
    }

    pub(crate) fn fire_close(&mut self, env: &mut Env<'_, P>) {
        self.pipeline.fire_close(&self.info, env);
    }

    pub(crate) fn fire_tick(&mut self, now: Instant, env: &mut Env<'_, P>) {
        self.pipeline.fire_tick(now, &self.info, env);
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Thread-safe proxy to an active session.
///
/// Sends are queued on the owning loop in call order, so messages sent through
/// one handle arrive in the order they were sent.
pub struct SessionHandle<P> {
    key: SessionKey,
    local: Endpoint,
    remote: Endpoint,
    state: watch::Receiver<SessionState>,
    loop_handle: LoopHandle<P>,
}

impl<P> Clone for SessionHandle<P> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            local: self.local.clone(),
            remote: self.remote.clone(),
            state: self.state.clone(),
            loop_handle: self.loop_handle.clone(),
        }
    }
}

impl<P> fmt::Debug for SessionHandle<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("key", &self.key)
            .field("remote", &self.remote)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl<P: Send + 'static> SessionHandle<P> {
    /// Shared session id.
    pub fn session_id(&self) -> &SessionId {
        &self.key.session_id
    }

    /// Registry key.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Local endpoint.
    pub fn local_identity(&self) -> &Endpoint {
        &self.local
    }

    /// Remote endpoint confirmed by the handshake.
    pub fn remote_identity(&self) -> &Endpoint {
        &self.remote
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Whether the session is active.
    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Queue a one-way message. It is written when the buffer fills, on the
    /// next tick, or on an explicit flush.
    pub fn send(&self, payload: P) -> Result<(), SessionError> {
        self.submit_write(Payload::OneWay(payload), false)
    }

    /// Queue a one-way message and flush immediately.
    pub fn send_and_flush(&self, payload: P) -> Result<(), SessionError> {
        self.submit_write(Payload::OneWay(payload), true)
    }

    /// Queue a request and flush immediately.
    pub fn send_request(&self, request_id: u64, body: P) -> Result<(), SessionError> {
        self.submit_write(Payload::Request { request_id, body }, true)
    }

    /// Queue a response and flush immediately.
    pub fn send_response(&self, request_id: u64, body: P) -> Result<(), SessionError> {
        self.submit_write(Payload::Response { request_id, body }, true)
    }

    /// Write everything buffered so far.
    pub fn flush(&self) -> Result<(), SessionError> {
        self.ensure_active()?;
        let key = self.key.clone();
        self.loop_handle
            .post(move |cx| cx.flush_session(&key))
            .map_err(|_| SessionError::LoopClosed)
    }

    /// Close the session. The returned handle resolves once the close has run
    /// on the loop. Closing an already-closed session is a no-op.
    pub fn close(&self) -> TaskHandle<()> {
        let key = self.key.clone();
        self.loop_handle.submit(move |cx| {
            cx.close_session(&key);
        })
    }

    fn ensure_active(&self) -> Result<(), SessionError> {
        if self.is_active() {
            Ok(())
        } else {
            Err(SessionError::NotActive(self.key.session_id.clone()))
        }
    }

    fn submit_write(&self, payload: Payload<P>, flush: bool) -> Result<(), SessionError> {
        self.ensure_active()?;
        let key = self.key.clone();
        self.loop_handle
            .post(move |cx| {
                if let Err(e) = cx.write(&key, payload, flush) {
                    tracing::debug!("Dropped write to {key}: {e}");
                }
            })
            .map_err(|_| SessionError::LoopClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display_includes_side() {
        let id = SessionId::new("A|B");
        assert_eq!(SessionKey::initiator(id.clone()).to_string(), "A|B@initiator");
        assert_eq!(SessionKey::acceptor(id).to_string(), "A|B@acceptor");
    }

    #[test]
    fn test_state_only_moves_forward() {
        let token = LoopToken::acquire();
        let mut session: Session<String> = Session::new(
            SessionKey::initiator(SessionId::new("A|B")),
            Endpoint::new("A", "gate"),
            Arc::new(SessionConfig::default()),
            None,
        );
        let watcher = session.subscribe();
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.remote().is_none());

        assert!(session.activate(Endpoint::new("B", "battle"), &token));
        assert_eq!(*watcher.borrow(), SessionState::Active);
        assert!(!session.activate(Endpoint::new("C", "battle"), &token));
        assert_eq!(session.remote().map(|e| e.id.as_str()), Some("B"));

        assert_eq!(session.mark_closed(&token), SessionState::Active);
        assert_eq!(session.mark_closed(&token), SessionState::Closed);
        assert!(!session.activate(Endpoint::new("B", "battle"), &token));
        assert_eq!(*watcher.borrow(), SessionState::Closed);
    }

    #[test]
    fn test_handle_requires_remote() {
        let token = LoopToken::acquire();
        let (loop_handle, _inbox) = LoopHandle::<String>::detached();
        let mut session: Session<String> = Session::new(
            SessionKey::acceptor(SessionId::new("A|B")),
            Endpoint::new("B", "battle"),
            Arc::new(SessionConfig::default()),
            None,
        );
        assert!(session.handle(&loop_handle).is_none());

        session.activate(Endpoint::new("A", "gate"), &token);
        let handle = session.handle(&loop_handle).unwrap();
        assert!(handle.is_active());
        assert_eq!(handle.remote_identity().id, "A");
        assert_eq!(handle.local_identity().id, "B");
        assert_eq!(handle.session_id().as_str(), "A|B");
    }

    #[test]
    fn test_send_on_inactive_session_fails() {
        let token = LoopToken::acquire();
        let (loop_handle, _inbox) = LoopHandle::<String>::detached();
        let mut session: Session<String> = Session::new(
            SessionKey::initiator(SessionId::new("A|B")),
            Endpoint::new("A", "gate"),
            Arc::new(SessionConfig::default()),
            None,
        );
        session.activate(Endpoint::new("B", "battle"), &token);
        let handle = session.handle(&loop_handle).unwrap();
        assert!(handle.send("hello".to_string()).is_ok());

        session.mark_closed(&token);
        assert!(matches!(
            handle.send("late".to_string()),
            Err(SessionError::NotActive(_))
        ));
    }

    #[test]
    fn test_default_deadline_is_connect_plus_verify() {
        let config = SessionConfig::default();
        let start = Instant::now();
        assert_eq!(config.handshake_deadline(start) - start, Duration::from_secs(10));
    }
}
