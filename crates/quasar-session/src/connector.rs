//! Initiating side of session establishment.
//!
//! A connect attempt owns a session in the connecting state whose only
//! handler is a [`ConnectorHandshake`]. The dial runs as a task on the loop
//! runtime; the handshake runs in the pipeline. On success the handshake
//! handler is swapped for the standard chain, the session is activated and
//! registered, and the caller's [`ConnectFuture`] resolves to its handle.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::net::TcpStream;
use tokio::sync::oneshot;

use crate::event_loop::LoopContext;
use crate::handshake::{ConnectorHandshake, HANDSHAKE_HANDLER, HandshakeMode, VerifyCounters};
use crate::pipeline::{Effect, Env};
use crate::protocol::{ConnectRequest, Endpoint, SessionId};
use crate::session::{Session, SessionConfig, SessionHandle, SessionKey};
use crate::transfer::Link;
use crate::transport::SocketTransport;

/// Who is connecting to whom.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// This side's identity.
    pub local: Endpoint,
    /// The acceptor expected at the remote address.
    pub remote: Endpoint,
    /// Distinguishes parallel sessions between the same pair. Default: 0.
    pub discriminator: u32,
}

impl ConnectTarget {
    /// Target `remote` as `local` with discriminator 0.
    pub fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self {
            local,
            remote,
            discriminator: 0,
        }
    }

    /// Use `discriminator` to open a parallel session.
    pub fn with_discriminator(mut self, discriminator: u32) -> Self {
        self.discriminator = discriminator;
        self
    }

    /// Id of the session this target opens.
    pub fn session_id(&self) -> SessionId {
        SessionId::derive(&self.local, &self.remote, self.discriminator)
    }

    fn request(&self, mode: HandshakeMode) -> ConnectRequest {
        let (local, remote) = (self.local.clone(), self.remote.clone());
        match mode {
            HandshakeMode::Trusted => ConnectRequest::trusted(local, remote, self.discriminator),
            HandshakeMode::Verified => {
                let counters = VerifyCounters::first_attempt();
                ConnectRequest::verified(
                    local,
                    remote,
                    self.discriminator,
                    counters.verifying,
                    counters.verified,
                )
            }
        }
    }
}

/// Why a connect attempt failed.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// The TCP connection could not be established.
    #[error("connect failure: {0}")]
    Io(#[from] io::Error),

    /// The acceptor refused the request.
    #[error("connect failure: rejected by acceptor")]
    Rejected,

    /// Dial or handshake exceeded its time budget.
    #[error("connect failure: timed out")]
    Timeout,

    /// The acceptor answered with something other than a valid response.
    #[error("connect failure: protocol violation during handshake")]
    ProtocolViolation,

    /// The transport closed before the handshake completed.
    #[error("connect failure: transport closed during handshake")]
    TransportClosed,

    /// A session with this id is already open or connecting.
    #[error("connect failure: session {0} already exists")]
    Duplicate(SessionId),

    /// The session loop shut down.
    #[error("connect failure: session loop is shut down")]
    LoopClosed,
}

type ConnectResult<P> = Result<SessionHandle<P>, ConnectError>;

/// Resolves once the handshake completes or fails.
///
/// Dropping it abandons the attempt.
pub struct ConnectFuture<P> {
    rx: oneshot::Receiver<ConnectResult<P>>,
}

impl<P> ConnectFuture<P> {
    pub(crate) fn new(rx: oneshot::Receiver<ConnectResult<P>>) -> Self {
        Self { rx }
    }
}

impl<P> Future for ConnectFuture<P> {
    type Output = ConnectResult<P>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(ConnectError::LoopClosed)))
    }
}

/// A session that has not finished its handshake.
pub(crate) struct ConnectAttempt<P> {
    pub(crate) session: Session<P>,
    target: ConnectTarget,
    result: oneshot::Sender<ConnectResult<P>>,
    started: Instant,
}

impl<P> ConnectAttempt<P> {
    fn abandoned(&self) -> bool {
        self.result.is_closed()
    }
}

impl<P: Send + 'static> LoopContext<P> {
    pub(crate) fn begin_connect(
        &mut self,
        addr: SocketAddr,
        target: ConnectTarget,
        config: SessionConfig,
        result: oneshot::Sender<ConnectResult<P>>,
    ) {
        let session_id = target.session_id();
        let key = SessionKey::initiator(session_id.clone());
        if self.registry.contains(&key) || self.connecting.contains_key(&key) {
            tracing::warn!("Refusing second connect for {session_id}");
            let _ = result.send(Err(ConnectError::Duplicate(session_id)));
            return;
        }

        let timeout = config.connect_timeout;
        let session = Session::new(key.clone(), target.local.clone(), Arc::new(config), Some(addr))
            .with_discriminator(target.discriminator);
        tracing::info!("Connecting {session_id} to {} at {addr}", target.remote);
        self.connecting.insert(
            key.clone(),
            ConnectAttempt {
                session,
                target,
                result,
                started: Instant::now(),
            },
        );

        let handle = self.handle().clone();
        self.tasks.spawn(async move {
            let outcome = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
                Ok(result) => result.map_err(ConnectError::Io),
                Err(_) => Err(ConnectError::Timeout),
            };
            let _ = handle.post(move |cx| cx.on_dialed(key, outcome));
        });
    }

    fn on_dialed(&mut self, key: SessionKey, outcome: Result<TcpStream, ConnectError>) {
        let Some(attempt) = self.connecting.get(&key) else {
            return;
        };
        if attempt.abandoned() {
            tracing::debug!("Connect attempt for {key} abandoned before dial finished");
            self.connecting.remove(&key);
            return;
        }
        let stream = match outcome {
            Ok(stream) => stream,
            Err(error) => {
                let effects = self.fail_connect(&key, error);
                self.settle(effects);
                return;
            }
        };

        let transport = self.open_socket(stream);
        self.bind(transport.id(), key.clone());
        let Some(attempt) = self.connecting.get_mut(&key) else {
            return;
        };
        let request = attempt.target.request(attempt.session.config().mode);
        let deadline = attempt.session.config().handshake_deadline(attempt.started);
        attempt.session.set_remote_addr(transport.peer_addr());
        tracing::debug!("Dialed {key} on {:?}", transport.id());

        let handshake = ConnectorHandshake::new(transport, request, deadline);
        let effects = self.with_session(&key, |session, env| session.add_handler(Box::new(handshake), env));
        self.settle(effects.unwrap_or_default());
    }

    pub(crate) fn on_handshake_accepted(
        &mut self,
        key: SessionKey,
        acceptor: Endpoint,
        transport: SocketTransport,
    ) -> Vec<Effect<P>> {
        let Some(mut attempt) = self.connecting.remove(&key) else {
            transport.close();
            return Vec::new();
        };

        let mut effects = Vec::new();
        let mut env = Env {
            token: &self.token,
            services: &self.services,
            effects: &mut effects,
        };
        if attempt.abandoned() {
            tracing::info!("Connect attempt for {key} abandoned, closing established session");
            attempt.session.mark_closed(env.token);
            attempt.session.fire_close(&mut env);
            transport.close();
            self.unbind_session(&key);
            return effects;
        }

        attempt.session.remove_handler(HANDSHAKE_HANDLER);
        attempt.session.install_chain(Link::Socket(transport.clone()), &mut env);
        attempt.session.activate(acceptor.clone(), env.token);
        if attempt.session.config().mode == HandshakeMode::Verified {
            let counters = VerifyCounters::first_attempt();
            attempt.session.set_counters(counters.confirmed(counters.verifying), env.token);
        }

        let loop_handle = self.services.handle.clone();
        let handle = attempt.session.handle(&loop_handle);
        if let Err(e) = self.registry.register(attempt.session, &self.token) {
            tracing::warn!("Dropping established session: {e}");
            transport.close();
            self.unbind_session(&key);
            let _ = attempt.result.send(Err(ConnectError::Duplicate(key.session_id)));
            return effects;
        }
        tracing::info!("Session {key} established with {acceptor}");

        if let Some(more) = self.with_session(&key, |session, env| session.fire_active(env)) {
            effects.extend(more);
        }
        match handle {
            Some(handle) => {
                let _ = attempt.result.send(Ok(handle));
            }
            None => tracing::error!("Established session {key} has no remote endpoint"),
        }
        effects
    }

    /// Fail a connect attempt: close its session and report `error` to the caller.
    pub(crate) fn fail_connect(&mut self, key: &SessionKey, error: ConnectError) -> Vec<Effect<P>> {
        let Some(mut attempt) = self.connecting.remove(key) else {
            return Vec::new();
        };
        tracing::warn!("Connect attempt for {key} failed: {error}");

        let mut effects = Vec::new();
        attempt.session.mark_closed(&self.token);
        attempt.session.fire_close(&mut Env {
            token: &self.token,
            services: &self.services,
            effects: &mut effects,
        });
        self.unbind_session(key);
        let _ = attempt.result.send(Err(error));
        effects
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::codec::PostcardCodec;
    use crate::event_loop::{LoopConfig, SessionLoop};

    fn target() -> ConnectTarget {
        ConnectTarget::new(Endpoint::new("A", "gate"), Endpoint::new("B", "battle"))
    }

    fn quick() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(100),
            verify_timeout: Duration::from_millis(100),
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_target_session_id_uses_discriminator() {
        assert_eq!(target().session_id().as_str(), "A|B");
        assert_eq!(target().with_discriminator(2).session_id().as_str(), "A|B#2");
    }

    #[test]
    fn test_error_messages_read_as_connect_failures() {
        assert!(ConnectError::Rejected.to_string().starts_with("connect failure"));
        assert!(ConnectError::Duplicate(SessionId::new("A|B")).to_string().contains("A|B"));
    }

    #[tokio::test]
    async fn test_refused_dial_reports_io_error() {
        let (session_loop, _events) =
            SessionLoop::<String>::spawn(LoopConfig::default(), Arc::new(PostcardCodec)).unwrap();
        let unused = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let result = session_loop.handle().connect(unused, target(), quick()).await;
        assert!(matches!(result, Err(ConnectError::Io(_))));
        tokio::task::spawn_blocking(move || session_loop.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn test_silent_acceptor_times_out_and_second_connect_is_duplicate() {
        let (session_loop, _events) =
            SessionLoop::<String>::spawn(LoopConfig::default(), Arc::new(PostcardCodec)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = session_loop.handle().clone();

        let first = handle.connect(addr, target(), quick());
        let (_silent, _) = listener.accept().await.unwrap();
        let second = handle.connect(addr, target(), quick()).await;
        assert!(matches!(second, Err(ConnectError::Duplicate(id)) if id.as_str() == "A|B"));

        let first = tokio::time::timeout(Duration::from_secs(2), first).await.unwrap();
        assert!(matches!(first, Err(ConnectError::Timeout)));
        assert_eq!(handle.lookup(&SessionId::new("A|B")).await, Ok(None));
        tokio::task::spawn_blocking(move || session_loop.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_fails_pending_connect() {
        let (session_loop, _events) =
            SessionLoop::<String>::spawn(LoopConfig::default(), Arc::new(PostcardCodec)).unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let pending = session_loop.handle().connect(addr, target(), SessionConfig::default());
        let (_silent, _) = listener.accept().await.unwrap();
        tokio::task::spawn_blocking(move || session_loop.shutdown()).await.unwrap();
        assert!(matches!(pending.await, Err(ConnectError::LoopClosed)));
    }
}
