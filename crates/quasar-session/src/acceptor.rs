//! Accepting side of session establishment.
//!
//! Listeners run as tasks on the loop runtime and hand every accepted stream
//! to the loop. Until its connect request arrives a transport is pending: it
//! belongs to no session and its events are routed here. A valid request
//! either creates a session or, in verified mode, resumes an existing one on
//! the new transport. Anything else gets a negative response and a close.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use crate::event_loop::{LoopContext, LoopHandle};
use crate::handshake::{Admission, admit};
use crate::pipeline::{Env, ReadEvent};
use crate::platform::bind_listener;
use crate::protocol::{ConnectRequest, ConnectResponse, Endpoint, Frame};
use crate::session::{Session, SessionConfig, SessionKey};
use crate::transfer::{Link, ResumeLink, ResumeRole};
use crate::transport::{SocketEvent, SocketEventKind, SocketTransport};

/// What a listener accepts sessions as.
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Identity of this side; requests addressed elsewhere are refused.
    pub local: Endpoint,
    /// Settings for every session accepted on the listener.
    pub session: SessionConfig,
}

impl AcceptorConfig {
    /// Accept as `local` with default session settings.
    pub fn new(local: Endpoint) -> Self {
        Self {
            local,
            session: SessionConfig::default(),
        }
    }
}

/// A transport waiting for its connect request.
pub(crate) struct PendingAccept {
    pub(crate) transport: SocketTransport,
    config: Arc<AcceptorConfig>,
    deadline: Instant,
}

impl<P: Send + 'static> LoopContext<P> {
    /// Bind `addr` and accept sessions on it until the loop shuts down or
    /// [`stop_listening`](Self::stop_listening) is called.
    pub fn listen(&mut self, addr: SocketAddr, config: AcceptorConfig) -> io::Result<SocketAddr> {
        let listener = bind_listener(addr, &self.socket)?;
        let local_addr = listener.local_addr()?;
        let (stop_tx, stop_rx) = watch::channel(false);

        tracing::info!("Listening on {local_addr} as {}", config.local);
        self.tasks.spawn(accept_loop(
            listener,
            self.handle().clone(),
            Arc::new(config),
            stop_rx,
        ));
        self.listeners.insert(local_addr, stop_tx);
        Ok(local_addr)
    }

    /// Stop the listener bound to `addr`. Sessions it accepted stay open.
    pub fn stop_listening(&mut self, addr: SocketAddr) -> bool {
        match self.listeners.remove(&addr) {
            Some(stop) => {
                let _ = stop.send(true);
                true
            }
            None => false,
        }
    }

    fn on_accepted(&mut self, stream: TcpStream, config: Arc<AcceptorConfig>) {
        let transport = self.open_socket(stream);
        let deadline = Instant::now() + config.session.verify_timeout;
        tracing::debug!(
            "Transport {:?} from {:?} awaiting connect request",
            transport.id(),
            transport.peer_addr()
        );
        self.pending.insert(
            transport.id(),
            PendingAccept {
                transport,
                config,
                deadline,
            },
        );
    }

    /// Close pending transports whose connect request did not arrive in time.
    pub(crate) fn expire_pending(&mut self, now: Instant) {
        let expired: Vec<_> = self
            .pending
            .iter()
            .filter(|(_, pending)| now >= pending.deadline)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                tracing::warn!(
                    "No connect request from {:?} in time, closing",
                    pending.transport.peer_addr()
                );
                self.close_transport(id);
            }
        }
    }

    /// Handle an event from a transport that belongs to no session.
    pub(crate) fn on_unbound_event(&mut self, event: SocketEvent<P>) {
        let id = event.transport;
        let Some(pending) = self.pending.remove(&id) else {
            if !matches!(event.kind, SocketEventKind::TransportClosed) {
                tracing::debug!("{} on unknown transport {id:?}, closing", event.kind.label());
                self.close_transport(id);
            }
            return;
        };

        match event.kind {
            SocketEventKind::ConnectRequest(request) => self.on_connect_request(pending, request),
            SocketEventKind::TransportClosed => {
                tracing::debug!("Transport {id:?} closed before its connect request");
            }
            other => {
                tracing::warn!(
                    "{} from {:?} before connect request, closing",
                    other.label(),
                    pending.transport.peer_addr()
                );
                self.close_transport(id);
            }
        }
    }

    fn on_connect_request(&mut self, pending: PendingAccept, request: ConnectRequest) {
        let PendingAccept {
            transport, config, ..
        } = pending;
        let key = SessionKey::acceptor(request.session_id.clone());
        let existing = self.registry.get(&key).map(Session::counters);

        match admit(&request, &config.local, config.session.mode, existing) {
            Err(e) => {
                tracing::warn!(
                    "Rejected connect request for {} from {:?}: {e}",
                    request.session_id,
                    transport.peer_addr()
                );
                transport.send(Frame::ConnectResponse(ConnectResponse::reject(
                    request,
                    config.local.clone(),
                )));
                self.close_transport(transport.id());
            }
            Ok(Admission::Fresh(counters)) => {
                let mut session = Session::new(
                    key.clone(),
                    config.local.clone(),
                    Arc::new(config.session.clone()),
                    transport.peer_addr(),
                )
                .with_discriminator(request.discriminator);
                let remote = request.from.clone();
                let mut effects = Vec::new();
                let mut env = Env {
                    token: &self.token,
                    services: &self.services,
                    effects: &mut effects,
                };
                session.set_counters(counters, env.token);
                session.install_chain(Link::Socket(transport.clone()), &mut env);
                session.activate(remote.clone(), env.token);

                transport.send(Frame::ConnectResponse(ConnectResponse::accept(
                    request,
                    config.local.clone(),
                )));
                if let Err(e) = self.registry.register(session, &self.token) {
                    tracing::warn!("Dropping accepted session: {e}");
                    self.close_transport(transport.id());
                    return;
                }
                self.bind(transport.id(), key.clone());
                tracing::info!("Accepted session {key} from {remote}");

                if let Some(more) = self.with_session(&key, |session, env| session.fire_active(env)) {
                    effects.extend(more);
                }
                self.settle(effects);
            }
            Ok(Admission::Resume(counters)) => {
                if let Some(session) = self.registry.get_mut(&key) {
                    session.set_counters(counters, &self.token);
                    session.set_remote_addr(transport.peer_addr());
                }
                self.bind(transport.id(), key.clone());
                tracing::info!(
                    "Resuming session {key} on {:?} (attempt {})",
                    transport.id(),
                    counters.verifying
                );
                let link = ResumeLink {
                    transport,
                    role: ResumeRole::Accept(ConnectResponse::accept(request, config.local.clone())),
                };
                let effects = self.with_session(&key, |session, env| {
                    session.fire_read(ReadEvent::Resume(link), env)
                });
                self.settle(effects.unwrap_or_default());
            }
        }
    }
}

async fn accept_loop<P: Send + 'static>(
    listener: TcpListener,
    handle: LoopHandle<P>,
    config: Arc<AcceptorConfig>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, peer_addr)) => {
                    tracing::debug!("Accepted connection from {peer_addr}");
                    let config = Arc::clone(&config);
                    if handle.post(move |cx| cx.on_accepted(stream, config)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = stop.changed() => break,
        }
    }
    tracing::info!("Listener for {} stopped", config.local);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PostcardCodec;
    use crate::event_loop::{LoopConfig, SessionLoop};
    use crate::framing::{FrameConfig, FramedReader, FramedWriter};

    fn b() -> Endpoint {
        Endpoint::new("B", "battle")
    }

    async fn exchange(addr: SocketAddr, request: ConnectRequest) -> Frame {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, writer) = stream.into_split();
        let mut writer = FramedWriter::new(writer, FrameConfig::default());
        let mut reader = FramedReader::new(reader, FrameConfig::default());
        writer.send(&Frame::ConnectRequest(request)).await.unwrap();
        reader.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_rejects_request_for_other_endpoint() {
        let (session_loop, _events) =
            SessionLoop::<String>::spawn(LoopConfig::default(), Arc::new(PostcardCodec)).unwrap();
        let addr = session_loop
            .handle()
            .listen("127.0.0.1:0".parse().unwrap(), AcceptorConfig::new(b()))
            .await
            .unwrap()
            .unwrap();

        let request = ConnectRequest::trusted(Endpoint::new("A", "gate"), Endpoint::new("C", "battle"), 0);
        let response = exchange(addr, request.clone()).await;
        assert!(matches!(
            response,
            Frame::ConnectResponse(r) if !r.accepted && r.echoed_request == request
        ));
        tokio::task::spawn_blocking(move || session_loop.shutdown()).await.unwrap();
    }

    #[tokio::test]
    async fn test_accepts_and_registers_session() {
        let (session_loop, events) =
            SessionLoop::<String>::spawn(LoopConfig::default(), Arc::new(PostcardCodec)).unwrap();
        let handle = session_loop.handle().clone();
        let addr = handle
            .listen("127.0.0.1:0".parse().unwrap(), AcceptorConfig::new(b()))
            .await
            .unwrap()
            .unwrap();

        let request = ConnectRequest::trusted(Endpoint::new("A", "gate"), b(), 0);
        let response = exchange(addr, request).await;
        assert!(matches!(response, Frame::ConnectResponse(r) if r.accepted && r.acceptor == b()));

        let snapshot = handle
            .lookup(&crate::protocol::SessionId::new("A|B"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.key, SessionKey::acceptor(crate::protocol::SessionId::new("A|B")));
        assert_eq!(snapshot.remote, Some(Endpoint::new("A", "gate")));
        assert!(matches!(
            events.recv_timeout(Duration::from_secs(1)),
            Ok(crate::support::AppEvent::Connected(_))
        ));

        assert!(handle.submit(move |cx| cx.stop_listening(addr)).await.unwrap());
        tokio::task::spawn_blocking(move || session_loop.shutdown()).await.unwrap();
    }
}
