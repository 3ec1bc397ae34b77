//! The session loop: one dedicated thread that owns every session it hosts.
//!
//! All mutable session state lives in a [`LoopContext`] on the loop thread.
//! Other threads reach it by submitting closures through a [`LoopHandle`];
//! raw socket reader and writer tasks run on the loop's own current-thread
//! runtime and feed their events back over a channel. Nothing here is locked:
//! the thread boundary is the synchronization.
//!
//! Handler callbacks never call back into the loop directly. They record
//! [`Effect`]s, which the loop applies one at a time after the callback
//! returns.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::io;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;

use crate::acceptor::{AcceptorConfig, PendingAccept};
use crate::codec::Codec;
use crate::connector::{ConnectAttempt, ConnectFuture, ConnectTarget};
use crate::framing::FrameConfig;
use crate::pipeline::{Effect, Env, ReadEvent, Services};
use crate::platform::{SocketConfig, tune_stream};
use crate::protocol::{Endpoint, Payload, SessionId};
use crate::registry::SessionRegistry;
use crate::session::{Session, SessionConfig, SessionError, SessionHandle, SessionKey, SessionState};
use crate::support::AppEvent;
use crate::transport::{IdGenerator, SocketEvent, SocketEventKind, SocketTransport, TransportId, spawn_socket};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Settings for a [`SessionLoop`].
#[derive(Debug, Clone)]
pub struct LoopConfig {
    /// Interval between ticks delivered to every session. Default: 10ms.
    pub tick_interval: Duration,
    /// Name of the loop thread. Default: `quasar-session`.
    pub thread_name: String,
    /// Framing limits for every transport.
    pub frame: FrameConfig,
    /// Socket options for every transport and listener.
    pub socket: SocketConfig,
    /// Time allowed for transports to drain on shutdown. Default: 250ms.
    pub shutdown_grace: Duration,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(10),
            thread_name: "quasar-session".to_string(),
            frame: FrameConfig::default(),
            socket: SocketConfig::default(),
            shutdown_grace: Duration::from_millis(250),
        }
    }
}

// ---------------------------------------------------------------------------
// Ownership
// ---------------------------------------------------------------------------

/// Proof that the holder runs on the owning session loop.
///
/// Only the loop creates tokens, and a token cannot leave the thread that
/// created it.
#[derive(Debug)]
pub struct LoopToken {
    _not_send: PhantomData<*const ()>,
}

impl LoopToken {
    pub(crate) fn acquire() -> Self {
        Self {
            _not_send: PhantomData,
        }
    }
}

type LoopTask<P> = Box<dyn FnOnce(&mut LoopContext<P>) + Send>;

pub(crate) enum LoopMessage<P> {
    Task(LoopTask<P>),
    Shutdown,
}

/// Errors returned when handing work to a session loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LoopError {
    /// A blocking wait was requested from the loop thread itself.
    #[error("blocking on the session loop from its own thread would deadlock")]
    WouldDeadlock,
    /// The loop has shut down.
    #[error("session loop is shut down")]
    Closed,
}

/// Result of work submitted to a session loop.
///
/// Resolves to [`LoopError::Closed`] if the loop stopped before running it.
#[derive(Debug)]
pub struct TaskHandle<R> {
    rx: oneshot::Receiver<R>,
}

impl<R> Future for TaskHandle<R> {
    type Output = Result<R, LoopError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map_err(|_| LoopError::Closed)
    }
}

/// Point-in-time view of a session, safe to send across threads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Registry key.
    pub key: SessionKey,
    /// Local endpoint.
    pub local: Endpoint,
    /// Remote endpoint, once known.
    pub remote: Option<Endpoint>,
    /// State when the snapshot was taken.
    pub state: SessionState,
}

impl SessionSnapshot {
    fn of<P: Send + 'static>(session: &Session<P>) -> Self {
        Self {
            key: session.key().clone(),
            local: session.local().clone(),
            remote: session.remote().cloned(),
            state: session.state(),
        }
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cloneable, thread-safe entry point into a session loop.
pub struct LoopHandle<P> {
    inbox: mpsc::UnboundedSender<LoopMessage<P>>,
    owner: ThreadId,
}

impl<P> Clone for LoopHandle<P> {
    fn clone(&self) -> Self {
        Self {
            inbox: self.inbox.clone(),
            owner: self.owner,
        }
    }
}

impl<P> std::fmt::Debug for LoopHandle<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").field("owner", &self.owner).finish()
    }
}

impl<P: Send + 'static> LoopHandle<P> {
    /// Whether the calling thread is the loop thread.
    pub fn currently_owned_by(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// Run `f` on the loop. Closures submitted from one thread run in
    /// submission order.
    pub fn submit<R, F>(&self, f: F) -> TaskHandle<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut LoopContext<P>) -> R + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if self
            .post(move |cx| {
                let _ = tx.send(f(cx));
            })
            .is_err()
        {
            tracing::debug!("Task submitted to a stopped session loop");
        }
        TaskHandle { rx }
    }

    /// Run `f` on the loop and block until it returns.
    ///
    /// Fails with [`LoopError::WouldDeadlock`] on the loop thread itself.
    pub fn submit_and_wait<R, F>(&self, f: F) -> Result<R, LoopError>
    where
        R: Send + 'static,
        F: FnOnce(&mut LoopContext<P>) -> R + Send + 'static,
    {
        if self.currently_owned_by() {
            return Err(LoopError::WouldDeadlock);
        }
        let (tx, rx) = crossbeam_channel::bounded(1);
        self.post(move |cx| {
            let _ = tx.send(f(cx));
        })?;
        rx.recv().map_err(|_| LoopError::Closed)
    }

    pub(crate) fn post<F>(&self, f: F) -> Result<(), LoopError>
    where
        F: FnOnce(&mut LoopContext<P>) + Send + 'static,
    {
        self.inbox
            .send(LoopMessage::Task(Box::new(f)))
            .map_err(|_| LoopError::Closed)
    }

    /// Accept sessions on `addr`. Resolves to the bound address.
    pub fn listen(&self, addr: SocketAddr, config: AcceptorConfig) -> TaskHandle<io::Result<SocketAddr>> {
        self.submit(move |cx| cx.listen(addr, config))
    }

    /// Open a session to the acceptor at `addr`.
    ///
    /// Dropping the returned future abandons the attempt; a session that
    /// completes its handshake afterwards is closed instead of activated.
    pub fn connect(&self, addr: SocketAddr, target: ConnectTarget, config: SessionConfig) -> ConnectFuture<P> {
        let (tx, rx) = oneshot::channel();
        if self
            .post(move |cx| cx.begin_connect(addr, target, config, tx))
            .is_err()
        {
            tracing::debug!("Connect submitted to a stopped session loop");
        }
        ConnectFuture::new(rx)
    }

    /// Open a co-located pair of sessions that exchange messages without a
    /// socket. Resolves to `(initiator, acceptor)` handles.
    pub fn connect_local(
        &self,
        initiator: Endpoint,
        acceptor: Endpoint,
        config: SessionConfig,
    ) -> TaskHandle<Result<(SessionHandle<P>, SessionHandle<P>), SessionError>> {
        self.submit(move |cx| cx.open_local_pair(initiator, acceptor, config))
    }

    /// Snapshot of the session with `session_id`, preferring the initiator half.
    pub fn lookup(&self, session_id: &SessionId) -> TaskHandle<Option<SessionSnapshot>> {
        let session_id = session_id.clone();
        self.submit(move |cx| cx.registry.lookup(&session_id).map(SessionSnapshot::of))
    }

    /// Handle to the session with `session_id`, if it is established.
    pub fn session(&self, session_id: &SessionId) -> TaskHandle<Option<SessionHandle<P>>> {
        let session_id = session_id.clone();
        self.submit(move |cx| {
            let handle = cx.services.handle.clone();
            cx.registry.lookup(&session_id)?.handle(&handle)
        })
    }

    /// Close every registered session. Resolves to the number closed.
    pub fn close_all(&self) -> TaskHandle<usize> {
        self.submit(|cx| cx.close_all())
    }

    /// A handle whose inbox is the returned receiver, for driving sessions
    /// without a loop thread.
    #[cfg(test)]
    pub(crate) fn detached() -> (Self, mpsc::UnboundedReceiver<LoopMessage<P>>) {
        let (inbox, rx) = mpsc::unbounded_channel();
        (
            Self {
                inbox,
                owner: thread::current().id(),
            },
            rx,
        )
    }
}

// ---------------------------------------------------------------------------
// Loop
// ---------------------------------------------------------------------------

/// A running session loop. Dropping it shuts the loop down.
pub struct SessionLoop<P> {
    handle: LoopHandle<P>,
    thread: Option<JoinHandle<()>>,
}

impl<P: Send + 'static> SessionLoop<P> {
    /// Start a loop thread. Application events arrive on the returned receiver.
    pub fn spawn(config: LoopConfig, codec: Arc<dyn Codec<P>>) -> io::Result<(Self, Receiver<AppEvent<P>>)> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let (handle_tx, handle_rx) = crossbeam_channel::bounded::<LoopHandle<P>>(1);

        let thread = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || {
                let Ok(handle) = handle_rx.recv() else {
                    return;
                };
                runtime.block_on(run(config, codec, handle, inbox_rx, events_tx));
            })?;

        let handle = LoopHandle {
            inbox: inbox_tx,
            owner: thread.thread().id(),
        };
        let _ = handle_tx.send(handle.clone());

        Ok((
            Self {
                handle,
                thread: Some(thread),
            },
            events_rx,
        ))
    }

    /// Cloneable handle for submitting work.
    pub fn handle(&self) -> &LoopHandle<P> {
        &self.handle
    }

    /// Close every session, stop every listener and join the loop thread.
    pub fn shutdown(self) {
        drop(self);
    }
}

impl<P> Drop for SessionLoop<P> {
    fn drop(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let _ = self.handle.inbox.send(LoopMessage::Shutdown);
        if thread.thread().id() == thread::current().id() {
            tracing::warn!("Session loop dropped from its own thread, not joining");
        } else if thread.join().is_err() {
            tracing::error!("Session loop thread panicked");
        }
    }
}

async fn run<P: Send + 'static>(
    config: LoopConfig,
    codec: Arc<dyn Codec<P>>,
    handle: LoopHandle<P>,
    mut inbox: mpsc::UnboundedReceiver<LoopMessage<P>>,
    events: crossbeam_channel::Sender<AppEvent<P>>,
) {
    let (socket_tx, mut socket_rx) = mpsc::unbounded_channel();
    let mut cx = LoopContext::new(&config, codec, handle, events, socket_tx);
    let mut ticker = tokio::time::interval(config.tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tracing::info!("Session loop started (tick {:?})", config.tick_interval);

    loop {
        tokio::select! {
            message = inbox.recv() => match message {
                Some(LoopMessage::Task(task)) => task(&mut cx),
                Some(LoopMessage::Shutdown) | None => break,
            },
            Some(event) = socket_rx.recv() => cx.route_socket_event(event),
            _ = ticker.tick() => cx.tick(Instant::now()),
        }
    }

    cx.shutdown(config.shutdown_grace).await;
    tracing::info!("Session loop stopped");
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Loop-owned state, passed to every closure submitted through a [`LoopHandle`].
pub struct LoopContext<P> {
    pub(crate) token: LoopToken,
    pub(crate) registry: SessionRegistry<P>,
    pub(crate) connecting: HashMap<SessionKey, ConnectAttempt<P>>,
    pub(crate) bindings: HashMap<TransportId, SessionKey>,
    pub(crate) transports: HashMap<TransportId, SocketTransport>,
    pub(crate) pending: HashMap<TransportId, PendingAccept>,
    pub(crate) listeners: HashMap<SocketAddr, watch::Sender<bool>>,
    pub(crate) services: Services<P>,
    pub(crate) tasks: JoinSet<()>,
    ids: IdGenerator,
    frame: FrameConfig,
    pub(crate) socket: SocketConfig,
    socket_tx: mpsc::UnboundedSender<SocketEvent<P>>,
}

impl<P: Send + 'static> LoopContext<P> {
    fn new(
        config: &LoopConfig,
        codec: Arc<dyn Codec<P>>,
        handle: LoopHandle<P>,
        events: crossbeam_channel::Sender<AppEvent<P>>,
        socket_tx: mpsc::UnboundedSender<SocketEvent<P>>,
    ) -> Self {
        Self {
            token: LoopToken::acquire(),
            registry: SessionRegistry::new(),
            connecting: HashMap::new(),
            bindings: HashMap::new(),
            transports: HashMap::new(),
            pending: HashMap::new(),
            listeners: HashMap::new(),
            services: Services {
                codec,
                events,
                handle,
            },
            tasks: JoinSet::new(),
            ids: IdGenerator::new(),
            frame: config.frame.clone(),
            socket: config.socket.clone(),
            socket_tx,
        }
    }

    /// Ownership proof for registry and session mutators.
    pub fn token(&self) -> &LoopToken {
        &self.token
    }

    /// Sessions hosted by this loop.
    pub fn registry(&self) -> &SessionRegistry<P> {
        &self.registry
    }

    /// Handle to this loop.
    pub fn handle(&self) -> &LoopHandle<P> {
        &self.services.handle
    }

    /// Send `payload` on an active session, optionally flushing right away.
    pub fn write(&mut self, key: &SessionKey, payload: Payload<P>, flush: bool) -> Result<(), SessionError> {
        if !self.registry.get(key).is_some_and(Session::is_active) {
            return Err(SessionError::NotActive(key.session_id.clone()));
        }
        let effects = self.with_session(key, |session, env| {
            session.fire_write(payload, env);
            if flush {
                session.fire_flush(env);
            }
        });
        self.settle(effects.unwrap_or_default());
        Ok(())
    }

    /// Write everything buffered on a session.
    pub fn flush_session(&mut self, key: &SessionKey) {
        let effects = self.with_session(key, |session, env| session.fire_flush(env));
        self.settle(effects.unwrap_or_default());
    }

    /// Close a session. Closing an unknown or already-closed session is a no-op.
    pub fn close_session(&mut self, key: &SessionKey) {
        let effects = self.close_now(key);
        self.settle(effects);
    }

    /// Close every registered session, returning how many were closed.
    pub fn close_all(&mut self) -> usize {
        let keys = self.registry.keys();
        for key in &keys {
            self.close_session(key);
        }
        keys.len()
    }

    // -- plumbing shared by the acceptor, connector and local pairs ---------

    /// Start reader and writer tasks for a freshly connected stream.
    pub(crate) fn open_socket(&mut self, stream: TcpStream) -> SocketTransport {
        if let Err(e) = tune_stream(&stream, &self.socket) {
            tracing::warn!("Failed to tune socket: {e}");
        }
        let id = self.ids.next_id();
        let transport = spawn_socket(
            id,
            stream,
            &self.frame,
            Arc::clone(&self.services.codec),
            self.socket_tx.clone(),
            &mut self.tasks,
        );
        self.transports.insert(id, transport.clone());
        transport
    }

    pub(crate) fn next_transport_id(&self) -> TransportId {
        self.ids.next_id()
    }

    pub(crate) fn bind(&mut self, transport: TransportId, key: SessionKey) {
        self.bindings.insert(transport, key);
    }

    pub(crate) fn unbind_session(&mut self, key: &SessionKey) {
        let ids: Vec<TransportId> = self
            .bindings
            .iter()
            .filter(|(_, bound)| *bound == key)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.bindings.remove(&id);
            if let Some(transport) = self.transports.remove(&id) {
                transport.close();
            }
        }
    }

    pub(crate) fn close_transport(&mut self, id: TransportId) {
        self.bindings.remove(&id);
        if let Some(transport) = self.transports.remove(&id) {
            transport.close();
        }
    }

    /// Run `f` against a registered or connecting session, returning the
    /// effects it produced, or `None` if no such session exists.
    pub(crate) fn with_session<F>(&mut self, key: &SessionKey, f: F) -> Option<Vec<Effect<P>>>
    where
        F: FnOnce(&mut Session<P>, &mut Env<'_, P>),
    {
        let session = match self.registry.get_mut(key) {
            Some(session) => session,
            None => &mut self.connecting.get_mut(key)?.session,
        };
        let mut effects = Vec::new();
        let mut env = Env {
            token: &self.token,
            services: &self.services,
            effects: &mut effects,
        };
        f(session, &mut env);
        Some(effects)
    }

    /// Apply effects, and the effects they cause, until none remain.
    pub(crate) fn settle(&mut self, effects: Vec<Effect<P>>) {
        let mut queue = VecDeque::from(effects);
        while let Some(effect) = queue.pop_front() {
            queue.extend(self.apply(effect));
        }
    }

    fn apply(&mut self, effect: Effect<P>) -> Vec<Effect<P>> {
        match effect {
            Effect::CloseSession(key) => self.close_now(&key),
            Effect::CloseTransport(id) => {
                self.close_transport(id);
                Vec::new()
            }
            Effect::DeliverLocal { to, event } => self
                .with_session(&to, |session, env| session.fire_read(ReadEvent::Socket(event), env))
                .unwrap_or_default(),
            Effect::HandshakeAccepted {
                key,
                acceptor,
                transport,
            } => self.on_handshake_accepted(key, acceptor, transport),
            Effect::HandshakeFailed { key, error } => self.fail_connect(&key, error),
            Effect::TransportLost { key } => {
                self.on_transport_lost(&key);
                Vec::new()
            }
            Effect::ResumeConfirmed { key, attempt } => {
                if let Some(session) = self.registry.get_mut(&key) {
                    let counters = session.counters().confirmed(attempt);
                    session.set_counters(counters, &self.token);
                }
                Vec::new()
            }
        }
    }

    /// Close a registered session or abandon a connecting one.
    pub(crate) fn close_now(&mut self, key: &SessionKey) -> Vec<Effect<P>> {
        let Some(mut session) = self.registry.remove(key, &self.token) else {
            if self.connecting.contains_key(key) {
                return self.fail_connect(key, crate::connector::ConnectError::TransportClosed);
            }
            return Vec::new();
        };

        let previous = session.mark_closed(&self.token);
        let mut effects = Vec::new();
        let mut env = Env {
            token: &self.token,
            services: &self.services,
            effects: &mut effects,
        };
        session.fire_close(&mut env);
        if previous == SessionState::Active {
            session.fire_inactive(&mut env);
        }
        self.unbind_session(key);
        tracing::info!("Session {key} closed");
        effects
    }

    /// Route a raw socket event to its session, or to the acceptor while the
    /// transport is still unbound.
    pub(crate) fn route_socket_event(&mut self, event: SocketEvent<P>) {
        let id = event.transport;
        tracing::trace!("{} on {id:?}", event.kind.label());

        let bound = if matches!(event.kind, SocketEventKind::TransportClosed) {
            self.transports.remove(&id);
            self.bindings.remove(&id)
        } else {
            self.bindings.get(&id).cloned()
        };

        let Some(key) = bound else {
            self.on_unbound_event(event);
            return;
        };
        match self.with_session(&key, |session, env| session.fire_read(ReadEvent::Socket(event), env)) {
            Some(effects) => self.settle(effects),
            None => {
                tracing::debug!("Transport {id:?} outlived session {key}, closing");
                self.close_transport(id);
            }
        }
    }

    /// Deliver a tick to every session and connect attempt.
    pub(crate) fn tick(&mut self, now: Instant) {
        let mut effects = Vec::new();
        {
            let mut env = Env {
                token: &self.token,
                services: &self.services,
                effects: &mut effects,
            };
            for session in self.registry.iter_mut() {
                session.fire_tick(now, &mut env);
            }
            for attempt in self.connecting.values_mut() {
                attempt.session.fire_tick(now, &mut env);
            }
        }
        self.expire_pending(now);
        while let Some(result) = self.tasks.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    tracing::error!("Session loop task panicked: {e}");
                }
            }
        }
        self.settle(effects);
    }

    async fn shutdown(&mut self, grace: Duration) {
        for (addr, stop) in self.listeners.drain() {
            let _ = stop.send(true);
            tracing::debug!("Stopped listener on {addr}");
        }
        let closed = self.close_all();
        let connecting: Vec<SessionKey> = self.connecting.keys().cloned().collect();
        for key in connecting {
            let effects = self.fail_connect(&key, crate::connector::ConnectError::LoopClosed);
            self.settle(effects);
        }
        for (_, pending) in self.pending.drain() {
            pending.transport.close();
        }
        tracing::info!("Session loop closed {closed} session(s)");

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::debug!("{} task(s) still running after {grace:?}, aborting", self.tasks.len());
            self.tasks.abort_all();
        }
    }
}
