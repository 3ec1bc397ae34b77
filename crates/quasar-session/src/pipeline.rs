//! Ordered handler chain attached to each session.
//!
//! Inbound operations (active, inactive, read, tick) travel from the head
//! (index 0, the transport side) toward the tail; outbound operations (write,
//! flush, close) travel from the tail toward the head. A [`Handler`] that does
//! not override a callback passes the operation on unchanged. An operation
//! that runs off either end of the chain is dropped without error.
//!
//! Propagation is queued rather than recursive: a handler that fires an
//! operation only schedules it, and [`Pipeline`] dispatches queued operations
//! in FIFO order once the current callback returns. A handler may therefore
//! fire into the chain from inside any callback, including its own.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use crate::codec::Codec;
use crate::connector::ConnectError;
use crate::event_loop::{LoopHandle, LoopToken};
use crate::protocol::{Endpoint, Payload};
use crate::session::{SessionConfig, SessionHandle, SessionInfo, SessionKey};
use crate::support::AppEvent;
use crate::transfer::ResumeLink;
use crate::transport::{SocketEvent, SocketTransport, TransportId};

/// An inbound event travelling toward the application.
#[derive(Debug)]
pub enum ReadEvent<P> {
    /// Raw event from the session's transport.
    Socket(SocketEvent<P>),
    /// Decoded payload released by the transfer handler.
    Payload(Payload<P>),
    /// A replacement transport for a resumable session.
    Resume(ResumeLink),
}

/// One element of a session's handler chain.
///
/// Every callback has a pass-through default, so implementations override only
/// what they handle.
pub trait Handler<P> {
    /// Name used to find the handler in the chain.
    fn name(&self) -> &'static str;

    /// Called once when the handler joins the chain.
    fn on_added(&mut self, _ctx: &mut HandlerContext<'_, P>) {}

    /// The session became active.
    fn on_active(&mut self, ctx: &mut HandlerContext<'_, P>) {
        ctx.fire_active();
    }

    /// The session stopped being active.
    fn on_inactive(&mut self, ctx: &mut HandlerContext<'_, P>) {
        ctx.fire_inactive();
    }

    /// An inbound event arrived.
    fn on_read(&mut self, ctx: &mut HandlerContext<'_, P>, event: ReadEvent<P>) {
        ctx.fire_read(event);
    }

    /// An outbound payload is on its way to the transport.
    fn on_write(&mut self, ctx: &mut HandlerContext<'_, P>, payload: Payload<P>) {
        ctx.fire_write(payload);
    }

    /// Buffered outbound payloads should be written now.
    fn on_flush(&mut self, ctx: &mut HandlerContext<'_, P>) {
        ctx.fire_flush();
    }

    /// The session is closing.
    fn on_close(&mut self, ctx: &mut HandlerContext<'_, P>) {
        ctx.fire_close();
    }

    /// Periodic tick from the session loop.
    fn on_tick(&mut self, ctx: &mut HandlerContext<'_, P>, now: Instant) {
        ctx.fire_tick(now);
    }
}

/// Follow-up work a handler asks the session loop to perform once the
/// current dispatch has finished.
#[derive(Debug)]
pub(crate) enum Effect<P> {
    CloseSession(SessionKey),
    CloseTransport(TransportId),
    DeliverLocal {
        to: SessionKey,
        event: SocketEvent<P>,
    },
    HandshakeAccepted {
        key: SessionKey,
        acceptor: Endpoint,
        transport: SocketTransport,
    },
    HandshakeFailed {
        key: SessionKey,
        error: ConnectError,
    },
    TransportLost {
        key: SessionKey,
    },
    ResumeConfirmed {
        key: SessionKey,
        attempt: u64,
    },
}

/// Loop-wide collaborators shared by every pipeline.
pub(crate) struct Services<P> {
    pub(crate) codec: Arc<dyn Codec<P>>,
    pub(crate) events: crossbeam_channel::Sender<AppEvent<P>>,
    pub(crate) handle: LoopHandle<P>,
}

/// Borrowed loop state a pipeline needs while dispatching.
pub(crate) struct Env<'a, P> {
    pub(crate) token: &'a LoopToken,
    pub(crate) services: &'a Services<P>,
    pub(crate) effects: &'a mut Vec<Effect<P>>,
}

enum Op<P> {
    Added,
    Active,
    Inactive,
    Read(ReadEvent<P>),
    Write(Payload<P>),
    Flush,
    Close,
    Tick(Instant),
}

struct Hop<P> {
    target: usize,
    op: Op<P>,
}

/// A handler's view of its session while one of its callbacks runs.
pub struct HandlerContext<'a, P> {
    index: usize,
    queue: &'a mut VecDeque<Hop<P>>,
    info: &'a SessionInfo,
    token: &'a LoopToken,
    services: &'a Services<P>,
    effects: &'a mut Vec<Effect<P>>,
}

impl<P> HandlerContext<'_, P> {
    fn inbound(&mut self, op: Op<P>) {
        self.queue.push_back(Hop {
            target: self.index + 1,
            op,
        });
    }

    fn outbound(&mut self, op: Op<P>) {
        match self.index.checked_sub(1) {
            Some(target) => self.queue.push_back(Hop { target, op }),
            None => tracing::trace!("Outbound operation dropped at the head of {}", self.info.key),
        }
    }

    /// Pass the active notification toward the tail.
    pub fn fire_active(&mut self) {
        self.inbound(Op::Active);
    }

    /// Pass the inactive notification toward the tail.
    pub fn fire_inactive(&mut self) {
        self.inbound(Op::Inactive);
    }

    /// Pass an inbound event toward the tail.
    pub fn fire_read(&mut self, event: ReadEvent<P>) {
        self.inbound(Op::Read(event));
    }

    /// Pass a tick toward the tail.
    pub fn fire_tick(&mut self, now: Instant) {
        self.inbound(Op::Tick(now));
    }

    /// Pass an outbound payload toward the head.
    pub fn fire_write(&mut self, payload: Payload<P>) {
        self.outbound(Op::Write(payload));
    }

    /// Pass a flush request toward the head.
    pub fn fire_flush(&mut self) {
        self.outbound(Op::Flush);
    }

    /// Pass a close request toward the head.
    pub fn fire_close(&mut self) {
        self.outbound(Op::Close);
    }

    /// Ask the loop to close this session once the current dispatch ends.
    pub fn close_session(&mut self) {
        self.effects.push(Effect::CloseSession(self.info.key.clone()));
    }

    /// Registry key of the session.
    pub fn key(&self) -> &SessionKey {
        &self.info.key
    }

    /// Local endpoint.
    pub fn local(&self) -> &Endpoint {
        &self.info.local
    }

    /// Remote endpoint, once the handshake has confirmed it.
    pub fn remote(&self) -> Option<&Endpoint> {
        self.info.remote.as_ref()
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.info.config
    }

    /// Proof that this callback runs on the owning session loop.
    pub fn token(&self) -> &LoopToken {
        self.token
    }

    pub(crate) fn push_effect(&mut self, effect: Effect<P>) {
        self.effects.push(effect);
    }

    pub(crate) fn codec(&self) -> &dyn Codec<P> {
        self.services.codec.as_ref()
    }

    pub(crate) fn notify(&self, event: AppEvent<P>) {
        if self.services.events.send(event).is_err() {
            tracing::trace!("Application event for {} dropped, receiver gone", self.info.key);
        }
    }
}

impl<P: Send + 'static> HandlerContext<'_, P> {
    pub(crate) fn session_handle(&self) -> Option<SessionHandle<P>> {
        self.info.handle(&self.services.handle)
    }
}

/// The ordered handler chain of one session.
pub struct Pipeline<P> {
    handlers: Vec<Box<dyn Handler<P>>>,
    queue: VecDeque<Hop<P>>,
}

impl<P> Pipeline<P> {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
            queue: VecDeque::new(),
        }
    }

    /// Number of handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether the chain has no handlers.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Handler names from head to tail.
    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Append a handler at the tail and run its `on_added` callback.
    pub(crate) fn add_last(
        &mut self,
        handler: Box<dyn Handler<P>>,
        info: &SessionInfo,
        env: &mut Env<'_, P>,
    ) {
        self.handlers.push(handler);
        let target = self.handlers.len() - 1;
        self.queue.push_back(Hop {
            target,
            op: Op::Added,
        });
        self.run(info, env);
    }

    /// Remove the first handler called `name`.
    pub(crate) fn remove(&mut self, name: &str) -> Option<Box<dyn Handler<P>>> {
        let index = self.handlers.iter().position(|h| h.name() == name)?;
        Some(self.handlers.remove(index))
    }

    pub(crate) fn fire_active(&mut self, info: &SessionInfo, env: &mut Env<'_, P>) {
        self.enter_head(Op::Active, info, env);
    }

    pub(crate) fn fire_inactive(&mut self, info: &SessionInfo, env: &mut Env<'_, P>) {
        self.enter_head(Op::Inactive, info, env);
    }

    pub(crate) fn fire_read(&mut self, event: ReadEvent<P>, info: &SessionInfo, env: &mut Env<'_, P>) {
        self.enter_head(Op::Read(event), info, env);
    }

    pub(crate) fn fire_tick(&mut self, now: Instant, info: &SessionInfo, env: &mut Env<'_, P>) {
        self.enter_head(Op::Tick(now), info, env);
    }

    pub(crate) fn fire_write(&mut self, payload: Payload<P>, info: &SessionInfo, env: &mut Env<'_, P>) {
        self.enter_tail(Op::Write(payload), info, env);
    }

    pub(crate) fn fire_flush(&mut self, info: &SessionInfo, env: &mut Env<'_, P>) {
        self.enter_tail(Op::Flush, info, env);
    }

    pub(crate) fn fire_close(&mut self, info: &SessionInfo, env: &mut Env<'_, P>) {
        self.enter_tail(Op::Close, info, env);
    }

    fn enter_head(&mut self, op: Op<P>, info: &SessionInfo, env: &mut Env<'_, P>) {
        self.queue.push_back(Hop { target: 0, op });
        self.run(info, env);
    }

    fn enter_tail(&mut self, op: Op<P>, info: &SessionInfo, env: &mut Env<'_, P>) {
        if let Some(target) = self.handlers.len().checked_sub(1) {
            self.queue.push_back(Hop { target, op });
            self.run(info, env);
        }
    }

    fn run(&mut self, info: &SessionInfo, env: &mut Env<'_, P>) {
        while let Some(Hop { target, op }) = self.queue.pop_front() {
            let Some(handler) = self.handlers.get_mut(target) else {
                continue;
            };
            let mut ctx = HandlerContext {
                index: target,
                queue: &mut self.queue,
                info,
                token: env.token,
                services: env.services,
                effects: &mut *env.effects,
            };
            match op {
                Op::Added => handler.on_added(&mut ctx),
                Op::Active => handler.on_active(&mut ctx),
                Op::Inactive => handler.on_inactive(&mut ctx),
                Op::Read(event) => handler.on_read(&mut ctx, event),
                Op::Write(payload) => handler.on_write(&mut ctx, payload),
                Op::Flush => handler.on_flush(&mut ctx),
                Op::Close => handler.on_close(&mut ctx),
                Op::Tick(now) => handler.on_tick(&mut ctx, now),
            }
        }
    }
}

impl<P> Default for Pipeline<P> {
    fn default() -> Self {
        Self::new()
    }
}


#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::testing::Harness;
    use super::*;
    use crate::session::SessionConfig;

    type Log = Rc<RefCell<Vec<String>>>;

    /// Records every callback, then passes it on.
    struct Recorder {
        name: &'static str,
        log: Log,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Log) -> Self {
            Self {
                name,
                log: Rc::clone(log),
            }
        }

        fn record(&self, what: &str) {
            self.log.borrow_mut().push(format!("{}:{what}", self.name));
        }
    }

    impl Handler<String> for Recorder {
        fn name(&self) -> &'static str {
            self.name
        }

        fn on_added(&mut self, _ctx: &mut HandlerContext<'_, String>) {
            self.record("added");
        }

        fn on_active(&mut self, ctx: &mut HandlerContext<'_, String>) {
            self.record("active");
            ctx.fire_active();
        }

        fn on_read(&mut self, ctx: &mut HandlerContext<'_, String>, event: ReadEvent<String>) {
            self.record("read");
            ctx.fire_read(event);
        }

        fn on_write(&mut self, ctx: &mut HandlerContext<'_, String>, payload: Payload<String>) {
            self.record("write");
            ctx.fire_write(payload);
        }

        fn on_close(&mut self, ctx: &mut HandlerContext<'_, String>) {
            self.record("close");
            ctx.fire_close();
        }
    }

    /// Swallows reads and answers each with a write back toward the head.
    struct Echo;

    impl Handler<String> for Echo {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn on_read(&mut self, ctx: &mut HandlerContext<'_, String>, event: ReadEvent<String>) {
            if let ReadEvent::Payload(Payload::OneWay(text)) = event {
                ctx.fire_write(Payload::OneWay(format!("re:{text}")));
            }
        }
    }

    fn harness_with(names: &[&'static str], log: &Log) -> Harness {
        let mut harness = Harness::new(SessionConfig::default());
        for name in names {
            harness.add(Recorder::new(name, log));
        }
        harness
    }

    #[test]
    fn test_added_runs_once_per_handler() {
        let log = Log::default();
        let _harness = harness_with(&["a", "b"], &log);
        assert_eq!(*log.borrow(), vec!["a:added", "b:added"]);
    }

    #[test]
    fn test_inbound_runs_head_to_tail() {
        let log = Log::default();
        let mut harness = harness_with(&["a", "b", "c"], &log);
        log.borrow_mut().clear();

        harness.active();
        harness.read(ReadEvent::Payload(Payload::OneWay("x".into())));
        assert_eq!(
            *log.borrow(),
            vec!["a:active", "b:active", "c:active", "a:read", "b:read", "c:read"]
        );
    }

    #[test]
    fn test_outbound_runs_tail_to_head() {
        let log = Log::default();
        let mut harness = harness_with(&["a", "b", "c"], &log);
        log.borrow_mut().clear();

        harness.write(Payload::OneWay("x".into()));
        harness.close();
        assert_eq!(
            *log.borrow(),
            vec!["c:write", "b:write", "a:write", "c:close", "b:close", "a:close"]
        );
    }

    #[test]
    fn test_reply_from_tail_travels_back_through_chain() {
        let log = Log::default();
        let mut harness = harness_with(&["a", "b"], &log);
        harness.add(Echo);
        log.borrow_mut().clear();

        harness.read(ReadEvent::Payload(Payload::OneWay("hi".into())));
        assert_eq!(*log.borrow(), vec!["a:read", "b:read", "b:write", "a:write"]);
        assert!(harness.take_effects().is_empty());
    }

    #[test]
    fn test_empty_chain_drops_everything() {
        let mut harness = Harness::new(SessionConfig::default());
        harness.active();
        harness.write(Payload::OneWay("lost".into()));
        harness.flush();
        harness.tick(Instant::now());
        assert!(harness.pipeline.is_empty());
        assert!(harness.take_effects().is_empty());
    }

    #[test]
    fn test_remove_by_name() {
        let log = Log::default();
        let mut harness = harness_with(&["a", "b", "c"], &log);
        assert!(harness.pipeline.remove("b").is_some());
        assert!(harness.pipeline.remove("b").is_none());
        assert_eq!(harness.pipeline.names(), vec!["a", "c"]);

        log.borrow_mut().clear();
        harness.active();
        assert_eq!(*log.borrow(), vec!["a:active", "c:active"]);
    }

    #[test]
    fn test_close_session_becomes_effect() {
        struct Closer;
        impl Handler<String> for Closer {
            fn name(&self) -> &'static str {
                "closer"
            }
            fn on_active(&mut self, ctx: &mut HandlerContext<'_, String>) {
                ctx.close_session();
            }
        }

        let mut harness = Harness::new(SessionConfig::default());
        harness.add(Closer);
        harness.active();
        let effects = harness.take_effects();
        assert!(matches!(effects.as_slice(), [Effect::CloseSession(key)] if key.session_id.as_str() == "A|B"));
    }
}
