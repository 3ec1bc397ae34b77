//! Liveness for established sessions.
//!
//! Sends a ping when nothing has been written for `ping_interval`, answers
//! pings with pongs, and closes the session when nothing has been read for
//! `session_timeout`. Heartbeats never reach the application.

use std::time::{Duration, Instant};

use crate::pipeline::{Handler, HandlerContext, ReadEvent};
use crate::protocol::{Heartbeat, Payload};
use crate::session::SessionConfig;

/// Name of the heartbeat handler in a session's chain.
pub const HEARTBEAT_HANDLER: &str = "heartbeat";

/// Idle detection driven by the loop tick.
pub struct HeartbeatHandler {
    ping_interval: Duration,
    session_timeout: Duration,
    last_read: Instant,
    last_write: Instant,
}

impl HeartbeatHandler {
    /// Create a handler using the intervals in `config`.
    pub fn new(config: &SessionConfig) -> Self {
        let now = Instant::now();
        Self {
            ping_interval: config.ping_interval,
            session_timeout: config.session_timeout,
            last_read: now,
            last_write: now,
        }
    }
}

impl<P> Handler<P> for HeartbeatHandler {
    fn name(&self) -> &'static str {
        HEARTBEAT_HANDLER
    }

    fn on_read(&mut self, ctx: &mut HandlerContext<'_, P>, event: ReadEvent<P>) {
        self.last_read = Instant::now();
        match event {
            ReadEvent::Payload(Payload::Heartbeat(Heartbeat::Ping)) => {
                self.last_write = self.last_read;
                ctx.fire_write(Payload::Heartbeat(Heartbeat::Pong));
            }
            ReadEvent::Payload(Payload::Heartbeat(Heartbeat::Pong)) => {}
            other => ctx.fire_read(other),
        }
    }

    fn on_write(&mut self, ctx: &mut HandlerContext<'_, P>, payload: Payload<P>) {
        self.last_write = Instant::now();
        ctx.fire_write(payload);
    }

    fn on_tick(&mut self, ctx: &mut HandlerContext<'_, P>, now: Instant) {
        let read_idle = now.saturating_duration_since(self.last_read);
        if read_idle >= self.session_timeout {
            tracing::warn!("Session {} idle for {read_idle:?}, closing", ctx.key());
            ctx.close_session();
            return;
        }
        if now.saturating_duration_since(self.last_write) >= self.ping_interval {
            self.last_write = now;
            ctx.fire_write(Payload::Heartbeat(Heartbeat::Ping));
        }
        ctx.fire_tick(now);
    }
}
