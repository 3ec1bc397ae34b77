//! Application-facing tail of the handler chain.
//!
//! Support handlers turn decoded payloads into [`AppEvent`]s on the loop's
//! crossbeam channel. The application drains that channel from its own
//! thread, typically once per game tick, with [`drain_app_events`].

use crossbeam_channel::Receiver;

use crate::pipeline::{Handler, HandlerContext, ReadEvent};
use crate::protocol::{Endpoint, Payload};
use crate::session::{SessionHandle, SessionKey};

/// Name of the one-way support handler.
pub const ONE_WAY_HANDLER: &str = "one-way";
/// Name of the request/response support handler.
pub const RPC_HANDLER: &str = "rpc";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Notification from the session loop to the application.
#[derive(Debug)]
pub enum AppEvent<P> {
    /// A session became active.
    Connected(SessionHandle<P>),
    /// A previously active session closed.
    Disconnected {
        /// Key of the closed session.
        key: SessionKey,
        /// Its remote endpoint.
        remote: Option<Endpoint>,
    },
    /// A one-way message arrived.
    Message {
        /// Receiving session.
        key: SessionKey,
        /// Decoded body.
        payload: P,
    },
    /// A request arrived (request/response support only).
    Request {
        /// Receiving session.
        key: SessionKey,
        /// Correlation id to echo in the response.
        request_id: u64,
        /// Decoded body.
        body: P,
    },
    /// A response arrived (request/response support only).
    Response {
        /// Receiving session.
        key: SessionKey,
        /// Correlation id of the answered request.
        request_id: u64,
        /// Decoded body.
        body: P,
    },
}

impl<P: Send + 'static> AppEvent<P> {
    /// Session the event concerns.
    pub fn key(&self) -> &SessionKey {
        match self {
            AppEvent::Connected(handle) => handle.key(),
            AppEvent::Disconnected { key, .. }
            | AppEvent::Message { key, .. }
            | AppEvent::Request { key, .. }
            | AppEvent::Response { key, .. } => key,
        }
    }
}

/// Drain every pending application event without blocking.
pub fn drain_app_events<P>(receiver: &Receiver<AppEvent<P>>) -> Vec<AppEvent<P>> {
    receiver.try_iter().collect()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// Delivers one-way messages to the application.
pub struct OneWaySupport;

impl<P> Handler<P> for OneWaySupport {
    fn name(&self) -> &'static str {
        ONE_WAY_HANDLER
    }

    fn on_read(&mut self, ctx: &mut HandlerContext<'_, P>, event: ReadEvent<P>) {
        match event {
            ReadEvent::Payload(Payload::OneWay(payload)) => {
                let key = ctx.key().clone();
                ctx.notify(AppEvent::Message { key, payload });
            }
            other => ctx.fire_read(other),
        }
    }
}

/// Delivers requests and responses to the application.
///
/// Correlating responses with requests is left to the layer above.
pub struct RpcSupport;

impl<P> Handler<P> for RpcSupport {
    fn name(&self) -> &'static str {
        RPC_HANDLER
    }

    fn on_read(&mut self, ctx: &mut HandlerContext<'_, P>, event: ReadEvent<P>) {
        let key = ctx.key().clone();
        match event {
            ReadEvent::Payload(Payload::Request { request_id, body }) => {
                ctx.notify(AppEvent::Request { key, request_id, body });
            }
            ReadEvent::Payload(Payload::Response { request_id, body }) => {
                ctx.notify(AppEvent::Response { key, request_id, body });
            }
            other => ctx.fire_read(other),
        }
    }
}
