//! Connect handshake: admission rules on the acceptor side and the temporary
//! handler that drives a connect attempt on the initiator side.
//!
//! Two variants exist. The trusted variant is for links inside a trusted
//! network: the request carries fixed sentinel values (see
//! [`protocol::trusted`](crate::protocol::trusted)) and a session can be
//! established once. The verified variant carries attempt counters so a
//! session can be resumed over a new transport, while stale or replayed
//! requests are refused.

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::connector::ConnectError;
use crate::pipeline::{Effect, Handler, HandlerContext, ReadEvent};
use crate::protocol::{ConnectRequest, ConnectResponse, Endpoint, Frame, Payload, SessionId, trusted};
use crate::transport::{SocketEvent, SocketEventKind, SocketTransport};

/// Name of the connector handshake handler in a session's chain.
pub const HANDSHAKE_HANDLER: &str = "handshake";

/// Which handshake variant a session uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum HandshakeMode {
    /// Fixed sentinels, no resumption.
    #[default]
    Trusted,
    /// Attempt counters, resumable after transport loss.
    Verified,
}

/// Progress of a connector handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Handler installed, request not yet sent.
    Init,
    /// Request sent, waiting for the response.
    AwaitingResponse,
    /// The acceptor admitted us.
    Verified,
    /// Refused, timed out or failed.
    Rejected,
}

/// Reasons a request or response fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    /// A trusted request carried a non-sentinel value.
    #[error("trusted request field {field} is {value}, expected the sentinel")]
    SentinelMismatch {
        /// Offending field.
        field: &'static str,
        /// Value found.
        value: u64,
    },

    /// The request was addressed to another endpoint.
    #[error("request addressed to {requested}, this endpoint is {local}")]
    WrongTarget {
        /// Endpoint named in the request.
        requested: String,
        /// Endpoint that received it.
        local: String,
    },

    /// The session id does not match the endpoints and discriminator.
    #[error("session id {0} does not match its endpoints")]
    SessionIdMismatch(SessionId),

    /// The session is already registered.
    #[error("session {0} already exists")]
    Duplicate(SessionId),

    /// Verified counters are not newer than the last accepted attempt.
    #[error("stale attempt: verifying {verifying}, verified {verified}")]
    StaleAttempt {
        /// Verifying counter of the request.
        verifying: u64,
        /// Verified counter of the request.
        verified: u64,
    },

    /// The response does not echo the request that was sent.
    #[error("response does not echo the request")]
    EchoMismatch,

    /// The response names an unexpected acceptor.
    #[error("response from {0}, expected another acceptor")]
    UnexpectedAcceptor(String),
}

/// Attempt counters of a verified session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerifyCounters {
    /// Latest attempt sent (connector) or admitted (acceptor).
    pub verifying: u64,
    /// Latest attempt confirmed by both sides.
    pub verified: u64,
}

impl VerifyCounters {
    /// Counters of a brand-new connect attempt.
    pub fn first_attempt() -> Self {
        Self {
            verifying: 1,
            verified: 0,
        }
    }

    /// Counters for the next resume attempt.
    pub fn next_attempt(self) -> Self {
        Self {
            verifying: self.verifying + 1,
            verified: self.verified,
        }
    }

    /// Record that `attempt` was confirmed.
    pub fn confirmed(self, attempt: u64) -> Self {
        Self {
            verifying: self.verifying.max(attempt),
            verified: attempt,
        }
    }
}

/// What the acceptor should do with a valid request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Create a new session.
    Fresh(VerifyCounters),
    /// Rebind an existing verified session to the new transport.
    Resume(VerifyCounters),
}

/// Check that a trusted request carries every sentinel.
pub fn check_trusted_sentinels(request: &ConnectRequest) -> Result<(), HandshakeError> {
    let fields = [
        ("sequence_base", request.sequence_base, trusted::SEQUENCE_BASE),
        ("ack_base", request.ack_base, trusted::ACK_BASE),
        ("verifying_attempt", request.verifying_attempt, trusted::VERIFYING_ATTEMPT),
        ("verified_attempt", request.verified_attempt, trusted::VERIFIED_ATTEMPT),
    ];
    match fields.into_iter().find(|(_, value, sentinel)| value != sentinel) {
        Some((field, value, _)) => Err(HandshakeError::SentinelMismatch { field, value }),
        None => Ok(()),
    }
}

/// Decide whether an acceptor admits `request`.
///
/// `existing` holds the counters of a registered session with the same id, if
/// there is one.
pub fn admit(
    request: &ConnectRequest,
    local: &Endpoint,
    mode: HandshakeMode,
    existing: Option<VerifyCounters>,
) -> Result<Admission, HandshakeError> {
    if mode == HandshakeMode::Trusted {
        check_trusted_sentinels(request)?;
    }
    if request.to != *local {
        return Err(HandshakeError::WrongTarget {
            requested: request.to.to_string(),
            local: local.to_string(),
        });
    }
    if request.session_id != SessionId::derive(&request.from, &request.to, request.discriminator) {
        return Err(HandshakeError::SessionIdMismatch(request.session_id.clone()));
    }

    let stale = || HandshakeError::StaleAttempt {
        verifying: request.verifying_attempt,
        verified: request.verified_attempt,
    };
    match (mode, existing) {
        (HandshakeMode::Trusted, None) => Ok(Admission::Fresh(VerifyCounters::default())),
        (HandshakeMode::Trusted, Some(_)) => Err(HandshakeError::Duplicate(request.session_id.clone())),
        (HandshakeMode::Verified, None) => {
            let starts_clean = request.sequence_base == 1 && request.ack_base == 0;
            if starts_clean && request.verified_attempt == 0 && request.verifying_attempt >= 1 {
                let attempt = request.verifying_attempt;
                Ok(Admission::Fresh(VerifyCounters {
                    verifying: attempt,
                    verified: attempt,
                }))
            } else {
                Err(stale())
            }
        }
        (HandshakeMode::Verified, Some(last)) => {
            if request.verifying_attempt > last.verifying && request.verified_attempt <= last.verified {
                let attempt = request.verifying_attempt;
                Ok(Admission::Resume(VerifyCounters {
                    verifying: attempt,
                    verified: attempt,
                }))
            } else {
                Err(stale())
            }
        }
    }
}

/// Check that `response` answers exactly the request that was sent.
pub fn check_echo(sent: &ConnectRequest, response: &ConnectResponse) -> Result<(), HandshakeError> {
    if response.echoed_request == *sent {
        Ok(())
    } else {
        Err(HandshakeError::EchoMismatch)
    }
}

/// Temporary sole handler of a connecting session.
///
/// Sends the request when added, waits for the response, and reports the
/// outcome to the loop. It never outlives the handshake: on success the loop
/// replaces it with the standard chain.
pub struct ConnectorHandshake {
    transport: SocketTransport,
    request: ConnectRequest,
    deadline: Instant,
    state: HandshakeState,
}

impl ConnectorHandshake {
    /// Create a handler that will send `request` over `transport`.
    pub fn new(transport: SocketTransport, request: ConnectRequest, deadline: Instant) -> Self {
        Self {
            transport,
            request,
            deadline,
            state: HandshakeState::Init,
        }
    }

    /// Current progress.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    fn fail<P>(&mut self, ctx: &mut HandlerContext<'_, P>, error: ConnectError) {
        if self.state == HandshakeState::Rejected {
            return;
        }
        self.state = HandshakeState::Rejected;
        self.transport.close();
        ctx.push_effect(Effect::HandshakeFailed {
            key: ctx.key().clone(),
            error,
        });
    }

    fn on_response<P>(&mut self, ctx: &mut HandlerContext<'_, P>, response: ConnectResponse) {
        if let Err(e) = check_echo(&self.request, &response) {
            tracing::warn!("Handshake for {} failed: {e}", self.request.session_id);
            self.fail(ctx, ConnectError::ProtocolViolation);
            return;
        }
        if !response.accepted {
            tracing::info!("Handshake for {} rejected by {}", self.request.session_id, response.acceptor);
            self.fail(ctx, ConnectError::Rejected);
            return;
        }
        if response.acceptor != self.request.to {
            let error = HandshakeError::UnexpectedAcceptor(response.acceptor.to_string());
            tracing::warn!("Handshake for {} failed: {error}", self.request.session_id);
            self.fail(ctx, ConnectError::ProtocolViolation);
            return;
        }

        self.state = HandshakeState::Verified;
        ctx.push_effect(Effect::HandshakeAccepted {
            key: ctx.key().clone(),
            acceptor: response.acceptor,
            transport: self.transport.clone(),
        });
    }
}

impl<P> Handler<P> for ConnectorHandshake {
    fn name(&self) -> &'static str {
        HANDSHAKE_HANDLER
    }

    fn on_added(&mut self, ctx: &mut HandlerContext<'_, P>) {
        if self.transport.send(Frame::ConnectRequest(self.request.clone())) {
            self.state = HandshakeState::AwaitingResponse;
            tracing::debug!(
                "Sent connect request for {} on {:?}",
                self.request.session_id,
                self.transport.id()
            );
        } else {
            self.fail(ctx, ConnectError::TransportClosed);
        }
    }

    fn on_read(&mut self, ctx: &mut HandlerContext<'_, P>, event: ReadEvent<P>) {
        let ReadEvent::Socket(SocketEvent { transport, kind }) = event else {
            return;
        };
        if transport != self.transport.id() {
            ctx.push_effect(Effect::CloseTransport(transport));
            return;
        }
        if self.state != HandshakeState::AwaitingResponse {
            return;
        }
        match kind {
            SocketEventKind::ConnectResponse(response) => self.on_response(ctx, response),
            SocketEventKind::TransportClosed => self.fail(ctx, ConnectError::TransportClosed),
            other => {
                tracing::warn!(
                    "Unexpected {} during handshake for {}, closing",
                    other.label(),
                    self.request.session_id
                );
                self.fail(ctx, ConnectError::ProtocolViolation);
            }
        }
    }

    fn on_write(&mut self, _ctx: &mut HandlerContext<'_, P>, _payload: Payload<P>) {
        tracing::trace!("Write before handshake completion dropped");
    }

    fn on_close(&mut self, _ctx: &mut HandlerContext<'_, P>) {
        self.state = HandshakeState::Rejected;
        self.transport.close();
    }

    fn on_tick(&mut self, ctx: &mut HandlerContext<'_, P>, now: Instant) {
        if self.state == HandshakeState::AwaitingResponse && now >= self.deadline {
            tracing::warn!("Handshake for {} timed out", self.request.session_id);
            self.fail(ctx, ConnectError::Timeout);
        }
    }
}
