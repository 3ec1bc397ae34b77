//! Wire protocol: handshake messages, transport frames and their versioned
//! postcard encoding.
//!
//! Every frame is serialized with [`postcard`] and prefixed with a protocol
//! version byte. Use [`serialize_frame`] and [`deserialize_frame`] for
//! encoding/decoding. Application bodies inside [`WireMessage`] are opaque
//! bytes produced by the session's [`Codec`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::codec::{Codec, CodecError};

/// Current wire-protocol version. Prepended to every serialized frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed handshake values for the trusted handshake variant.
///
/// A trusted [`ConnectRequest`] must carry exactly these values in its
/// sequence, ack and attempt fields. Anything else is rejected, which stops a
/// verified-mode (or replayed) request from being admitted on a trusted link.
pub mod trusted {
    /// Sentinel for [`ConnectRequest::sequence_base`](super::ConnectRequest::sequence_base).
    pub const SEQUENCE_BASE: u64 = u64::MAX;
    /// Sentinel for [`ConnectRequest::ack_base`](super::ConnectRequest::ack_base).
    pub const ACK_BASE: u64 = u64::MAX;
    /// Sentinel for [`ConnectRequest::verifying_attempt`](super::ConnectRequest::verifying_attempt).
    pub const VERIFYING_ATTEMPT: u64 = u64::MAX;
    /// Sentinel for [`ConnectRequest::verified_attempt`](super::ConnectRequest::verified_attempt).
    pub const VERIFIED_ATTEMPT: u64 = u64::MAX;
}

// ---------------------------------------------------------------------------
// Identities
// ---------------------------------------------------------------------------

/// A node identity: unique id plus the role it plays in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    /// Unique node id, e.g. `"gate-1"`.
    pub id: String,
    /// Node role, e.g. `"gate"` or `"battle"`.
    pub role: String,
}

impl Endpoint {
    /// Create an endpoint from an id and a role.
    pub fn new(id: impl Into<String>, role: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: role.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.id, self.role)
    }
}

/// Logical session identifier, derived from both endpoint ids.
///
/// The same id is shared by the initiator and the acceptor side of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap an already-formatted id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the id for a session from `initiator` to `acceptor`.
    ///
    /// Discriminator 0 yields `"initiator|acceptor"`; any other value is
    /// appended as `"#n"` so several sessions between one pair can coexist.
    pub fn derive(initiator: &Endpoint, acceptor: &Endpoint, discriminator: u32) -> Self {
        if discriminator == 0 {
            Self(format!("{}|{}", initiator.id, acceptor.id))
        } else {
            Self(format!("{}|{}#{discriminator}", initiator.id, acceptor.id))
        }
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Handshake messages
// ---------------------------------------------------------------------------

/// First frame sent by an initiator on a fresh transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Session the initiator wants to open or resume.
    pub session_id: SessionId,
    /// The initiator.
    pub from: Endpoint,
    /// The endpoint the initiator expects to reach.
    pub to: Endpoint,
    /// Distinguishes parallel sessions between the same pair.
    pub discriminator: u32,
    /// First outbound sequence the initiator will (re)send.
    pub sequence_base: u64,
    /// Highest inbound sequence the initiator has delivered.
    pub ack_base: u64,
    /// Attempt counter of this handshake.
    pub verifying_attempt: u64,
    /// Last attempt the initiator saw confirmed.
    pub verified_attempt: u64,
}

impl ConnectRequest {
    /// Build a trusted-mode request carrying the fixed sentinel values.
    pub fn trusted(from: Endpoint, to: Endpoint, discriminator: u32) -> Self {
        Self {
            session_id: SessionId::derive(&from, &to, discriminator),
            from,
            to,
            discriminator,
            sequence_base: trusted::SEQUENCE_BASE,
            ack_base: trusted::ACK_BASE,
            verifying_attempt: trusted::VERIFYING_ATTEMPT,
            verified_attempt: trusted::VERIFIED_ATTEMPT,
        }
    }

    /// Build a verified-mode request with explicit attempt counters.
    pub fn verified(
        from: Endpoint,
        to: Endpoint,
        discriminator: u32,
        verifying_attempt: u64,
        verified_attempt: u64,
    ) -> Self {
        Self {
            session_id: SessionId::derive(&from, &to, discriminator),
            from,
            to,
            discriminator,
            sequence_base: 1,
            ack_base: 0,
            verifying_attempt,
            verified_attempt,
        }
    }

    /// Whether every sentinel field holds its trusted value.
    pub fn has_trusted_sentinels(&self) -> bool {
        self.sequence_base == trusted::SEQUENCE_BASE
            && self.ack_base == trusted::ACK_BASE
            && self.verifying_attempt == trusted::VERIFYING_ATTEMPT
            && self.verified_attempt == trusted::VERIFIED_ATTEMPT
    }
}

/// Acceptor's answer to a [`ConnectRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    /// Whether the acceptor admitted the request.
    pub accepted: bool,
    /// Exact copy of the request being answered.
    pub echoed_request: ConnectRequest,
    /// The acceptor's identity.
    pub acceptor: Endpoint,
    /// Highest inbound sequence the acceptor has delivered (verified mode).
    pub ack_base: u64,
}

impl ConnectResponse {
    /// Positive response echoing `request`.
    pub fn accept(request: ConnectRequest, acceptor: Endpoint) -> Self {
        Self {
            accepted: true,
            ack_base: 0,
            echoed_request: request,
            acceptor,
        }
    }

    /// Negative response echoing `request`.
    pub fn reject(request: ConnectRequest, acceptor: Endpoint) -> Self {
        Self {
            accepted: false,
            ack_base: 0,
            echoed_request: request,
            acceptor,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport frames
// ---------------------------------------------------------------------------

/// Liveness marker exchanged by the heartbeat handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Heartbeat {
    /// Liveness check; the receiver answers with [`Heartbeat::Pong`].
    Ping,
    /// Answer to a [`Heartbeat::Ping`].
    Pong,
}

/// Shape of an application message body on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireKind {
    /// Fire-and-forget message.
    OneWay,
    /// Request carrying its correlation id.
    Request(u64),
    /// Response to the request with this correlation id.
    Response(u64),
}

/// A sequenced application message with a codec-encoded body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Sender-assigned sequence number, starting at 1.
    pub sequence: u64,
    /// Highest sequence the sender has delivered from its peer.
    pub ack: u64,
    /// Body shape.
    pub kind: WireKind,
    /// Codec-encoded body.
    pub body: Vec<u8>,
}

/// Top-level frame exchanged on a socket. The enum discriminant is the type tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// Handshake request from the initiator.
    ConnectRequest(ConnectRequest),
    /// Handshake response from the acceptor.
    ConnectResponse(ConnectResponse),
    /// A single application message.
    Data(WireMessage),
    /// Several application messages flushed together, in sequence order.
    Batch(Vec<WireMessage>),
    /// Liveness marker with the sender's current acknowledgement.
    Heartbeat {
        /// Ping or pong.
        beat: Heartbeat,
        /// Highest sequence the sender has delivered.
        ack: u64,
    },
    /// Bare acknowledgement from a side with no data of its own to send.
    Ack {
        /// Highest sequence the sender has delivered.
        ack: u64,
    },
}

// ---------------------------------------------------------------------------
// Typed messages
// ---------------------------------------------------------------------------

/// Payload of a message travelling through a session's handler chain.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload<P> {
    /// Fire-and-forget application message.
    OneWay(P),
    /// Request expecting a [`Payload::Response`] with the same id.
    Request {
        /// Caller-chosen correlation id.
        request_id: u64,
        /// Request body.
        body: P,
    },
    /// Response to an earlier request.
    Response {
        /// Correlation id of the request being answered.
        request_id: u64,
        /// Response body.
        body: P,
    },
    /// Liveness marker.
    Heartbeat(Heartbeat),
}

impl<P> Payload<P> {
    /// Whether this payload is a heartbeat marker.
    pub fn is_heartbeat(&self) -> bool {
        matches!(self, Payload::Heartbeat(_))
    }
}

/// A decoded sequenced message.
#[derive(Debug, Clone, PartialEq)]
pub struct SocketMessage<P> {
    /// Sender-assigned sequence number.
    pub sequence: u64,
    /// Sender's acknowledgement of our traffic.
    pub ack: u64,
    /// Message payload.
    pub payload: Payload<P>,
}

/// Encode a data message into its wire form using `codec`.
///
/// Heartbeats travel as [`Frame::Heartbeat`] and are not sequenced, so they
/// are rejected here.
pub fn encode_message<P: 'static>(
    message: &SocketMessage<P>,
    codec: &dyn Codec<P>,
) -> Result<WireMessage, CodecError> {
    let (kind, body) = match &message.payload {
        Payload::OneWay(body) => (WireKind::OneWay, codec.encode(body)?),
        Payload::Request { request_id, body } => (WireKind::Request(*request_id), codec.encode(body)?),
        Payload::Response { request_id, body } => {
            (WireKind::Response(*request_id), codec.encode(body)?)
        }
        Payload::Heartbeat(_) => {
            return Err(CodecError::Encode("heartbeat is not a data message".to_string()));
        }
    };
    Ok(WireMessage {
        sequence: message.sequence,
        ack: message.ack,
        kind,
        body,
    })
}

/// Decode a wire message body using `codec`.
pub fn decode_message<P: 'static>(
    wire: WireMessage,
    codec: &dyn Codec<P>,
) -> Result<SocketMessage<P>, CodecError> {
    let body = codec.decode(&wire.body)?;
    let payload = match wire.kind {
        WireKind::OneWay => Payload::OneWay(body),
        WireKind::Request(request_id) => Payload::Request { request_id, body },
        WireKind::Response(request_id) => Payload::Response { request_id, body },
    };
    Ok(SocketMessage {
        sequence: wire.sequence,
        ack: wire.ack,
        payload,
    })
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors that can occur during frame deserialization.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The payload was empty (no version byte).
    #[error("empty frame, no version byte")]
    EmptyPayload,

    /// The version byte does not match [`PROTOCOL_VERSION`].
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    /// Postcard deserialization failed.
    #[error("frame deserialization error: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// Serialization helpers
// ---------------------------------------------------------------------------

/// Serialize a [`Frame`] into a versioned binary payload.
///
/// Wire format: `[version: u8] [postcard-encoded Frame]`
pub fn serialize_frame(frame: &Frame) -> Result<Vec<u8>, postcard::Error> {
    let body = postcard::to_allocvec(frame)?;
    let mut out = Vec::with_capacity(1 + body.len());
    out.push(PROTOCOL_VERSION);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Deserialize a versioned binary payload into a [`Frame`].
pub fn deserialize_frame(data: &[u8]) -> Result<Frame, ProtocolError> {
    let (&version, body) = data.split_first().ok_or(ProtocolError::EmptyPayload)?;
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }
    Ok(postcard::from_bytes(body)?)
}
