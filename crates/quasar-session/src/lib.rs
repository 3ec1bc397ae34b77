//! Session and transport layer for node-to-node messaging: handshakes, ordered
//! delivery with batching, heartbeat liveness, and a single-threaded session loop
//! that owns every session's mutable state.

pub mod acceptor;
pub mod codec;
pub mod compression;
pub mod connector;
pub mod event_loop;
pub mod framing;
pub mod handshake;
pub mod heartbeat;
mod local;
pub mod pipeline;
pub mod platform;
pub mod protocol;
pub mod reconnect;
pub mod registry;
pub mod session;
pub mod support;
pub mod transfer;
pub mod transport;

pub use acceptor::AcceptorConfig;
pub use codec::{Codec, CodecError, PostcardCodec};
pub use connector::{ConnectError, ConnectFuture, ConnectTarget};
pub use event_loop::{
    LoopConfig, LoopContext, LoopError, LoopHandle, LoopToken, SessionLoop, SessionSnapshot, TaskHandle,
};
pub use handshake::{HandshakeError, HandshakeMode, HandshakeState};
pub use pipeline::{Handler, HandlerContext, ReadEvent};
pub use protocol::{Endpoint, Heartbeat, Payload, SessionId, SocketMessage};
pub use reconnect::{ReconnectConfig, ReconnectError};
pub use registry::{RegistryError, SessionRegistry};
pub use session::{Session, SessionConfig, SessionError, SessionHandle, SessionKey, SessionState, Side};
pub use support::{AppEvent, drain_app_events};
pub use transport::{SocketEvent, SocketEventKind, TransportId};
