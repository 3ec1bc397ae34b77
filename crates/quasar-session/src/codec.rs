//! Payload codec used to turn application messages into wire bytes and back.
//!
//! The session layer never inspects payloads; it only asks the configured
//! [`Codec`] to encode outbound bodies, decode inbound ones, and produce
//! independent copies for in-process delivery.

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Errors reported by a [`Codec`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The payload could not be encoded.
    #[error("payload encode failed: {0}")]
    Encode(String),

    /// The bytes could not be decoded into a payload.
    #[error("payload decode failed: {0}")]
    Decode(String),
}

/// Serialization contract for application payloads of type `P`.
///
/// Implementations are shared between the session loop and the socket reader
/// tasks, so they must be thread-safe.
pub trait Codec<P>: Send + Sync + 'static {
    /// Encode a payload into bytes.
    fn encode(&self, payload: &P) -> Result<Vec<u8>, CodecError>;

    /// Decode bytes produced by [`Codec::encode`].
    fn decode(&self, bytes: &[u8]) -> Result<P, CodecError>;

    /// Produce a copy of `payload` that shares no mutable state with the
    /// original. Used when both endpoints live in the same process.
    fn clone_for_local_delivery(&self, payload: &P) -> P;
}

/// [`Codec`] backed by postcard, the same compact format used for frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostcardCodec;

impl<P> Codec<P> for PostcardCodec
where
    P: Serialize + DeserializeOwned + Clone + Send + 'static,
{
    fn encode(&self, payload: &P) -> Result<Vec<u8>, CodecError> {
        postcard::to_allocvec(payload).map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<P, CodecError> {
        postcard::from_bytes(bytes).map_err(|e| CodecError::Decode(e.to_string()))
    }

    fn clone_for_local_delivery(&self, payload: &P) -> P {
        payload.clone()
    }
}
