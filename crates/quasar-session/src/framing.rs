//! Length-prefixed framing for TCP streams.
//!
//! Every frame on the wire is:
//!
//! ```text
//! +-------------------+------+---------------------------------+
//! | length (4 bytes)  | flag |  versioned postcard Frame       |
//! | u32 little-endian | u8   |  (LZ4-compressed if flag = 1)   |
//! +-------------------+------+---------------------------------+
//! ```
//!
//! The length covers the flag byte and the body but not the prefix itself.
//! [`FramedReader`] and [`FramedWriter`] wrap the two halves of a split stream.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::compression::{self, CompressionConfig, CompressionError};
use crate::protocol::{self, Frame, ProtocolError};

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed frame length in bytes, before and after decompression. Default: 1 MB.
    pub max_frame_size: u32,
    /// Compression applied to outbound frames.
    pub compression: CompressionConfig,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_size: 1_048_576,
            compression: CompressionConfig::default(),
        }
    }
}

/// Errors that can occur while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The frame length exceeds the configured maximum.
    #[error("frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// The offending length.
        size: usize,
        /// The configured maximum.
        max: u32,
    },

    /// The peer closed the stream, possibly in the middle of a frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// The frame body could not be unpacked.
    #[error(transparent)]
    Compression(#[from] CompressionError),

    /// The frame could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The frame could not be encoded.
    #[error("frame serialization error: {0}")]
    Encode(#[from] postcard::Error),

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn eof_as_closed(e: std::io::Error) -> FrameError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        FrameError::ConnectionClosed
    } else {
        FrameError::Io(e)
    }
}

/// Reads whole [`Frame`]s from the read half of a stream.
pub struct FramedReader<R> {
    inner: R,
    config: FrameConfig,
    buf: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    /// Wrap a reader.
    pub fn new(inner: R, config: FrameConfig) -> Self {
        Self {
            inner,
            config,
            buf: Vec::new(),
        }
    }

    /// Read the next raw frame, returning the packed bytes after the length prefix.
    pub async fn recv_raw(&mut self) -> Result<&[u8], FrameError> {
        let mut prefix = [0u8; 4];
        self.inner.read_exact(&mut prefix).await.map_err(eof_as_closed)?;

        let len = u32::from_le_bytes(prefix);
        if len > self.config.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                size: len as usize,
                max: self.config.max_frame_size,
            });
        }

        self.buf.resize(len as usize, 0);
        self.inner.read_exact(&mut self.buf).await.map_err(eof_as_closed)?;
        Ok(&self.buf)
    }

    /// Read and decode the next frame.
    pub async fn recv(&mut self) -> Result<Frame, FrameError> {
        let max = self.config.max_frame_size as usize;
        let packed = self.recv_raw().await?;
        let raw = compression::unpack(packed, max)?;
        Ok(protocol::deserialize_frame(&raw)?)
    }
}

/// Writes whole [`Frame`]s to the write half of a stream.
pub struct FramedWriter<W> {
    inner: W,
    config: FrameConfig,
}

impl<W: AsyncWrite + Unpin> FramedWriter<W> {
    /// Wrap a writer.
    pub fn new(inner: W, config: FrameConfig) -> Self {
        Self { inner, config }
    }

    /// Write already-packed bytes as one length-prefixed frame and flush.
    pub async fn send_raw(&mut self, packed: &[u8]) -> Result<(), FrameError> {
        let len = u32::try_from(packed.len())
            .ok()
            .filter(|len| *len <= self.config.max_frame_size)
            .ok_or(FrameError::FrameTooLarge {
                size: packed.len(),
                max: self.config.max_frame_size,
            })?;

        self.inner.write_all(&len.to_le_bytes()).await?;
        self.inner.write_all(packed).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Serialize, pack and write a frame.
    pub async fn send(&mut self, frame: &Frame) -> Result<(), FrameError> {
        let raw = protocol::serialize_frame(frame)?;
        let packed = compression::pack(&raw, &self.config.compression);
        self.send_raw(&packed).await
    }

    /// Shut down the underlying writer, signalling end-of-stream to the peer.
    pub async fn shutdown(&mut self) -> std::io::Result<()> {
        self.inner.shutdown().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ConnectRequest, Endpoint, Heartbeat, WireKind, WireMessage};
    use tokio::io::duplex;

    fn data(sequence: u64, body: &[u8]) -> Frame {
        Frame::Data(WireMessage {
            sequence,
            ack: 0,
            kind: WireKind::OneWay,
            body: body.to_vec(),
        })
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (client, server) = duplex(8192);
        let mut writer = FramedWriter::new(client, FrameConfig::default());
        let mut reader = FramedReader::new(server, FrameConfig::default());

        let request = Frame::ConnectRequest(ConnectRequest::trusted(
            Endpoint::new("A", "gate"),
            Endpoint::new("B", "battle"),
            0,
        ));
        let frames = vec![request, data(1, b"first"), data(2, b"second")];
        for frame in &frames {
            writer.send(frame).await.unwrap();
        }
        for expected in &frames {
            assert_eq!(&reader.recv().await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn test_partial_reads_resume() {
        let (client, server) = duplex(8);
        let big = data(1, &[9u8; 600]);
        let sent = big.clone();
        let write_task = tokio::spawn(async move {
            let mut writer = FramedWriter::new(client, FrameConfig::default());
            writer.send(&sent).await.unwrap();
        });

        let mut reader = FramedReader::new(server, FrameConfig::default());
        assert_eq!(reader.recv().await.unwrap(), big);
        write_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_read() {
        let (mut client, server) = duplex(8192);
        let config = FrameConfig {
            max_frame_size: 16,
            ..FrameConfig::default()
        };
        client.write_all(&1024u32.to_le_bytes()).await.unwrap();

        let mut reader = FramedReader::new(server, config);
        assert!(matches!(
            reader.recv().await,
            Err(FrameError::FrameTooLarge { size: 1024, max: 16 })
        ));
    }

    #[tokio::test]
    async fn test_frame_inflating_past_limit_rejected_on_read() {
        let (client, server) = duplex(1 << 20);
        let limit = 64 * 1024;
        let sender = FrameConfig {
            max_frame_size: 8 << 20,
            ..FrameConfig::default()
        };
        let receiver = FrameConfig {
            max_frame_size: limit,
            ..FrameConfig::default()
        };

        let big = data(1, &vec![0u8; 4 << 20]);
        let raw = protocol::serialize_frame(&big).unwrap();
        let packed = compression::pack(&raw, &sender.compression);
        assert!(packed.len() < limit as usize, "packed {} bytes", packed.len());

        let mut writer = FramedWriter::new(client, sender);
        writer.send_raw(&packed).await.unwrap();

        let mut reader = FramedReader::new(server, receiver);
        assert!(matches!(
            reader.recv().await,
            Err(FrameError::Compression(CompressionError::TooLarge { max: 65_536, .. }))
        ));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_on_write() {
        let (client, _server) = duplex(8192);
        let config = FrameConfig {
            max_frame_size: 16,
            compression: CompressionConfig {
                enabled: false,
                ..CompressionConfig::default()
            },
        };
        let mut writer = FramedWriter::new(client, config);
        assert!(matches!(
            writer.send(&data(1, &[0u8; 64])).await,
            Err(FrameError::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_closed_stream_reports_connection_closed() {
        let (client, server) = duplex(8192);
        drop(client);
        let mut reader = FramedReader::new(server, FrameConfig::default());
        assert!(matches!(reader.recv().await, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_truncated_frame_reports_connection_closed() {
        let (mut client, server) = duplex(8192);
        client.write_all(&10u32.to_le_bytes()).await.unwrap();
        client.write_all(&[0u8; 3]).await.unwrap();
        drop(client);

        let mut reader = FramedReader::new(server, FrameConfig::default());
        assert!(matches!(reader.recv().await, Err(FrameError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_length_prefix_is_little_endian() {
        let (client, mut server) = duplex(8192);
        let mut writer = FramedWriter::new(client, FrameConfig::default());
        writer
            .send(&Frame::Heartbeat {
                beat: Heartbeat::Ping,
                ack: 0,
            })
            .await
            .unwrap();

        let mut prefix = [0u8; 4];
        server.read_exact(&mut prefix).await.unwrap();
        let len = u32::from_le_bytes(prefix) as usize;
        let mut rest = vec![0u8; len];
        server.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest[0], compression::COMPRESSION_FLAG_NONE);
        assert_eq!(rest[1], protocol::PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_garbage_body_is_a_protocol_error() {
        let (mut client, server) = duplex(8192);
        client.write_all(&3u32.to_le_bytes()).await.unwrap();
        client
            .write_all(&[compression::COMPRESSION_FLAG_NONE, 42, 0])
            .await
            .unwrap();

        let mut reader = FramedReader::new(server, FrameConfig::default());
        assert!(matches!(
            reader.recv().await,
            Err(FrameError::Protocol(ProtocolError::UnsupportedVersion(42)))
        ));
    }
}
