//! Frame-level socket I/O: newline-delimited JSON over a buffered
//! `TcpStream`.
//!
//! The buffering strategy is an internal `BytesMut` read buffer that is
//! scanned for a complete frame (a `\n`-terminated line) before reading any
//! more bytes off the socket.

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

/// Default ceiling on a single frame's size. Bounds how much a misbehaving
/// client can make the read buffer grow.
pub(crate) const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024;

/// Send and receive newline-delimited JSON values from a remote peer.
pub(crate) struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
    max_frame_bytes: usize,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ConnError {
    #[error("frame too large")]
    FrameTooLarge,
    #[error("connection reset by peer")]
    ResetByPeer,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Connection {
    pub(crate) fn new(socket: TcpStream) -> Connection {
        Connection {
            stream: BufWriter::new(socket),
            buffer: BytesMut::with_capacity(4 * 1024),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Reads one newline-delimited frame. `Ok(None)` means the peer closed
    /// the connection cleanly between frames.
    pub(crate) async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, ConnError> {
        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                let mut frame = self.buffer.split_to(pos + 1);
                frame.truncate(frame.len() - 1); // drop the trailing '\n'
                return Ok(Some(frame.to_vec()));
            }

            if self.buffer.len() >= self.max_frame_bytes {
                // Discard the oversized buffer so the connection can recover
                // on the next frame rather than wedging forever.
                self.buffer.clear();
                return Err(ConnError::FrameTooLarge);
            }

            if 0 == self.stream.read_buf(&mut self.buffer).await? {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(ConnError::ResetByPeer);
            }
        }
    }

    /// Writes one JSON value followed by `\n` and flushes it.
    pub(crate) async fn write_frame(&mut self, value: &serde_json::Value) -> std::io::Result<()> {
        let encoded = serde_json::to_vec(value).expect("Value always serializes");
        self.stream.write_all(&encoded).await?;
        self.stream.write_all(b"\n").await?;
        self.stream.flush().await
    }
}
