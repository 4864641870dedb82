//! Transport adapter: length-prefixed frames over an already-secured stream.
//!
//! Encryption and peer authentication of the byte stream are the job of the
//! security collaborator behind [`SecureAcceptor`] / [`SecureConnector`]. This
//! module only turns an ordered, reliable byte stream into discrete frames:
//!
//! ```text
//! [len:u32 big-endian][envelope bytes: len]
//! ```
//!
//! # Why buffer inside the reader? (for beginners)
//!
//! A single `read()` may return half a frame, or one and a half frames. The
//! [`FrameReader`] keeps leftover bytes in its own buffer between calls, which
//! also makes [`FrameReader::receive`] safe to cancel: if a `tokio::select!`
//! picks another branch halfway through a frame, nothing is lost and the next
//! call continues where this one stopped.

pub mod memory;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

/// Size of the frame length prefix.
pub const FRAME_PREFIX_SIZE: usize = 4;

const READ_CHUNK: usize = 8 * 1024;

/// Errors raised by the transport adapter.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A frame (inbound or outbound) exceeds the configured maximum.
    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    /// The peer closed the stream.
    #[error("stream closed by peer")]
    Closed,

    /// The underlying stream failed.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Any stream the security collaborator hands us.
pub trait SecureStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> SecureStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Server-side source of authenticated, encrypted streams.
#[async_trait]
pub trait SecureAcceptor: Send + Sync + 'static {
    type Stream: SecureStream;

    /// Waits for the next inbound connection. Returns the stream and a
    /// printable peer address for logging.
    async fn accept(&self) -> std::io::Result<(Self::Stream, String)>;
}

/// Client-side factory for authenticated, encrypted streams.
#[async_trait]
pub trait SecureConnector: Send + Sync + 'static {
    type Stream: SecureStream;

    /// Opens a stream to `address`.
    async fn connect(&self, address: &str) -> std::io::Result<Self::Stream>;
}

// ── Traffic counters ──────────────────────────────────────────────────────────

/// Byte counters shared by every transport of one process.
///
/// Counts include the length prefixes.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    fn add_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    fn add_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Reads whole frames from the read half of a stream.
pub struct FrameReader<R> {
    inner: R,
    buf: Vec<u8>,
    max_frame_size: usize,
    counters: Arc<TrafficCounters>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_size: usize, counters: Arc<TrafficCounters>) -> Self {
        Self {
            inner,
            buf: Vec::with_capacity(READ_CHUNK),
            max_frame_size,
            counters,
        }
    }

    /// Waits for the next complete frame and returns its body.
    ///
    /// Cancel-safe: partially received frames stay buffered.
    ///
    /// # Errors
    ///
    /// - [`TransportError::MessageTooLarge`] as soon as a length prefix above
    ///   the limit is seen; the frame body is never buffered.
    /// - [`TransportError::Closed`] on end of stream.
    /// - [`TransportError::Io`] if the stream fails.
    pub async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(frame) = self.take_frame()? {
                return Ok(frame);
            }
            let n = self.inner.read(&mut chunk).await?;
            if n == 0 {
                return Err(TransportError::Closed);
            }
            self.counters.add_received(n);
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn take_frame(&mut self) -> Result<Option<Vec<u8>>, TransportError> {
        if self.buf.len() < FRAME_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if len > self.max_frame_size {
            return Err(TransportError::MessageTooLarge {
                size: len,
                limit: self.max_frame_size,
            });
        }
        let total = FRAME_PREFIX_SIZE + len;
        if self.buf.len() < total {
            return Ok(None);
        }
        let frame = self.buf[FRAME_PREFIX_SIZE..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(frame))
    }
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Writes length-prefixed frames to the write half of a stream.
pub struct FrameWriter<W> {
    inner: W,
    max_frame_size: usize,
    counters: Arc<TrafficCounters>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W, max_frame_size: usize, counters: Arc<TrafficCounters>) -> Self {
        Self {
            inner,
            max_frame_size,
            counters,
        }
    }

    /// Writes one frame and flushes it.
    ///
    /// # Errors
    ///
    /// [`TransportError::MessageTooLarge`] before any byte is written if
    /// `body` exceeds the limit, or [`TransportError::Io`] on stream failure.
    pub async fn send(&mut self, body: &[u8]) -> Result<(), TransportError> {
        if body.len() > self.max_frame_size {
            return Err(TransportError::MessageTooLarge {
                size: body.len(),
                limit: self.max_frame_size,
            });
        }
        let mut frame = Vec::with_capacity(FRAME_PREFIX_SIZE + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(body);

        self.inner.write_all(&frame).await?;
        self.inner.flush().await?;
        self.counters.add_sent(frame.len());
        Ok(())
    }

    /// Shuts down the write direction.
    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

// ── Framed transport ──────────────────────────────────────────────────────────

/// Both directions of one connection.
pub struct FramedTransport<S> {
    reader: FrameReader<ReadHalf<S>>,
    writer: FrameWriter<WriteHalf<S>>,
}

impl<S: SecureStream> FramedTransport<S> {
    pub fn new(stream: S, max_frame_size: usize, counters: Arc<TrafficCounters>) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader::new(read_half, max_frame_size, Arc::clone(&counters)),
            writer: FrameWriter::new(write_half, max_frame_size, counters),
        }
    }

    pub async fn send(&mut self, body: &[u8]) -> Result<(), TransportError> {
        self.writer.send(body).await
    }

    pub async fn receive(&mut self) -> Result<Vec<u8>, TransportError> {
        self.reader.receive().await
    }

    pub async fn close(&mut self) -> Result<(), TransportError> {
        self.writer.close().await
    }
}
