//! The duplex byte-channel abstraction and its TCP implementation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;

use crate::error::TetherError;

// ── StreamId ─────────────────────────────────────────────────────

/// Opaque stable identity of a stream.
///
/// Identities are process-unique and never reused, independent of the
/// underlying socket descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(u64);

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

impl StreamId {
    /// Allocates the next process-unique stream identity.
    pub fn next() -> Self {
        StreamId(NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

// ── Stream ───────────────────────────────────────────────────────

/// A bidirectional byte channel with non-blocking reads.
#[async_trait]
pub trait Stream: Send + Sync {
    /// Unique stream identifier.
    fn id(&self) -> StreamId;

    /// Attempts one read. Must not wait for data: returns `Ok(0)` when
    /// nothing is ready right now, `ConnectionClosed` when the peer
    /// has closed the connection.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, TetherError>;

    /// Writes the whole buffer, waiting out transient backpressure.
    async fn write(&self, buf: &[u8]) -> Result<(), TetherError>;
}

// ── TcpStream ────────────────────────────────────────────────────

/// TCP-connection based [`Stream`] implementation.
pub struct TcpStream {
    id: StreamId,
    inner: tokio::net::TcpStream,
}

impl TcpStream {
    /// Wraps an already-connected socket.
    pub fn new(inner: tokio::net::TcpStream) -> Self {
        Self {
            id: StreamId::next(),
            inner,
        }
    }
}

#[async_trait]
impl Stream for TcpStream {
    fn id(&self) -> StreamId {
        self.id
    }

    async fn read(&self, buf: &mut [u8]) -> Result<usize, TetherError> {
        match self.inner.try_read(buf) {
            // A successful zero-length read means the peer closed the
            // connection; "no data yet" surfaces as WouldBlock instead.
            Ok(0) => Err(TetherError::ConnectionClosed),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(TetherError::Io(e)),
        }
    }

    async fn write(&self, buf: &[u8]) -> Result<(), TetherError> {
        let mut sent = 0;
        while sent < buf.len() {
            self.inner.writable().await?;
            match self.inner.try_write(&buf[sent..]) {
                Ok(0) => return Err(TetherError::ConnectionClosed),
                Ok(n) => sent += n,
                // writable() can report ready spuriously
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(TetherError::Io(e)),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for TcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpStream")
            .field("id", &self.id)
            .field("peer", &self.inner.peer_addr().ok())
            .finish()
    }
}
