//! Domain-specific error types for the tether transport.
//!
//! All fallible operations return `Result<T, TetherError>`.
//! Transport errors never unwind across the reactor boundary — they are
//! converted into stream lifecycle notifications at the layer that
//! detects them.

use thiserror::Error;

use crate::net::StreamId;

/// The canonical error type for the tether transport.
#[derive(Debug, Error)]
pub enum TetherError {
    // ── Address Errors ───────────────────────────────────────────
    /// A `host:port` string could not be parsed.
    #[error("invalid TCP address string: {0}")]
    InvalidAddress(String),

    /// A hostname did not resolve to any IPv4 address.
    #[error("failed to resolve hostname: \"{0}\"")]
    ResolutionError(String),

    // ── Transport Errors ─────────────────────────────────────────
    /// The outbound connect failed.
    #[error("connect error: {0}")]
    ConnectError(std::io::Error),

    /// The listen address is already occupied.
    #[error("address \"{0}\" is already in use")]
    AddressInUse(String),

    /// The listening socket could not be created.
    #[error("bind error: {0}")]
    BindError(std::io::Error),

    /// The peer closed the connection.
    #[error("TCP connection was closed")]
    ConnectionClosed,

    /// The TCP/IO layer reported an error.
    #[error("stream I/O error: {0}")]
    Io(#[from] std::io::Error),

    // ── Reactor Errors ───────────────────────────────────────────
    /// An operation referenced a stream that is not registered.
    #[error("stream {0} is not registered")]
    StreamNotFound(StreamId),

    /// The reactor was operated in a state that forbids the call.
    #[error("invalid listener state: {0}")]
    InvalidState(&'static str),

    // ── Protocol Errors ──────────────────────────────────────────
    /// A frame carried a type tag no message is registered for.
    #[error("unknown message type tag: {0}")]
    UnknownMessageType(u32),

    /// A payload ended before a declared field was complete.
    #[error("truncated payload: needed {needed} more bytes")]
    Truncated { needed: usize },

    /// A string field held bytes that are not valid UTF-8.
    #[error("invalid utf-8 in payload: {0}")]
    InvalidUtf8(#[from] std::string::FromUtf8Error),

    /// A frame declared a payload larger than the configured maximum.
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// Encoding of an outgoing payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),

    // ── Service Errors ───────────────────────────────────────────
    /// No connected stream carries the requested endpoint identity.
    #[error("unknown endpoint: \"{0}\"")]
    UnknownEndpoint(String),

    /// A file collaborator operation failed.
    #[error("file error: {0}")]
    FileError(String),
}

impl TetherError {
    /// Returns `true` for errors that terminate the stream they
    /// occurred on (as opposed to per-message discardable errors).
    pub fn is_fatal_for_stream(&self) -> bool {
        matches!(
            self,
            TetherError::ConnectionClosed
                | TetherError::Io(_)
                | TetherError::PayloadTooLarge { .. }
        )
    }
}
