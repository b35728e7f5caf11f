//! # tether-core
//!
//! Transport and messaging engine for the tether remote-administration
//! suite.
//!
//! This crate contains:
//! - **Net**: `TcpAddress`, the `Stream` abstraction and its TCP
//!   implementation, client/server bindings, and `StreamListener` —
//!   a multi-threaded polling reactor that multiplexes many streams
//!   over a bounded worker pool
//! - **Msg**: `Messenger` — per-stream byte accumulation, frame
//!   extraction (`FrameCodec`), factory-based message construction,
//!   and delegate dispatch
//! - **Proto**: `SvcMessage` — the typed service protocol (identity
//!   handshake, directory listing, file transfer, sysinfo, generic
//!   commands) and its factory
//! - **Fs**: chunked `FileReader` / `FileWriter` collaborators
//! - **Error**: `TetherError` — typed, `thiserror`-based error
//!   hierarchy

pub mod error;
pub mod fs;
pub mod msg;
pub mod net;
pub mod proto;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use error::TetherError;
pub use fs::{FileReader, FileWriter};
pub use msg::codec::{Frame, FrameCodec, HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use msg::{ConnectionDelegate, MessageFactory, Messenger, MessengerDelegate, WireMessage};
pub use net::{
    BindingDelegate, Stream, StreamEvents, StreamId, StreamListener, TcpAddress, TcpClient,
    TcpServer, TcpStream,
};
pub use proto::types::{DirEntry, FileChunk, FileRequest};
pub use proto::{GenericCommand, MessageTag, SvcMessage, SvcMessageFactory};
