//! Stream transport: addresses, TCP streams, client/server bindings,
//! and the polling reactor that multiplexes them.

pub mod address;
pub mod client;
pub mod listener;
pub mod server;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;

pub use address::TcpAddress;
pub use client::TcpClient;
pub use listener::{StreamEvents, StreamListener};
pub use server::TcpServer;
pub use stream::{Stream, StreamId, TcpStream};

/// Observer of stream creation on a binding.
///
/// A client binding fires this exactly once; a server binding fires it
/// once per accepted connection.
#[async_trait]
pub trait BindingDelegate: Send + Sync {
    async fn on_stream_created(&self, stream: Arc<dyn Stream>);
}
