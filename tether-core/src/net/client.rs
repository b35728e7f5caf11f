//! Outbound (client) binding: one blocking connect, one stream.

use std::sync::Arc;

use tracing::debug;

use crate::error::TetherError;
use crate::net::address::TcpAddress;
use crate::net::stream::{Stream, TcpStream};
use crate::net::BindingDelegate;

/// Client binding. `bind` connects to the remote address and hands the
/// resulting stream to the delegate.
#[derive(Debug, Default)]
pub struct TcpClient;

impl TcpClient {
    pub fn new() -> Self {
        Self
    }

    /// Resolves `address`, connects, and invokes
    /// `delegate.on_stream_created` once with the new stream.
    pub async fn bind(
        &self,
        address: &str,
        delegate: Arc<dyn BindingDelegate>,
    ) -> Result<(), TetherError> {
        let addr = TcpAddress::resolve(address).await?;

        let socket = tokio::net::TcpStream::connect(addr.socket_addr())
            .await
            .map_err(TetherError::ConnectError)?;

        let stream = Arc::new(TcpStream::new(socket));
        debug!(stream_id = %stream.id(), %addr, "outbound stream connected");

        delegate.on_stream_created(stream).await;
        Ok(())
    }
}
