//! Inbound (server) binding: a listening socket plus a background
//! accept loop that yields one stream per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::TetherError;
use crate::net::address::TcpAddress;
use crate::net::stream::{Stream, TcpStream};
use crate::net::BindingDelegate;

/// Server binding. `bind` starts an accept loop on a background task;
/// every accepted connection is wrapped as a stream and handed to the
/// delegate. `shutdown` cancels the loop and waits for it to exit.
#[derive(Debug, Default)]
pub struct TcpServer {
    cancel: CancellationToken,
    acceptor: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
}

impl TcpServer {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            acceptor: None,
            local_addr: None,
        }
    }

    /// Resolves `address`, opens the listening socket, and spawns the
    /// accept loop. `AddressInUse` when the port is occupied,
    /// `BindError` for any other bind failure.
    pub async fn bind(
        &mut self,
        address: &str,
        delegate: Arc<dyn BindingDelegate>,
    ) -> Result<(), TetherError> {
        let addr = TcpAddress::resolve(address).await?;

        let listener = tokio::net::TcpListener::bind(addr.socket_addr())
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AddrInUse {
                    TetherError::AddressInUse(address.to_string())
                } else {
                    TetherError::BindError(e)
                }
            })?;

        self.local_addr = listener.local_addr().ok();
        debug!(local_addr = ?self.local_addr, "server binding listening");

        let cancel = self.cancel.clone();
        self.acceptor = Some(tokio::spawn(run_acceptor(listener, delegate, cancel)));
        Ok(())
    }

    /// The locally bound address; useful when binding to port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stops the accept loop and waits for it to exit. Idempotent.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        if let Some(acceptor) = self.acceptor.take() {
            let _ = acceptor.await;
        }
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        // The acceptor holds no reference to self; cancelling is
        // enough for it to wind down on its own.
        self.cancel.cancel();
    }
}

async fn run_acceptor(
    listener: tokio::net::TcpListener,
    delegate: Arc<dyn BindingDelegate>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((socket, peer)) => {
                    let stream = Arc::new(TcpStream::new(socket));
                    debug!(stream_id = %stream.id(), %peer, "inbound stream accepted");
                    delegate.on_stream_created(stream).await;
                }
                Err(e) => {
                    // Transient accept failures (per-connection resets,
                    // fd pressure) do not kill the loop.
                    warn!("accept failed: {e}");
                    tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                }
            },
        }
    }
}
