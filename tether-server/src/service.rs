//! The server service: accepts many agent connections, learns each
//! agent's endpoint identity from its announcement, routes responses
//! to application delegates, and originates requests to a named
//! endpoint.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tether_core::{
    ConnectionDelegate, DirEntry, FileChunk, FileRequest, GenericCommand, Messenger,
    MessengerDelegate, StreamId, StreamListener, SvcMessage, SvcMessageFactory, TcpServer,
    TetherError,
};

// ── Service delegate ─────────────────────────────────────────────

/// Application-facing sink for service events. All methods default to
/// doing nothing so a delegate only implements what it cares about.
#[async_trait]
pub trait ServiceDelegate: Send + Sync {
    /// A new endpoint connected and announced its identity.
    async fn on_endpoint_connected(&self, _endpoint_id: &str) {}

    /// An endpoint disconnected.
    async fn on_endpoint_disconnected(&self, _endpoint_id: &str) {}

    /// Directory contents arrived.
    async fn on_response_dir(&self, _endpoint_id: &str, _entries: &[DirEntry]) {}

    /// One file chunk arrived.
    async fn on_response_file(&self, _endpoint_id: &str, _chunk: &FileChunk) {}

    /// System information arrived.
    async fn on_response_sys_info(&self, _endpoint_id: &str, _info: &[String]) {}

    /// Outcome of one uploaded chunk arrived.
    async fn on_upload_file_reply(&self, _endpoint_id: &str, _ok: bool) {}
}

// ── ServerService ────────────────────────────────────────────────

/// The administration side of the suite.
pub struct ServerService {
    identity: String,
    weak_self: Weak<Self>,
    listener: Arc<StreamListener>,
    messenger: Arc<Messenger<SvcMessageFactory>>,
    binding: tokio::sync::Mutex<TcpServer>,
    runner: Mutex<Option<JoinHandle<()>>>,
    delegates: Mutex<Vec<Arc<dyn ServiceDelegate>>>,
    endpoints: Mutex<HashMap<StreamId, String>>,
}

impl ServerService {
    /// Wires the factory, messenger, reactor, and server binding, and
    /// starts accepting agents on `address`.
    pub async fn start(
        address: &str,
        delegate: Arc<dyn ServiceDelegate>,
    ) -> Result<Arc<Self>, TetherError> {
        let listener = StreamListener::new();
        let messenger = Messenger::new(Arc::clone(&listener));

        let service = Arc::new_cyclic(|weak| Self {
            identity: generate_identity(),
            weak_self: weak.clone(),
            listener: Arc::clone(&listener),
            messenger: Arc::clone(&messenger),
            binding: tokio::sync::Mutex::new(TcpServer::new()),
            runner: Mutex::new(None),
            delegates: Mutex::new(vec![delegate]),
            endpoints: Mutex::new(HashMap::new()),
        });

        messenger.set_message_factory(Some(Arc::new(SvcMessageFactory)));
        messenger
            .set_connection_delegate(Some(Arc::clone(&service) as Arc<dyn ConnectionDelegate>));

        *service.runner_lock() = Some(tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.run().await }
        }));
        // A later shutdown() must find the reactor cancellable.
        listener.wait_running().await;

        service
            .binding
            .lock()
            .await
            .bind(address, Arc::clone(&messenger) as _)
            .await?;

        Ok(service)
    }

    fn runner_lock(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.runner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn delegates_lock(&self) -> MutexGuard<'_, Vec<Arc<dyn ServiceDelegate>>> {
        self.delegates.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoints_lock(&self) -> MutexGuard<'_, HashMap<StreamId, String>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The locally bound address; useful when listening on port 0.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.binding.lock().await.local_addr()
    }

    /// Identities of all currently connected endpoints.
    pub fn endpoints(&self) -> Vec<String> {
        self.endpoints_lock().values().cloned().collect()
    }

    pub fn add_delegate(&self, delegate: Arc<dyn ServiceDelegate>) {
        let mut delegates = self.delegates_lock();
        if !delegates.iter().any(|d| Arc::ptr_eq(d, &delegate)) {
            delegates.push(delegate);
        }
    }

    pub fn delete_delegate(&self, delegate: &Arc<dyn ServiceDelegate>) {
        self.delegates_lock().retain(|d| !Arc::ptr_eq(d, delegate));
    }

    /// Stops accepting, stops the reactor, waits for both, then clears
    /// the messenger's references. The order is load-bearing: no
    /// callback may fire into a partially-torn-down service.
    pub async fn shutdown(&self) {
        self.binding.lock().await.shutdown().await;

        self.listener.cancel_run();
        self.listener.join_run().await;
        let runner = self.runner_lock().take();
        if let Some(runner) = runner {
            let _ = runner.await;
        }

        self.messenger.set_message_factory(None);
        self.messenger.set_connection_delegate(None);
        self.endpoints_lock().clear();
    }

    // ── Operations ───────────────────────────────────────────────

    /// Asks `endpoint_id` for the contents of `dir`.
    pub async fn request_dir(&self, endpoint_id: &str, dir: &str) -> Result<(), TetherError> {
        let stream_id = self.find_stream(endpoint_id)?;
        self.messenger
            .send_message(
                stream_id,
                &SvcMessage::RequestDir {
                    dir: dir.to_string(),
                },
            )
            .await
    }

    /// Asks `endpoint_id` for one chunk of a file.
    pub async fn request_file(
        &self,
        endpoint_id: &str,
        request: FileRequest,
    ) -> Result<(), TetherError> {
        let stream_id = self.find_stream(endpoint_id)?;
        self.messenger
            .send_message(stream_id, &SvcMessage::RequestFile(request))
            .await
    }

    /// Sends one chunk of a file being uploaded to `endpoint_id`.
    pub async fn upload_file(
        &self,
        endpoint_id: &str,
        chunk: FileChunk,
    ) -> Result<(), TetherError> {
        let stream_id = self.find_stream(endpoint_id)?;
        self.messenger
            .send_message(stream_id, &SvcMessage::UploadFile(chunk))
            .await
    }

    /// Asks `endpoint_id` for its system information.
    pub async fn request_sys_info(&self, endpoint_id: &str) -> Result<(), TetherError> {
        let stream_id = self.find_stream(endpoint_id)?;
        self.messenger
            .send_message(
                stream_id,
                &SvcMessage::RequestSysInfo {
                    query: "Default Request".to_string(),
                },
            )
            .await
    }

    /// Requests the execution of a file on the remote endpoint.
    pub async fn execute_file(
        &self,
        endpoint_id: &str,
        remote_path: &str,
    ) -> Result<(), TetherError> {
        let stream_id = self.find_stream(endpoint_id)?;
        self.messenger
            .send_message(
                stream_id,
                &SvcMessage::Generic {
                    command: GenericCommand::ReqFileExec as u32,
                    params: vec![remote_path.to_string()],
                },
            )
            .await
    }

    // ── Internals ────────────────────────────────────────────────

    /// Reverse lookup: endpoint identity → stream.
    fn find_stream(&self, endpoint_id: &str) -> Result<StreamId, TetherError> {
        self.endpoints_lock()
            .iter()
            .find(|(_, id)| id.as_str() == endpoint_id)
            .map(|(stream_id, _)| *stream_id)
            .ok_or_else(|| TetherError::UnknownEndpoint(endpoint_id.to_string()))
    }

    fn delegates_snapshot(&self) -> Vec<Arc<dyn ServiceDelegate>> {
        self.delegates_lock().clone()
    }

    fn endpoint_of(&self, stream_id: StreamId) -> Option<String> {
        self.endpoints_lock().get(&stream_id).cloned()
    }
}

fn generate_identity() -> String {
    let host = std::env::var("COMPUTERNAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .ok()
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("{:08x}", rand::random::<u32>()));
    format!("{host}-{}", std::process::id())
}

// ── Messenger delegates ──────────────────────────────────────────

#[async_trait]
impl ConnectionDelegate for ServerService {
    async fn on_stream_created(&self, stream_id: StreamId) {
        let Some(me) = self.weak_self.upgrade() else {
            return;
        };
        self.messenger.add_delegate(stream_id, me as _).await;

        let identity = SvcMessage::Identity {
            endpoint_id: self.identity.clone(),
        };
        if let Err(e) = self.messenger.send_message(stream_id, &identity).await {
            warn!(%stream_id, "failed to send server identity: {e}");
        }
    }
}

#[async_trait]
impl MessengerDelegate<SvcMessage> for ServerService {
    async fn on_message_received(&self, stream_id: StreamId, message: SvcMessage) {
        // The identity announcement binds the stream to an endpoint;
        // everything else requires that binding to already exist.
        if let SvcMessage::Identity { endpoint_id } = &message {
            info!(%stream_id, endpoint = %endpoint_id, "endpoint connected");
            self.endpoints_lock()
                .insert(stream_id, endpoint_id.clone());
            for delegate in self.delegates_snapshot() {
                delegate.on_endpoint_connected(endpoint_id).await;
            }
            return;
        }

        let Some(endpoint_id) = self.endpoint_of(stream_id) else {
            warn!(%stream_id, "message from a stream with no announced identity");
            return;
        };

        match message {
            SvcMessage::ResponseDir { entries } => {
                for delegate in self.delegates_snapshot() {
                    delegate.on_response_dir(&endpoint_id, &entries).await;
                }
            }
            SvcMessage::ResponseFile(chunk) => {
                for delegate in self.delegates_snapshot() {
                    delegate.on_response_file(&endpoint_id, &chunk).await;
                }
            }
            SvcMessage::ResponseSysInfo { info } => {
                for delegate in self.delegates_snapshot() {
                    delegate.on_response_sys_info(&endpoint_id, &info).await;
                }
            }
            SvcMessage::UploadFileReply { ok } => {
                for delegate in self.delegates_snapshot() {
                    delegate.on_upload_file_reply(&endpoint_id, ok).await;
                }
            }
            other => {
                warn!(
                    %stream_id,
                    endpoint = %endpoint_id,
                    tag = ?other.tag(),
                    "unexpected message for a server"
                );
            }
        }
    }

    async fn on_stream_died(&self, stream_id: StreamId) {
        let endpoint = self.endpoints_lock().remove(&stream_id);
        match endpoint {
            Some(endpoint_id) => {
                info!(%stream_id, endpoint = %endpoint_id, "endpoint disconnected");
                for delegate in self.delegates_snapshot() {
                    delegate.on_endpoint_disconnected(&endpoint_id).await;
                }
            }
            None => warn!(%stream_id, "stream died before identity exchange"),
        }
    }
}
