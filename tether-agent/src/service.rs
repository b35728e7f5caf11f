//! The agent service: connects out to the administration server,
//! announces its identity, and serves directory / file / sysinfo /
//! upload requests until the connection dies — then tears the whole
//! transport wiring down and reconnects after a fixed interval.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use tether_core::{
    ConnectionDelegate, DirEntry, FileChunk, FileReader, FileRequest, FileWriter, GenericCommand,
    Messenger, MessengerDelegate, StreamId, StreamListener, SvcMessage, SvcMessageFactory,
    TcpClient, TetherError,
};

use crate::config::AgentConfig;
use crate::sysinfo::{SysInfoCollector, SysInfoProvider, hostname};

// ── Collaborators ────────────────────────────────────────────────

/// Supplies directory listings for `RequestDir`.
#[async_trait]
pub trait DirLister: Send + Sync {
    async fn list(&self, dir: &str) -> Vec<DirEntry>;
}

/// Default lister backed by the filesystem. A listing starts with a
/// `..` entry for upward navigation; an unreadable directory yields an
/// empty listing.
#[derive(Debug, Default)]
pub struct StdDirLister;

#[async_trait]
impl DirLister for StdDirLister {
    async fn list(&self, dir: &str) -> Vec<DirEntry> {
        let mut entries = Vec::new();
        match tokio::fs::read_dir(dir).await {
            Ok(mut read_dir) => {
                entries.push(DirEntry {
                    name: "..".to_string(),
                    is_dir: true,
                });
                while let Ok(Some(entry)) = read_dir.next_entry().await {
                    let is_dir = entry
                        .file_type()
                        .await
                        .map(|t| t.is_dir())
                        .unwrap_or(false);
                    entries.push(DirEntry {
                        name: entry.file_name().to_string_lossy().into_owned(),
                        is_dir,
                    });
                }
            }
            Err(e) => warn!(dir, "failed to list directory: {e}"),
        }
        entries
    }
}

// ── Service ──────────────────────────────────────────────────────

/// Everything that exists only while one connection attempt is alive.
struct Wiring {
    listener: Arc<StreamListener>,
    messenger: Arc<Messenger<SvcMessageFactory>>,
    runner: JoinHandle<()>,
}

/// Chunked transfer state; one download and one upload at a time.
#[derive(Default)]
struct Transfer {
    reader: FileReader,
    writer: FileWriter,
}

/// The administered endpoint.
pub struct AgentService {
    config: AgentConfig,
    identity: String,
    weak_self: Weak<Self>,
    dir_lister: Arc<dyn DirLister>,
    sys_info: Arc<dyn SysInfoProvider>,
    wiring: Mutex<Option<Wiring>>,
    endpoints: Mutex<HashMap<StreamId, String>>,
    transfer: tokio::sync::Mutex<Transfer>,
    disconnected_tx: watch::Sender<bool>,
    disconnected_rx: watch::Receiver<bool>,
}

impl AgentService {
    pub fn new(config: AgentConfig) -> Arc<Self> {
        Self::with_collaborators(config, Arc::new(StdDirLister), Arc::new(SysInfoCollector))
    }

    /// Full constructor with injectable collaborators.
    pub fn with_collaborators(
        config: AgentConfig,
        dir_lister: Arc<dyn DirLister>,
        sys_info: Arc<dyn SysInfoProvider>,
    ) -> Arc<Self> {
        let (disconnected_tx, disconnected_rx) = watch::channel(false);
        Arc::new_cyclic(|weak| Self {
            config,
            identity: generate_identity(),
            weak_self: weak.clone(),
            dir_lister,
            sys_info,
            wiring: Mutex::new(None),
            endpoints: Mutex::new(HashMap::new()),
            transfer: tokio::sync::Mutex::new(Transfer::default()),
            disconnected_tx,
            disconnected_rx,
        })
    }

    /// The identity this agent announces after connecting.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    fn wiring_lock(&self) -> MutexGuard<'_, Option<Wiring>> {
        self.wiring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn endpoints_lock(&self) -> MutexGuard<'_, HashMap<StreamId, String>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn messenger(&self) -> Option<Arc<Messenger<SvcMessageFactory>>> {
        self.wiring_lock()
            .as_ref()
            .map(|w| Arc::clone(&w.messenger))
    }

    /// Runs forever: connect, serve until disconnected, tear down,
    /// wait the reconnect interval, repeat.
    pub async fn run(&self) {
        let interval = Duration::from_millis(self.config.network.reconnect_interval_ms);
        loop {
            match self.connect().await {
                Ok(()) => {
                    info!(
                        address = %self.config.network.server_address,
                        identity = %self.identity,
                        "connected to server"
                    );
                    self.wait_disconnected().await;
                    info!("server connection ended");
                }
                Err(e) => warn!("connect error: {e}"),
            }
            self.reset().await;
            tokio::time::sleep(interval).await;
        }
    }

    /// Builds fresh transport wiring and connects once.
    pub async fn connect(&self) -> Result<(), TetherError> {
        let me = self
            .weak_self
            .upgrade()
            .ok_or(TetherError::InvalidState("service is being dropped"))?;

        self.disconnected_tx.send_replace(false);

        let listener = StreamListener::new();
        let messenger = Messenger::new(Arc::clone(&listener));
        messenger.set_message_factory(Some(Arc::new(SvcMessageFactory)));
        messenger.set_connection_delegate(Some(me as Arc<dyn ConnectionDelegate>));

        let runner = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.run().await }
        });
        // A later reset() must find the reactor cancellable.
        listener.wait_running().await;

        *self.wiring_lock() = Some(Wiring {
            listener,
            messenger: Arc::clone(&messenger),
            runner,
        });

        TcpClient::new()
            .bind(&self.config.network.server_address, messenger as _)
            .await
    }

    /// Releases the current wiring: cancel the reactor, wait for it to
    /// fully stop, then clear the messenger's references.
    pub async fn reset(&self) {
        let wiring = self.wiring_lock().take();
        let Some(wiring) = wiring else { return };

        wiring.listener.cancel_run();
        wiring.listener.join_run().await;
        let _ = wiring.runner.await;

        wiring.messenger.set_message_factory(None);
        wiring.messenger.set_connection_delegate(None);

        self.endpoints_lock().clear();
        let mut transfer = self.transfer.lock().await;
        transfer.reader.close();
        transfer.writer.close();
    }

    async fn wait_disconnected(&self) {
        let mut rx = self.disconnected_rx.clone();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    async fn send(&self, stream_id: StreamId, message: &SvcMessage) {
        let Some(messenger) = self.messenger() else {
            return;
        };
        if let Err(e) = messenger.send_message(stream_id, message).await {
            warn!(%stream_id, "send failed: {e}");
        }
    }

    // ── Request handlers ─────────────────────────────────────────

    async fn sys_info_response(&self) -> SvcMessage {
        let mut info = self.sys_info.collect().await;
        if info.is_empty() {
            info.push("No information about endpoint available".to_string());
        }
        SvcMessage::ResponseSysInfo { info }
    }

    /// Reads one chunk of the requested file. The chunk is marked
    /// invalid when the file cannot be opened or the read fails.
    async fn serve_file_chunk(&self, request: FileRequest) -> SvcMessage {
        let mut transfer = self.transfer.lock().await;
        let mut chunk = FileChunk {
            file_name: request.file_name.clone(),
            position: request.start_from,
            ..FileChunk::default()
        };

        match transfer.reader.open(&request.file_name).await {
            Ok(()) => {
                chunk.file_size = transfer.reader.size();
                let remaining = (chunk.file_size - request.start_from).max(0);
                let len = remaining.min(self.config.transfer.chunk_size as i64) as usize;

                match transfer.reader.read(request.start_from, len).await {
                    Ok(data) => {
                        chunk.data = data;
                        chunk.valid = true;
                    }
                    Err(e) => {
                        warn!(file = %request.file_name, "file read failed: {e}");
                        transfer.reader.close();
                    }
                }
            }
            Err(e) => {
                // File not found (or unreadable) — reply invalid.
                warn!(file = %request.file_name, "file open failed: {e}");
            }
        }

        SvcMessage::ResponseFile(chunk)
    }

    /// Writes one uploaded chunk. An invalid chunk is the upload-abort
    /// marker and produces no reply.
    async fn store_upload_chunk(&self, chunk: FileChunk) -> Option<SvcMessage> {
        let mut transfer = self.transfer.lock().await;

        if !chunk.valid {
            transfer.writer.close();
            return None;
        }

        let mut ok = false;
        if transfer.writer.open(&chunk.file_name).await.is_ok() {
            ok = transfer.writer.write(&chunk.data).await.is_ok();
            if chunk.file_size <= transfer.writer.size() {
                transfer.writer.close();
            }
        }

        Some(SvcMessage::UploadFileReply { ok })
    }

    async fn handle_generic(&self, command: u32, params: Vec<String>) -> Option<SvcMessage> {
        match GenericCommand::try_from(command) {
            Ok(GenericCommand::ReqSysInfo) => Some(self.sys_info_response().await),
            Ok(GenericCommand::ReqFileExec) => {
                info!(?params, "remote execution request ignored");
                None
            }
            Err(_) => {
                warn!(command, "unknown generic command");
                None
            }
        }
    }
}

fn generate_identity() -> String {
    let host = hostname().unwrap_or_else(|| format!("{:08x}", rand::random::<u32>()));
    format!("{host}-{}", std::process::id())
}

// ── Messenger delegates ──────────────────────────────────────────

#[async_trait]
impl ConnectionDelegate for AgentService {
    async fn on_stream_created(&self, stream_id: StreamId) {
        let Some(messenger) = self.messenger() else {
            return;
        };
        let Some(me) = self.weak_self.upgrade() else {
            return;
        };
        messenger.add_delegate(stream_id, me as _).await;

        // Self-announce: the agent speaks first.
        let identity = SvcMessage::Identity {
            endpoint_id: self.identity.clone(),
        };
        if let Err(e) = messenger.send_message(stream_id, &identity).await {
            warn!(%stream_id, "failed to announce identity: {e}");
        }
    }
}

#[async_trait]
impl MessengerDelegate<SvcMessage> for AgentService {
    async fn on_message_received(&self, stream_id: StreamId, message: SvcMessage) {
        let reply = match message {
            SvcMessage::Identity { endpoint_id } => {
                if let Some(old) = self.endpoints_lock().insert(stream_id, endpoint_id) {
                    warn!(%stream_id, old, "server identity re-announced");
                }
                None
            }
            SvcMessage::RequestDir { dir } => Some(SvcMessage::ResponseDir {
                entries: self.dir_lister.list(&dir).await,
            }),
            SvcMessage::RequestFile(request) => Some(self.serve_file_chunk(request).await),
            SvcMessage::RequestSysInfo { .. } => Some(self.sys_info_response().await),
            SvcMessage::UploadFile(chunk) => self.store_upload_chunk(chunk).await,
            SvcMessage::Generic { command, params } => self.handle_generic(command, params).await,
            other => {
                warn!(%stream_id, tag = ?other.tag(), "unexpected message for an agent");
                None
            }
        };

        if let Some(reply) = reply {
            self.send(stream_id, &reply).await;
        }
    }

    async fn on_stream_died(&self, stream_id: StreamId) {
        match self.endpoints_lock().remove(&stream_id) {
            Some(endpoint) => info!(%stream_id, endpoint, "server connection lost"),
            None => warn!(%stream_id, "stream died before identity exchange"),
        }
        self.transfer.lock().await.reader.close();
        self.disconnected_tx.send_replace(true);
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedSysInfo(Vec<String>);

    #[async_trait]
    impl SysInfoProvider for FixedSysInfo {
        async fn collect(&self) -> Vec<String> {
            self.0.clone()
        }
    }

    fn test_service(sys_info: Vec<String>) -> Arc<AgentService> {
        AgentService::with_collaborators(
            AgentConfig::default(),
            Arc::new(StdDirLister),
            Arc::new(FixedSysInfo(sys_info)),
        )
    }

    #[tokio::test]
    async fn identity_has_host_and_pid() {
        let service = test_service(vec![]);
        let identity = service.identity();
        assert!(identity.contains('-'));
        assert!(identity.ends_with(&std::process::id().to_string()));
    }

    #[tokio::test]
    async fn empty_sysinfo_gets_placeholder() {
        let service = test_service(vec![]);
        let SvcMessage::ResponseSysInfo { info } = service.sys_info_response().await else {
            panic!("wrong variant");
        };
        assert_eq!(info.len(), 1);
        assert!(info[0].contains("No information"));
    }

    #[tokio::test]
    async fn file_chunks_cover_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        let chunk_size = AgentConfig::default().transfer.chunk_size;
        // 2.5 chunks worth of data.
        let content: Vec<u8> = (0..chunk_size * 5 / 2).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).unwrap();
        let path = path.to_str().unwrap().to_string();

        let service = test_service(vec![]);
        let mut rebuilt = Vec::new();
        let mut offset = 0i64;
        let mut sizes = Vec::new();

        loop {
            let SvcMessage::ResponseFile(chunk) = service
                .serve_file_chunk(FileRequest {
                    file_name: path.clone(),
                    start_from: offset,
                })
                .await
            else {
                panic!("wrong variant");
            };
            assert!(chunk.valid);
            assert_eq!(chunk.file_size, content.len() as i64);
            assert_eq!(chunk.position, offset);
            sizes.push(chunk.data.len());
            rebuilt.extend_from_slice(&chunk.data);
            offset += chunk.data.len() as i64;
            if offset >= chunk.file_size {
                break;
            }
        }

        assert_eq!(sizes, vec![chunk_size, chunk_size, chunk_size / 2]);
        assert_eq!(rebuilt, content);
    }

    #[tokio::test]
    async fn missing_file_yields_invalid_chunk() {
        let service = test_service(vec![]);
        let SvcMessage::ResponseFile(chunk) = service
            .serve_file_chunk(FileRequest {
                file_name: "/no/such/file".to_string(),
                start_from: 0,
            })
            .await
        else {
            panic!("wrong variant");
        };
        assert!(!chunk.valid);
        assert!(chunk.data.is_empty());
    }

    #[tokio::test]
    async fn upload_chunks_rebuild_file_and_close_at_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.bin");
        let path = path.to_str().unwrap().to_string();

        let service = test_service(vec![]);
        let total = 300usize;
        let payloads = [vec![1u8; 100], vec![2u8; 100], vec![3u8; 100]];

        let mut position = 0i64;
        for payload in &payloads {
            let reply = service
                .store_upload_chunk(FileChunk {
                    file_name: path.clone(),
                    file_size: total as i64,
                    position,
                    data: payload.clone(),
                    valid: true,
                })
                .await;
            assert_eq!(reply, Some(SvcMessage::UploadFileReply { ok: true }));
            position += payload.len() as i64;
        }

        // The writer closed itself once the declared size was reached.
        assert!(!service.transfer.lock().await.writer.is_open());

        let written = std::fs::read(&path).unwrap();
        assert_eq!(written.len(), total);
        assert_eq!(&written[..100], &[1u8; 100][..]);
        assert_eq!(&written[200..], &[3u8; 100][..]);
    }

    #[tokio::test]
    async fn invalid_upload_chunk_aborts_silently() {
        let service = test_service(vec![]);
        let reply = service
            .store_upload_chunk(FileChunk {
                valid: false,
                ..FileChunk::default()
            })
            .await;
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn generic_sysinfo_command_answers() {
        let service = test_service(vec!["line".to_string()]);
        let reply = service
            .handle_generic(GenericCommand::ReqSysInfo as u32, vec![])
            .await;
        assert_eq!(
            reply,
            Some(SvcMessage::ResponseSysInfo {
                info: vec!["line".to_string()]
            })
        );
    }

    #[tokio::test]
    async fn unknown_generic_command_is_ignored() {
        let service = test_service(vec![]);
        assert_eq!(service.handle_generic(999, vec![]).await, None);
    }

    #[tokio::test]
    async fn dir_listing_marks_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("file.txt"), b"x").unwrap();

        let entries = StdDirLister.list(dir.path().to_str().unwrap()).await;
        assert_eq!(entries[0].name, "..");
        assert!(entries[0].is_dir);

        let sub = entries.iter().find(|e| e.name == "sub").unwrap();
        assert!(sub.is_dir);
        let file = entries.iter().find(|e| e.name == "file.txt").unwrap();
        assert!(!file.is_dir);
    }

    #[tokio::test]
    async fn unreadable_dir_yields_empty_listing() {
        let entries = StdDirLister.list("/definitely/not/a/dir").await;
        assert!(entries.is_empty());
    }
}
