//! Integration tests — reactor fairness, busy exclusion, the
//! cancel/join lifecycle, and message exchange over real TCP
//! connections on localhost.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tether_core::{
    ConnectionDelegate, Messenger, MessengerDelegate, Stream, StreamEvents, StreamId,
    StreamListener, SvcMessage, SvcMessageFactory, TcpClient, TcpServer, TcpStream,
};

// ── Helpers ──────────────────────────────────────────────────────

/// Accepted/connected socket pair wrapped as tether streams.
async fn tcp_pair() -> (Arc<TcpStream>, tokio::net::TcpStream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let client = tokio::net::TcpStream::connect(addr).await.unwrap();
    let (server, _) = listener.accept().await.unwrap();
    (Arc::new(TcpStream::new(server)), client)
}

/// Records delivered bytes and deaths per stream.
#[derive(Default)]
struct Recorder {
    bytes: Mutex<HashMap<StreamId, usize>>,
    deaths: Mutex<HashMap<StreamId, usize>>,
}

#[async_trait]
impl StreamEvents for Recorder {
    async fn on_data_received(&self, stream_id: StreamId, data: &[u8]) {
        *self.bytes.lock().unwrap().entry(stream_id).or_default() += data.len();
    }

    async fn on_stream_died(&self, stream_id: StreamId) {
        *self.deaths.lock().unwrap().entry(stream_id).or_default() += 1;
    }
}

// ── Reactor fairness (K streams, W < K workers) ──────────────────

#[tokio::test]
async fn all_streams_serviced_with_fewer_workers() {
    const K: usize = 4;

    let listener = StreamListener::with_max_workers(2);
    let recorder = Arc::new(Recorder::default());

    let mut writers = Vec::new();
    let mut ids = Vec::new();
    for _ in 0..K {
        let (stream, writer) = tcp_pair().await;
        ids.push(stream.id());
        listener
            .add_delegate(stream, Arc::clone(&recorder) as Arc<dyn StreamEvents>)
            .unwrap();
        writers.push(writer);
    }
    assert_eq!(listener.worker_count(), 2);

    let runner = tokio::spawn({
        let listener = Arc::clone(&listener);
        async move { listener.run().await }
    });
    listener.wait_running().await;

    // Every connection produces data continuously for a while.
    let producers: Vec<_> = writers
        .into_iter()
        .map(|writer| {
            tokio::spawn(async move {
                use tokio::io::AsyncWriteExt;
                let mut writer = writer;
                for _ in 0..50 {
                    if writer.write_all(&[0xAA; 256]).await.is_err() {
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                writer
            })
        })
        .collect();

    for producer in producers {
        let _ = producer.await;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;

    {
        let bytes = recorder.bytes.lock().unwrap();
        for id in &ids {
            let delivered = bytes.get(id).copied().unwrap_or(0);
            assert!(delivered > 0, "stream {id} was starved");
        }
    }

    listener.cancel_run();
    listener.join_run().await;
    runner.await.unwrap();
}

// ── Busy exclusion ───────────────────────────────────────────────

/// Counts concurrent entries into each stream's data path.
#[derive(Default)]
struct OverlapProbe {
    current: Mutex<HashMap<StreamId, usize>>,
    max_seen: Mutex<HashMap<StreamId, usize>>,
}

#[async_trait]
impl StreamEvents for OverlapProbe {
    async fn on_data_received(&self, stream_id: StreamId, _data: &[u8]) {
        {
            let mut current = self.current.lock().unwrap();
            let now = current.entry(stream_id).or_default();
            *now += 1;
            let mut max_seen = self.max_seen.lock().unwrap();
            let max = max_seen.entry(stream_id).or_default();
            *max = (*max).max(*now);
        }
        // Dwell long enough that a second worker would pile up if the
        // busy flag let it in.
        tokio::time::sleep(Duration::from_millis(3)).await;
        *self
            .current
            .lock()
            .unwrap()
            .entry(stream_id)
            .or_default() -= 1;
    }

    async fn on_stream_died(&self, _stream_id: StreamId) {}
}

#[tokio::test]
async fn no_two_workers_read_one_stream() {
    let listener = StreamListener::with_max_workers(4);
    let probe = Arc::new(OverlapProbe::default());

    // Two streams so more than one worker gets spawned and has reason
    // to scan while the first stream is mid-read.
    let (stream_a, writer_a) = tcp_pair().await;
    let (stream_b, writer_b) = tcp_pair().await;
    listener
        .add_delegate(stream_a, Arc::clone(&probe) as Arc<dyn StreamEvents>)
        .unwrap();
    listener
        .add_delegate(stream_b, Arc::clone(&probe) as Arc<dyn StreamEvents>)
        .unwrap();

    let runner = tokio::spawn({
        let listener = Arc::clone(&listener);
        async move { listener.run().await }
    });
    listener.wait_running().await;

    for writer in [writer_a, writer_b] {
        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            let mut writer = writer;
            for _ in 0..30 {
                if writer.write_all(&[1u8; 64]).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
            writer
        });
    }

    tokio::time::sleep(Duration::from_millis(300)).await;

    // Both streams saw traffic, and no stream was ever entered by two
    // workers at once.
    {
        let max_seen = probe.max_seen.lock().unwrap();
        assert_eq!(max_seen.len(), 2);
        for (stream_id, max) in max_seen.iter() {
            assert_eq!(*max, 1, "stream {stream_id} was read concurrently");
        }
    }

    listener.cancel_run();
    listener.join_run().await;
    runner.await.unwrap();
}

// ── Cancel / join lifecycle ──────────────────────────────────────

#[tokio::test]
async fn cancel_join_drains_and_allows_rerun() {
    let listener = StreamListener::with_max_workers(2);
    let recorder = Arc::new(Recorder::default());

    let mut keep_alive = Vec::new();
    let mut ids = Vec::new();
    for _ in 0..3 {
        let (stream, writer) = tcp_pair().await;
        ids.push(stream.id());
        listener
            .add_delegate(stream, Arc::clone(&recorder) as Arc<dyn StreamEvents>)
            .unwrap();
        keep_alive.push(writer);
    }

    let runner = tokio::spawn({
        let listener = Arc::clone(&listener);
        async move { listener.run().await }
    });
    listener.wait_running().await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    listener.cancel_run();
    listener.cancel_run(); // idempotent
    listener.join_run().await;
    runner.await.unwrap();

    assert_eq!(listener.worker_count(), 0);
    assert_eq!(listener.stream_count(), 0);
    {
        let deaths = recorder.deaths.lock().unwrap();
        for id in &ids {
            assert_eq!(deaths.get(id).copied().unwrap_or(0), 1, "stream {id}");
        }
    }

    // The same instance runs again.
    let recorder2 = Arc::new(Recorder::default());
    let (stream, _writer) = tcp_pair().await;
    let id = stream.id();
    listener
        .add_delegate(stream, Arc::clone(&recorder2) as Arc<dyn StreamEvents>)
        .unwrap();

    let runner = tokio::spawn({
        let listener = Arc::clone(&listener);
        async move { listener.run().await }
    });
    listener.wait_running().await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    listener.cancel_run();
    listener.join_run().await;
    runner.await.unwrap();

    assert_eq!(recorder2.deaths.lock().unwrap().get(&id).copied(), Some(1));
}

// ── Message exchange over real TCP ───────────────────────────────

/// One side of a messenger conversation: registers itself for every
/// new stream and records everything dispatched to it.
struct Peer {
    messenger: Arc<Messenger<SvcMessageFactory>>,
    weak_self: std::sync::Weak<Peer>,
    streams: Mutex<Vec<StreamId>>,
    received: Mutex<Vec<(StreamId, SvcMessage)>>,
}

impl Peer {
    fn new(listener: Arc<StreamListener>) -> Arc<Self> {
        let messenger = Messenger::new(listener);
        messenger.set_message_factory(Some(Arc::new(SvcMessageFactory)));
        let peer = Arc::new_cyclic(|weak| Self {
            messenger: Arc::clone(&messenger),
            weak_self: weak.clone(),
            streams: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        });
        messenger
            .set_connection_delegate(Some(Arc::clone(&peer) as Arc<dyn ConnectionDelegate>));
        peer
    }
}

#[async_trait]
impl ConnectionDelegate for Peer {
    async fn on_stream_created(&self, stream_id: StreamId) {
        // A Peer is its own dispatch delegate. Register before
        // publishing the stream so no message can slip past.
        if let Some(me) = self.weak_self.upgrade() {
            self.messenger.add_delegate(stream_id, me as _).await;
        }
        self.streams.lock().unwrap().push(stream_id);
    }
}

#[async_trait]
impl MessengerDelegate<SvcMessage> for Peer {
    async fn on_message_received(&self, stream_id: StreamId, message: SvcMessage) {
        self.received.lock().unwrap().push((stream_id, message));
    }

    async fn on_stream_died(&self, _stream_id: StreamId) {}
}

#[tokio::test]
async fn request_response_over_loopback() {
    // Server side.
    let server_listener = StreamListener::new();
    let server_peer = Peer::new(Arc::clone(&server_listener));
    let server_runner = tokio::spawn({
        let listener = Arc::clone(&server_listener);
        async move { listener.run().await }
    });
    server_listener.wait_running().await;

    let mut server_binding = TcpServer::new();
    server_binding
        .bind("127.0.0.1:0", server_peer.messenger.clone() as _)
        .await
        .unwrap();
    let addr = server_binding.local_addr().unwrap();

    // Client side.
    let client_listener = StreamListener::new();
    let client_peer = Peer::new(Arc::clone(&client_listener));
    let client_runner = tokio::spawn({
        let listener = Arc::clone(&client_listener);
        async move { listener.run().await }
    });
    client_listener.wait_running().await;

    TcpClient::new()
        .bind(&addr.to_string(), client_peer.messenger.clone() as _)
        .await
        .unwrap();

    // Wait until both sides saw their stream.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let server_ready = !server_peer.streams.lock().unwrap().is_empty();
        let client_ready = !client_peer.streams.lock().unwrap().is_empty();
        if server_ready && client_ready {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "streams never appeared");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let server_stream = server_peer.streams.lock().unwrap()[0];
    let client_stream = client_peer.streams.lock().unwrap()[0];

    // Client asks; server hears it.
    client_peer
        .messenger
        .send_message(
            client_stream,
            &SvcMessage::RequestSysInfo {
                query: "Default Request".to_string(),
            },
        )
        .await
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !server_peer.received.lock().unwrap().is_empty() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "request never arrived");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    {
        let received = server_peer.received.lock().unwrap();
        assert_eq!(
            received[0].1,
            SvcMessage::RequestSysInfo {
                query: "Default Request".to_string()
            }
        );
    }

    // Server answers; client hears it.
    server_peer
        .messenger
        .send_message(
            server_stream,
            &SvcMessage::ResponseSysInfo {
                info: vec!["OS: test".to_string()],
            },
        )
        .await
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !client_peer.received.lock().unwrap().is_empty() {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "response never arrived");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    {
        let received = client_peer.received.lock().unwrap();
        assert_eq!(
            received[0].1,
            SvcMessage::ResponseSysInfo {
                info: vec!["OS: test".to_string()]
            }
        );
    }

    // Strict shutdown order: cancel, then join, then drop wiring.
    server_binding.shutdown().await;
    server_listener.cancel_run();
    client_listener.cancel_run();
    server_listener.join_run().await;
    client_listener.join_run().await;
    server_runner.await.unwrap();
    client_runner.await.unwrap();
    server_peer.messenger.set_message_factory(None);
    client_peer.messenger.set_message_factory(None);
}
