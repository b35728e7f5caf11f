//! The stream reactor: a bounded worker pool that round-robin polls
//! every registered stream and delivers incoming bytes to per-stream
//! delegate lists.
//!
//! There is no OS-level readiness selector here. Workers scan the
//! registry under a coarse lock, mark the picked stream busy, and read
//! it outside the lock until it runs dry. The cost is a ~1ms polling
//! delay bound and an O(streams) pick scan; the payoff is fair,
//! non-starving multiplexing over a small fixed pool with fully
//! portable code.
//!
//! Lifecycle: `Stopped → Running → Stopping → Stopped`, cyclic — the
//! same instance may `run()` again after a full stop.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::TetherError;
use crate::net::stream::{Stream, StreamId};

/// How long a worker sleeps when no stream has data.
const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Size of the scratch buffer each worker reads into.
const READ_CHUNK_SIZE: usize = 64 * 1024;

/// Hard cap on the worker pool, whatever the host parallelism says.
const MAX_WORKER_CAP: usize = 64;

// ── Delegate interface ───────────────────────────────────────────

/// Observer of a stream's data and lifecycle events.
///
/// `write_stream` must be used for writes so the listener can handle
/// stream errors.
#[async_trait]
pub trait StreamEvents: Send + Sync {
    /// Called when data arrived on a stream.
    async fn on_data_received(&self, stream_id: StreamId, data: &[u8]);

    /// Called exactly once when a stream has died.
    async fn on_stream_died(&self, stream_id: StreamId);
}

// ── Internal state ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Stopped,
    Running,
    Stopping,
}

struct Registration {
    stream: Arc<dyn Stream>,
    /// Set strictly while one worker is inside the read loop for this
    /// stream; no two workers may read the same stream concurrently.
    busy: bool,
    delegates: Vec<Arc<dyn StreamEvents>>,
}

struct ListenerInner {
    state: ListenerState,
    streams: BTreeMap<StreamId, Registration>,
    workers: Vec<JoinHandle<()>>,
    /// Round-robin position, persisted across picks.
    rr_index: usize,
}

// ── StreamListener ───────────────────────────────────────────────

/// The reactor. Construct one per service context and share it by
/// `Arc`; its lifetime is tied to the owning service, not the process.
pub struct StreamListener {
    inner: Mutex<ListenerInner>,
    weak_self: Weak<Self>,
    /// Wakes `run()` when a stop has been requested.
    stopping: Notify,
    state_tx: watch::Sender<()>,
    state_rx: watch::Receiver<()>,
    max_workers: usize,
}

impl StreamListener {
    /// Creates a listener whose worker pool is bounded by the host's
    /// available parallelism.
    pub fn new() -> Arc<Self> {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_max_workers(parallelism)
    }

    /// Creates a listener with an explicit worker bound (clamped to
    /// `1..=64`).
    pub fn with_max_workers(max_workers: usize) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(());
        Arc::new_cyclic(|weak| Self {
            inner: Mutex::new(ListenerInner {
                state: ListenerState::Stopped,
                streams: BTreeMap::new(),
                workers: Vec::new(),
                rr_index: 0,
            }),
            weak_self: weak.clone(),
            stopping: Notify::new(),
            state_tx,
            state_rx,
            max_workers: max_workers.clamp(1, MAX_WORKER_CAP),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ListenerInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers `delegate` as an observer of `stream`'s events,
    /// registering the stream itself on first sight.
    ///
    /// Spawns an additional worker when the pool is below its bound
    /// and there are more streams than workers.
    pub fn add_delegate(
        &self,
        stream: Arc<dyn Stream>,
        delegate: Arc<dyn StreamEvents>,
    ) -> Result<(), TetherError> {
        let mut inner = self.lock();

        if inner.state == ListenerState::Stopping {
            return Err(TetherError::InvalidState(
                "cannot register a delegate while the stream listener is stopping",
            ));
        }

        let stream_id = stream.id();
        let reg = inner.streams.entry(stream_id).or_insert_with(|| Registration {
            stream,
            busy: false,
            delegates: Vec::new(),
        });

        if reg.delegates.iter().any(|d| Arc::ptr_eq(d, &delegate)) {
            debug_assert!(false, "delegate already registered for this stream");
            error!(%stream_id, "delegate already registered for this stream");
            return Ok(());
        }
        reg.delegates.push(delegate);

        let worker_count = inner.workers.len();
        if worker_count < self.max_workers && inner.streams.len() > worker_count {
            if let Some(listener) = self.weak_self.upgrade() {
                inner.workers.push(tokio::spawn(listener.worker_loop()));
            }
        }

        Ok(())
    }

    /// Runs the listening loop. Blocks the calling task until a stop
    /// is requested via [`cancel_run`](Self::cancel_run), then joins
    /// every worker, clears all registrations, notifies the remaining
    /// streams' delegates of death, and returns with the listener back
    /// in its stopped state.
    pub async fn run(&self) {
        {
            let mut inner = self.lock();
            inner.state = ListenerState::Running;
            let _ = self.state_tx.send(());
        }

        // Suspend until cancel_run() is called.
        self.stopping.notified().await;

        // Wait for all workers to notice the stop and exit.
        let workers: Vec<JoinHandle<()>> = {
            let mut inner = self.lock();
            inner.workers.drain(..).collect()
        };
        for outcome in futures::future::join_all(workers).await {
            if let Err(e) = outcome {
                error!("reactor worker panicked: {e}");
            }
        }

        let remnants = {
            let mut inner = self.lock();
            inner.rr_index = 0;
            std::mem::take(&mut inner.streams)
        };

        // Notify outside the lock: a delegate may call back into the
        // listener from here.
        for (stream_id, reg) in remnants {
            for delegate in reg.delegates {
                delegate.on_stream_died(stream_id).await;
            }
        }

        {
            let mut inner = self.lock();
            debug_assert!(inner.state == ListenerState::Stopping);
            inner.state = ListenerState::Stopped;
            // Release anyone blocked in join_run().
            let _ = self.state_tx.send(());
        }
    }

    /// Requests `run()` to stop. Non-blocking, idempotent, and safe to
    /// call from within a delegate callback.
    pub fn cancel_run(&self) {
        let mut inner = self.lock();
        if inner.state == ListenerState::Running {
            inner.state = ListenerState::Stopping;
            let _ = self.state_tx.send(());
            self.stopping.notify_one();
        }
    }

    /// Waits until a concurrently started `run()` has entered its
    /// running state. Lets a caller that spawns `run()` on a task know
    /// that a subsequent [`cancel_run`](Self::cancel_run) will be
    /// observed.
    pub async fn wait_running(&self) {
        let mut rx = self.state_rx.clone();
        loop {
            if self.lock().state != ListenerState::Stopped {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Waits until the listener has fully stopped. Must not be called
    /// from within a delegate callback: `run()`'s teardown has to
    /// complete first, and it may be waiting on that very callback.
    pub async fn join_run(&self) {
        let mut rx = self.state_rx.clone();
        loop {
            if self.lock().state == ListenerState::Stopped {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Writes `buf` to a registered stream. The stream is looked up
    /// under the lock; the (potentially waiting) write happens outside
    /// it. A write failure runs the stream-died path for the stream.
    pub async fn write_stream(&self, stream_id: StreamId, buf: &[u8]) -> Result<(), TetherError> {
        let stream = self
            .lock()
            .streams
            .get(&stream_id)
            .map(|reg| Arc::clone(&reg.stream))
            .ok_or(TetherError::StreamNotFound(stream_id))?;

        if let Err(e) = stream.write(buf).await {
            self.stream_died(stream_id, &e.to_string()).await;
            return Err(e);
        }
        Ok(())
    }

    /// Explicitly tears down a stream after a higher-level error.
    pub async fn close_stream(&self, stream_id: StreamId, reason: &str) {
        self.stream_died(stream_id, reason).await;
    }

    /// Number of live worker tasks.
    pub fn worker_count(&self) -> usize {
        self.lock().workers.len()
    }

    /// Number of registered streams.
    pub fn stream_count(&self) -> usize {
        self.lock().streams.len()
    }

    // ── Worker internals ─────────────────────────────────────────

    /// Picks the next non-busy stream in round-robin order, marks it
    /// busy, and hands back its handle plus a copy of its delegate
    /// list. Must run under the lock.
    fn next_ready_stream(
        inner: &mut ListenerInner,
    ) -> Option<(Arc<dyn Stream>, Vec<Arc<dyn StreamEvents>>)> {
        let count = inner.streams.len();
        if count == 0 {
            return None;
        }

        // Registrations may have changed since the last pick; the
        // persisted index is only meaningful modulo the live count.
        let ids: Vec<StreamId> = inner.streams.keys().copied().collect();
        let start = inner.rr_index % count;

        for step in 0..count {
            let pos = (start + step) % count;
            let stream_id = ids[pos];
            if let Some(reg) = inner.streams.get_mut(&stream_id) {
                if !reg.busy {
                    reg.busy = true;
                    inner.rr_index = pos + 1;
                    return Some((Arc::clone(&reg.stream), reg.delegates.clone()));
                }
            }
        }

        None
    }

    /// Worker routine; up to `max_workers` of these run concurrently.
    async fn worker_loop(self: Arc<Self>) {
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        loop {
            let picked = {
                let mut inner = self.lock();
                if inner.state == ListenerState::Stopping {
                    return;
                }
                Self::next_ready_stream(&mut inner)
            };

            let Some((stream, delegates)) = picked else {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            };

            let stream_id = stream.id();
            let mut received = false;
            let mut died = false;

            // Drain this stream while data keeps arriving.
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) => break,
                    Ok(n) => {
                        for delegate in &delegates {
                            delegate.on_data_received(stream_id, &buf[..n]).await;
                        }
                        received = true;
                    }
                    Err(e) => {
                        self.stream_died(stream_id, &e.to_string()).await;
                        died = true;
                        break;
                    }
                }
            }

            if !died {
                let mut inner = self.lock();
                if let Some(reg) = inner.streams.get_mut(&stream_id) {
                    reg.busy = false;
                }
            }

            if !received && !died {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }

    /// Removes a stream's registration and notifies its delegates of
    /// death, outside the lock. Safe to race against other died paths;
    /// only the caller that performs the removal notifies.
    async fn stream_died(&self, stream_id: StreamId, reason: &str) {
        let delegates = {
            let mut inner = self.lock();
            match inner.streams.remove(&stream_id) {
                Some(reg) => reg.delegates,
                None => {
                    debug!(%stream_id, "stream already removed");
                    return;
                }
            }
        };

        warn!(%stream_id, reason, "stream died");
        for delegate in delegates {
            delegate.on_stream_died(stream_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NullStream {
        id: StreamId,
    }

    #[async_trait]
    impl Stream for NullStream {
        fn id(&self) -> StreamId {
            self.id
        }

        async fn read(&self, _buf: &mut [u8]) -> Result<usize, TetherError> {
            Ok(0)
        }

        async fn write(&self, _buf: &[u8]) -> Result<(), TetherError> {
            Ok(())
        }
    }

    struct CountingDelegate {
        deaths: AtomicUsize,
    }

    #[async_trait]
    impl StreamEvents for CountingDelegate {
        async fn on_data_received(&self, _stream_id: StreamId, _data: &[u8]) {}

        async fn on_stream_died(&self, _stream_id: StreamId) {
            self.deaths.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn register_spawns_bounded_workers() {
        let listener = StreamListener::with_max_workers(2);
        for _ in 0..4 {
            let stream = Arc::new(NullStream {
                id: StreamId::next(),
            });
            let delegate = Arc::new(CountingDelegate {
                deaths: AtomicUsize::new(0),
            });
            listener.add_delegate(stream, delegate).unwrap();
        }
        assert_eq!(listener.stream_count(), 4);
        assert_eq!(listener.worker_count(), 2);

        let runner = tokio::spawn({
            let listener = Arc::clone(&listener);
            async move { listener.run().await }
        });
        listener.wait_running().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.cancel_run();
        listener.join_run().await;
        runner.await.unwrap();
    }

    #[tokio::test]
    async fn register_while_stopping_is_rejected() {
        let listener = StreamListener::with_max_workers(1);

        // Force the stopping state without running: set up one stream
        // and drive the lifecycle.
        let stream = Arc::new(NullStream {
            id: StreamId::next(),
        });
        let delegate = Arc::new(CountingDelegate {
            deaths: AtomicUsize::new(0),
        });
        listener.add_delegate(stream, delegate).unwrap();

        {
            let mut inner = listener.lock();
            inner.state = ListenerState::Stopping;
        }

        let late = Arc::new(NullStream {
            id: StreamId::next(),
        });
        let late_delegate = Arc::new(CountingDelegate {
            deaths: AtomicUsize::new(0),
        });
        assert!(matches!(
            listener.add_delegate(late, late_delegate),
            Err(TetherError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn write_to_unknown_stream_fails() {
        let listener = StreamListener::with_max_workers(1);
        let err = listener
            .write_stream(StreamId::next(), b"data")
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::StreamNotFound(_)));
    }

    #[tokio::test]
    async fn close_stream_notifies_once() {
        let listener = StreamListener::with_max_workers(1);
        let stream = Arc::new(NullStream {
            id: StreamId::next(),
        });
        let id = stream.id();
        let delegate = Arc::new(CountingDelegate {
            deaths: AtomicUsize::new(0),
        });
        listener
            .add_delegate(stream, Arc::clone(&delegate) as Arc<dyn StreamEvents>)
            .unwrap();

        listener.close_stream(id, "test teardown").await;
        listener.close_stream(id, "second close is a no-op").await;

        assert_eq!(delegate.deaths.load(Ordering::SeqCst), 1);
        assert_eq!(listener.stream_count(), 0);
    }
}
