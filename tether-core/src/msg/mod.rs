//! Message framing and dispatch on top of the reactor.
//!
//! The [`Messenger`] accumulates raw bytes per stream, extracts
//! complete length-prefixed frames, deserializes them into typed
//! messages via a pluggable factory, and dispatches each message to
//! the stream's delegate. Outgoing messages are serialized and written
//! as a single `write_stream` call, so concurrent senders can
//! interleave whole frames but never bytes within one.

pub mod codec;
pub mod wire;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use async_trait::async_trait;
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, error, warn};

use crate::error::TetherError;
use crate::net::{BindingDelegate, Stream, StreamEvents, StreamId, StreamListener};
use codec::{Frame, FrameCodec, HEADER_SIZE};

/// Floor for a stream's receive-buffer reservation; avoids repeated
/// small reallocations while partial frames trickle in.
const MIN_RECV_BUF_SIZE: usize = 64 * 1024;

// ── Message traits ───────────────────────────────────────────────

/// A typed message with a stable integer type tag and a self-contained
/// binary payload encoding.
pub trait WireMessage: Send + Sized {
    /// Stable wire tag for this message.
    fn type_tag(&self) -> u32;

    /// Serializes the payload (header excluded) into `buf`.
    fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), TetherError>;
}

/// Maps a numeric type tag plus payload bytes to a concrete message.
pub trait MessageFactory: Send + Sync + 'static {
    type Message: WireMessage + 'static;

    /// Builds a message from a received frame. `UnknownMessageType`
    /// for unrecognized tags — the messenger treats that as a
    /// discardable-frame error, not a stream failure.
    fn create_message(&self, type_tag: u32, payload: &[u8]) -> Result<Self::Message, TetherError>;
}

/// Per-stream receiver of dispatched messages.
#[async_trait]
pub trait MessengerDelegate<M: Send + 'static>: Send + Sync {
    async fn on_message_received(&self, stream_id: StreamId, message: M);

    /// Propagated from the reactor when the stream dies.
    async fn on_stream_died(&self, stream_id: StreamId);
}

/// Observer of new streams, after the messenger has wired them up.
#[async_trait]
pub trait ConnectionDelegate: Send + Sync {
    async fn on_stream_created(&self, stream_id: StreamId);
}

// ── Messenger ────────────────────────────────────────────────────

struct MessengerInner<F: MessageFactory> {
    /// Must be set before any message can be received.
    factory: Option<Arc<F>>,
    connection_delegate: Option<Arc<dyn ConnectionDelegate>>,
    /// Bytes collected per stream until a full frame is available.
    buffers: HashMap<StreamId, BytesMut>,
    /// Exactly one dispatch delegate per stream.
    delegates: HashMap<StreamId, Arc<dyn MessengerDelegate<F::Message>>>,
}

/// The framing/dispatch layer. Construct one per service context and
/// register it as the binding delegate; it registers itself with the
/// reactor for every stream it is told about.
pub struct Messenger<F: MessageFactory> {
    listener: Arc<StreamListener>,
    weak_self: Weak<Self>,
    inner: Mutex<MessengerInner<F>>,
}

impl<F: MessageFactory> Messenger<F> {
    pub fn new(listener: Arc<StreamListener>) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            listener,
            weak_self: weak.clone(),
            inner: Mutex::new(MessengerInner {
                factory: None,
                connection_delegate: None,
                buffers: HashMap::new(),
                delegates: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, MessengerInner<F>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The reactor this messenger feeds from and writes through.
    pub fn listener(&self) -> &Arc<StreamListener> {
        &self.listener
    }

    /// Sets (or clears) the factory responsible for building received
    /// messages.
    pub fn set_message_factory(&self, factory: Option<Arc<F>>) {
        self.lock().factory = factory;
    }

    /// Sets (or clears) the new-stream observer.
    pub fn set_connection_delegate(&self, delegate: Option<Arc<dyn ConnectionDelegate>>) {
        self.lock().connection_delegate = delegate;
    }

    /// Associates the dispatch delegate for `stream_id`. Registering a
    /// second delegate for the same stream is a caller contract
    /// violation; the newer delegate wins.
    ///
    /// Frames that were buffered before any delegate existed (the
    /// reactor can deliver bytes the instant a stream is registered)
    /// are extracted and dispatched here.
    pub async fn add_delegate(
        &self,
        stream_id: StreamId,
        delegate: Arc<dyn MessengerDelegate<F::Message>>,
    ) {
        {
            let mut inner = self.lock();
            if inner.delegates.insert(stream_id, delegate).is_some() {
                debug_assert!(false, "dispatch delegate already defined for this stream");
                error!(%stream_id, "dispatch delegate already defined for this stream; replacing");
            }
        }

        let (frames, factory, delegate, fatal) = self.take_ready_frames(stream_id);
        self.dispatch_frames(stream_id, frames, factory, delegate, fatal)
            .await;
    }

    /// Serializes `message` and sends it over `stream_id`.
    ///
    /// Header and payload go out in one `write_stream` call; two
    /// concurrent sends on the same stream may interleave whole frames
    /// but never bytes within a frame.
    pub async fn send_message(
        &self,
        stream_id: StreamId,
        message: &F::Message,
    ) -> Result<(), TetherError> {
        let mut payload = BytesMut::new();
        message.encode_payload(&mut payload)?;

        let mut frame = BytesMut::with_capacity(HEADER_SIZE + payload.len());
        FrameCodec.encode(
            Frame {
                type_tag: message.type_tag(),
                payload: payload.freeze(),
            },
            &mut frame,
        )?;

        self.listener.write_stream(stream_id, &frame).await
    }

    /// Appends received bytes to the stream's buffer, growing
    /// geometrically (at least +20%, with a floor) so a large message
    /// arriving in many small reads does not reallocate per read.
    fn append_data(&self, stream_id: StreamId, data: &[u8]) {
        let mut inner = self.lock();
        let buf = inner.buffers.entry(stream_id).or_default();

        let required = buf.len() + data.len();
        if buf.capacity() < required {
            let target = (required + required / 5).max(MIN_RECV_BUF_SIZE);
            buf.reserve(target - buf.len());
        }
        buf.extend_from_slice(data);
    }

    /// Extracts every complete frame currently buffered for
    /// `stream_id`. Runs under the lock; frame bytes are consumed here
    /// regardless of what later decode/dispatch does with them.
    ///
    /// Until a dispatch delegate exists for the stream the buffer is
    /// left untouched — nothing may be consumed while there is nobody
    /// to hand it to.
    fn take_ready_frames(
        &self,
        stream_id: StreamId,
    ) -> (
        Vec<Frame>,
        Option<Arc<F>>,
        Option<Arc<dyn MessengerDelegate<F::Message>>>,
        Option<TetherError>,
    ) {
        let mut inner = self.lock();

        let Some(delegate) = inner.delegates.get(&stream_id).cloned() else {
            return (Vec::new(), None, None, None);
        };

        let mut frames = Vec::new();
        let mut fatal = None;
        if let Some(buf) = inner.buffers.get_mut(&stream_id) {
            loop {
                match FrameCodec.decode(buf) {
                    Ok(Some(frame)) => frames.push(frame),
                    Ok(None) => break,
                    Err(e) => {
                        // Framing itself is broken; the buffer cannot
                        // be realigned. The stream has to go.
                        fatal = Some(e);
                        break;
                    }
                }
            }
        }

        let factory = inner.factory.clone();
        (frames, factory, Some(delegate), fatal)
    }

    /// Builds and dispatches extracted frames, outside the lock, in
    /// extraction order. Per-frame failures (unknown tag, bad payload,
    /// missing factory) discard the message, never the stream.
    async fn dispatch_frames(
        &self,
        stream_id: StreamId,
        frames: Vec<Frame>,
        factory: Option<Arc<F>>,
        delegate: Option<Arc<dyn MessengerDelegate<F::Message>>>,
        fatal: Option<TetherError>,
    ) {
        for frame in frames {
            let Some(factory) = factory.as_ref() else {
                debug_assert!(false, "message factory must be set before receiving messages");
                error!(%stream_id, "no message factory set; discarding frame");
                continue;
            };

            let message = match factory.create_message(frame.type_tag, &frame.payload) {
                Ok(message) => message,
                Err(e) => {
                    warn!(%stream_id, type_tag = frame.type_tag, "discarding frame: {e}");
                    continue;
                }
            };

            match delegate.as_ref() {
                Some(delegate) => delegate.on_message_received(stream_id, message).await,
                None => {
                    debug_assert!(false, "no dispatch delegate registered for stream");
                    error!(%stream_id, "no dispatch delegate registered; dropping message");
                }
            }
        }

        if let Some(e) = fatal {
            self.listener.close_stream(stream_id, &e.to_string()).await;
        }
    }
}

// ── Binding delegate: new streams flow through here ──────────────

#[async_trait]
impl<F: MessageFactory> BindingDelegate for Messenger<F> {
    async fn on_stream_created(&self, stream: Arc<dyn Stream>) {
        let stream_id = stream.id();

        let Some(strong) = self.weak_self.upgrade() else {
            return;
        };
        if let Err(e) = self
            .listener
            .add_delegate(stream, strong as Arc<dyn StreamEvents>)
        {
            error!(%stream_id, "failed to register stream with reactor: {e}");
            return;
        }

        let delegate = self.lock().connection_delegate.clone();
        if let Some(delegate) = delegate {
            delegate.on_stream_created(stream_id).await;
        }
    }
}

// ── Reactor delegate: bytes in, messages out ─────────────────────

#[async_trait]
impl<F: MessageFactory> StreamEvents for Messenger<F> {
    async fn on_data_received(&self, stream_id: StreamId, data: &[u8]) {
        self.append_data(stream_id, data);

        let (frames, factory, delegate, fatal) = self.take_ready_frames(stream_id);
        self.dispatch_frames(stream_id, frames, factory, delegate, fatal)
            .await;
    }

    async fn on_stream_died(&self, stream_id: StreamId) {
        let delegate = {
            let mut inner = self.lock();
            inner.buffers.remove(&stream_id);
            inner.delegates.remove(&stream_id)
        };

        match delegate {
            Some(delegate) => delegate.on_stream_died(stream_id).await,
            None => debug!(%stream_id, "stream died before a dispatch delegate was registered"),
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
