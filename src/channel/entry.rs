//! One upgraded connection.
//!
//! # Responsibilities
//! - Wrap the transport's native channel with topic qualification
//! - Make every operation a no-op once the channel has ended
//! - Copy inbound message, ping, pong and close payloads into owned memory
//! - Fan inbound traffic out to a single [`ChannelStream`] consumer
//!
//! # Design Decisions
//! - `ended` is flipped before the transport is touched, so a close racing a
//!   send can never reach a dead transport handle
//! - Drain and close both bump one watch counter; a backpressured sender
//!   wakes on either and checks `ended` to tell them apart
//! - Inbound events are only queued once a [`ChannelStream`] was taken;
//!   before that they are dropped, except the close which is kept for a late
//!   consumer

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::channel::stream::ChannelStream;
use crate::channel::topic::{IntoTopic, Topic};
use crate::channel::ChannelError;
use crate::observability::metrics;
use crate::transport::{ChannelTransport, SendStatus};

/// Close code used when the channel is dropped without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Unique identifier for a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId(Uuid);

impl ChannelId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ChannelId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0.simple())
    }
}

/// Inbound traffic, in owned memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Message { data: Bytes, binary: bool },
    Ping(Bytes),
    Pong(Bytes),
    /// Backpressured sends were flushed.
    Drain,
    /// Last event of a channel.
    Close { code: u16, reason: Bytes },
}

type CloseHook = Box<dyn FnOnce(u16, &Bytes) + Send>;

#[derive(Default)]
struct EventSink {
    taken: bool,
    tx: Option<mpsc::UnboundedSender<ChannelEvent>>,
    close: Option<(u16, Bytes)>,
}

struct ChannelInner {
    id: ChannelId,
    namespace: Bytes,
    transport: Mutex<Box<dyn ChannelTransport>>,
    ended: AtomicBool,
    finalized: AtomicBool,
    sink: Mutex<EventSink>,
    drained: watch::Sender<u64>,
    close_hooks: Mutex<Vec<CloseHook>>,
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle to an upgraded connection. Cheap to clone.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Wrap a freshly opened channel transport. Plain topic names are
    /// qualified with `namespace`.
    pub fn new(transport: Box<dyn ChannelTransport>, namespace: impl Into<Bytes>) -> Self {
        let (drained, _) = watch::channel(0);
        let channel = Self {
            inner: Arc::new(ChannelInner {
                id: ChannelId::new(),
                namespace: namespace.into(),
                transport: Mutex::new(transport),
                ended: AtomicBool::new(false),
                finalized: AtomicBool::new(false),
                sink: Mutex::new(EventSink::default()),
                drained,
                close_hooks: Mutex::new(Vec::new()),
            }),
        };
        tracing::debug!(channel_id = %channel.id(), "Channel opened");
        channel
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn namespace(&self) -> &[u8] {
        &self.inner.namespace
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.load(Ordering::Acquire)
    }

    /// Qualify a name with this channel's namespace.
    pub fn topic(&self, name: impl IntoTopic) -> Topic {
        name.into_topic(&self.inner.namespace)
    }

    /// Run `f` against the transport unless the channel has ended.
    fn with_transport<R>(&self, f: impl FnOnce(&mut dyn ChannelTransport) -> R) -> Option<R> {
        let mut transport = lock(&self.inner.transport);
        // Checked under the transport lock; end/close flip it under the same lock.
        if self.is_ended() {
            return None;
        }
        Some(f(transport.as_mut()))
    }

    pub fn send(&self, data: &[u8], binary: bool) -> SendStatus {
        let status = self
            .with_transport(|t| t.send(data, binary))
            .unwrap_or(SendStatus::Closed);
        metrics::record_channel_send(status);
        tracing::trace!(channel_id = %self.id(), bytes = data.len(), ?status, "Channel send");
        status
    }

    /// Send several messages inside one corked section. Stops at the first
    /// message that is not `Sent` and returns its status.
    pub fn send_batch<'a>(
        &self,
        messages: impl IntoIterator<Item = &'a [u8]>,
        binary: bool,
    ) -> SendStatus {
        let mut messages = messages.into_iter();
        let status = self
            .with_transport(|t| {
                let mut status = SendStatus::Sent;
                t.cork(&mut |t: &mut dyn ChannelTransport| {
                    for message in messages.by_ref() {
                        status = t.send(message, binary);
                        if status != SendStatus::Sent {
                            break;
                        }
                    }
                });
                status
            })
            .unwrap_or(SendStatus::Closed);
        metrics::record_channel_send(status);
        status
    }

    /// Send and wait until the bytes were handed to the socket.
    pub async fn send_and_wait(&self, data: &[u8], binary: bool) -> Result<(), ChannelError> {
        let mut drained = self.inner.drained.subscribe();
        match self.send(data, binary) {
            SendStatus::Sent => Ok(()),
            SendStatus::Backpressure => {
                // The sender lives as long as `self`, so this only returns on a bump.
                let _ = drained.changed().await;
                if self.is_ended() {
                    Err(ChannelError::Closed)
                } else {
                    Ok(())
                }
            }
            SendStatus::Dropped => Err(ChannelError::Dropped),
            SendStatus::Closed => Err(ChannelError::Closed),
        }
    }

    /// Publish to every other subscriber of `topic`.
    pub fn publish(&self, topic: impl IntoTopic, data: &[u8], binary: bool) -> bool {
        let topic = self.topic(topic);
        self.with_transport(|t| t.publish(topic.as_bytes(), data, binary))
            .unwrap_or(false)
    }

    pub fn subscribe(&self, topic: impl IntoTopic) -> bool {
        let topic = self.topic(topic);
        self.with_transport(|t| t.subscribe(topic.as_bytes()))
            .unwrap_or(false)
    }

    pub fn unsubscribe(&self, topic: impl IntoTopic) -> bool {
        let topic = self.topic(topic);
        self.with_transport(|t| t.unsubscribe(topic.as_bytes()))
            .unwrap_or(false)
    }

    pub fn is_subscribed(&self, topic: impl IntoTopic) -> bool {
        let topic = self.topic(topic);
        self.with_transport(|t| t.is_subscribed(topic.as_bytes()))
            .unwrap_or(false)
    }

    /// Current subscriptions. Empty once ended.
    pub fn topics(&self) -> Vec<Topic> {
        self.with_transport(|t| t.topics())
            .unwrap_or_default()
            .into_iter()
            .filter_map(Topic::from_qualified)
            .collect()
    }

    pub fn ping(&self, data: &[u8]) -> SendStatus {
        self.with_transport(|t| t.ping(data))
            .unwrap_or(SendStatus::Closed)
    }

    pub fn buffered_amount(&self) -> usize {
        self.with_transport(|t| t.buffered_amount()).unwrap_or(0)
    }

    /// Graceful close with a close frame. Idempotent.
    pub fn end(&self, code: u16, reason: &[u8]) {
        let closed = {
            let mut transport = lock(&self.inner.transport);
            if self.inner.ended.swap(true, Ordering::AcqRel) {
                false
            } else {
                transport.end(code, reason);
                true
            }
        };
        if closed {
            self.finalize(code, Bytes::copy_from_slice(reason));
        }
    }

    /// Immediate close without a close frame. Idempotent.
    pub fn close(&self) {
        let closed = {
            let mut transport = lock(&self.inner.transport);
            if self.inner.ended.swap(true, Ordering::AcqRel) {
                false
            } else {
                transport.close();
                true
            }
        };
        if closed {
            self.finalize(ABNORMAL_CLOSURE, Bytes::new());
        }
    }

    /// Register a hook run once when the channel closes, by either side.
    /// Runs immediately if it already closed.
    pub fn add_close_hook(&self, hook: impl FnOnce(u16, &Bytes) + Send + 'static) {
        {
            let mut hooks = lock(&self.inner.close_hooks);
            if !self.inner.finalized.load(Ordering::Acquire) {
                hooks.push(Box::new(hook));
                return;
            }
        }
        hook(ABNORMAL_CLOSURE, &Bytes::new());
    }

    /// Take the inbound event stream. Only one consumer is supported; events
    /// that arrived before this call are not replayed, a close is.
    pub fn stream(&self) -> Result<ChannelStream, ChannelError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut sink = lock(&self.inner.sink);
            if sink.taken {
                return Err(ChannelError::StreamTaken);
            }
            sink.taken = true;
            match sink.close.clone() {
                Some((code, reason)) => {
                    let _ = tx.send(ChannelEvent::Close { code, reason });
                }
                None => sink.tx = Some(tx),
            }
        }
        Ok(ChannelStream::new(self.clone(), rx))
    }

    // ---- transport entry points ---------------------------------------------

    /// A message arrived. `data` is only valid for this call.
    pub fn on_message(&self, data: &[u8], binary: bool) {
        self.emit(ChannelEvent::Message {
            data: Bytes::copy_from_slice(data),
            binary,
        });
    }

    pub fn on_ping(&self, data: &[u8]) {
        self.emit(ChannelEvent::Ping(Bytes::copy_from_slice(data)));
    }

    pub fn on_pong(&self, data: &[u8]) {
        self.emit(ChannelEvent::Pong(Bytes::copy_from_slice(data)));
    }

    /// Backpressured data was written out.
    pub fn on_drain(&self) {
        self.inner.drained.send_modify(|n| *n += 1);
        self.emit(ChannelEvent::Drain);
    }

    /// The transport closed the channel. The handle is dead and is not
    /// touched again.
    pub fn on_close(&self, code: u16, reason: &[u8]) {
        {
            let _transport = lock(&self.inner.transport);
            self.inner.ended.store(true, Ordering::Release);
        }
        self.finalize(code, Bytes::copy_from_slice(reason));
    }

    fn emit(&self, event: ChannelEvent) {
        if self.inner.finalized.load(Ordering::Acquire) {
            return;
        }
        let mut sink = lock(&self.inner.sink);
        let dropped = match &sink.tx {
            Some(tx) => tx.send(event).is_err(),
            None => false,
        };
        if dropped {
            sink.tx = None;
        }
    }

    fn finalize(&self, code: u16, reason: Bytes) {
        let hooks = {
            let mut hooks = lock(&self.inner.close_hooks);
            if self.inner.finalized.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *hooks)
        };
        self.inner.drained.send_modify(|n| *n += 1);
        {
            let mut sink = lock(&self.inner.sink);
            sink.close = Some((code, reason.clone()));
            if let Some(tx) = sink.tx.take() {
                let _ = tx.send(ChannelEvent::Close {
                    code,
                    reason: reason.clone(),
                });
            }
        }
        tracing::debug!(channel_id = %self.id(), code, "Channel closed");
        for hook in hooks {
            hook(code, &reason);
        }
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("namespace", &String::from_utf8_lossy(&self.inner.namespace))
            .field("ended", &self.is_ended())
            .finish()
    }
}
