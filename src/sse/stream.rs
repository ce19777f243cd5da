//! Event write combiner.
//!
//! # Responsibilities
//! - Buffer formatted events and issue them as combined corked writes
//! - Stage the fixed event-stream headers on the first flush
//! - Share one completion handle among callers while a write is backpressured
//! - Enforce the buffer ceiling, keep the connection alive with heartbeats
//!
//! # Design Decisions
//! - At most one write is in flight; the buffer is the only queue
//! - A flush is triggered by the batch threshold, an explicit flush, or close
//! - Overflowing the ceiling while backpressured closes the connection
//!
//! # Data Flow
//! ```text
//! send(event) → format → buffer ──threshold / flush / close──▶ OutboundStream::write
//!                                                                 │
//!                      write callback (drained) ◀─────────────────┘
//!                          → resolve shared completion
//!                          → flush again if the threshold was reached meanwhile
//! ```

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{self, BoxFuture, Shared};
use futures_util::{FutureExt, Stream, StreamExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::config::EventStreamConfig;
use crate::error::AdapterError;
use crate::http::request::RequestHead;
use crate::http::response::OutboundStream;
use crate::observability::metrics;
use crate::sse::event::{SseMessage, HEARTBEAT_FRAME};

/// Headers every event stream carries. Caller headers never override them.
pub const FIXED_HEADERS: [(&str, &str); 4] = [
    ("content-type", "text/event-stream"),
    ("cache-control", "no-cache"),
    ("connection", "keep-alive"),
    ("x-accel-buffering", "no"),
];

/// Resolves once the write that carries (or precedes) an event has drained.
pub type Delivery = Shared<BoxFuture<'static, Result<(), AdapterError>>>;

fn ready_delivery() -> Delivery {
    future::ready(Ok(())).boxed().shared()
}

fn pending_delivery() -> (oneshot::Sender<Result<(), AdapterError>>, Delivery) {
    let (tx, rx) = oneshot::channel();
    let delivery = rx
        .map(|r| r.unwrap_or(Err(AdapterError::StreamDestroyed)))
        .boxed()
        .shared();
    (tx, delivery)
}

/// Combiner tuning.
#[derive(Debug, Clone)]
pub struct EventStreamOptions {
    /// Events buffered before a combined write is issued.
    pub batch_events: usize,
    /// Byte ceiling of the buffer.
    pub max_buffer_bytes: usize,
    /// Keep-alive period; `None` disables heartbeats.
    pub heartbeat: Option<Duration>,
    /// Extra response headers.
    pub headers: Vec<(String, String)>,
}

impl Default for EventStreamOptions {
    fn default() -> Self {
        Self::from(&EventStreamConfig::default())
    }
}

impl From<&EventStreamConfig> for EventStreamOptions {
    fn from(config: &EventStreamConfig) -> Self {
        Self {
            batch_events: config.batch_events.max(1),
            max_buffer_bytes: config.max_buffer_bytes,
            heartbeat: (config.heartbeat_secs > 0)
                .then(|| Duration::from_secs(config.heartbeat_secs)),
            headers: Vec::new(),
        }
    }
}

#[derive(Default)]
struct CombinerState {
    buffer: String,
    event_count: usize,
    inflight: bool,
    completion: Option<Delivery>,
    completion_tx: Option<oneshot::Sender<Result<(), AdapterError>>>,
    headers_staged: bool,
    closed: bool,
    closing: bool,
    disconnected: bool,
    heartbeat: Option<JoinHandle<()>>,
    close_hooks: Vec<Box<dyn FnOnce() + Send>>,
}

struct StreamInner {
    out: OutboundStream,
    options: EventStreamOptions,
    last_event_id: Option<String>,
    state: Mutex<CombinerState>,
}

enum Enqueue {
    FlushFirst,
    Overflow(usize),
    Flush,
    Queued(Delivery),
}

enum AfterWrite {
    Nothing,
    Flush,
    End,
}

/// Server-to-client push stream over an [`OutboundStream`].
#[derive(Clone)]
pub struct EventStream {
    inner: Arc<StreamInner>,
}

impl EventStream {
    pub fn new(out: OutboundStream, options: EventStreamOptions) -> Self {
        Self::build(out, options, None)
    }

    /// Event stream answering `head`; remembers its `last-event-id`.
    pub fn for_request(head: &RequestHead, out: OutboundStream, options: EventStreamOptions) -> Self {
        let last_event_id = head
            .header("last-event-id")
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string);
        Self::build(out, options, last_event_id)
    }

    fn build(out: OutboundStream, options: EventStreamOptions, last_event_id: Option<String>) -> Self {
        let stream = Self {
            inner: Arc::new(StreamInner {
                out,
                options,
                last_event_id,
                state: Mutex::new(CombinerState::default()),
            }),
        };
        let weak: Weak<StreamInner> = Arc::downgrade(&stream.inner);
        stream.inner.out.socket().on_close(move |_| {
            if let Some(inner) = weak.upgrade() {
                EventStream { inner }.on_disconnect();
            }
        });
        stream
    }

    fn lock(&self) -> MutexGuard<'_, CombinerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The `last-event-id` the client reconnected with.
    pub fn last_event_id(&self) -> Option<&str> {
        self.inner.last_event_id.as_deref()
    }

    pub fn is_connected(&self) -> bool {
        let state = self.lock();
        !state.closed && !state.disconnected
    }

    /// Bytes buffered and not yet written.
    pub fn buffered_bytes(&self) -> usize {
        self.lock().buffer.len()
    }

    /// Events buffered and not yet written.
    pub fn buffered_events(&self) -> usize {
        self.lock().event_count
    }

    /// Whether a combined write is waiting for drain.
    pub fn is_backpressured(&self) -> bool {
        self.lock().inflight
    }

    /// Queue an event without waiting.
    pub fn push(&self, message: &SseMessage) -> Result<Delivery, AdapterError> {
        self.enqueue(message.format(), false)
    }

    /// Queue an event and wait until the write path can take more.
    pub async fn send(&self, message: impl Into<SseMessage>) -> Result<(), AdapterError> {
        self.push(&message.into())?.await
    }

    /// Send every event of `source`, then flush. Returns the number sent.
    pub async fn stream<S>(&self, source: S) -> Result<usize, AdapterError>
    where
        S: Stream<Item = SseMessage>,
    {
        let mut source = std::pin::pin!(source);
        let mut sent = 0;
        while let Some(message) = source.next().await {
            self.send(message).await?;
            sent += 1;
        }
        self.flush().await?;
        Ok(sent)
    }

    /// Resend history after a reconnect. `history` receives the client's
    /// `last-event-id` and yields the events it missed.
    pub async fn replay<F, I>(&self, history: F) -> Result<usize, AdapterError>
    where
        F: FnOnce(Option<&str>) -> I,
        I: IntoIterator<Item = SseMessage>,
    {
        let events: Vec<SseMessage> = history(self.last_event_id()).into_iter().collect();
        tracing::debug!(
            connection_id = %self.inner.out.socket().id(),
            last_event_id = ?self.last_event_id(),
            events = events.len(),
            "Replaying events"
        );
        self.stream(futures_util::stream::iter(events)).await
    }

    /// Write whatever is buffered and wait for it to drain.
    pub async fn flush(&self) -> Result<(), AdapterError> {
        self.flush_buffer()?.await
    }

    /// Start (or restart) the heartbeat timer on the socket's runtime. No-op
    /// when heartbeats are disabled or no runtime is available.
    pub fn keep_alive(&self) {
        let Some(period) = self.inner.options.heartbeat else {
            return;
        };
        let Some(runtime) = self.inner.out.socket().runtime().cloned() else {
            tracing::warn!(
                connection_id = %self.inner.out.socket().id(),
                "No tokio runtime, heartbeats disabled"
            );
            return;
        };
        let weak = Arc::downgrade(&self.inner);
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                let stream = EventStream { inner };
                if !stream.is_connected() {
                    return;
                }
                if stream.enqueue(HEARTBEAT_FRAME.to_string(), true).is_err() {
                    return;
                }
            }
        });
        let previous = {
            let mut state = self.lock();
            if state.closed || state.disconnected {
                task.abort();
                return;
            }
            state.heartbeat.replace(task)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Register a hook run once when the stream disconnects.
    pub fn on_close(&self, hook: impl FnOnce() + Send + 'static) {
        {
            let mut state = self.lock();
            if !state.disconnected {
                state.close_hooks.push(Box::new(hook));
                return;
            }
        }
        hook();
    }

    /// Flush the buffer as the final write and end the response. Idempotent.
    pub fn close(&self) {
        let end_now = {
            let mut state = self.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.closing = true;
            if let Some(task) = state.heartbeat.take() {
                task.abort();
            }
            !state.inflight
        };
        if end_now {
            self.end_stream();
        }
    }

    fn enqueue(&self, frame: String, flush_now: bool) -> Result<Delivery, AdapterError> {
        let limit = self.inner.options.max_buffer_bytes;
        let mut flushed_first = false;
        loop {
            let step = {
                let mut state = self.lock();
                if state.closed || state.disconnected {
                    return Err(AdapterError::Disconnected);
                }
                let attempted = state.buffer.len() + frame.len();
                if attempted > limit {
                    if !state.inflight && !state.buffer.is_empty() && !flushed_first {
                        Enqueue::FlushFirst
                    } else {
                        Enqueue::Overflow(attempted)
                    }
                } else {
                    state.buffer.push_str(&frame);
                    state.event_count += 1;
                    if !state.inflight
                        && (flush_now || state.event_count >= self.inner.options.batch_events)
                    {
                        Enqueue::Flush
                    } else {
                        Enqueue::Queued(state.completion.clone().unwrap_or_else(ready_delivery))
                    }
                }
            };
            match step {
                Enqueue::FlushFirst => {
                    flushed_first = true;
                    self.flush_buffer()?;
                }
                Enqueue::Overflow(attempted) => {
                    self.overflow(attempted);
                    return Err(AdapterError::BufferOverflow { limit, attempted });
                }
                Enqueue::Flush => return self.flush_buffer(),
                Enqueue::Queued(delivery) => return Ok(delivery),
            }
        }
    }

    fn flush_buffer(&self) -> Result<Delivery, AdapterError> {
        let (payload, count, delivery) = {
            let mut state = self.lock();
            if state.inflight {
                return Ok(state.completion.clone().unwrap_or_else(ready_delivery));
            }
            if state.buffer.is_empty() {
                return Ok(ready_delivery());
            }
            let (tx, delivery) = pending_delivery();
            state.inflight = true;
            state.completion = Some(delivery.clone());
            state.completion_tx = Some(tx);
            (
                std::mem::take(&mut state.buffer),
                std::mem::take(&mut state.event_count),
                delivery,
            )
        };
        if let Err(e) = self.stage_headers() {
            self.on_write_done(Err(e.clone()));
            return Err(e);
        }

        metrics::record_event_flush(count, payload.len());
        tracing::trace!(
            connection_id = %self.inner.out.socket().id(),
            events = count,
            bytes = payload.len(),
            "Flushing events"
        );
        let this = self.clone();
        match self
            .inner
            .out
            .write(Bytes::from(payload), move |result| this.on_write_done(result))
        {
            Ok(_) => Ok(delivery),
            Err(e) => {
                self.on_write_done(Err(e.clone()));
                Err(e)
            }
        }
    }

    fn on_write_done(&self, result: Result<(), AdapterError>) {
        let (tx, next) = {
            let mut state = self.lock();
            state.inflight = false;
            state.completion = None;
            let next = if result.is_err() {
                AfterWrite::Nothing
            } else if state.closing {
                AfterWrite::End
            } else if state.event_count >= self.inner.options.batch_events {
                AfterWrite::Flush
            } else {
                AfterWrite::Nothing
            };
            (state.completion_tx.take(), next)
        };
        if let Some(tx) = tx {
            let _ = tx.send(result);
        }
        match next {
            AfterWrite::Flush => {
                if let Err(e) = self.flush_buffer() {
                    tracing::debug!(error = %e, "Deferred event flush failed");
                }
            }
            AfterWrite::End => self.end_stream(),
            AfterWrite::Nothing => {}
        }
    }

    /// Merge caller headers under the fixed set. Runs once, before the first
    /// write.
    fn stage_headers(&self) -> Result<(), AdapterError> {
        {
            let mut state = self.lock();
            if std::mem::replace(&mut state.headers_staged, true) {
                return Ok(());
            }
        }
        let out = &self.inner.out;
        if out.headers_sent() {
            return Ok(());
        }
        for (name, value) in &self.inner.options.headers {
            let fixed = FIXED_HEADERS
                .iter()
                .any(|(fixed, _)| fixed.eq_ignore_ascii_case(name));
            if !fixed {
                out.set_header(name, value.as_str())?;
            }
        }
        out.remove_header("content-length")?;
        for (name, value) in FIXED_HEADERS {
            out.set_header(name, value)?;
        }
        Ok(())
    }

    fn end_stream(&self) {
        let payload = {
            let mut state = self.lock();
            state.event_count = 0;
            std::mem::take(&mut state.buffer)
        };
        if let Err(e) = self.stage_headers() {
            tracing::debug!(error = %e, "Could not stage event-stream headers");
        }
        let id = self.inner.out.socket().id();
        let result = self.inner.out.end(Some(Bytes::from(payload)), move |result| {
            if let Err(e) = result {
                tracing::debug!(connection_id = %id, error = %e, "Final event write failed");
            }
        });
        if let Err(e) = result {
            tracing::debug!(connection_id = %id, error = %e, "Event stream end failed");
        }
    }

    fn overflow(&self, attempted: usize) {
        metrics::record_event_overflow();
        tracing::warn!(
            connection_id = %self.inner.out.socket().id(),
            limit = self.inner.options.max_buffer_bytes,
            attempted,
            "Event buffer overflow while backpressured, closing connection"
        );
        {
            let mut state = self.lock();
            state.closed = true;
            if let Some(task) = state.heartbeat.take() {
                task.abort();
            }
        }
        self.inner.out.socket().abort();
    }

    fn on_disconnect(&self) {
        let hooks = {
            let mut state = self.lock();
            if state.disconnected {
                return;
            }
            state.disconnected = true;
            if let Some(task) = state.heartbeat.take() {
                task.abort();
            }
            std::mem::take(&mut state.close_hooks)
        };
        tracing::debug!(connection_id = %self.inner.out.socket().id(), "Event stream disconnected");
        for hook in hooks {
            hook();
        }
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("EventStream")
            .field("connection_id", &self.inner.out.socket().id())
            .field("buffered_bytes", &state.buffer.len())
            .field("buffered_events", &state.event_count)
            .field("backpressured", &state.inflight)
            .field("closed", &state.closed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::{SocketAdapter, SocketOptions};
    use crate::transport::memory::{MemoryPeer, MemoryTransport};

    fn event_stream(options: EventStreamOptions) -> (EventStream, MemoryPeer) {
        let (transport, peer) = MemoryTransport::pair();
        let socket = SocketAdapter::new(Box::new(transport), SocketOptions::default());
        (EventStream::new(OutboundStream::new(socket), options), peer)
    }

    fn options(batch_events: usize) -> EventStreamOptions {
        EventStreamOptions {
            batch_events,
            heartbeat: None,
            ..EventStreamOptions::default()
        }
    }

    #[tokio::test]
    async fn fixed_headers_win_over_caller_headers() {
        let mut opts = options(1);
        opts.headers = vec![
            ("Content-Type".into(), "text/plain".into()),
            ("X-Stream".into(), "1".into()),
        ];
        let (events, peer) = event_stream(opts);
        events.send("hi").await.unwrap();

        assert_eq!(peer.header("content-type").as_deref(), Some("text/event-stream"));
        assert_eq!(peer.header("cache-control").as_deref(), Some("no-cache"));
        assert_eq!(peer.header("x-accel-buffering").as_deref(), Some("no"));
        assert_eq!(peer.header("x-stream").as_deref(), Some("1"));
        assert_eq!(peer.body(), b"data: hi\n\n");
    }

    #[tokio::test]
    async fn backpressured_callers_share_one_completion() {
        let (events, peer) = event_stream(options(1));
        peer.set_backpressure(true);
        let first = events.push(&"a".into()).unwrap();
        assert!(events.is_backpressured());
        let second = events.push(&"b".into()).unwrap();
        let third = events.push(&"c".into()).unwrap();
        assert_eq!(peer.write_count(), 1);
        assert_eq!(events.buffered_events(), 2);

        peer.set_backpressure(false);
        assert!(events.inner.out.socket().on_writable());
        first.await.unwrap();
        second.await.unwrap();
        third.await.unwrap();
        // the two queued events went out as one write after the drain
        assert_eq!(peer.write_count(), 2);
        assert_eq!(peer.body(), b"data: a\n\ndata: b\n\ndata: c\n\n");
    }

    #[tokio::test]
    async fn overflow_while_backpressured_closes() {
        let mut opts = options(1);
        opts.max_buffer_bytes = 32;
        let (events, peer) = event_stream(opts);
        peer.set_backpressure(true);
        events.push(&"first".into()).unwrap();

        events.push(&"0123456789".into()).unwrap();
        let err = events.push(&"0123456789".into()).unwrap_err();
        assert!(matches!(err, AdapterError::BufferOverflow { limit: 32, .. }));
        assert!(peer.is_closed());
        assert!(!events.is_connected());
        assert!(matches!(events.send("late").await, Err(AdapterError::Disconnected)));
    }

    #[test]
    fn heartbeats_run_on_the_socket_runtime() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let (transport, peer) = MemoryTransport::pair();
        let socket = SocketAdapter::new(
            Box::new(transport),
            SocketOptions {
                runtime: Some(runtime.handle().clone()),
                ..SocketOptions::default()
            },
        );
        let mut opts = options(1);
        opts.heartbeat = Some(Duration::from_millis(10));
        let events = EventStream::new(OutboundStream::new(socket), opts);

        events.keep_alive();
        runtime.block_on(async { tokio::time::sleep(Duration::from_millis(60)).await });
        assert!(peer.body().starts_with(HEARTBEAT_FRAME.as_bytes()));
        events.close();
    }

    #[test]
    fn keep_alive_without_runtime_is_a_no_op() {
        let mut opts = options(1);
        opts.heartbeat = Some(Duration::from_millis(10));
        let (events, peer) = event_stream(opts);
        events.keep_alive();
        assert!(peer.body().is_empty());
        assert!(events.is_connected());
    }

    #[tokio::test]
    async fn close_flushes_and_ends_once() {
        let (events, peer) = event_stream(options(16));
        let closed = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let c = Arc::clone(&closed);
        events.on_close(move || {
            c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        });
        events.push(&"tail".into()).unwrap();
        assert_eq!(peer.write_count(), 0);

        events.close();
        events.close();
        assert!(peer.is_ended());
        assert_eq!(peer.body(), b"data: tail\n\n");
        assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(!events.is_connected());
    }

    #[tokio::test]
    async fn replay_uses_last_event_id() {
        let (transport, peer) = MemoryTransport::pair();
        let socket = SocketAdapter::new(Box::new(transport), SocketOptions::default());
        let headers: [(&str, &[u8]); 1] = [("Last-Event-ID", b"2")];
        let head = RequestHead::snapshot(&crate::transport::RawRequest {
            method: "GET",
            path: "/events",
            query: None,
            headers: &headers,
        });
        let events = EventStream::for_request(&head, OutboundStream::new(socket), options(16));

        let history = ["1", "2", "3", "4"];
        let sent = events
            .replay(|last| {
                let after = last.and_then(|id| history.iter().position(|h| *h == id));
                history
                    .iter()
                    .skip(after.map_or(0, |i| i + 1))
                    .map(|id| SseMessage::text(format!("event {id}")).with_id(*id))
                    .collect::<Vec<_>>()
            })
            .await
            .unwrap();

        assert_eq!(sent, 2);
        assert_eq!(peer.write_count(), 1);
        assert_eq!(
            peer.body(),
            b"id: 3\ndata: event 3\n\nid: 4\ndata: event 4\n\n"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_flushes_until_disconnected() {
        let opts = EventStreamOptions {
            heartbeat: Some(Duration::from_secs(15)),
            ..options(16)
        };
        let (events, peer) = event_stream(opts);
        events.keep_alive();

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert_eq!(peer.body(), HEARTBEAT_FRAME.as_bytes());

        events.inner.out.socket().on_aborted();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(peer.body(), HEARTBEAT_FRAME.as_bytes());
    }
}
