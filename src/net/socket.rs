//! Socket adapter: the drain/backpressure/timeout state machine.
//!
//! # Responsibilities
//! - Single authority for every byte entering or leaving a [`Connection`]
//! - Two-phase writes: queue one pending write, then flush it inside a cork
//! - One drain waiter per connection, bounded by a timeout
//! - Copy inbound chunks out of transport memory before handing them on
//! - Idle timeout, abort and lifecycle notification
//!
//! # Design Decisions
//! - Callbacks never run while the adapter lock is held, so handlers may
//!   call back into the adapter from inside them
//! - A panic raised by a handler callback inside a transport entry point is
//!   caught and turned into an abort
//! - Abort resolves the pending drain before tearing down; no caller is left
//!   waiting

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

use crate::config::TimeoutConfig;
use crate::error::AdapterError;
use crate::net::connection::{Connection, ConnectionId, ConnectionState};
use crate::observability::metrics;
use crate::transport::Transport;

/// Completion callback of a write or end.
pub type WriteCallback = Box<dyn FnOnce(Result<(), AdapterError>) + Send>;

/// Receives body chunks; `None` marks end-of-body and is delivered once.
pub type ReadCallback = Box<dyn FnMut(Option<Bytes>) + Send>;

type CloseHook = Box<dyn FnOnce(&ConnectionEvent) + Send>;

/// Default bound on how long a write may wait for drain.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Lifecycle notifications broadcast by a [`SocketAdapter`].
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The idle timer fired; an abort follows.
    Timeout,
    /// A transport or drain failure; an abort follows.
    Error(AdapterError),
    /// The connection was torn down.
    Aborted,
    /// The final write was fully flushed.
    Finished,
}

/// Per-connection adapter options.
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub drain_timeout: Duration,
    pub idle_timeout: Option<Duration>,
    /// Runtime that drives drain and idle timers. When unset, the runtime
    /// current at [`SocketAdapter::new`] is used; with neither, timers are
    /// disabled and a stuck write waits for drain or abort.
    pub runtime: Option<Handle>,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            idle_timeout: None,
            runtime: None,
        }
    }
}

impl From<&TimeoutConfig> for SocketOptions {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            drain_timeout: Duration::from_millis(config.drain_ms),
            idle_timeout: (config.idle_secs > 0).then(|| Duration::from_secs(config.idle_secs)),
            runtime: None,
        }
    }
}

/// Status line and headers staged ahead of the first body write.
#[derive(Debug, Clone, Default)]
pub struct ResponseHead {
    pub status: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    fn emit(&self, transport: &mut dyn Transport) {
        transport.write_status(&self.status);
        for (name, value) in &self.headers {
            transport.write_header(name, value);
        }
    }
}

/// The single write slot's content.
struct PendingWrite {
    payload: Bytes,
    head: Option<ResponseHead>,
    callback: WriteCallback,
    end_of_stream: bool,
}

struct DrainWaiter {
    callback: WriteCallback,
    timer: Option<JoinHandle<()>>,
    deadline: Instant,
    end_of_stream: bool,
    generation: u64,
}

#[derive(Default)]
struct Reader {
    queue: VecDeque<Bytes>,
    callback: Option<ReadCallback>,
    /// The transport delivered the last chunk.
    finished: bool,
    /// A pump currently owns the callback.
    delivering: bool,
    /// End-of-body was signalled.
    done: bool,
}

enum Flush {
    Done { callback: WriteCallback, finished: bool },
    Deferred,
}

enum ReadStep {
    Chunk(Bytes),
    End,
}

struct Inner {
    conn: Connection,
    state: ConnectionState,
    options: SocketOptions,
    drain: Option<DrainWaiter>,
    drain_generation: u64,
    reader: Reader,
    idle: Option<JoinHandle<()>>,
    last_activity: Instant,
    close_hooks: Vec<CloseHook>,
}

impl Inner {
    fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    fn cancel_idle(&mut self) {
        if let Some(task) = self.idle.take() {
            task.abort();
        }
    }

    fn use_side(&mut self, readable: bool, writable: bool) {
        let (r, w) = match self.state {
            ConnectionState::Opening => (false, false),
            ConnectionState::ReadOnly => (true, false),
            ConnectionState::WriteOnly => (false, true),
            ConnectionState::Open => (true, true),
            ConnectionState::Ended | ConnectionState::Aborted => return,
        };
        self.state = ConnectionState::attached(r || readable, w || writable);
    }

    fn check_writable(&self) -> Result<(), AdapterError> {
        if self.conn.aborted {
            return Err(AdapterError::StreamDestroyed);
        }
        if self.conn.writable_ended || self.state == ConnectionState::Ended {
            return Err(AdapterError::WriteAfterEnd);
        }
        if self.drain.is_some() {
            return Err(AdapterError::WriteBeforeDrain);
        }
        Ok(())
    }

    /// Phase two: performs the pending write inside a corked section.
    fn flush_pending(&mut self, write: PendingWrite, shared: &Arc<Shared>) -> Flush {
        let PendingWrite {
            payload,
            mut head,
            callback,
            end_of_stream,
        } = write;

        let mut flushed = false;
        self.conn.transport.cork(&mut |t: &mut dyn Transport| {
            if let Some(head) = head.take() {
                head.emit(t);
            }
            flushed = if end_of_stream {
                t.end(&payload)
            } else {
                t.write(&payload)
            };
        });

        self.conn.bytes_written += payload.len() as u64;
        if end_of_stream {
            self.conn.writable_ended = true;
        }
        self.touch();
        metrics::record_bytes_written(payload.len());

        if flushed {
            return Flush::Done {
                callback,
                finished: end_of_stream,
            };
        }

        self.drain_generation += 1;
        let generation = self.drain_generation;
        let timeout = self.options.drain_timeout;
        let weak = Arc::downgrade(shared);
        let timer = shared.spawn(async move {
            time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                SocketAdapter { shared }.on_drain_timeout(generation, timeout);
            }
        });
        metrics::record_drain_wait();
        tracing::trace!(
            connection_id = %self.conn.id(),
            bytes = payload.len(),
            "Write backpressured, waiting for drain"
        );
        self.drain = Some(DrainWaiter {
            callback,
            timer,
            deadline: Instant::now() + timeout,
            end_of_stream,
            generation,
        });
        Flush::Deferred
    }
}

struct Shared {
    id: ConnectionId,
    inner: Mutex<Inner>,
    events: broadcast::Sender<ConnectionEvent>,
    state_tx: watch::Sender<ConnectionState>,
    runtime: Option<Handle>,
}

impl Shared {
    fn spawn<F>(&self, task: F) -> Option<JoinHandle<()>>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        match &self.runtime {
            Some(runtime) => Some(runtime.spawn(task)),
            None => {
                tracing::warn!(connection_id = %self.id, "No tokio runtime, timer not armed");
                None
            }
        }
    }
}

/// Drain/backpressure/timeout state machine over one [`Connection`].
///
/// Cheap to clone; every clone drives the same connection.
#[derive(Clone)]
pub struct SocketAdapter {
    shared: Arc<Shared>,
}

impl SocketAdapter {
    /// Wrap a freshly accepted transport.
    pub fn new(transport: Box<dyn Transport>, options: SocketOptions) -> Self {
        let conn = Connection::new(transport);
        let id = conn.id();
        let idle_timeout = options.idle_timeout;
        let runtime = options.runtime.clone().or_else(|| Handle::try_current().ok());
        let (events, _) = broadcast::channel(16);
        let (state_tx, _) = watch::channel(ConnectionState::Opening);
        let adapter = Self {
            shared: Arc::new(Shared {
                id,
                inner: Mutex::new(Inner {
                    conn,
                    state: ConnectionState::Opening,
                    options,
                    drain: None,
                    drain_generation: 0,
                    reader: Reader::default(),
                    idle: None,
                    last_activity: Instant::now(),
                    close_hooks: Vec::new(),
                }),
                events,
                state_tx,
                runtime,
            }),
        };
        if let Some(timeout) = idle_timeout {
            adapter.set_timeout(timeout);
        }
        tracing::debug!(connection_id = %id, "Socket adapter opened");
        adapter
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.shared
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> ConnectionId {
        self.shared.id
    }

    pub fn state(&self) -> ConnectionState {
        self.lock().state
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().conn.aborted
    }

    /// Runtime driving this connection's timers, if any.
    pub fn runtime(&self) -> Option<&Handle> {
        self.shared.runtime.as_ref()
    }

    /// Whether a write is waiting for drain.
    pub fn is_write_pending(&self) -> bool {
        self.lock().drain.is_some()
    }

    /// Time left before the pending write times out.
    pub fn drain_deadline(&self) -> Option<Instant> {
        self.lock().drain.as_ref().map(|d| d.deadline)
    }

    /// The first error recorded on this connection.
    pub fn error(&self) -> Option<AdapterError> {
        self.lock().conn.errored.clone()
    }

    pub fn bytes_read(&self) -> u64 {
        self.lock().conn.bytes_read()
    }

    pub fn bytes_written(&self) -> u64 {
        self.lock().conn.bytes_written()
    }

    /// Declare which sides of the connection are in use.
    pub fn attach(&self, readable: bool, writable: bool) {
        let state = {
            let mut inner = self.lock();
            inner.use_side(readable, writable);
            inner.state
        };
        self.shared.state_tx.send_replace(state);
    }

    /// Subscribe to lifecycle notifications.
    pub fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.shared.events.subscribe()
    }

    /// Watch the state machine.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Register a hook run once when the connection ends or aborts.
    /// Runs immediately if that already happened.
    pub fn on_close(&self, hook: impl FnOnce(&ConnectionEvent) + Send + 'static) {
        let terminal = {
            let mut inner = self.lock();
            match inner.state {
                ConnectionState::Ended => Some(ConnectionEvent::Finished),
                ConnectionState::Aborted => Some(ConnectionEvent::Aborted),
                _ => {
                    inner.close_hooks.push(Box::new(hook));
                    return;
                }
            }
        };
        if let Some(event) = terminal {
            hook(&event);
        }
    }

    /// Resolve once the connection reached a terminal state.
    pub async fn closed(&self) -> ConnectionState {
        let mut rx = self.watch_state();
        let state = match rx.wait_for(|s| s.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        };
        state
    }

    // ---- read side ---------------------------------------------------------

    /// Register the body callback.
    ///
    /// Chunks already received are delivered first. On an aborted or ended
    /// adapter the callback immediately receives `None`.
    pub fn read(&self, callback: impl FnMut(Option<Bytes>) + Send + 'static) {
        let callback: ReadCallback = Box::new(callback);
        {
            let mut inner = self.lock();
            inner.use_side(true, false);
            if inner.reader.delivering && !inner.reader.done {
                inner.reader.callback = Some(callback);
                return;
            }
            inner.reader.callback = None;
            inner.reader.delivering = true;
        }
        self.pump(callback);
    }

    fn pump(&self, mut callback: ReadCallback) {
        loop {
            let step = {
                let mut inner = self.lock();
                let terminal = inner.conn.aborted || inner.state == ConnectionState::Ended;
                let reader = &mut inner.reader;
                if let Some(newer) = reader.callback.take() {
                    callback = newer;
                }
                if reader.done {
                    reader.delivering = false;
                    ReadStep::End
                } else if terminal {
                    reader.queue.clear();
                    reader.done = true;
                    reader.delivering = false;
                    ReadStep::End
                } else if let Some(chunk) = reader.queue.pop_front() {
                    ReadStep::Chunk(chunk)
                } else if reader.finished {
                    reader.done = true;
                    reader.delivering = false;
                    ReadStep::End
                } else {
                    reader.callback = Some(callback);
                    reader.delivering = false;
                    return;
                }
            };
            match step {
                ReadStep::Chunk(chunk) => callback(Some(chunk)),
                ReadStep::End => {
                    callback(None);
                    return;
                }
            }
        }
    }

    /// Transport entry point: a body chunk arrived.
    ///
    /// `chunk` is only valid for this call and is copied before delivery.
    pub fn on_data(&self, chunk: &[u8], is_last: bool) {
        let callback = {
            let mut inner = self.lock();
            if inner.conn.aborted || inner.reader.done {
                return;
            }
            if !chunk.is_empty() {
                inner.reader.queue.push_back(Bytes::copy_from_slice(chunk));
                inner.conn.bytes_read += chunk.len() as u64;
                metrics::record_bytes_read(chunk.len());
            }
            if is_last {
                inner.reader.finished = true;
            }
            inner.touch();
            if inner.reader.delivering {
                return;
            }
            match inner.reader.callback.take() {
                Some(callback) => {
                    inner.reader.delivering = true;
                    callback
                }
                None => return,
            }
        };
        self.guard(|| self.pump(callback));
    }

    // ---- write side --------------------------------------------------------

    /// Write `payload`. Returns `Ok(true)` when it was fully flushed and the
    /// callback has already run; `Ok(false)` when the callback waits for
    /// drain.
    pub fn write(
        &self,
        payload: impl Into<Bytes>,
        callback: impl FnOnce(Result<(), AdapterError>) + Send + 'static,
    ) -> Result<bool, AdapterError> {
        self.submit(None, payload.into(), false, Box::new(callback))
    }

    /// Write the final chunk and finish the outbound side.
    ///
    /// On an ended or aborted adapter this is a no-op: the callback runs
    /// with the terminal outcome and no error is returned.
    pub fn end(
        &self,
        payload: Option<Bytes>,
        callback: impl FnOnce(Result<(), AdapterError>) + Send + 'static,
    ) -> Result<bool, AdapterError> {
        match self.state() {
            ConnectionState::Ended => {
                callback(Ok(()));
                return Ok(true);
            }
            ConnectionState::Aborted => {
                callback(Err(AdapterError::StreamDestroyed));
                return Ok(false);
            }
            _ => {}
        }
        self.submit(None, payload.unwrap_or_default(), true, Box::new(callback))
    }

    /// Write `payload` and wait for it to drain.
    pub async fn write_all(&self, payload: impl Into<Bytes>) -> Result<(), AdapterError> {
        let (tx, rx) = oneshot::channel();
        self.write(payload, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(AdapterError::StreamDestroyed))
    }

    /// End with `payload` and wait for it to drain.
    pub async fn finish(&self, payload: Option<Bytes>) -> Result<(), AdapterError> {
        let (tx, rx) = oneshot::channel();
        self.end(payload, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(AdapterError::StreamDestroyed))
    }

    pub(crate) fn submit(
        &self,
        head: Option<ResponseHead>,
        payload: Bytes,
        end_of_stream: bool,
        callback: WriteCallback,
    ) -> Result<bool, AdapterError> {
        let (outcome, state) = {
            let mut inner = self.lock();
            inner.check_writable()?;
            inner.use_side(false, true);
            let write = PendingWrite {
                payload,
                head,
                callback,
                end_of_stream,
            };
            let outcome = inner.flush_pending(write, &self.shared);
            (outcome, inner.state)
        };
        self.shared.state_tx.send_replace(state);

        match outcome {
            Flush::Done { callback, finished } => {
                if finished {
                    self.finish_outbound();
                }
                callback(Ok(()));
                Ok(true)
            }
            Flush::Deferred => Ok(false),
        }
    }

    /// Transport entry point: the socket is writable again.
    ///
    /// Returns `false` when no write was waiting.
    pub fn on_writable(&self) -> bool {
        let waiter = {
            let mut inner = self.lock();
            let Some(waiter) = inner.drain.take() else {
                return false;
            };
            if let Some(timer) = &waiter.timer {
                timer.abort();
            }
            inner.touch();
            waiter
        };
        tracing::trace!(connection_id = %self.id(), "Write drained");
        self.guard(|| {
            if waiter.end_of_stream {
                self.finish_outbound();
            }
            (waiter.callback)(Ok(()));
        });
        true
    }

    fn on_drain_timeout(&self, generation: u64, timeout: Duration) {
        let waiter = {
            let mut inner = self.lock();
            let current = inner
                .drain
                .as_ref()
                .is_some_and(|w| w.generation == generation);
            if current {
                inner.drain.take()
            } else {
                None
            }
        };
        let Some(waiter) = waiter else {
            return;
        };
        tracing::warn!(
            connection_id = %self.id(),
            timeout_ms = timeout.as_millis() as u64,
            "Write did not drain in time, aborting connection"
        );
        metrics::record_drain_timeout();
        let error = AdapterError::DrainTimeout(timeout);
        self.teardown(Some(error.clone()), true, "drain_timeout");
        self.guard(|| (waiter.callback)(Err(error)));
    }

    fn finish_outbound(&self) {
        let (hooks, reader) = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = ConnectionState::Ended;
            inner.cancel_idle();
            let reader = if inner.reader.done || inner.reader.delivering {
                None
            } else {
                inner.reader.done = true;
                inner.reader.queue.clear();
                inner.reader.callback.take()
            };
            (std::mem::take(&mut inner.close_hooks), reader)
        };
        self.shared.state_tx.send_replace(ConnectionState::Ended);
        let event = ConnectionEvent::Finished;
        let _ = self.shared.events.send(event.clone());
        tracing::debug!(connection_id = %self.id(), "Connection finished");
        if let Some(mut reader) = reader {
            reader(None);
        }
        for hook in hooks {
            hook(&event);
        }
    }

    // ---- teardown ----------------------------------------------------------

    /// Abort the connection. Idempotent.
    pub fn abort(&self) {
        self.teardown(None, true, "explicit");
    }

    /// Transport entry point: the peer went away. The transport handle is
    /// already dead and is not touched.
    pub fn on_aborted(&self) {
        self.teardown(None, false, "peer");
    }

    /// Transport entry point: socket I/O failed.
    pub fn on_error(&self, error: std::io::Error) {
        let error = AdapterError::from(error);
        if !self.teardown(Some(error.clone()), true, "transport_error") {
            tracing::trace!(connection_id = %self.id(), error = %error, "Error after teardown ignored");
        }
    }

    /// Returns `false` when the connection was already terminal.
    fn teardown(&self, cause: Option<AdapterError>, release_transport: bool, reason: &'static str) -> bool {
        let (waiter, reader, hooks) = {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return false;
            }
            inner.conn.aborted = true;
            inner.state = ConnectionState::Aborted;
            if let Some(cause) = &cause {
                inner.conn.errored.get_or_insert_with(|| cause.clone());
            }
            inner.cancel_idle();
            let waiter = inner.drain.take().map(|w| {
                if let Some(timer) = &w.timer {
                    timer.abort();
                }
                w.callback
            });
            if release_transport && !inner.conn.writable_ended {
                inner.conn.transport.close();
            }
            let reader = if inner.reader.done || inner.reader.delivering {
                None
            } else {
                inner.reader.done = true;
                inner.reader.queue.clear();
                inner.reader.callback.take()
            };
            (waiter, reader, std::mem::take(&mut inner.close_hooks))
        };

        self.shared.state_tx.send_replace(ConnectionState::Aborted);
        if let Some(cause) = cause {
            let _ = self.shared.events.send(ConnectionEvent::Error(cause));
        }
        let event = ConnectionEvent::Aborted;
        let _ = self.shared.events.send(event.clone());
        metrics::record_abort(reason);
        tracing::debug!(connection_id = %self.id(), reason, "Connection aborted");

        if let Some(waiter) = waiter {
            waiter(Err(AdapterError::StreamDestroyed));
        }
        if let Some(mut reader) = reader {
            reader(None);
        }
        for hook in hooks {
            hook(&event);
        }
        true
    }

    /// Replace the idle timer. A zero duration disables it.
    ///
    /// The timer is re-armed by read and write activity; when it fires a
    /// [`ConnectionEvent::Timeout`] is broadcast and the connection aborts.
    pub fn set_timeout(&self, timeout: Duration) {
        let mut inner = self.lock();
        inner.cancel_idle();
        if timeout.is_zero() || inner.state.is_terminal() {
            return;
        }
        inner.touch();
        let weak = Arc::downgrade(&self.shared);
        inner.idle = self.shared.spawn(idle_loop(weak, timeout));
    }

    fn on_idle_timeout(&self, timeout: Duration) {
        {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            // This runs on the idle task itself; forget it instead of aborting.
            inner.idle = None;
        }
        tracing::debug!(
            connection_id = %self.id(),
            timeout_secs = timeout.as_secs(),
            "Connection idle timeout"
        );
        let _ = self.shared.events.send(ConnectionEvent::Timeout);
        self.teardown(None, true, "idle_timeout");
    }

    /// Run handler code invoked from a transport entry point; a panic aborts
    /// the connection instead of unwinding into the transport.
    fn guard(&self, f: impl FnOnce()) {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(f)) {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(
                connection_id = %self.id(),
                panic = %message,
                "Handler panicked inside transport callback"
            );
            // The pump that owned the read callback unwound with it.
            self.lock().reader.delivering = false;
            self.teardown(None, true, "handler_panic");
        }
    }
}

impl std::fmt::Debug for SocketAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("SocketAdapter")
            .field("connection", &inner.conn)
            .field("state", &inner.state)
            .field("write_pending", &inner.drain.is_some())
            .finish()
    }
}

async fn idle_loop(weak: Weak<Shared>, timeout: Duration) {
    loop {
        let deadline = {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let adapter = SocketAdapter { shared };
            let last = adapter.lock().last_activity;
            last + timeout
        };
        time::sleep_until(deadline).await;

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let adapter = SocketAdapter { shared };
        let expired = adapter.lock().last_activity + timeout <= Instant::now();
        if expired {
            adapter.on_idle_timeout(timeout);
            return;
        }
    }
}
