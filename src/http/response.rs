//! Outbound side of a request.
//!
//! # Responsibilities
//! - Stage status and headers until the first flush, then freeze them
//! - Sanitize the reason phrase and every header against CRLF injection
//! - Proxy body bytes to the socket adapter's single write slot
//! - Relay a pre-formatted upstream status/header block
//!
//! # Design Decisions
//! - Status line and headers are written in the same cork as the first body
//!   chunk
//! - When the first write is exactly the declared `content-length`, it is
//!   issued as the final write; a later `end()` just waits for it
//! - Writing after the response has finished is rejected

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use http::StatusCode;
use tokio::sync::oneshot;

use crate::error::AdapterError;
use crate::http::headers::{strip_crlf, HeaderSet, HeaderValue};
use crate::net::connection::ConnectionState;
use crate::net::socket::{ResponseHead, SocketAdapter, WriteCallback};

struct ResponseState {
    status: u16,
    reason: Option<String>,
    headers: HeaderSet,
    head_sent: bool,
    wrote_body: bool,
    finished: bool,
    final_outcome: Option<Result<(), AdapterError>>,
    end_waiters: Vec<WriteCallback>,
}

struct WriteCallbackList<'a>(&'a [WriteCallback]);

impl std::fmt::Debug for WriteCallbackList<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} waiters", self.0.len())
    }
}

impl ResponseState {
    fn declared_length(&self) -> Option<u64> {
        self.headers
            .get_str("content-length")
            .and_then(|v| v.trim().parse().ok())
    }

    fn head(&mut self) -> Option<ResponseHead> {
        self.headers.freeze();
        if self.head_sent {
            return None;
        }
        Some(ResponseHead {
            status: status_line(self.status, self.reason.as_deref()),
            headers: self.headers.lines(),
        })
    }

    fn ensure_mutable(&self) -> Result<(), AdapterError> {
        if self.head_sent || self.headers.is_frozen() {
            Err(AdapterError::HeadersSent)
        } else {
            Ok(())
        }
    }
}

/// Render `"<code> <reason>"`, defaulting to the canonical reason phrase.
pub fn status_line(code: u16, reason: Option<&str>) -> String {
    let reason = match reason {
        Some(r) => strip_crlf(r).into_owned(),
        None => StatusCode::from_u16(code)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("")
            .to_string(),
    };
    if reason.is_empty() {
        code.to_string()
    } else {
        format!("{code} {reason}")
    }
}

/// Response writer over a [`SocketAdapter`].
///
/// Clones share the same staged state.
#[derive(Clone)]
pub struct OutboundStream {
    socket: SocketAdapter,
    state: Arc<Mutex<ResponseState>>,
}

impl OutboundStream {
    pub fn new(socket: SocketAdapter) -> Self {
        socket.attach(false, true);
        Self {
            socket,
            state: Arc::new(Mutex::new(ResponseState {
                status: 200,
                reason: None,
                headers: HeaderSet::new(),
                head_sent: false,
                wrote_body: false,
                finished: false,
                final_outcome: None,
                end_waiters: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ResponseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn socket(&self) -> &SocketAdapter {
        &self.socket
    }

    pub fn set_status(&self, code: u16, reason: Option<&str>) -> Result<(), AdapterError> {
        let mut state = self.lock();
        state.ensure_mutable()?;
        state.status = code;
        state.reason = reason.map(|r| strip_crlf(r).into_owned());
        Ok(())
    }

    pub fn status(&self) -> u16 {
        self.lock().status
    }

    pub fn set_header(&self, name: &str, value: impl Into<HeaderValue>) -> Result<(), AdapterError> {
        let mut state = self.lock();
        state.ensure_mutable()?;
        state.headers.set(name, value)
    }

    pub fn append_header(&self, name: &str, value: impl Into<HeaderValue>) -> Result<(), AdapterError> {
        let mut state = self.lock();
        state.ensure_mutable()?;
        state.headers.append(name, value)
    }

    pub fn remove_header(&self, name: &str) -> Result<Option<HeaderValue>, AdapterError> {
        let mut state = self.lock();
        state.ensure_mutable()?;
        state.headers.remove(name)
    }

    pub fn header(&self, name: &str) -> Option<HeaderValue> {
        self.lock().headers.get(name).cloned()
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.lock().headers.contains(name)
    }

    /// Whether status and headers have been flushed.
    pub fn headers_sent(&self) -> bool {
        self.lock().head_sent
    }

    pub fn is_finished(&self) -> bool {
        self.lock().finished
    }

    /// Send status and headers now, without body bytes.
    pub fn flush_headers(&self) -> Result<(), AdapterError> {
        let Some(head) = self.lock().head() else {
            return Ok(());
        };
        self.socket
            .submit(Some(head), Bytes::new(), false, Box::new(|_| {}))?;
        self.lock().head_sent = true;
        Ok(())
    }

    /// Write a body chunk. Returns `Ok(true)` if the caller may keep writing
    /// without waiting for the callback.
    pub fn write(
        &self,
        chunk: impl Into<Bytes>,
        callback: impl FnOnce(Result<(), AdapterError>) + Send + 'static,
    ) -> Result<bool, AdapterError> {
        let chunk = chunk.into();
        let (head, final_write, wrote_body) = {
            let mut state = self.lock();
            if state.finished {
                return Err(AdapterError::WriteAfterEnd);
            }
            let wrote_body = state.wrote_body;
            let final_write = !wrote_body && state.declared_length() == Some(chunk.len() as u64);
            state.wrote_body = true;
            if final_write {
                state.finished = true;
            }
            (state.head(), final_write, wrote_body)
        };
        let result = if final_write {
            tracing::trace!(
                connection_id = %self.socket.id(),
                bytes = chunk.len(),
                "Body matches content-length, finishing on first write"
            );
            let callback = self.final_callback(Box::new(callback));
            self.submit(head, chunk, true, callback)
        } else {
            self.submit(head, chunk, false, Box::new(callback))
        };
        if let Err(error) = &result {
            self.write_failed(error, wrote_body, final_write);
        }
        result
    }

    /// Finish the response with an optional last chunk.
    ///
    /// After the response already finished this waits for the final write's
    /// outcome instead of writing again.
    ///
    /// On an ended or aborted connection this is a no-op: the callback runs
    /// with the terminal outcome and no error is returned.
    pub fn end(
        &self,
        chunk: Option<Bytes>,
        callback: impl FnOnce(Result<(), AdapterError>) + Send + 'static,
    ) -> Result<bool, AdapterError> {
        let (head, wrote_body) = {
            let mut state = self.lock();
            if !state.finished {
                let terminal = match self.socket.state() {
                    ConnectionState::Ended => Some(Ok(())),
                    ConnectionState::Aborted => Some(Err(AdapterError::StreamDestroyed)),
                    _ => None,
                };
                if let Some(outcome) = terminal {
                    state.finished = true;
                    state.final_outcome = Some(outcome);
                }
            }
            if state.finished {
                match state.final_outcome.clone() {
                    Some(outcome) => {
                        drop(state);
                        let ok = outcome.is_ok();
                        callback(outcome);
                        return Ok(ok);
                    }
                    None => {
                        state.end_waiters.push(Box::new(callback));
                        return Ok(false);
                    }
                }
            }
            let wrote_body = state.wrote_body;
            state.finished = true;
            state.wrote_body = true;
            (state.head(), wrote_body)
        };
        let callback = self.final_callback(Box::new(callback));
        let result = self.submit(head, chunk.unwrap_or_default(), true, callback);
        if let Err(error) = &result {
            self.write_failed(error, wrote_body, true);
        }
        result
    }

    pub async fn write_all(&self, chunk: impl Into<Bytes>) -> Result<(), AdapterError> {
        let (tx, rx) = oneshot::channel();
        self.write(chunk, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(AdapterError::StreamDestroyed))
    }

    pub async fn finish(&self, chunk: Option<Bytes>) -> Result<(), AdapterError> {
        let (tx, rx) = oneshot::channel();
        self.end(chunk, move |result| {
            let _ = tx.send(result);
        })?;
        rx.await.unwrap_or(Err(AdapterError::StreamDestroyed))
    }

    /// Relay a raw `HTTP/x.y <code> <reason>` block with headers and body,
    /// as produced by an upstream client-error path. `content-length` is
    /// dropped; the transport frames the body itself.
    pub fn relay_raw(
        &self,
        block: &[u8],
        callback: impl FnOnce(Result<(), AdapterError>) + Send + 'static,
    ) -> Result<bool, AdapterError> {
        let relay = RawResponse::parse(block)?;
        self.set_status(relay.status, relay.reason.as_deref())?;
        for (name, value) in &relay.headers {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            self.append_header(name, value.as_str())?;
        }
        self.end(Some(relay.body), callback)
    }

    fn submit(
        &self,
        head: Option<ResponseHead>,
        chunk: Bytes,
        end_of_stream: bool,
        callback: WriteCallback,
    ) -> Result<bool, AdapterError> {
        let had_head = head.is_some();
        let result = self.socket.submit(head, chunk, end_of_stream, callback);
        if had_head && result.is_ok() {
            self.lock().head_sent = true;
        }
        result
    }

    /// Undo the bookkeeping of a write the socket refused. A refused final
    /// write on a dead connection settles the response with that error so
    /// later `end()` calls do not wait for it.
    fn write_failed(&self, error: &AdapterError, wrote_body: bool, final_write: bool) {
        let waiters = {
            let mut state = self.lock();
            if final_write && self.socket.state().is_terminal() {
                state.final_outcome = Some(Err(error.clone()));
                std::mem::take(&mut state.end_waiters)
            } else {
                state.wrote_body = wrote_body;
                if final_write {
                    state.finished = false;
                }
                Vec::new()
            }
        };
        for waiter in waiters {
            waiter(Err(error.clone()));
        }
    }

    /// Wrap the final write's callback so later `end()` calls observe its
    /// outcome.
    fn final_callback(&self, callback: WriteCallback) -> WriteCallback {
        let state = Arc::clone(&self.state);
        Box::new(move |result: Result<(), AdapterError>| {
            callback(result.clone());
            let waiters = {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                state.final_outcome = Some(result.clone());
                std::mem::take(&mut state.end_waiters)
            };
            for waiter in waiters {
                waiter(result.clone());
            }
        })
    }
}

impl std::fmt::Debug for OutboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("OutboundStream")
            .field("connection_id", &self.socket.id())
            .field("status", &state.status)
            .field("headers", &state.headers)
            .field("head_sent", &state.head_sent)
            .field("finished", &state.finished)
            .field("end_waiters", &WriteCallbackList(&state.end_waiters))
            .finish()
    }
}

/// A parsed upstream status/header block.
#[derive(Debug)]
struct RawResponse {
    status: u16,
    reason: Option<String>,
    headers: Vec<(String, String)>,
    body: Bytes,
}

impl RawResponse {
    fn parse(block: &[u8]) -> Result<Self, AdapterError> {
        let (head, body) = match find(block, b"\r\n\r\n") {
            Some(i) => (&block[..i], &block[i + 4..]),
            None => match find(block, b"\n\n") {
                Some(i) => (&block[..i], &block[i + 2..]),
                None => (block, &[][..]),
            },
        };
        let head = std::str::from_utf8(head)
            .map_err(|_| AdapterError::MalformedRelay("status block is not UTF-8"))?;
        let mut lines = head.lines();

        let status_line = lines
            .next()
            .ok_or(AdapterError::MalformedRelay("missing status line"))?;
        let mut parts = status_line.splitn(3, ' ');
        let version = parts.next().unwrap_or_default();
        if !version.starts_with("HTTP/") {
            return Err(AdapterError::MalformedRelay("missing HTTP version"));
        }
        let status = parts
            .next()
            .and_then(|c| c.parse::<u16>().ok())
            .filter(|c| (100..=999).contains(c))
            .ok_or(AdapterError::MalformedRelay("invalid status code"))?;
        let reason = parts
            .next()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(str::to_string);

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                continue;
            }
            let (name, value) = line
                .split_once(':')
                .ok_or(AdapterError::MalformedRelay("header line without colon"))?;
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }

        Ok(Self {
            status,
            reason,
            headers,
            body: Bytes::copy_from_slice(body),
        })
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
