//! Inbound side of a request.
//!
//! # Responsibilities
//! - Snapshot request metadata while the transport still owns it
//! - Expose the body as a lazy, single-consumption stream of chunks
//!
//! # Design Decisions
//! - Metadata is copied at construction; nothing reads transport memory
//!   after the request callback returns
//! - Reading starts on first poll, not on construction
//! - Connection teardown ends the stream (with the recorded error, if any)

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;

use crate::error::AdapterError;
use crate::net::socket::SocketAdapter;
use crate::transport::RawRequest;

/// Owned copy of the request line and headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    method: String,
    url: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    /// Copy everything out of transport-owned request memory.
    pub fn snapshot(raw: &RawRequest<'_>) -> Self {
        let url = match raw.query {
            Some(q) if !q.is_empty() => format!("{}?{}", raw.path, q),
            _ => raw.path.to_string(),
        };
        Self {
            method: raw.method.to_ascii_uppercase(),
            url,
            headers: raw
                .headers
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_ascii_lowercase(),
                        String::from_utf8_lossy(value).into_owned(),
                    )
                })
                .collect(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    /// Path plus query string.
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn path(&self) -> &str {
        self.url.split_once('?').map_or(&self.url, |(p, _)| p)
    }

    pub fn query(&self) -> Option<&str> {
        self.url.split_once('?').map(|(_, q)| q)
    }

    /// First value of a header, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }
}

/// Request body as a stream of owned chunks.
pub struct InboundStream {
    head: Arc<RequestHead>,
    socket: SocketAdapter,
    rx: Option<mpsc::UnboundedReceiver<Option<Bytes>>>,
    done: bool,
}

impl InboundStream {
    pub fn new(socket: SocketAdapter, raw: &RawRequest<'_>) -> Self {
        Self::with_head(socket, Arc::new(RequestHead::snapshot(raw)))
    }

    pub(crate) fn with_head(socket: SocketAdapter, head: Arc<RequestHead>) -> Self {
        Self {
            head,
            socket,
            rx: None,
            done: false,
        }
    }

    pub fn head(&self) -> &RequestHead {
        &self.head
    }

    /// Shared handle to the snapshot.
    pub fn head_arc(&self) -> Arc<RequestHead> {
        Arc::clone(&self.head)
    }

    /// Buffer the whole body, failing once it grows past `limit` bytes.
    pub async fn collect(mut self, limit: usize) -> Result<Bytes, AdapterError> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            if body.len() + chunk.len() > limit {
                return Err(AdapterError::BodyTooLarge(limit));
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

impl Stream for InboundStream {
    type Item = Result<Bytes, AdapterError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        let rx = this.rx.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            this.socket.read(move |chunk| {
                let _ = tx.send(chunk);
            });
            rx
        });
        match rx.poll_recv(cx) {
            Poll::Ready(Some(Some(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(None)) | Poll::Ready(None) => {
                this.done = true;
                match this.socket.error() {
                    Some(err) => Poll::Ready(Some(Err(err))),
                    None => Poll::Ready(None),
                }
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl std::fmt::Debug for InboundStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundStream")
            .field("head", &self.head)
            .field("connection_id", &self.socket.id())
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::socket::SocketOptions;
    use crate::transport::memory::MemoryTransport;

    fn raw<'a>(headers: &'a [(&'a str, &'a [u8])]) -> RawRequest<'a> {
        RawRequest {
            method: "post",
            path: "/upload",
            query: Some("a=1"),
            headers,
        }
    }

    #[test]
    fn snapshot_owns_metadata() {
        let mut value = b"text/plain".to_vec();
        let head = {
            let headers = [("Content-Type", value.as_slice())];
            RequestHead::snapshot(&raw(&headers))
        };
        value.fill(b'X');

        assert_eq!(head.method(), "POST");
        assert_eq!(head.url(), "/upload?a=1");
        assert_eq!(head.path(), "/upload");
        assert_eq!(head.query(), Some("a=1"));
        assert_eq!(head.header("content-type"), Some("text/plain"));
    }

    #[tokio::test]
    async fn streams_chunks_then_ends() {
        let (transport, _peer) = MemoryTransport::pair();
        let socket = SocketAdapter::new(Box::new(transport), SocketOptions::default());
        let stream = InboundStream::new(socket.clone(), &raw(&[]));

        socket.on_data(b"hello ", false);
        socket.on_data(b"world", true);
        assert_eq!(stream.collect(1024).await.unwrap(), Bytes::from_static(b"hello world"));
    }

    #[tokio::test]
    async fn limit_is_enforced() {
        let (transport, _peer) = MemoryTransport::pair();
        let socket = SocketAdapter::new(Box::new(transport), SocketOptions::default());
        let stream = InboundStream::new(socket.clone(), &raw(&[]));
        socket.on_data(&[0u8; 16], true);
        assert!(matches!(stream.collect(8).await, Err(AdapterError::BodyTooLarge(8))));
    }

    #[tokio::test]
    async fn pending_pull_resolves_on_transport_error() {
        let (transport, _peer) = MemoryTransport::pair();
        let socket = SocketAdapter::new(Box::new(transport), SocketOptions::default());
        let mut stream = InboundStream::new(socket.clone(), &raw(&[]));

        let pull = tokio::spawn(async move { stream.next().await });
        tokio::task::yield_now().await;
        socket.on_error(std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset"));

        let item = pull.await.unwrap();
        assert!(matches!(item, Some(Err(AdapterError::Transport(_)))));
    }
}
