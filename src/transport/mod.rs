//! Transport seam.
//!
//! # Data Flow
//! ```text
//! event loop (driver)
//!     → on_data / on_writable / on_aborted   → net::socket::SocketAdapter
//!     → on_message / on_drain / on_close     → channel::Channel
//!
//! SocketAdapter ──cork(write_status, write_header, write | end)──▶ Transport
//! Channel       ──send / publish / subscribe / end──────────────▶ ChannelTransport
//! ```
//!
//! # Design Decisions
//! - The transport owns its buffers; anything it lends the adapter is only
//!   valid for the duration of the call and gets copied on receipt
//! - Every outbound byte is written inside a `cork` section
//! - Write calls report whether the data was fully flushed; a `false` is
//!   answered later by the driver calling `on_writable`
//! - Timers (drain timeout, idle timeout, heartbeats) run on a tokio runtime.
//!   A driver on a non-tokio thread passes a `Handle` through
//!   `SocketOptions::runtime`; without one the timers are not armed

pub mod memory;

/// A request/response socket as exposed by the event-loop library.
pub trait Transport: Send {
    /// Run `f` inside a corked section. Writes issued by `f` are batched and
    /// flushed together when it returns.
    fn cork(&mut self, f: &mut dyn FnMut(&mut dyn Transport));

    /// Stage the status line (`"200 OK"`).
    fn write_status(&mut self, status: &str);

    /// Stage one response header.
    fn write_header(&mut self, name: &str, value: &str);

    /// Write a body chunk. Returns `true` if it was fully flushed.
    fn write(&mut self, chunk: &[u8]) -> bool;

    /// Write the final body chunk and finish the response. Returns `true` if
    /// it was fully flushed. When no `content-length` was staged the
    /// transport frames the body itself.
    fn end(&mut self, chunk: &[u8]) -> bool;

    /// Close the underlying socket immediately.
    fn close(&mut self);
}

/// Result of a channel send, mirroring the transport's native codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStatus {
    /// Fully handed to the socket.
    Sent,
    /// Queued; completes on the next drain.
    Backpressure,
    /// Discarded because the channel is over its backpressure limit.
    Dropped,
    /// The channel is already closed.
    Closed,
}

/// An upgraded, message-oriented socket.
pub trait ChannelTransport: Send {
    /// Run `f` inside a corked section.
    fn cork(&mut self, f: &mut dyn FnMut(&mut dyn ChannelTransport));

    fn send(&mut self, message: &[u8], binary: bool) -> SendStatus;

    /// Publish to every subscriber of `topic` except this channel.
    fn publish(&mut self, topic: &[u8], message: &[u8], binary: bool) -> bool;

    fn subscribe(&mut self, topic: &[u8]) -> bool;

    fn unsubscribe(&mut self, topic: &[u8]) -> bool;

    fn is_subscribed(&self, topic: &[u8]) -> bool;

    fn topics(&self) -> Vec<Vec<u8>>;

    fn ping(&mut self, message: &[u8]) -> SendStatus;

    /// Bytes queued but not yet written to the socket.
    fn buffered_amount(&self) -> usize;

    /// Graceful close with a close frame.
    fn end(&mut self, code: u16, reason: &[u8]);

    /// Immediate close without a close frame.
    fn close(&mut self);
}

/// Server-wide publish primitive of the transport.
pub trait PubSub: Send + Sync {
    fn publish(&self, topic: &[u8], message: &[u8], binary: bool) -> bool;

    fn subscriber_count(&self, topic: &[u8]) -> usize;
}

/// Request metadata as lent by the transport during the request callback.
///
/// Borrowed from transport memory; see [`RequestHead::snapshot`](crate::http::request::RequestHead::snapshot).
#[derive(Debug, Clone, Copy)]
pub struct RawRequest<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a [(&'a str, &'a [u8])],
}
