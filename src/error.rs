//! Error taxonomy shared by the socket adapter and its views.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Errors raised by [`SocketAdapter`](crate::net::socket::SocketAdapter),
/// the request/response streams and the event writer.
///
/// `Clone` so a single failure can be handed to every waiter sharing a drain.
#[derive(Debug, Clone, Error)]
pub enum AdapterError {
    /// I/O failure reported by the underlying socket.
    #[error("transport error: {0}")]
    Transport(Arc<std::io::Error>),

    /// Operation attempted on an aborted connection.
    #[error("stream destroyed")]
    StreamDestroyed,

    /// A write did not drain within its deadline.
    #[error("write did not drain within {0:?}")]
    DrainTimeout(Duration),

    /// The event buffer ceiling was exceeded while backpressured.
    #[error("event buffer overflow: {attempted} bytes exceeds limit of {limit}")]
    BufferOverflow { limit: usize, attempted: usize },

    /// A write was issued while the previous one was still waiting to drain.
    #[error("write issued before the previous write drained")]
    WriteBeforeDrain,

    /// A write was issued after the outbound side had already ended.
    #[error("write after end")]
    WriteAfterEnd,

    /// Status or headers were mutated after they were flushed.
    #[error("headers already sent")]
    HeadersSent,

    /// An upstream raw response block could not be parsed.
    #[error("malformed raw response: {0}")]
    MalformedRelay(&'static str),

    /// The inbound body exceeded the caller's limit.
    #[error("body exceeds limit of {0} bytes")]
    BodyTooLarge(usize),

    /// The event stream's peer is gone.
    #[error("event stream disconnected")]
    Disconnected,
}

impl AdapterError {
    /// Whether this error leaves the connection unusable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            AdapterError::Transport(_)
                | AdapterError::StreamDestroyed
                | AdapterError::DrainTimeout(_)
                | AdapterError::BufferOverflow { .. }
                | AdapterError::Disconnected
        )
    }
}

impl From<std::io::Error> for AdapterError {
    fn from(e: std::io::Error) -> Self {
        AdapterError::Transport(Arc::new(e))
    }
}
