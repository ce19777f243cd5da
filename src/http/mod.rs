//! Request/response streams over a socket adapter.
//!
//! # Data Flow
//! ```text
//! transport request callback
//!     → request.rs (snapshot head, lazy body stream)
//!     → handler
//!     → response.rs (stage status + headers, write body)
//!     → SocketAdapter write slot
//!     → transport
//! ```

pub mod headers;
pub mod request;
pub mod response;

pub use headers::{strip_crlf, HeaderSet, HeaderValue};
pub use request::{InboundStream, RequestHead};
pub use response::OutboundStream;

use crate::net::socket::SocketAdapter;
use crate::transport::RawRequest;

/// Build the stream pair for one request.
///
/// Must be called from inside the transport's request callback, while `raw`
/// is still valid.
pub fn exchange(socket: SocketAdapter, raw: &RawRequest<'_>) -> (InboundStream, OutboundStream) {
    let inbound = InboundStream::new(socket.clone(), raw);
    (inbound, OutboundStream::new(socket))
}
