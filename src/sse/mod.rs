//! Server-sent event streams.
//!
//! # Data Flow
//! ```text
//! handler
//!     → event.rs (SseMessage → text frame)
//!     → stream.rs (EventStream: buffer, batch, backpressure, heartbeat)
//!     → OutboundStream → SocketAdapter
//! ```

pub mod event;
pub mod stream;

pub use event::{EventData, SseMessage, HEARTBEAT_FRAME};
pub use stream::{Delivery, EventStream, EventStreamOptions, FIXED_HEADERS};
