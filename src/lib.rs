//! Adapter layer between a corked, callback-driven socket transport and
//! async request/response, upgraded-channel and event-stream APIs.
//!
//! # Data Flow
//! ```text
//! transport callbacks
//!     → net::listener (accept, capacity, registry lease)
//!     → net::socket (single write slot, drain, timeouts)
//!     → http (inbound/outbound streams) | sse (event combiner) | channel
//! ```

pub mod channel;
pub mod config;
pub mod error;
pub mod http;
pub mod net;
pub mod observability;
pub mod sse;
pub mod transport;

pub use channel::{Channel, ChannelEvent, ChannelRegistry, ChannelStream, PortRegistry, Topic};
pub use config::schema::AdapterConfig;
pub use error::AdapterError;
pub use http::{InboundStream, OutboundStream, RequestHead};
pub use net::{Listener, ListenerError, SocketAdapter};
pub use sse::{EventStream, SseMessage};
pub use transport::{ChannelTransport, PubSub, RawRequest, SendStatus, Transport};
