//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Transport accepts a socket
//!     → listener.rs (capacity check, registry lease, TLS material)
//!     → socket.rs (drain/backpressure/timeout state machine)
//!     → connection.rs (transport handle, flags, live-connection tracking)
//!     → Hand off to the HTTP, event-stream or channel layer
//!
//! Connection States:
//!     Opening → { ReadOnly | WriteOnly | Open } → { Ended | Aborted }
//! ```
//!
//! # Design Decisions
//! - Each connection tracked so the listener can wait for idle
//! - The transport is touched only through the socket adapter
//! - TLS is optional; the listener only resolves material for the transport

pub mod connection;
pub mod listener;
pub mod socket;
pub mod tls;

pub use connection::{ConnectionId, ConnectionState, ConnectionTracker};
pub use listener::{Listener, ListenerError};
pub use socket::{ConnectionEvent, SocketAdapter, SocketOptions};
pub use tls::{resolve_cert_material, CertMaterial, CertPaths, TlsError};
