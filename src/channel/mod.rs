//! Upgraded, message-oriented connections.
//!
//! # Data Flow
//! ```text
//! upgrade request
//!     → upgrade.rs (validate credentials)
//!     → registry.rs (ChannelRegistry::open, per-port lease)
//!     → entry.rs (Channel: ended guard, topics, owned payloads)
//!     → stream.rs (ChannelStream: async sends, inbound Stream)
//! ```

pub mod entry;
pub mod registry;
pub mod stream;
pub mod topic;
pub mod upgrade;

pub use entry::{Channel, ChannelEvent, ChannelId};
pub use registry::{ChannelRegistry, PortRegistry, RegistryLease};
pub use stream::ChannelStream;
pub use topic::{IntoTopic, Topic};
pub use upgrade::{UpgradeError, UpgradeRequest};

/// Failure of an awaited channel send.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The transport discarded the message: over its backpressure limit.
    #[error("message dropped: channel over backpressure limit")]
    Dropped,

    /// The channel was closed before the message was sent.
    #[error("channel closed")]
    Closed,

    /// The inbound stream was already taken by another consumer.
    #[error("channel stream already taken")]
    StreamTaken,
}
