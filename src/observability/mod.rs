//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! socket adapter, streams, channels, event combiner
//!     → tracing events (connection_id, bytes, reason)
//!     → logging.rs (EnvFilter + fmt layer)
//!
//!     → metrics.rs (counters, gauges via the `metrics` facade)
//!     → whatever recorder the embedding application installs
//! ```
//!
//! # Design Decisions
//! - The crate never installs a metrics exporter; without a recorder the
//!   facade calls are no-ops
//! - Log initialization is opt-in for embedding applications

pub mod logging;
pub mod metrics;
