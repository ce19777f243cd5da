//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from TOML. Every section
//! carries `#[serde(default)]`, so an empty file is a valid configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Root configuration for the adapter layer.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct AdapterConfig {
    /// Listener configuration (port, capacity, TLS).
    pub listener: ListenerConfig,

    /// Drain and idle timeouts applied to every socket adapter.
    pub timeouts: TimeoutConfig,

    /// Event-stream combiner settings.
    pub events: EventStreamConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Port the transport is bound to. Also keys the shared channel registry.
    pub port: u16,

    /// Maximum concurrent connections.
    pub max_connections: usize,

    /// Optional TLS material.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            max_connections: 10_000,
            tls: None,
        }
    }
}

/// TLS material for the listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Private key (PEM).
    pub key: CertSources,

    /// Certificate chain (PEM).
    pub cert: CertSources,

    /// Optional CA bundle (PEM).
    #[serde(default)]
    pub ca: Option<CertSources>,
}

/// Where a piece of certificate material comes from.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CertSource {
    /// A file on disk, used as-is.
    Path(PathBuf),
    /// Inline PEM text, staged to a temporary file.
    Pem(String),
}

/// One source, or a list of them. Only single-element lists are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum CertSources {
    One(CertSource),
    Many(Vec<CertSource>),
}

impl CertSources {
    /// Number of sources given.
    pub fn len(&self) -> usize {
        match self {
            CertSources::One(_) => 1,
            CertSources::Many(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The source, if exactly one was given.
    pub fn single(&self) -> Option<&CertSource> {
        match self {
            CertSources::One(source) => Some(source),
            CertSources::Many(list) if list.len() == 1 => list.first(),
            CertSources::Many(_) => None,
        }
    }
}

impl From<CertSource> for CertSources {
    fn from(source: CertSource) -> Self {
        CertSources::One(source)
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on how long a write may wait for drain, in milliseconds.
    pub drain_ms: u64,

    /// Idle connection timeout in seconds (0 = disabled).
    pub idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            drain_ms: 30_000,
            idle_secs: 0,
        }
    }
}

/// Event-stream combiner configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EventStreamConfig {
    /// Events buffered before a combined write is issued.
    pub batch_events: usize,

    /// Byte ceiling of the event buffer while backpressured.
    pub max_buffer_bytes: usize,

    /// Heartbeat period in seconds for `keep_alive` (0 = disabled).
    pub heartbeat_secs: u64,
}

impl Default for EventStreamConfig {
    fn default() -> Self {
        Self {
            batch_events: 16,
            max_buffer_bytes: 1024 * 1024,
            heartbeat_secs: 15,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}
