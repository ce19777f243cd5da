//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (drain timeout > 0, batch threshold >= 1)
//! - Reject multi-valued certificate sources
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: AdapterConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use crate::config::schema::{AdapterConfig, CertSources, TlsConfig};
use crate::sse::event::HEARTBEAT_FRAME;

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("{field}: {count} values given, only one is supported")]
    MultiValueUnsupported { field: &'static str, count: usize },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ValidationError {
    ValidationError::InvalidValue {
        field,
        reason: reason.into(),
    }
}

/// Validate a configuration, collecting every violation.
pub fn validate_config(config: &AdapterConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.max_connections == 0 {
        errors.push(invalid("listener.max_connections", "must be greater than 0"));
    }
    if let Some(tls) = &config.listener.tls {
        validate_tls(tls, &mut errors);
    }

    if config.timeouts.drain_ms == 0 {
        errors.push(invalid("timeouts.drain_ms", "must be greater than 0"));
    }

    if config.events.batch_events == 0 {
        errors.push(invalid("events.batch_events", "must be at least 1"));
    }
    if config.events.max_buffer_bytes < HEARTBEAT_FRAME.len() {
        errors.push(invalid(
            "events.max_buffer_bytes",
            format!("must hold at least one heartbeat ({} bytes)", HEARTBEAT_FRAME.len()),
        ));
    }

    let level = config.observability.log_level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        errors.push(invalid(
            "observability.log_level",
            format!("unknown level '{}'", config.observability.log_level),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_tls(tls: &TlsConfig, errors: &mut Vec<ValidationError>) {
    check_sources("listener.tls.key", Some(&tls.key), errors);
    check_sources("listener.tls.cert", Some(&tls.cert), errors);
    check_sources("listener.tls.ca", tls.ca.as_ref(), errors);
}

fn check_sources(field: &'static str, sources: Option<&CertSources>, errors: &mut Vec<ValidationError>) {
    let Some(sources) = sources else {
        return;
    };
    match sources.len() {
        0 => errors.push(invalid(field, "empty list")),
        1 => {}
        count => errors.push(ValidationError::MultiValueUnsupported { field, count }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::CertSource;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&AdapterConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = AdapterConfig::default();
        config.listener.max_connections = 0;
        config.timeouts.drain_ms = 0;
        config.events.batch_events = 0;
        config.events.max_buffer_bytes = 1;
        config.observability.log_level = "loud".into();

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 5);
    }

    #[test]
    fn multi_valued_tls_source_is_rejected() {
        let mut config = AdapterConfig::default();
        config.listener.tls = Some(TlsConfig {
            key: CertSource::Path("a.pem".into()).into(),
            cert: CertSources::Many(vec![
                CertSource::Path("b.pem".into()),
                CertSource::Path("c.pem".into()),
            ]),
            ca: None,
        });

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(
            errors,
            vec![ValidationError::MultiValueUnsupported {
                field: "listener.tls.cert",
                count: 2
            }]
        );
    }
}
