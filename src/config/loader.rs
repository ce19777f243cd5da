//! Configuration loading from disk.

use std::fs;
use std::path::Path;

use crate::config::schema::AdapterConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation failed: {}", join(.0))]
    Validation(Vec<ValidationError>),
}

fn join(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<AdapterConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config = parse_config(&content)?;
    tracing::debug!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<AdapterConfig, ConfigError> {
    let config: AdapterConfig = toml::from_str(content)?;
    validate_config(&config).map_err(ConfigError::Validation)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{CertSource, LogFormat};
    use std::io::Write;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.timeouts.drain_ms, 30_000);
        assert_eq!(config.events.batch_events, 16);
        assert_eq!(config.events.max_buffer_bytes, 1024 * 1024);
        assert_eq!(config.events.heartbeat_secs, 15);
        assert!(config.listener.tls.is_none());
    }

    #[test]
    fn parses_full_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[listener]
port = 9001
max_connections = 64

[listener.tls]
key = {{ path = "/etc/bridge/key.pem" }}
cert = [{{ pem = "-----BEGIN CERTIFICATE-----" }}]

[timeouts]
drain_ms = 500
idle_secs = 30

[observability]
log_format = "json"
"#
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.listener.port, 9001);
        let tls = config.listener.tls.unwrap();
        assert_eq!(
            tls.key.single(),
            Some(&CertSource::Path("/etc/bridge/key.pem".into()))
        );
        assert!(matches!(tls.cert.single(), Some(CertSource::Pem(_))));
        assert_eq!(config.timeouts.idle_secs, 30);
        assert_eq!(config.observability.log_format, LogFormat::Json);
    }

    #[test]
    fn reports_validation_errors() {
        let err = parse_config("[timeouts]\ndrain_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref errors) if errors.len() == 1));
        assert!(err.to_string().contains("drain_ms"));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_config(Path::new("/nonexistent/bridge.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
