//! TLS certificate material resolution.
//!
//! # Responsibilities
//! - Turn configured key/cert/ca sources into file paths for the transport
//! - Validate PEM content before the transport ever sees it
//! - Stage inline PEM into single-use temporary files (mode 0600)
//!
//! # Design Decisions
//! - Staged files live exactly as long as the [`CertMaterial`] that owns
//!   them; dropping it deletes them on every path
//! - Multi-valued sources are rejected rather than silently truncated

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::{NamedTempFile, TempPath};

use crate::config::schema::{CertSource, CertSources, TlsConfig};

/// Error type for certificate material resolution.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("{field}: {count} values given, only one is supported")]
    MultiValueUnsupported { field: &'static str, count: usize },

    #[error("{field}: no source given")]
    Missing { field: &'static str },

    #[error("{field}: file not found: {}", path.display())]
    NotFound { field: &'static str, path: PathBuf },

    #[error("{field}: invalid PEM: {reason}")]
    InvalidPem { field: &'static str, reason: String },

    #[error("{field}: failed to read or stage material: {source}")]
    Io {
        field: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Key,
    Cert,
    Ca,
}

impl Kind {
    fn field(self) -> &'static str {
        match self {
            Kind::Key => "tls.key",
            Kind::Cert => "tls.cert",
            Kind::Ca => "tls.ca",
        }
    }
}

/// File paths handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub key: PathBuf,
    pub cert: PathBuf,
    pub ca: Option<PathBuf>,
}

/// Resolved material. Owns any staged temporary files.
#[derive(Debug)]
pub struct CertMaterial {
    paths: CertPaths,
    staged: Vec<TempPath>,
}

impl CertMaterial {
    pub fn paths(&self) -> &CertPaths {
        &self.paths
    }

    /// Paths of files staged from inline PEM.
    pub fn staged_files(&self) -> Vec<&Path> {
        self.staged.iter().map(|p| &**p).collect()
    }
}

/// Resolve key, cert and optional CA into file paths.
pub fn resolve_cert_material(config: &TlsConfig) -> Result<CertMaterial, TlsError> {
    let mut staged = Vec::new();
    let key = resolve(Kind::Key, &config.key, &mut staged)?;
    let cert = resolve(Kind::Cert, &config.cert, &mut staged)?;
    let ca = config
        .ca
        .as_ref()
        .map(|ca| resolve(Kind::Ca, ca, &mut staged))
        .transpose()?;

    tracing::debug!(
        key = %key.display(),
        cert = %cert.display(),
        staged = staged.len(),
        "TLS material resolved"
    );
    Ok(CertMaterial {
        paths: CertPaths { key, cert, ca },
        staged,
    })
}

fn resolve(kind: Kind, sources: &CertSources, staged: &mut Vec<TempPath>) -> Result<PathBuf, TlsError> {
    let field = kind.field();
    let source = match sources.len() {
        0 => return Err(TlsError::Missing { field }),
        1 => sources.single().ok_or(TlsError::Missing { field })?,
        count => return Err(TlsError::MultiValueUnsupported { field, count }),
    };

    match source {
        CertSource::Path(path) => {
            if !path.exists() {
                return Err(TlsError::NotFound {
                    field,
                    path: path.clone(),
                });
            }
            let pem = fs::read(path).map_err(|source| TlsError::Io { field, source })?;
            validate_pem(kind, &pem)?;
            Ok(path.clone())
        }
        CertSource::Pem(pem) => {
            validate_pem(kind, pem.as_bytes())?;
            let temp = stage(pem.as_bytes()).map_err(|source| TlsError::Io { field, source })?;
            let path = temp.to_path_buf();
            staged.push(temp);
            Ok(path)
        }
    }
}

/// Write `pem` to a fresh temporary file. `NamedTempFile` creates it with
/// owner-only permissions.
fn stage(pem: &[u8]) -> std::io::Result<TempPath> {
    let mut file = NamedTempFile::with_prefix("socket-bridge-")?;
    file.write_all(pem)?;
    file.flush()?;
    Ok(file.into_temp_path())
}

fn validate_pem(kind: Kind, pem: &[u8]) -> Result<(), TlsError> {
    let field = kind.field();
    let invalid = |reason: String| TlsError::InvalidPem { field, reason };
    let mut reader = pem;
    match kind {
        Kind::Key => {
            rustls_pemfile::private_key(&mut reader)
                .map_err(|e| invalid(e.to_string()))?
                .ok_or_else(|| invalid("no private key found".to_string()))?;
        }
        Kind::Cert | Kind::Ca => {
            let certs = rustls_pemfile::certs(&mut reader)
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| invalid(e.to_string()))?;
            if certs.is_empty() {
                return Err(invalid("no certificate found".to_string()));
            }
        }
    }
    Ok(())
}
