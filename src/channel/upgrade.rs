//! Upgrade request validation.
//!
//! Only the credentials are checked here; the handshake response itself is
//! produced by the transport.

use crate::http::request::RequestHead;

/// A malformed or missing upgrade credential.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpgradeError {
    #[error("invalid upgrade request: {0}")]
    InvalidUpgrade(&'static str),
}

/// Validated upgrade credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub key: String,
    pub protocols: Vec<String>,
    pub extensions: Option<String>,
}

impl UpgradeRequest {
    /// Check the request line and upgrade headers.
    pub fn validate(head: &RequestHead) -> Result<Self, UpgradeError> {
        if !head.method().eq_ignore_ascii_case("GET") {
            return Err(UpgradeError::InvalidUpgrade("method must be GET"));
        }
        let upgrade = head
            .header("upgrade")
            .ok_or(UpgradeError::InvalidUpgrade("missing upgrade header"))?;
        if !has_token(upgrade, "websocket") {
            return Err(UpgradeError::InvalidUpgrade("upgrade is not websocket"));
        }
        let connection = head
            .header("connection")
            .ok_or(UpgradeError::InvalidUpgrade("missing connection header"))?;
        if !has_token(connection, "upgrade") {
            return Err(UpgradeError::InvalidUpgrade("connection does not request upgrade"));
        }
        let key = head
            .header("sec-websocket-key")
            .map(str::trim)
            .ok_or(UpgradeError::InvalidUpgrade("missing sec-websocket-key"))?;
        if !is_valid_key(key) {
            return Err(UpgradeError::InvalidUpgrade("malformed sec-websocket-key"));
        }
        match head.header("sec-websocket-version").map(str::trim) {
            Some("13") => {}
            Some(_) => return Err(UpgradeError::InvalidUpgrade("unsupported version")),
            None => return Err(UpgradeError::InvalidUpgrade("missing sec-websocket-version")),
        }

        let protocols = head
            .header("sec-websocket-protocol")
            .map(|p| {
                p.split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let extensions = head
            .header("sec-websocket-extensions")
            .map(str::to_string);

        Ok(Self {
            key: key.to_string(),
            protocols,
            extensions,
        })
    }
}

fn has_token(value: &str, token: &str) -> bool {
    value
        .split(',')
        .any(|part| part.trim().eq_ignore_ascii_case(token))
}

/// 16 random bytes, base64 encoded: 22 alphabet characters and `==`.
fn is_valid_key(key: &str) -> bool {
    let bytes = key.as_bytes();
    bytes.len() == 24
        && bytes.ends_with(b"==")
        && bytes[..22]
            .iter()
            .all(|b| b.is_ascii_alphanumeric() || *b == b'+' || *b == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RawRequest;

    fn head(headers: &[(&str, &str)]) -> RequestHead {
        let headers: Vec<(&str, &[u8])> = headers
            .iter()
            .map(|(name, value)| (*name, value.as_bytes()))
            .collect();
        RequestHead::snapshot(&RawRequest {
            method: "GET",
            path: "/ws",
            query: None,
            headers: &headers,
        })
    }

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    #[test]
    fn accepts_valid_request() {
        let req = UpgradeRequest::validate(&head(&[
            ("Upgrade", "websocket"),
            ("Connection", "keep-alive, Upgrade"),
            ("Sec-WebSocket-Key", KEY),
            ("Sec-WebSocket-Version", "13"),
            ("Sec-WebSocket-Protocol", "chat, superchat"),
        ]))
        .unwrap();
        assert_eq!(req.key, KEY);
        assert_eq!(req.protocols, vec!["chat", "superchat"]);
    }

    #[test]
    fn rejects_bad_credentials() {
        let cases: [&[(&str, &str)]; 4] = [
            &[("Connection", "upgrade"), ("Sec-WebSocket-Key", KEY), ("Sec-WebSocket-Version", "13")],
            &[("Upgrade", "websocket"), ("Connection", "upgrade"), ("Sec-WebSocket-Key", "short"), ("Sec-WebSocket-Version", "13")],
            &[("Upgrade", "websocket"), ("Connection", "upgrade"), ("Sec-WebSocket-Key", KEY), ("Sec-WebSocket-Version", "8")],
            &[("Upgrade", "websocket"), ("Connection", "close"), ("Sec-WebSocket-Key", KEY), ("Sec-WebSocket-Version", "13")],
        ];
        for headers in cases {
            assert!(matches!(
                UpgradeRequest::validate(&head(headers)),
                Err(UpgradeError::InvalidUpgrade(_))
            ));
        }
    }
}
