//! Response header staging.
//!
//! # Responsibilities
//! - Keep headers in insertion order, keyed by lower-cased name
//! - Strip CR and LF from every name and value before it is stored
//! - Refuse mutation once the set has been flushed
//!
//! # Design Decisions
//! - Sanitization happens on insertion, so nothing unsanitized is ever held
//! - Multi-value headers are emitted as one header line per value

use std::borrow::Cow;

use crate::error::AdapterError;

/// Remove carriage returns and line feeds.
pub fn strip_crlf(input: &str) -> Cow<'_, str> {
    if input.contains(['\r', '\n']) {
        Cow::Owned(input.chars().filter(|c| !matches!(c, '\r' | '\n')).collect())
    } else {
        Cow::Borrowed(input)
    }
}

/// A header value: one string or a list emitted as repeated lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    Single(String),
    Multi(Vec<String>),
}

impl HeaderValue {
    pub fn is_multi_value(&self) -> bool {
        matches!(self, HeaderValue::Multi(_))
    }

    /// First value.
    pub fn first(&self) -> Option<&str> {
        match self {
            HeaderValue::Single(v) => Some(v),
            HeaderValue::Multi(vs) => vs.first().map(String::as_str),
        }
    }

    pub fn values(&self) -> &[String] {
        match self {
            HeaderValue::Single(v) => std::slice::from_ref(v),
            HeaderValue::Multi(vs) => vs,
        }
    }

    fn sanitized(self) -> Self {
        match self {
            HeaderValue::Single(v) => HeaderValue::Single(strip_crlf(&v).into_owned()),
            HeaderValue::Multi(vs) => {
                HeaderValue::Multi(vs.iter().map(|v| strip_crlf(v).into_owned()).collect())
            }
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Single(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Single(v)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(vs: Vec<String>) -> Self {
        HeaderValue::Multi(vs)
    }
}

impl From<Vec<&str>> for HeaderValue {
    fn from(vs: Vec<&str>) -> Self {
        HeaderValue::Multi(vs.into_iter().map(str::to_string).collect())
    }
}

impl From<u64> for HeaderValue {
    fn from(v: u64) -> Self {
        HeaderValue::Single(v.to_string())
    }
}

impl From<usize> for HeaderValue {
    fn from(v: usize) -> Self {
        HeaderValue::Single(v.to_string())
    }
}

#[derive(Debug, Clone)]
struct HeaderEntry {
    key: String,
    original_name: String,
    value: HeaderValue,
}

/// Ordered, sanitized, freezable header map.
#[derive(Debug, Clone, Default)]
pub struct HeaderSet {
    entries: Vec<HeaderEntry>,
    frozen: bool,
}

impl HeaderSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.key.eq_ignore_ascii_case(name))
    }

    fn ensure_mutable(&self) -> Result<(), AdapterError> {
        if self.frozen {
            Err(AdapterError::HeadersSent)
        } else {
            Ok(())
        }
    }

    /// Set `name`, replacing any previous value. A name that is empty after
    /// sanitization is ignored.
    pub fn set(&mut self, name: &str, value: impl Into<HeaderValue>) -> Result<(), AdapterError> {
        self.ensure_mutable()?;
        let name = strip_crlf(name);
        if name.is_empty() {
            return Ok(());
        }
        let value = value.into().sanitized();
        match self.position(&name) {
            Some(i) => {
                let entry = &mut self.entries[i];
                entry.original_name = name.into_owned();
                entry.value = value;
            }
            None => self.entries.push(HeaderEntry {
                key: name.to_ascii_lowercase(),
                original_name: name.into_owned(),
                value,
            }),
        }
        Ok(())
    }

    /// Add a value to `name`, turning it into a multi-value header if it
    /// already exists.
    pub fn append(&mut self, name: &str, value: impl Into<HeaderValue>) -> Result<(), AdapterError> {
        self.ensure_mutable()?;
        let Some(i) = self.position(&strip_crlf(name)) else {
            return self.set(name, value);
        };
        let added = value.into().sanitized();
        let entry = &mut self.entries[i];
        let mut values = entry.value.values().to_vec();
        values.extend_from_slice(added.values());
        entry.value = HeaderValue::Multi(values);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.position(name).map(|i| &self.entries[i].value)
    }

    /// First value of `name`.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(HeaderValue::first)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Result<Option<HeaderValue>, AdapterError> {
        self.ensure_mutable()?;
        Ok(self.position(name).map(|i| self.entries.remove(i).value))
    }

    /// Header names as the caller spelled them.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.original_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// One `(name, value)` line per value, in insertion order.
    pub fn lines(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .flat_map(|e| {
                e.value
                    .values()
                    .iter()
                    .map(move |v| (e.original_name.clone(), v.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn names_are_case_insensitive_and_keep_spelling() {
        let mut headers = HeaderSet::new();
        headers.set("X-Trace", "a").unwrap();
        headers.set("x-trace", "b").unwrap();
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.get_str("X-TRACE"), Some("b"));
        assert_eq!(headers.names().collect::<Vec<_>>(), vec!["x-trace"]);
    }

    #[test]
    fn append_builds_multi_value() {
        let mut headers = HeaderSet::new();
        headers.append("Set-Cookie", "a=1").unwrap();
        headers.append("set-cookie", "b=2").unwrap();
        let value = headers.get("set-cookie").unwrap();
        assert!(value.is_multi_value());
        assert_eq!(
            headers.lines(),
            vec![
                ("Set-Cookie".to_string(), "a=1".to_string()),
                ("Set-Cookie".to_string(), "b=2".to_string()),
            ]
        );
    }

    #[test]
    fn frozen_set_rejects_mutation() {
        let mut headers = HeaderSet::new();
        headers.set("a", "1").unwrap();
        headers.freeze();
        assert!(matches!(headers.set("b", "2"), Err(AdapterError::HeadersSent)));
        assert!(matches!(headers.append("a", "2"), Err(AdapterError::HeadersSent)));
        assert!(matches!(headers.remove("a"), Err(AdapterError::HeadersSent)));
        assert_eq!(headers.get_str("a"), Some("1"));
    }

    #[test]
    fn injection_is_stripped() {
        let mut headers = HeaderSet::new();
        headers
            .set("X-Evil\r\nSet-Cookie", vec!["ok\r\nInjected: 1", "fine"])
            .unwrap();
        assert_eq!(
            headers.lines(),
            vec![
                ("X-EvilSet-Cookie".to_string(), "okInjected: 1".to_string()),
                ("X-EvilSet-Cookie".to_string(), "fine".to_string()),
            ]
        );
    }

    #[test]
    fn empty_name_is_ignored() {
        let mut headers = HeaderSet::new();
        headers.set("\r\n", "x").unwrap();
        assert!(headers.is_empty());
    }

    proptest! {
        #[test]
        fn sanitized_fields_never_contain_crlf(
            name in "[a-zA-Z\r\n-]{0,24}",
            values in proptest::collection::vec("[ -~\r\n]{0,32}", 1..4),
        ) {
            let mut headers = HeaderSet::new();
            headers.set(&name, values).unwrap();
            for (n, v) in headers.lines() {
                prop_assert!(!n.contains(['\r', '\n']));
                prop_assert!(!v.contains(['\r', '\n']));
            }
        }
    }
}
