//! Namespaced pub/sub topics.
//!
//! A topic is `namespace ‖ 0x00 ‖ name`. Qualification is deterministic, so
//! two call sites naming the same `(namespace, name)` always produce the same
//! bytes and match at the transport's native pub/sub.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// Byte between namespace and name.
pub const TOPIC_SEPARATOR: u8 = 0x00;

/// A namespace-qualified topic.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(Bytes);

impl Topic {
    /// Qualify `name` with `namespace`.
    pub fn new(namespace: impl AsRef<[u8]>, name: impl AsRef<[u8]>) -> Self {
        let namespace = namespace.as_ref();
        let name = name.as_ref();
        let mut buf = BytesMut::with_capacity(namespace.len() + 1 + name.len());
        buf.put_slice(namespace);
        buf.put_u8(TOPIC_SEPARATOR);
        buf.put_slice(name);
        Topic(buf.freeze())
    }

    /// Wrap bytes that are already qualified, as reported by the transport.
    /// Returns `None` when the separator is missing.
    pub fn from_qualified(bytes: impl Into<Bytes>) -> Option<Self> {
        let bytes = bytes.into();
        bytes.contains(&TOPIC_SEPARATOR).then_some(Topic(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// `(namespace, name)`.
    pub fn split(&self) -> (&[u8], &[u8]) {
        match self.0.iter().position(|b| *b == TOPIC_SEPARATOR) {
            Some(i) => (&self.0[..i], &self.0[i + 1..]),
            None => (&[], &self.0[..]),
        }
    }

    pub fn namespace(&self) -> &[u8] {
        self.split().0
    }

    pub fn name(&self) -> &[u8] {
        self.split().1
    }
}

impl AsRef<[u8]> for Topic {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (namespace, name) = self.split();
        write!(
            f,
            "Topic({:?}/{:?})",
            String::from_utf8_lossy(namespace),
            String::from_utf8_lossy(name)
        )
    }
}

/// Anything that names a topic within a namespace.
///
/// A [`Topic`] is already qualified and passes through unchanged; plain names
/// are qualified with the channel's namespace.
pub trait IntoTopic {
    fn into_topic(self, namespace: &[u8]) -> Topic;
}

impl IntoTopic for Topic {
    fn into_topic(self, _namespace: &[u8]) -> Topic {
        self
    }
}

impl IntoTopic for &Topic {
    fn into_topic(self, _namespace: &[u8]) -> Topic {
        self.clone()
    }
}

macro_rules! impl_into_topic {
    ($($ty:ty),*) => {
        $(
            impl IntoTopic for $ty {
                fn into_topic(self, namespace: &[u8]) -> Topic {
                    Topic::new(namespace, AsRef::<[u8]>::as_ref(&self))
                }
            }
        )*
    };
}

impl_into_topic!(&str, String, &String, &[u8], Vec<u8>, Bytes);
