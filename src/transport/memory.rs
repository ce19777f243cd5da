//! In-memory loopback transport.
//!
//! Implements [`Transport`], [`ChannelTransport`] and [`PubSub`] over shared
//! buffers so handlers can be driven without a socket. The peer side records
//! what reached the "wire", including whether it was written inside a cork.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{ChannelTransport, PubSub, SendStatus, Transport};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Default)]
struct PeerState {
    status: Option<String>,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    writes: usize,
    corks: usize,
    cork_depth: usize,
    uncorked_writes: usize,
    ended: bool,
    closed: bool,
    backpressure: bool,
}

impl PeerState {
    fn record_write(&mut self, chunk: &[u8]) -> bool {
        if self.cork_depth == 0 {
            self.uncorked_writes += 1;
        }
        self.writes += 1;
        self.body.extend_from_slice(chunk);
        !self.backpressure
    }
}

/// Request/response side of the loopback.
pub struct MemoryTransport {
    state: Arc<Mutex<PeerState>>,
}

impl MemoryTransport {
    /// Create a transport and the peer observing it.
    pub fn pair() -> (Self, MemoryPeer) {
        let state = Arc::new(Mutex::new(PeerState::default()));
        (
            Self {
                state: Arc::clone(&state),
            },
            MemoryPeer { state },
        )
    }
}

impl Transport for MemoryTransport {
    fn cork(&mut self, f: &mut dyn FnMut(&mut dyn Transport)) {
        {
            let mut state = lock(&self.state);
            state.corks += 1;
            state.cork_depth += 1;
        }
        f(self);
        lock(&self.state).cork_depth -= 1;
    }

    fn write_status(&mut self, status: &str) {
        lock(&self.state).status = Some(status.to_string());
    }

    fn write_header(&mut self, name: &str, value: &str) {
        lock(&self.state)
            .headers
            .push((name.to_string(), value.to_string()));
    }

    fn write(&mut self, chunk: &[u8]) -> bool {
        lock(&self.state).record_write(chunk)
    }

    fn end(&mut self, chunk: &[u8]) -> bool {
        let mut state = lock(&self.state);
        state.ended = true;
        state.record_write(chunk)
    }

    fn close(&mut self) {
        lock(&self.state).closed = true;
    }
}

/// Observer of a [`MemoryTransport`].
#[derive(Clone)]
pub struct MemoryPeer {
    state: Arc<Mutex<PeerState>>,
}

impl MemoryPeer {
    /// Make subsequent writes report "not flushed".
    pub fn set_backpressure(&self, on: bool) {
        lock(&self.state).backpressure = on;
    }

    pub fn body(&self) -> Vec<u8> {
        lock(&self.state).body.clone()
    }

    pub fn status(&self) -> Option<String> {
        lock(&self.state).status.clone()
    }

    pub fn headers(&self) -> Vec<(String, String)> {
        lock(&self.state).headers.clone()
    }

    /// First header value with a case-insensitive name match.
    pub fn header(&self, name: &str) -> Option<String> {
        lock(&self.state)
            .headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    }

    /// Status line and header block as they would appear on the wire.
    pub fn wire_head(&self) -> String {
        let state = lock(&self.state);
        let mut out = format!(
            "HTTP/1.1 {}\r\n",
            state.status.as_deref().unwrap_or("200 OK")
        );
        for (name, value) in &state.headers {
            out.push_str(name);
            out.push_str(": ");
            out.push_str(value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }

    /// Number of body write calls (including the final one).
    pub fn write_count(&self) -> usize {
        lock(&self.state).writes
    }

    pub fn cork_count(&self) -> usize {
        lock(&self.state).corks
    }

    /// Body writes that happened outside any cork section.
    pub fn uncorked_writes(&self) -> usize {
        lock(&self.state).uncorked_writes
    }

    pub fn is_ended(&self) -> bool {
        lock(&self.state).ended
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }
}

/// A message observed by a [`MemoryChannelPeer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub data: Vec<u8>,
    pub binary: bool,
    /// Set when the message arrived through a publish.
    pub topic: Option<Vec<u8>>,
}

#[derive(Debug)]
struct ChannelState {
    received: Vec<Received>,
    pings: Vec<Vec<u8>>,
    topics: BTreeSet<Vec<u8>>,
    send_status: SendStatus,
    closed_with: Option<(u16, Vec<u8>)>,
    closed: bool,
    buffered: usize,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self {
            received: Vec::new(),
            pings: Vec::new(),
            topics: BTreeSet::new(),
            send_status: SendStatus::Sent,
            closed_with: None,
            closed: false,
            buffered: 0,
        }
    }
}

type Subscriber = (u64, Arc<Mutex<ChannelState>>);

#[derive(Default)]
struct HubState {
    next_id: u64,
    subscribers: HashMap<Vec<u8>, Vec<Subscriber>>,
}

/// Loopback pub/sub broker shared by [`MemoryChannel`]s.
#[derive(Clone, Default)]
pub struct MemoryHub {
    inner: Arc<Mutex<HubState>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a channel attached to this hub and the peer observing it.
    pub fn channel(&self) -> (MemoryChannel, MemoryChannelPeer) {
        let id = {
            let mut hub = lock(&self.inner);
            hub.next_id += 1;
            hub.next_id
        };
        let state = Arc::new(Mutex::new(ChannelState::default()));
        (
            MemoryChannel {
                id,
                hub: self.clone(),
                state: Arc::clone(&state),
            },
            MemoryChannelPeer { state },
        )
    }

    fn publish_from(&self, sender: Option<u64>, topic: &[u8], message: &[u8], binary: bool) -> bool {
        let hub = lock(&self.inner);
        let Some(subscribers) = hub.subscribers.get(topic) else {
            return false;
        };
        let mut delivered = false;
        for (id, state) in subscribers {
            if Some(*id) == sender {
                continue;
            }
            let mut state = lock(state);
            if state.closed {
                continue;
            }
            state.received.push(Received {
                data: message.to_vec(),
                binary,
                topic: Some(topic.to_vec()),
            });
            delivered = true;
        }
        delivered
    }

    fn remove(&self, id: u64) {
        let mut hub = lock(&self.inner);
        for subscribers in hub.subscribers.values_mut() {
            subscribers.retain(|(sid, _)| *sid != id);
        }
        hub.subscribers.retain(|_, s| !s.is_empty());
    }
}

impl PubSub for MemoryHub {
    fn publish(&self, topic: &[u8], message: &[u8], binary: bool) -> bool {
        self.publish_from(None, topic, message, binary)
    }

    fn subscriber_count(&self, topic: &[u8]) -> usize {
        lock(&self.inner)
            .subscribers
            .get(topic)
            .map_or(0, Vec::len)
    }
}

/// Channel side of the loopback.
pub struct MemoryChannel {
    id: u64,
    hub: MemoryHub,
    state: Arc<Mutex<ChannelState>>,
}

impl ChannelTransport for MemoryChannel {
    fn cork(&mut self, f: &mut dyn FnMut(&mut dyn ChannelTransport)) {
        f(self);
    }

    fn send(&mut self, message: &[u8], binary: bool) -> SendStatus {
        let mut state = lock(&self.state);
        if state.closed {
            return SendStatus::Closed;
        }
        let status = state.send_status;
        match status {
            SendStatus::Sent => {}
            SendStatus::Backpressure => state.buffered += message.len(),
            SendStatus::Dropped | SendStatus::Closed => return status,
        }
        state.received.push(Received {
            data: message.to_vec(),
            binary,
            topic: None,
        });
        status
    }

    fn publish(&mut self, topic: &[u8], message: &[u8], binary: bool) -> bool {
        self.hub.publish_from(Some(self.id), topic, message, binary)
    }

    fn subscribe(&mut self, topic: &[u8]) -> bool {
        let mut hub = lock(&self.hub.inner);
        let subscribers = hub.subscribers.entry(topic.to_vec()).or_default();
        if subscribers.iter().any(|(id, _)| *id == self.id) {
            return false;
        }
        subscribers.push((self.id, Arc::clone(&self.state)));
        lock(&self.state).topics.insert(topic.to_vec());
        true
    }

    fn unsubscribe(&mut self, topic: &[u8]) -> bool {
        let mut hub = lock(&self.hub.inner);
        if let Some(subscribers) = hub.subscribers.get_mut(topic) {
            subscribers.retain(|(id, _)| *id != self.id);
            if subscribers.is_empty() {
                hub.subscribers.remove(topic);
            }
        }
        lock(&self.state).topics.remove(topic)
    }

    fn is_subscribed(&self, topic: &[u8]) -> bool {
        lock(&self.state).topics.contains(topic)
    }

    fn topics(&self) -> Vec<Vec<u8>> {
        lock(&self.state).topics.iter().cloned().collect()
    }

    fn ping(&mut self, message: &[u8]) -> SendStatus {
        let mut state = lock(&self.state);
        if state.closed {
            return SendStatus::Closed;
        }
        state.pings.push(message.to_vec());
        SendStatus::Sent
    }

    fn buffered_amount(&self) -> usize {
        lock(&self.state).buffered
    }

    fn end(&mut self, code: u16, reason: &[u8]) {
        {
            let mut state = lock(&self.state);
            state.closed = true;
            state.closed_with = Some((code, reason.to_vec()));
        }
        self.hub.remove(self.id);
    }

    fn close(&mut self) {
        lock(&self.state).closed = true;
        self.hub.remove(self.id);
    }
}

/// Observer of a [`MemoryChannel`].
#[derive(Clone)]
pub struct MemoryChannelPeer {
    state: Arc<Mutex<ChannelState>>,
}

impl MemoryChannelPeer {
    /// Status returned by subsequent sends.
    pub fn set_send_status(&self, status: SendStatus) {
        lock(&self.state).send_status = status;
    }

    /// Everything delivered to this channel so far.
    pub fn received(&self) -> Vec<Received> {
        lock(&self.state).received.clone()
    }

    pub fn pings(&self) -> Vec<Vec<u8>> {
        lock(&self.state).pings.clone()
    }

    /// Close code and reason, if the channel was ended gracefully.
    pub fn closed_with(&self) -> Option<(u16, Vec<u8>)> {
        lock(&self.state).closed_with.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).closed
    }

    /// Mark queued bytes as written.
    pub fn flush(&self) {
        lock(&self.state).buffered = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_corked_writes() {
        let (mut transport, peer) = MemoryTransport::pair();
        transport.cork(&mut |t| {
            t.write_status("201 Created");
            t.write_header("x-a", "1");
            t.write(b"hello");
        });
        transport.write(b"!");

        assert_eq!(peer.status().as_deref(), Some("201 Created"));
        assert_eq!(peer.body(), b"hello!");
        assert_eq!(peer.cork_count(), 1);
        assert_eq!(peer.uncorked_writes(), 1);
        assert!(peer.wire_head().starts_with("HTTP/1.1 201 Created\r\nx-a: 1\r\n"));
    }

    #[test]
    fn publish_skips_sender() {
        let hub = MemoryHub::new();
        let (mut a, peer_a) = hub.channel();
        let (mut b, peer_b) = hub.channel();
        assert!(a.subscribe(b"t"));
        assert!(b.subscribe(b"t"));
        assert!(!b.subscribe(b"t"));

        assert!(a.publish(b"t", b"hi", false));
        assert!(peer_a.received().is_empty());
        assert_eq!(peer_b.received()[0].data, b"hi");
        assert_eq!(hub.subscriber_count(b"t"), 2);

        b.close();
        assert_eq!(hub.subscriber_count(b"t"), 1);
    }
}
