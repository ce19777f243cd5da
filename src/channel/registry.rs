//! Channel registries.
//!
//! # Responsibilities
//! - Keep one entry per upgraded connection, removed when it closes
//! - Publish server-wide through the transport's native pub/sub
//! - Share one registry per bound port between listeners (lease counted)
//!
//! # Data Flow
//! ```text
//! Listener::new(port)
//!     → PortRegistry::lease(port)    first lease creates the registry
//!     → ChannelRegistry::open(...)   per upgraded connection
//!     → channel close hook           removes the entry
//! RegistryLease dropped
//!     → last lease closes remaining channels and removes the port
//! ```

use std::ops::Deref;
use std::sync::{Arc, OnceLock, Weak};

use bytes::Bytes;
use dashmap::DashMap;

use crate::channel::entry::{Channel, ChannelId};
use crate::channel::topic::Topic;
use crate::transport::{ChannelTransport, PubSub};

/// Close code sent to channels left open when their registry goes away.
pub const GOING_AWAY: u16 = 1001;

/// Live channels accepted on one port.
pub struct ChannelRegistry {
    port: u16,
    channels: DashMap<ChannelId, Channel>,
    hub: Arc<dyn PubSub>,
}

impl ChannelRegistry {
    pub fn new(port: u16, hub: Arc<dyn PubSub>) -> Arc<Self> {
        Arc::new(Self {
            port,
            channels: DashMap::new(),
            hub,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Register a freshly upgraded channel transport.
    pub fn open(self: &Arc<Self>, transport: Box<dyn ChannelTransport>, namespace: impl Into<Bytes>) -> Channel {
        let channel = Channel::new(transport, namespace);
        let id = channel.id();
        self.channels.insert(id, channel.clone());

        let registry: Weak<Self> = Arc::downgrade(self);
        channel.add_close_hook(move |code, _| {
            if let Some(registry) = registry.upgrade() {
                registry.channels.remove(&id);
                tracing::trace!(port = registry.port, channel_id = %id, code, "Channel unregistered");
            }
        });
        tracing::debug!(port = self.port, channel_id = %id, "Channel registered");
        channel
    }

    pub fn get(&self, id: ChannelId) -> Option<Channel> {
        self.channels.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Publish to every subscriber of `topic`, sender-less.
    pub fn publish(&self, topic: &Topic, data: &[u8], binary: bool) -> bool {
        self.hub.publish(topic.as_bytes(), data, binary)
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.hub.subscriber_count(topic.as_bytes())
    }

    /// End every registered channel.
    pub fn close_all(&self, code: u16, reason: &[u8]) {
        // Collected first: each end() re-enters the map through its close hook.
        let channels: Vec<Channel> = self.channels.iter().map(|e| e.value().clone()).collect();
        for channel in channels {
            channel.end(code, reason);
        }
    }
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("port", &self.port)
            .field("channels", &self.channels.len())
            .finish()
    }
}

struct PortEntry {
    registry: Arc<ChannelRegistry>,
    leases: usize,
}

/// Channel registries keyed by bound port.
#[derive(Clone, Default)]
pub struct PortRegistry {
    ports: Arc<DashMap<u16, PortEntry>>,
}

impl PortRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide instance.
    pub fn global() -> &'static PortRegistry {
        static GLOBAL: OnceLock<PortRegistry> = OnceLock::new();
        GLOBAL.get_or_init(PortRegistry::new)
    }

    /// Lease the registry for `port`, creating it with `hub` on first use.
    pub fn lease(&self, port: u16, hub: impl FnOnce() -> Arc<dyn PubSub>) -> RegistryLease {
        let registry = {
            let mut entry = self.ports.entry(port).or_insert_with(|| PortEntry {
                registry: ChannelRegistry::new(port, hub()),
                leases: 0,
            });
            entry.leases += 1;
            Arc::clone(&entry.registry)
        };
        RegistryLease {
            port,
            ports: Arc::clone(&self.ports),
            registry,
        }
    }

    pub fn get(&self, port: u16) -> Option<Arc<ChannelRegistry>> {
        self.ports.get(&port).map(|e| Arc::clone(&e.registry))
    }

    /// Outstanding leases for `port`.
    pub fn leases(&self, port: u16) -> usize {
        self.ports.get(&port).map_or(0, |e| e.leases)
    }
}

impl std::fmt::Debug for PortRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortRegistry")
            .field("ports", &self.ports.len())
            .finish()
    }
}

/// Shared ownership of one port's [`ChannelRegistry`].
///
/// Dropping the last lease closes the remaining channels and forgets the port.
pub struct RegistryLease {
    port: u16,
    ports: Arc<DashMap<u16, PortEntry>>,
    registry: Arc<ChannelRegistry>,
}

impl RegistryLease {
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }
}

impl Deref for RegistryLease {
    type Target = ChannelRegistry;

    fn deref(&self) -> &ChannelRegistry {
        &self.registry
    }
}

impl std::fmt::Debug for RegistryLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryLease")
            .field("port", &self.port)
            .finish()
    }
}

impl Drop for RegistryLease {
    fn drop(&mut self) {
        if let Some(mut entry) = self.ports.get_mut(&self.port) {
            entry.leases = entry.leases.saturating_sub(1);
        }
        if let Some((_, entry)) = self.ports.remove_if(&self.port, |_, e| e.leases == 0) {
            tracing::debug!(port = self.port, "Last registry lease released");
            entry.registry.close_all(GOING_AWAY, b"server shutting down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory::MemoryHub;

    fn hub() -> Arc<dyn PubSub> {
        Arc::new(MemoryHub::new())
    }

    #[test]
    fn leases_share_one_registry() {
        let ports = PortRegistry::new();
        let a = ports.lease(9001, hub);
        let b = ports.lease(9001, || unreachable!("registry already exists"));
        assert!(Arc::ptr_eq(a.registry(), b.registry()));
        assert_eq!(ports.leases(9001), 2);

        drop(a);
        assert!(ports.get(9001).is_some());
        drop(b);
        assert!(ports.get(9001).is_none());
    }

    #[test]
    fn closed_channels_leave_the_registry() {
        let memory = MemoryHub::new();
        let ports = PortRegistry::new();
        let lease = ports.lease(9002, {
            let memory = memory.clone();
            move || Arc::new(memory) as Arc<dyn PubSub>
        });

        let (transport, _peer) = memory.channel();
        let channel = lease.registry().open(Box::new(transport), "/ns");
        assert_eq!(lease.len(), 1);
        assert!(lease.get(channel.id()).is_some());

        channel.close();
        assert!(lease.is_empty());
    }

    #[test]
    fn last_lease_closes_remaining_channels() {
        let memory = MemoryHub::new();
        let ports = PortRegistry::new();
        let lease = ports.lease(9003, {
            let memory = memory.clone();
            move || Arc::new(memory) as Arc<dyn PubSub>
        });
        let (transport, peer) = memory.channel();
        lease.registry().open(Box::new(transport), "/ns");

        drop(lease);
        assert_eq!(peer.closed_with().map(|(code, _)| code), Some(GOING_AWAY));
    }

    #[test]
    fn registry_publish_reaches_subscribers() {
        let memory = MemoryHub::new();
        let registry = ChannelRegistry::new(9004, Arc::new(memory.clone()));
        let (transport, peer) = memory.channel();
        let channel = registry.open(Box::new(transport), "/room");
        channel.subscribe("chat");

        let topic = Topic::new("/room", "chat");
        assert_eq!(registry.subscriber_count(&topic), 1);
        assert!(registry.publish(&topic, b"broadcast", false));
        assert_eq!(peer.received()[0].data, b"broadcast");
    }
}
