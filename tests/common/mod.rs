//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use socket_bridge::config::AdapterConfig;
use socket_bridge::error::AdapterError;
use socket_bridge::net::socket::{SocketAdapter, SocketOptions};
use socket_bridge::transport::memory::{MemoryPeer, MemoryTransport};
use socket_bridge::transport::RawRequest;

/// Socket adapter over a loopback transport.
pub fn socket() -> (SocketAdapter, MemoryPeer) {
    socket_with(SocketOptions::default())
}

pub fn socket_with(options: SocketOptions) -> (SocketAdapter, MemoryPeer) {
    let (transport, peer) = MemoryTransport::pair();
    (SocketAdapter::new(Box::new(transport), options), peer)
}

/// Config with a port unique to the calling test.
pub fn config(port: u16) -> AdapterConfig {
    let mut config = AdapterConfig::default();
    config.listener.port = port;
    config
}

/// A GET request with `headers`.
pub fn get<'a>(path: &'a str, headers: &'a [(&'a str, &'a [u8])]) -> RawRequest<'a> {
    RawRequest {
        method: "GET",
        path,
        query: None,
        headers,
    }
}

/// Records every outcome handed to a write callback.
#[derive(Clone, Default)]
pub struct Outcomes {
    calls: Arc<AtomicUsize>,
    results: Arc<Mutex<Vec<Result<(), AdapterError>>>>,
}

impl Outcomes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callback(&self) -> impl FnOnce(Result<(), AdapterError>) + Send + 'static {
        let this = self.clone();
        move |result| {
            this.calls.fetch_add(1, Ordering::SeqCst);
            this.results.lock().unwrap().push(result);
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last(&self) -> Option<Result<(), AdapterError>> {
        self.results.lock().unwrap().last().cloned()
    }
}
