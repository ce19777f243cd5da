//! Event stream behavior, standalone and through the listener.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket_bridge::channel::PortRegistry;
use socket_bridge::error::AdapterError;
use socket_bridge::http::OutboundStream;
use socket_bridge::net::{Listener, SocketAdapter};
use socket_bridge::sse::{EventStream, EventStreamOptions, SseMessage, HEARTBEAT_FRAME};
use socket_bridge::transport::memory::{MemoryHub, MemoryPeer, MemoryTransport};

mod common;

fn event_stream(options: EventStreamOptions) -> (EventStream, SocketAdapter, MemoryPeer) {
    let (socket, peer) = common::socket();
    let events = EventStream::new(OutboundStream::new(socket.clone()), options);
    (events, socket, peer)
}

fn options(batch_events: usize, max_buffer_bytes: usize) -> EventStreamOptions {
    EventStreamOptions {
        batch_events,
        max_buffer_bytes,
        heartbeat: None,
        headers: Vec::new(),
    }
}

#[tokio::test]
async fn batch_threshold_issues_one_combined_write() {
    let (events, _socket, peer) = event_stream(options(3, 1 << 20));
    let messages: Vec<SseMessage> = (1..=3)
        .map(|i| SseMessage::text(format!("tick {i}")).with_id(i.to_string()))
        .collect();

    events.push(&messages[0]).unwrap();
    events.push(&messages[1]).unwrap();
    assert_eq!(peer.write_count(), 0);
    assert_eq!(events.buffered_events(), 2);

    events.push(&messages[2]).unwrap().await.unwrap();
    assert_eq!(peer.write_count(), 1);
    assert_eq!(peer.cork_count(), 1);
    let expected: String = messages.iter().map(SseMessage::format).collect();
    assert_eq!(peer.body(), expected.as_bytes());
    assert_eq!(peer.header("content-type").as_deref(), Some("text/event-stream"));
}

#[tokio::test]
async fn backpressured_callers_share_one_completion() {
    let (events, socket, peer) = event_stream(options(1, 1 << 20));
    peer.set_backpressure(true);

    let first = events.push(&SseMessage::text("a")).unwrap();
    let second = events.push(&SseMessage::text("b")).unwrap();
    assert!(events.is_backpressured());
    assert_eq!(peer.write_count(), 1);

    peer.set_backpressure(false);
    assert!(socket.on_writable());
    first.await.unwrap();
    second.await.unwrap();
    assert_eq!(peer.write_count(), 2);
    assert_eq!(peer.body(), b"data: a\n\ndata: b\n\n");
}

#[tokio::test]
async fn overflow_while_backpressured_closes_connection() {
    let (events, _socket, peer) = event_stream(options(1, 32));
    peer.set_backpressure(true);
    let closed = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&closed);
    events.on_close(move || flag.store(true, Ordering::SeqCst));

    events.push(&SseMessage::text("first")).unwrap();
    events.push(&SseMessage::text("0123456789")).unwrap();
    let err = events.push(&SseMessage::text("0123456789")).unwrap_err();

    assert!(matches!(err, AdapterError::BufferOverflow { limit: 32, .. }));
    assert!(peer.is_closed());
    assert!(!events.is_connected());
    assert!(closed.load(Ordering::SeqCst));
    assert!(matches!(
        events.push(&SseMessage::text("late")),
        Err(AdapterError::Disconnected)
    ));
}

#[tokio::test]
async fn listener_stream_replays_after_last_event_id() {
    let ports = PortRegistry::new();
    let listener = Listener::with_ports(&common::config(7101), Arc::new(MemoryHub::new()), &ports).unwrap();
    let (transport, peer) = MemoryTransport::pair();
    let headers: [(&str, &[u8]); 1] = [("Last-Event-ID", b"2")];
    let events = listener
        .event_stream(Box::new(transport), &common::get("/events", &headers))
        .unwrap();
    assert_eq!(events.last_event_id(), Some("2"));

    let history = ["one", "two", "three", "four"];
    let sent = events
        .replay(|last| {
            let after: usize = last.and_then(|id| id.parse().ok()).unwrap_or(0);
            history
                .iter()
                .enumerate()
                .skip(after)
                .map(|(i, text)| SseMessage::text(*text).with_id((i + 1).to_string()))
                .collect::<Vec<_>>()
        })
        .await
        .unwrap();
    assert_eq!(sent, 2);

    let body = String::from_utf8(peer.body()).unwrap();
    assert_eq!(body, "id: 3\ndata: three\n\nid: 4\ndata: four\n\n");
    assert_eq!(peer.write_count(), 1);

    events.close();
    assert!(peer.is_ended());
    assert_eq!(listener.active_connections(), 0);
}

#[tokio::test(start_paused = true)]
async fn listener_stream_sends_heartbeats() {
    let mut config = common::config(7102);
    config.events.heartbeat_secs = 5;
    let ports = PortRegistry::new();
    let listener = Listener::with_ports(&config, Arc::new(MemoryHub::new()), &ports).unwrap();
    let (transport, peer) = MemoryTransport::pair();
    let events = listener
        .event_stream(Box::new(transport), &common::get("/events", &[]))
        .unwrap();

    tokio::time::sleep(Duration::from_secs(4)).await;
    assert!(peer.body().is_empty());

    tokio::time::sleep(Duration::from_secs(7)).await;
    let body = String::from_utf8(peer.body()).unwrap();
    assert_eq!(body, HEARTBEAT_FRAME.repeat(2));

    events.close();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(String::from_utf8(peer.body()).unwrap(), HEARTBEAT_FRAME.repeat(2));
}
