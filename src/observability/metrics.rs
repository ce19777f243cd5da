//! Metrics collection.
//!
//! # Metrics
//! - `socket_bytes_written_total` / `socket_bytes_read_total` (counter)
//! - `socket_drain_waits_total` (counter): writes that were backpressured
//! - `socket_drain_timeouts_total` (counter)
//! - `socket_aborts_total` (counter): by `reason`
//! - `socket_active_connections` (gauge)
//! - `event_stream_flushes_total` (counter), `event_stream_flush_bytes`
//!   (histogram), `event_stream_overflows_total` (counter)
//! - `channel_sends_total` (counter): by `status`
//!
//! # Design Decisions
//! - Thin wrappers so call sites stay one line and names live in one place

use crate::transport::SendStatus;

pub fn record_bytes_written(bytes: usize) {
    metrics::counter!("socket_bytes_written_total").increment(bytes as u64);
}

pub fn record_bytes_read(bytes: usize) {
    metrics::counter!("socket_bytes_read_total").increment(bytes as u64);
}

pub fn record_drain_wait() {
    metrics::counter!("socket_drain_waits_total").increment(1);
}

pub fn record_drain_timeout() {
    metrics::counter!("socket_drain_timeouts_total").increment(1);
}

pub fn record_abort(reason: &'static str) {
    metrics::counter!("socket_aborts_total", "reason" => reason).increment(1);
}

pub fn set_active_connections(count: u64) {
    metrics::gauge!("socket_active_connections").set(count as f64);
}

/// One combined event write.
pub fn record_event_flush(events: usize, bytes: usize) {
    metrics::counter!("event_stream_flushes_total").increment(1);
    metrics::counter!("event_stream_events_total").increment(events as u64);
    metrics::histogram!("event_stream_flush_bytes").record(bytes as f64);
}

pub fn record_event_overflow() {
    metrics::counter!("event_stream_overflows_total").increment(1);
}

pub fn record_channel_send(status: SendStatus) {
    let status = match status {
        SendStatus::Sent => "sent",
        SendStatus::Backpressure => "backpressure",
        SendStatus::Dropped => "dropped",
        SendStatus::Closed => "closed",
    };
    metrics::counter!("channel_sends_total", "status" => status).increment(1);
}
