// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Socket lifecycle per endpoint
//! - REQ latency and outcomes, PUSH outcomes
//! - Per-subscription receive throughput, drops and errors
//! - Dealer correlation (matched, unknown, timed out)
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `messaging_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! No recorder is installed here; the host application picks the exporter.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a socket created for an endpoint.
pub fn record_socket_created(endpoint: &str, socket_type: &str) {
    counter!("messaging_sockets_created_total", "endpoint" => endpoint.to_string(), "type" => socket_type.to_string()).increment(1);
}

/// Record a socket closed. `reason` is one of `type_change`, `release`, `cleanup`.
pub fn record_socket_closed(endpoint: &str, reason: &'static str) {
    counter!("messaging_sockets_closed_total", "endpoint" => endpoint.to_string(), "reason" => reason).increment(1);
}

/// Record a completed REQ exchange.
pub fn record_request(endpoint: &str, outcome: &'static str, latency: Duration) {
    counter!("messaging_requests_total", "endpoint" => endpoint.to_string(), "outcome" => outcome).increment(1);
    histogram!("messaging_request_duration_seconds", "endpoint" => endpoint.to_string())
        .record(latency.as_secs_f64());
}

/// Record a PUSH send.
pub fn record_push(endpoint: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("messaging_push_total", "endpoint" => endpoint.to_string(), "status" => status).increment(1);
}

/// Record a message accepted into a subscription.
pub fn record_message_received(subscription: &str) {
    counter!("messaging_messages_received_total", "subscription" => subscription.to_string()).increment(1);
}

/// Record a message dropped by a receive loop.
///
/// `reason`: `topic_mismatch` (no live stream for its topic) or `no_stream`
/// (its stream was torn down while the receive was in flight).
pub fn record_message_dropped(subscription: &str, reason: &'static str) {
    counter!("messaging_messages_dropped_total", "subscription" => subscription.to_string(), "reason" => reason).increment(1);
}

/// Record a transport error seen by a receive loop.
pub fn record_receive_error(receiver: &str, retryable: bool) {
    let kind = if retryable { "transient" } else { "fatal" };
    counter!("messaging_receive_errors_total", "receiver" => receiver.to_string(), "kind" => kind).increment(1);
}

/// Record a listener or dealer callback that panicked.
pub fn record_listener_failure(source: &str) {
    counter!("messaging_listener_failures_total", "source" => source.to_string()).increment(1);
}

/// Record a dealer response. `matched` is false for unknown request ids.
pub fn record_dealer_response(endpoint: &str, matched: bool) {
    let status = if matched { "matched" } else { "unknown" };
    counter!("messaging_dealer_responses_total", "endpoint" => endpoint.to_string(), "status" => status).increment(1);
}

/// Record a dealer request that outlived its timeout.
pub fn record_dealer_timeout(endpoint: &str) {
    counter!("messaging_dealer_timeouts_total", "endpoint" => endpoint.to_string()).increment(1);
}

/// Set the number of pending dealer requests.
pub fn set_pending_dealer_requests(count: usize) {
    gauge!("messaging_dealer_pending_requests").set(count as f64);
}

/// Set the number of running receive loops.
pub fn set_active_receivers(count: usize) {
    gauge!("messaging_active_receivers").set(count as f64);
}

/// Set the number of open sockets.
pub fn set_open_sockets(count: usize) {
    gauge!("messaging_open_sockets").set(count as f64);
}
