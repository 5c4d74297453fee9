//! Prometheus metrics endpoint.

use crate::server::CraneRelay;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Prometheus metrics handler.
///
/// Gauges describe current state; counters are monotonic since startup.
pub async fn metrics_handler(Extension(relay): Extension<Arc<CraneRelay>>) -> impl IntoResponse {
    let m = relay.metrics();

    // Gauges
    let rooms = relay.total_rooms();
    let subscribers = relay.total_subscribers();
    let sessions = relay.total_sessions();
    let tracked_ips = relay.rate_limits().tracked_ips();

    // Counters
    let conns_total = m.connections_total.load(Ordering::Relaxed);
    let opened = m.rooms_opened.load(Ordering::Relaxed);
    let completed = m.rooms_completed.load(Ordering::Relaxed);
    let aborted = m.rooms_aborted.load(Ordering::Relaxed);
    let timeouts = m.rendezvous_timeouts.load(Ordering::Relaxed);
    let chunks = m.chunks_relayed.load(Ordering::Relaxed);
    let bytes = m.bytes_relayed.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);
    let errors = m.errors_total.load(Ordering::Relaxed);

    let body = format!(
        r#"# HELP crane_relay_rooms_active Number of open rooms
# TYPE crane_relay_rooms_active gauge
crane_relay_rooms_active {rooms}

# HELP crane_relay_subscribers_active Number of attached subscribers
# TYPE crane_relay_subscribers_active gauge
crane_relay_subscribers_active {subscribers}

# HELP crane_relay_sessions_active Number of running sessions
# TYPE crane_relay_sessions_active gauge
crane_relay_sessions_active {sessions}

# HELP crane_relay_limiter_tracked_ips IPs held by the connection limiter
# TYPE crane_relay_limiter_tracked_ips gauge
crane_relay_limiter_tracked_ips {tracked_ips}

# HELP crane_relay_info Server information
# TYPE crane_relay_info gauge
crane_relay_info{{version="{version}"}} 1

# HELP crane_relay_connections_total Total connections accepted
# TYPE crane_relay_connections_total counter
crane_relay_connections_total {conns_total}

# HELP crane_relay_rooms_opened_total Rooms opened by publishers
# TYPE crane_relay_rooms_opened_total counter
crane_relay_rooms_opened_total {opened}

# HELP crane_relay_rooms_completed_total Rooms that finished their transfer
# TYPE crane_relay_rooms_completed_total counter
crane_relay_rooms_completed_total {completed}

# HELP crane_relay_rooms_aborted_total Rooms torn down after a publisher failure
# TYPE crane_relay_rooms_aborted_total counter
crane_relay_rooms_aborted_total {aborted}

# HELP crane_relay_rendezvous_timeouts_total Subscribers that gave up waiting for a room
# TYPE crane_relay_rendezvous_timeouts_total counter
crane_relay_rendezvous_timeouts_total {timeouts}

# HELP crane_relay_chunks_relayed_total Content packages fanned out
# TYPE crane_relay_chunks_relayed_total counter
crane_relay_chunks_relayed_total {chunks}

# HELP crane_relay_bytes_relayed_total Content bytes delivered to subscribers
# TYPE crane_relay_bytes_relayed_total counter
crane_relay_bytes_relayed_total {bytes}

# HELP crane_relay_rate_limit_hits_total Total rate limit rejections
# TYPE crane_relay_rate_limit_hits_total counter
crane_relay_rate_limit_hits_total {rate_limits}

# HELP crane_relay_errors_total Total protocol errors
# TYPE crane_relay_errors_total counter
crane_relay_errors_total {errors}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
