//! Main CraneRelay server coordination.
//!
//! CraneRelay owns the room registry, limits and metrics, accepts WebSocket
//! connections, and spawns one [`Session`] per connection.

use crate::config::Config;
use crate::connection::{Connection, PeerConnection, WsConnection};
use crate::error::Result;
use crate::http;
use crate::limits::{spawn_maintenance_task, RateLimits};
use crate::registry::RoomRegistry;
use crate::rendezvous::RendezvousSupervisor;
use crate::session::Session;
use crate::transport::ChunkTransport;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::Instrument;

/// How often idle limiter keys are evicted.
const LIMITER_MAINTENANCE_INTERVAL: Duration = Duration::from_secs(300);

/// Operational metrics for monitoring relay activity.
///
/// Counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Total connections accepted (before the role token).
    pub connections_total: AtomicU64,
    /// Sessions currently running.
    pub active_sessions: AtomicUsize,
    /// Rooms opened by publishers.
    pub rooms_opened: AtomicU64,
    /// Rooms that ended with `close`.
    pub rooms_completed: AtomicU64,
    /// Rooms torn down because their publisher failed.
    pub rooms_aborted: AtomicU64,
    /// Subscribers that gave up waiting for a room.
    pub rendezvous_timeouts: AtomicU64,
    /// `chunk`/`full` packages fanned out to subscribers.
    pub chunks_relayed: AtomicU64,
    /// Payload bytes fanned out (counted once per subscriber).
    pub bytes_relayed: AtomicU64,
    /// Connections refused by the rate limiter or session cap.
    pub rate_limit_hits: AtomicU64,
    /// Protocol errors (malformed envelopes, rejected rooms, etc.).
    pub errors_total: AtomicU64,
}

/// One counted session; gives its place back when dropped.
struct SessionSlot(Arc<CraneRelay>);

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.0.metrics.active_sessions.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Main relay server.
pub struct CraneRelay {
    config: Config,
    registry: Arc<RoomRegistry>,
    rendezvous: RendezvousSupervisor,
    transport: ChunkTransport,
    /// Rate limiters for incoming connections.
    rate_limits: RateLimits,
    /// Operational metrics (counters, gauges).
    metrics: RelayMetrics,
}

impl std::fmt::Debug for CraneRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CraneRelay")
            .field("config", &self.config)
            .field("rate_limits", &self.rate_limits)
            .field("metrics", &self.metrics)
            .field("rooms", &self.registry.room_count())
            .finish_non_exhaustive()
    }
}

impl CraneRelay {
    /// Create a relay with its own empty registry.
    pub fn new(config: Config) -> Self {
        Self::with_registry(config, Arc::new(RoomRegistry::new()))
    }

    /// Create a relay over an existing registry.
    pub fn with_registry(config: Config, registry: Arc<RoomRegistry>) -> Self {
        let rendezvous = RendezvousSupervisor::new(registry.clone(), config.rendezvous.timeout());
        let transport = ChunkTransport::new(&config.transfer);
        let rate_limits = RateLimits::new(&config.limits);
        Self {
            config,
            registry,
            rendezvous,
            transport,
            rate_limits,
            metrics: RelayMetrics::default(),
        }
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the room registry.
    pub fn registry(&self) -> &Arc<RoomRegistry> {
        &self.registry
    }

    /// Get the rendezvous supervisor.
    pub fn rendezvous(&self) -> &RendezvousSupervisor {
        &self.rendezvous
    }

    /// Get the chunk transport.
    pub fn transport(&self) -> &ChunkTransport {
        &self.transport
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Sessions currently running.
    pub fn total_sessions(&self) -> usize {
        self.metrics.active_sessions.load(Ordering::Relaxed)
    }

    /// Rooms currently open.
    pub fn total_rooms(&self) -> usize {
        self.registry.room_count()
    }

    /// Subscribers currently attached to any room.
    pub fn total_subscribers(&self) -> usize {
        self.registry.subscriber_count()
    }

    /// Reserve a place under `max_concurrent_sessions`.
    ///
    /// The check and the increment are one atomic step, so concurrent
    /// handshakes cannot overshoot the cap.
    fn try_reserve_session(self: &Arc<Self>) -> Option<SessionSlot> {
        let max_sessions = self.config.limits.max_concurrent_sessions;
        self.metrics
            .active_sessions
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < max_sessions).then_some(active + 1)
            })
            .ok()
            .map(|_| SessionSlot(self.clone()))
    }

    /// Spawn a session for an established connection.
    ///
    /// The session counts toward `total_sessions()` from this call until its
    /// task finishes. No cap is applied here; `serve` enforces it.
    pub fn spawn_session(self: &Arc<Self>, connection: PeerConnection) -> tokio::task::JoinHandle<()> {
        self.metrics.active_sessions.fetch_add(1, Ordering::AcqRel);
        self.spawn_in_slot(SessionSlot(self.clone()), connection)
    }

    fn spawn_in_slot(
        self: &Arc<Self>,
        slot: SessionSlot,
        connection: PeerConnection,
    ) -> tokio::task::JoinHandle<()> {
        let span = tracing::info_span!(
            "session",
            peer = %connection.remote_addr(),
            role = tracing::field::Empty,
            room = tracing::field::Empty,
        );
        let session = Session::new(self.clone(), connection);
        tokio::spawn(
            async move {
                let _slot = slot;
                if let Err(e) = session.run().await {
                    tracing::warn!("Session ended with error: {}", e);
                }
            }
            .instrument(span),
        )
    }

    /// Accept WebSocket connections on `listener` until it fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        tracing::info!("Relay listening on {}", listener.local_addr()?);

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let relay = self.clone();

            // Handshake off the accept loop so a slow client cannot stall it
            tokio::spawn(async move {
                let connection = match WsConnection::accept(stream, remote_addr).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        tracing::debug!("WebSocket handshake with {} failed: {}", remote_addr, e);
                        return;
                    }
                };

                if let Err(e) = relay.rate_limits.check_connection(remote_addr.ip()) {
                    tracing::warn!("Connection rate limited for {}: {}", remote_addr, e);
                    relay.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
                    let _ = connection.close(Some("rate limited")).await;
                    return;
                }

                let Some(slot) = relay.try_reserve_session() else {
                    tracing::warn!(
                        "Session limit reached ({}), rejecting {}",
                        relay.config.limits.max_concurrent_sessions,
                        remote_addr
                    );
                    relay.metrics.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
                    let _ = connection.close(Some("too many sessions")).await;
                    return;
                };

                relay.metrics.connections_total.fetch_add(1, Ordering::Relaxed);
                relay.spawn_in_slot(slot, Arc::new(connection));
            });
        }
    }

    /// Bind the configured listeners and run until an error occurs.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        http::health::init_start_time();
        spawn_maintenance_task(self.rate_limits.clone(), LIMITER_MAINTENANCE_INTERVAL);

        if self.config.http.enabled {
            let http_listener = TcpListener::bind(&self.config.http.bind_address).await?;
            tracing::info!("HTTP endpoints on {}", http_listener.local_addr()?);
            let router = http::build_router(self.clone());
            tokio::spawn(async move {
                if let Err(e) = axum::serve(http_listener, router).await {
                    tracing::error!("HTTP server stopped: {}", e);
                }
            });
        }

        let listener = TcpListener::bind(&self.config.server.bind_address).await?;
        self.serve(listener).await
    }
}
