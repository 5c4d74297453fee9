//! Health check endpoint.
//!
//! Reports `"full"` instead of `"ok"` while every session slot is taken.

use crate::registry::RoomPhases;
use crate::server::CraneRelay;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Global start time for uptime calculation.
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// Rooms by phase.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RoomsHealth {
    /// Rooms still accepting subscribers.
    pub accepting: usize,
    /// Rooms reconciling or streaming.
    pub syncing: usize,
}

impl From<RoomPhases> for RoomsHealth {
    fn from(phases: RoomPhases) -> Self {
        Self {
            accepting: phases.accepting,
            syncing: phases.syncing,
        }
    }
}

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// `"ok"`, or `"full"` when no session slot is free.
    pub status: &'static str,
    /// Server version.
    pub version: &'static str,
    /// Open rooms by phase.
    pub rooms: RoomsHealth,
    /// Subscribers attached to any room.
    pub subscribers: usize,
    /// Sessions currently running.
    pub sessions: usize,
    /// Configured session cap.
    pub max_sessions: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

impl HealthStatus {
    /// Snapshot the relay's current state.
    pub fn collect(relay: &CraneRelay) -> Self {
        let sessions = relay.total_sessions();
        let max_sessions = relay.config().limits.max_concurrent_sessions;

        Self {
            status: if sessions >= max_sessions { "full" } else { "ok" },
            version: env!("CARGO_PKG_VERSION"),
            rooms: relay.registry().room_phases().into(),
            subscribers: relay.total_subscribers(),
            sessions,
            max_sessions,
            uptime_seconds: START_TIME
                .get()
                .map(|start| start.elapsed().as_secs())
                .unwrap_or(0),
        }
    }
}

/// Health check handler.
pub async fn health_handler(Extension(relay): Extension<Arc<CraneRelay>>) -> Json<HealthStatus> {
    Json(HealthStatus::collect(&relay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    #[test]
    fn counts_rooms_by_phase() {
        let relay = CraneRelay::new(Config::default());
        relay.registry().create("proj1").unwrap();
        relay.registry().create("proj2").unwrap().close_to_newcomers();

        let health = HealthStatus::collect(&relay);
        assert_eq!(health.status, "ok");
        assert_eq!(health.rooms.accepting, 1);
        assert_eq!(health.rooms.syncing, 1);
    }

    #[test]
    fn full_when_no_session_slot_is_free() {
        let mut config = Config::default();
        config.limits.max_concurrent_sessions = 0;
        let health = HealthStatus::collect(&CraneRelay::new(config));
        assert_eq!(health.status, "full");
    }

    #[test]
    fn health_status_serializes() {
        let relay = CraneRelay::new(Config::default());
        let json = serde_json::to_value(HealthStatus::collect(&relay)).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["rooms"]["accepting"], 0);
        assert_eq!(json["max_sessions"], 1024);
    }
}
