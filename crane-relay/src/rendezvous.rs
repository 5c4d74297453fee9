//! Bounded-time wait for a room to come into existence.
//!
//! Subscribers usually connect before their publisher has opened the room.
//! The supervisor parks them on the registry's creation signal and gives up
//! after the configured timeout.

use crate::error::{SessionError, SessionResult};
use crate::registry::{Room, RoomRegistry};
use std::sync::Arc;
use std::time::Duration;

/// Waits for named rooms to appear in a registry.
#[derive(Debug, Clone)]
pub struct RendezvousSupervisor {
    registry: Arc<RoomRegistry>,
    timeout: Duration,
}

impl RendezvousSupervisor {
    /// Create a supervisor over `registry` that waits at most `timeout`.
    pub fn new(registry: Arc<RoomRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    /// The configured wait limit.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Return the room named `name`, waiting for it to be created if needed.
    ///
    /// Fails with [`SessionError::RendezvousTimeout`] once the timeout
    /// elapses without the room appearing.
    pub async fn wait_for_room(&self, name: &str) -> SessionResult<Arc<Room>> {
        // Subscribe before the first lookup so a creation in between is not missed.
        let mut created = self.registry.subscribe_created();

        let wait = async {
            loop {
                if let Some(room) = self.registry.lookup(name) {
                    return room;
                }
                if created.changed().await.is_err() {
                    // Registry dropped; nothing will ever be created.
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::time::timeout(self.timeout, wait)
            .await
            .map_err(|_| SessionError::RendezvousTimeout {
                room: name.to_string(),
                waited: self.timeout,
            })
    }
}
