//! Room registry and per-room state.
//!
//! The registry maps project names to live [`Room`]s. It is owned by the
//! relay and handed to every session; nothing here is process-global, so
//! several relays (or tests) can run side by side.
//!
//! Each room keeps its state inside a `watch` channel. Every mutation goes
//! through `send_modify`, which both serializes writers and wakes waiters,
//! so the publisher's reconciliation wait and the subscribers' completion
//! wait resolve on the triggering change instead of a poll tick.

use crate::connection::PeerConnection;
use crate::error::{SessionError, SessionResult};
use crane_types::MissingSet;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Identifies one subscriber inside a room.
pub type SubscriberId = u64;

/// How a room ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomOutcome {
    /// Publisher sent `close` and the final `complete` went out.
    Completed,
    /// Publisher's session failed; subscribers were force-closed.
    Aborted,
}

struct Subscriber {
    id: SubscriberId,
    connection: PeerConnection,
    reported: bool,
}

/// Mutable state of one room.
///
/// Invariant: `status <= subscribers.len()`. Detaching a subscriber that
/// already reported also gives back its status count.
pub struct RoomState {
    subscribers: Vec<Subscriber>,
    available: bool,
    status: usize,
    files: BTreeSet<String>,
    outcome: Option<RoomOutcome>,
}

impl RoomState {
    fn new() -> Self {
        Self {
            subscribers: Vec::new(),
            available: true,
            status: 0,
            files: BTreeSet::new(),
            outcome: None,
        }
    }

    fn reconciled(&self) -> bool {
        self.status >= self.subscribers.len()
    }
}

/// A live room: one publisher, any number of subscribers.
pub struct Room {
    name: String,
    state: watch::Sender<RoomState>,
    next_subscriber: AtomicU64,
}

impl std::fmt::Debug for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Room")
            .field("name", &self.name)
            .field("subscribers", &state.subscribers.len())
            .field("available", &state.available)
            .field("status", &state.status)
            .field("files", &state.files.len())
            .field("outcome", &state.outcome)
            .finish()
    }
}

impl Room {
    fn new(name: String) -> Self {
        Self {
            name,
            state: watch::Sender::new(RoomState::new()),
            next_subscriber: AtomicU64::new(1),
        }
    }

    /// The project name this room was opened for.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a subscriber in join order.
    ///
    /// Fails with [`SessionError::RoomClosed`] once the publisher has sent
    /// `sync` or the room has ended.
    pub fn attach(&self, connection: PeerConnection) -> SessionResult<SubscriberId> {
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);
        let mut attached = false;

        self.state.send_if_modified(|state| {
            if !state.available || state.outcome.is_some() {
                return false;
            }
            state.subscribers.push(Subscriber {
                id,
                connection,
                reported: false,
            });
            attached = true;
            true
        });

        if attached {
            Ok(id)
        } else {
            Err(SessionError::RoomClosed {
                room: self.name.clone(),
            })
        }
    }

    /// Remove a subscriber. Returns whether it was still attached.
    pub fn detach(&self, id: SubscriberId) -> bool {
        self.state.send_if_modified(|state| {
            let Some(index) = state.subscribers.iter().position(|s| s.id == id) else {
                return false;
            };
            let removed = state.subscribers.remove(index);
            if removed.reported {
                state.status -= 1;
            }
            true
        })
    }

    /// Merge a subscriber's missing set into the room and count its report.
    ///
    /// A second report from the same subscriber still merges its set but is
    /// not counted twice.
    pub fn report_missing(&self, id: SubscriberId, missing: MissingSet) {
        self.state.send_modify(|state| {
            let Some(subscriber) = state.subscribers.iter_mut().find(|s| s.id == id) else {
                return;
            };
            if !subscriber.reported {
                subscriber.reported = true;
                state.status += 1;
            }
            state.files.extend(missing.packages);
        });
    }

    /// Stop accepting subscribers. Called when the publisher sends `sync`.
    pub fn close_to_newcomers(&self) {
        self.state.send_if_modified(|state| std::mem::replace(&mut state.available, false));
    }

    /// Whether new subscribers may still attach.
    pub fn is_available(&self) -> bool {
        self.state.borrow().available
    }

    /// Number of subscribers that have reported their missing set.
    pub fn status(&self) -> usize {
        self.state.borrow().status
    }

    /// Number of attached subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.state.borrow().subscribers.len()
    }

    /// Attached subscribers as `host:port`, in join order.
    pub fn subscriber_addrs(&self) -> Vec<String> {
        self.state
            .borrow()
            .subscribers
            .iter()
            .map(|s| s.connection.remote_addr().to_string())
            .collect()
    }

    /// Snapshot of attached subscriber connections, in join order.
    pub fn subscribers(&self) -> Vec<PeerConnection> {
        self.state
            .borrow()
            .subscribers
            .iter()
            .map(|s| s.connection.clone())
            .collect()
    }

    /// Union of every reported missing set.
    pub fn missing_files(&self) -> MissingSet {
        MissingSet {
            packages: self.state.borrow().files.clone(),
        }
    }

    /// How the room ended, if it has.
    pub fn outcome(&self) -> Option<RoomOutcome> {
        self.state.borrow().outcome
    }

    /// Wait until every attached subscriber has reported.
    ///
    /// Resolves immediately for a room without subscribers.
    pub async fn wait_until_reconciled(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(RoomState::reconciled).await;
    }

    /// Wait until the room is removed from its registry.
    pub async fn wait_until_ended(&self) -> RoomOutcome {
        let mut rx = self.state.subscribe();
        let outcome = match rx.wait_for(|state| state.outcome.is_some()).await {
            Ok(state) => state.outcome.unwrap_or(RoomOutcome::Aborted),
            Err(_) => RoomOutcome::Aborted,
        };
        outcome
    }

    fn end(&self, outcome: RoomOutcome) {
        self.state.send_modify(|state| {
            state.available = false;
            state.outcome.get_or_insert(outcome);
        });
    }
}

/// Open rooms counted by phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoomPhases {
    /// Rooms whose publisher has not sent `sync` yet.
    pub accepting: usize,
    /// Rooms reconciling or streaming.
    pub syncing: usize,
}

/// Process-wide mapping from project name to live room.
#[derive(Debug)]
pub struct RoomRegistry {
    rooms: DashMap<String, Arc<Room>>,
    /// Bumped on every successful `create`, so rendezvous waits can wake.
    created: watch::Sender<u64>,
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl RoomRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            created: watch::Sender::new(0),
        }
    }

    /// Open a fresh room.
    ///
    /// Fails with [`SessionError::RoomExists`] if the name is taken; the
    /// check and insert are atomic, so racing publishers cannot both win.
    pub fn create(&self, name: &str) -> SessionResult<Arc<Room>> {
        let room = match self.rooms.entry(name.to_string()) {
            Entry::Occupied(_) => {
                return Err(SessionError::RoomExists {
                    room: name.to_string(),
                })
            }
            Entry::Vacant(slot) => slot.insert(Arc::new(Room::new(name.to_string()))).clone(),
        };

        self.created.send_modify(|generation| *generation += 1);
        tracing::debug!("Opened room {:?} (total: {})", name, self.rooms.len());
        Ok(room)
    }

    /// Non-blocking lookup.
    pub fn lookup(&self, name: &str) -> Option<Arc<Room>> {
        self.rooms.get(name).map(|entry| entry.value().clone())
    }

    /// Remove a room and wake everyone waiting on it.
    ///
    /// Returns `false` if no room with that name was registered.
    pub fn delete(&self, name: &str, outcome: RoomOutcome) -> bool {
        match self.rooms.remove(name) {
            Some((_, room)) => {
                room.end(outcome);
                tracing::debug!(
                    "Removed room {:?} ({:?}, remaining: {})",
                    name,
                    outcome,
                    self.rooms.len()
                );
                true
            }
            None => false,
        }
    }

    /// Watch for room creations.
    pub fn subscribe_created(&self) -> watch::Receiver<u64> {
        self.created.subscribe()
    }

    /// Number of open rooms.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Open rooms split by whether they still accept subscribers.
    pub fn room_phases(&self) -> RoomPhases {
        self.rooms
            .iter()
            .fold(RoomPhases::default(), |mut phases, entry| {
                if entry.value().is_available() {
                    phases.accepting += 1;
                } else {
                    phases.syncing += 1;
                }
                phases
            })
    }

    /// Subscribers attached across all rooms.
    pub fn subscriber_count(&self) -> usize {
        self.rooms
            .iter()
            .map(|entry| entry.value().subscriber_count())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MemoryConnection;
    use std::net::SocketAddr;

    fn peer(port: u16) -> PeerConnection {
        let relay: SocketAddr = "127.0.0.1:8765".parse().unwrap();
        let client: SocketAddr = format!("10.0.0.1:{port}").parse().unwrap();
        let (server_side, _client_side) = MemoryConnection::pair(relay, client);
        Arc::new(server_side)
    }

    #[test]
    fn create_lookup_delete() {
        let registry = RoomRegistry::new();

        let room = registry.create("proj1").unwrap();
        assert_eq!(room.name(), "proj1");
        assert!(room.is_available());
        assert_eq!(room.status(), 0);
        assert_eq!(registry.room_count(), 1);

        assert!(registry.lookup("proj1").is_some());
        assert!(registry.lookup("other").is_none());

        assert!(registry.delete("proj1", RoomOutcome::Completed));
        assert!(registry.lookup("proj1").is_none());
        assert!(!registry.delete("proj1", RoomOutcome::Completed));
        assert_eq!(room.outcome(), Some(RoomOutcome::Completed));
    }

    #[test]
    fn duplicate_create_rejected() {
        let registry = RoomRegistry::new();
        let first = registry.create("proj1").unwrap();

        let err = registry.create("proj1").unwrap_err();
        assert!(matches!(err, SessionError::RoomExists { ref room } if room == "proj1"));

        // The original room is untouched
        assert!(Arc::ptr_eq(&first, &registry.lookup("proj1").unwrap()));
    }

    #[test]
    fn subscribers_listed_in_join_order() {
        let registry = RoomRegistry::new();
        let room = registry.create("proj1").unwrap();

        room.attach(peer(4000)).unwrap();
        room.attach(peer(3000)).unwrap();
        room.attach(peer(5000)).unwrap();

        assert_eq!(
            room.subscriber_addrs(),
            vec!["10.0.0.1:4000", "10.0.0.1:3000", "10.0.0.1:5000"]
        );
        assert_eq!(registry.subscriber_count(), 3);
    }

    #[test]
    fn attach_rejected_after_sync() {
        let registry = RoomRegistry::new();
        let room = registry.create("proj1").unwrap();
        room.attach(peer(4000)).unwrap();

        room.close_to_newcomers();

        let err = room.attach(peer(4001)).unwrap_err();
        assert!(matches!(err, SessionError::RoomClosed { .. }));
        assert_eq!(room.subscriber_count(), 1);
    }

    #[test]
    fn files_are_union_of_reports() {
        let registry = RoomRegistry::new();
        let room = registry.create("proj1").unwrap();
        let a = room.attach(peer(1)).unwrap();
        let b = room.attach(peer(2)).unwrap();

        room.report_missing(b, MissingSet::new(["y", "z"]));
        room.report_missing(a, MissingSet::new(["x", "y"]));

        assert_eq!(room.missing_files(), MissingSet::new(["x", "y", "z"]));
        assert_eq!(room.status(), 2);
    }

    #[test]
    fn repeated_report_counted_once() {
        let registry = RoomRegistry::new();
        let room = registry.create("proj1").unwrap();
        let a = room.attach(peer(1)).unwrap();
        room.attach(peer(2)).unwrap();

        room.report_missing(a, MissingSet::new(["x"]));
        room.report_missing(a, MissingSet::new(["w"]));

        assert_eq!(room.status(), 1);
        assert_eq!(room.missing_files(), MissingSet::new(["w", "x"]));
    }

    #[test]
    fn detach_keeps_status_within_subscriber_count() {
        let registry = RoomRegistry::new();
        let room = registry.create("proj1").unwrap();
        let a = room.attach(peer(1)).unwrap();
        let b = room.attach(peer(2)).unwrap();

        room.report_missing(a, MissingSet::default());
        assert!(room.detach(a));
        assert_eq!(room.status(), 0);
        assert_eq!(room.subscriber_count(), 1);

        assert!(room.detach(b));
        assert!(!room.detach(b));
        assert!(room.status() <= room.subscriber_count());
    }

    #[tokio::test]
    async fn reconciled_immediately_without_subscribers() {
        let registry = RoomRegistry::new();
        let room = registry.create("proj1").unwrap();
        room.close_to_newcomers();
        room.wait_until_reconciled().await;
    }

    #[tokio::test]
    async fn reconciliation_wait_resolves_on_last_report() {
        let registry = RoomRegistry::new();
        let room = registry.create("proj1").unwrap();
        let a = room.attach(peer(1)).unwrap();
        let b = room.attach(peer(2)).unwrap();
        room.close_to_newcomers();

        let waiter = {
            let room = room.clone();
            tokio::spawn(async move { room.wait_until_reconciled().await })
        };

        room.report_missing(a, MissingSet::default());
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        room.report_missing(b, MissingSet::default());
        waiter.await.unwrap();
        assert_eq!(room.status(), room.subscriber_count());
    }

    #[tokio::test]
    async fn reconciliation_wait_resolves_when_straggler_detaches() {
        let registry = RoomRegistry::new();
        let room = registry.create("proj1").unwrap();
        let a = room.attach(peer(1)).unwrap();
        let b = room.attach(peer(2)).unwrap();

        room.report_missing(a, MissingSet::default());
        room.detach(b);

        room.wait_until_reconciled().await;
    }

    #[tokio::test]
    async fn end_wakes_waiters_with_outcome() {
        let registry = RoomRegistry::new();
        let room = registry.create("proj1").unwrap();

        let waiter = {
            let room = room.clone();
            tokio::spawn(async move { room.wait_until_ended().await })
        };

        registry.delete("proj1", RoomOutcome::Aborted);
        assert_eq!(waiter.await.unwrap(), RoomOutcome::Aborted);
        assert!(!room.is_available());
    }

    #[test]
    fn phases_split_on_sync() {
        let registry = RoomRegistry::new();
        registry.create("a").unwrap();
        registry.create("b").unwrap().close_to_newcomers();
        registry.create("c").unwrap();

        assert_eq!(
            registry.room_phases(),
            RoomPhases {
                accepting: 2,
                syncing: 1
            }
        );
    }

    #[tokio::test]
    async fn ended_room_reports_outcome_without_waiting() {
        let registry = RoomRegistry::new();
        let room = registry.create("proj1").unwrap();
        registry.delete("proj1", RoomOutcome::Completed);

        assert_eq!(room.wait_until_ended().await, RoomOutcome::Completed);
        // The first outcome sticks
        room.end(RoomOutcome::Aborted);
        assert_eq!(room.wait_until_ended().await, RoomOutcome::Completed);
    }

    #[test]
    fn create_bumps_generation() {
        let registry = RoomRegistry::new();
        let rx = registry.subscribe_created();
        registry.create("a").unwrap();
        registry.create("b").unwrap();
        assert_eq!(*rx.borrow(), 2);
    }
}
