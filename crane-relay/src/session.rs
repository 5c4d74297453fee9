//! Per-connection session management.
//!
//! Each connection gets a Session that reads the role token and room
//! announcement, then runs either the publisher or the subscriber state
//! machine until the room ends or the connection fails.
//!
//! ```text
//! publisher:  RoomOpen → Negotiating → Reconciling → Streaming → Closed
//! subscriber: AwaitingRoom → Attached → ReportingMissing → AwaitingDelivery → Terminated
//! ```

use crate::connection::PeerConnection;
use crate::error::{SessionError, SessionResult};
use crate::registry::{Room, RoomOutcome, SubscriberId};
use crate::server::CraneRelay;
use crate::transport::broadcast;
use crane_types::{MissingSet, Package, Role, RoomAnnouncement};
use futures_util::future::join_all;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Publisher state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublisherState {
    /// Room registered, nothing received yet.
    RoomOpen,
    /// Answering `refresh` until `sync`.
    Negotiating,
    /// Fanning out the hash manifest and collecting missing sets.
    Reconciling,
    /// Relaying content to subscribers.
    Streaming,
    /// Room removed from the registry.
    Closed,
}

/// Subscriber state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    /// Waiting for the publisher to open the room.
    AwaitingRoom,
    /// Appended to the room's subscriber list.
    Attached,
    /// Receiving this subscriber's missing set.
    ReportingMissing,
    /// Waiting for the room to end while content is pushed to us.
    AwaitingDelivery,
    /// Session over.
    Terminated,
}

/// Session state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Waiting for the role token and room announcement.
    Handshake,
    /// Running as a publisher.
    Publisher(PublisherState),
    /// Running as a subscriber.
    Subscriber(SubscriberState),
}

/// A per-connection session.
pub struct Session {
    relay: Arc<CraneRelay>,
    connection: PeerConnection,
    state: SessionState,
}

impl Session {
    /// Create a new session for a connection.
    pub fn new(relay: Arc<CraneRelay>, connection: PeerConnection) -> Self {
        Self {
            relay,
            connection,
            state: SessionState::Handshake,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the session until completion.
    ///
    /// The connection is closed on return; errors that the peer should hear
    /// about are passed along as the close reason.
    pub async fn run(mut self) -> SessionResult<()> {
        let relay = self.relay.clone();
        let metrics = relay.metrics();
        tracing::info!("New connection from {}", self.connection.remote_addr());

        let result = self.drive().await;

        let reason = match &result {
            Ok(()) => None,
            Err(e) => {
                if !matches!(
                    e,
                    SessionError::PeerDisconnected(_) | SessionError::RoomAborted { .. }
                ) {
                    metrics.errors_total.fetch_add(1, Ordering::Relaxed);
                }
                e.close_reason()
            }
        };
        if let Err(e) = self.connection.close(reason.as_deref()).await {
            tracing::debug!("Close failed: {}", e);
        }

        tracing::debug!("Session finished in state {:?}", self.state);
        result
    }

    async fn drive(&mut self) -> SessionResult<()> {
        let role = Role::from_frame(&self.connection.recv().await?).map_err(|e| {
            SessionError::MalformedEnvelope {
                reason: e.to_string(),
            }
        })?;
        let announcement =
            RoomAnnouncement::from_bytes(&self.connection.recv().await?).map_err(|e| {
                SessionError::MalformedEnvelope {
                    reason: format!("bad room announcement: {e}"),
                }
            })?;

        let span = tracing::Span::current();
        span.record("role", role.token());
        span.record("room", announcement.room.as_str());

        match role {
            Role::Publisher => self.run_publisher(&announcement.room).await,
            Role::Subscriber => self.run_subscriber(&announcement.room).await,
        }
    }

    // ── publisher ──────────────────────────────────────────────

    async fn run_publisher(&mut self, name: &str) -> SessionResult<()> {
        self.state = SessionState::Publisher(PublisherState::RoomOpen);
        let room = self.relay.registry().create(name)?;
        self.relay.metrics().rooms_opened.fetch_add(1, Ordering::Relaxed);
        tracing::info!("[PUB] Opened room {:?}", name);

        let result = self.publish(&room).await;

        let outcome = match &result {
            Ok(()) => {
                self.relay.metrics().rooms_completed.fetch_add(1, Ordering::Relaxed);
                tracing::info!("[PUB] Room {:?} completed", name);
                RoomOutcome::Completed
            }
            Err(e) => {
                tracing::warn!("[PUB] Room {:?} failed: {}; disconnecting subscribers", name, e);
                self.relay.metrics().rooms_aborted.fetch_add(1, Ordering::Relaxed);
                let subscribers = room.subscribers();
                join_all(
                    subscribers
                        .iter()
                        .map(|subscriber| subscriber.close(Some("Publisher disconnected"))),
                )
                .await;
                RoomOutcome::Aborted
            }
        };

        self.relay.registry().delete(name, outcome);
        self.state = SessionState::Publisher(PublisherState::Closed);
        result
    }

    async fn publish(&mut self, room: &Arc<Room>) -> SessionResult<()> {
        self.negotiate(room).await?;
        self.reconcile(room).await?;
        self.stream(room).await
    }

    /// Answer `refresh` until `sync`, then close the room to newcomers.
    async fn negotiate(&mut self, room: &Room) -> SessionResult<()> {
        self.state = SessionState::Publisher(PublisherState::Negotiating);

        loop {
            match self.recv_package().await? {
                Some(Package::Refresh { .. }) => {
                    let subscribers = room.subscriber_addrs();
                    tracing::debug!("[PUB] refresh: {} subscriber(s)", subscribers.len());
                    let reply = Package::subscribers(subscribers).to_bytes()?;
                    self.connection.send(&reply).await?;
                }
                Some(Package::Sync) => break,
                Some(other) => self.unexpected(&other),
                None => {}
            }
        }

        room.close_to_newcomers();
        tracing::info!("[PUB] Room closed with {} subscriber(s)", room.subscriber_count());
        Ok(())
    }

    /// Relay the hash manifest to every subscriber and wait for all of
    /// their missing sets.
    async fn reconcile(&mut self, room: &Room) -> SessionResult<()> {
        self.state = SessionState::Publisher(PublisherState::Reconciling);
        let transport = self.relay.transport();

        let manifest = transport.receive(self.connection.as_ref()).await?;
        tracing::debug!("[PUB] Received hash manifest ({} bytes)", manifest.len());

        let report = transport.send_to_all(&room.subscribers(), &manifest).await?;
        if report.failed > 0 {
            tracing::warn!(
                "[PUB] Manifest reached {}/{} subscribers",
                report.delivered,
                report.delivered + report.failed
            );
        }

        // A publisher that drops while subscribers report still aborts the room.
        loop {
            tokio::select! {
                _ = room.wait_until_reconciled() => break,
                frame = self.connection.recv() => {
                    let _ = frame?;
                    self.relay.metrics().errors_total.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("[PUB] Ignoring frame received before missing set was sent");
                }
            }
        }

        tracing::info!(
            "[PUB] All {} subscriber(s) reported, {} file(s) missing",
            room.status(),
            room.missing_files().packages.len()
        );
        Ok(())
    }

    /// Hand the missing set to the publisher, then fan its content out.
    async fn stream(&mut self, room: &Room) -> SessionResult<()> {
        self.state = SessionState::Publisher(PublisherState::Streaming);
        let metrics = self.relay.metrics();

        let missing = room.missing_files().to_bytes()?;
        self.relay
            .transport()
            .send(self.connection.as_ref(), &missing)
            .await?;

        loop {
            match self.recv_package().await? {
                Some(Package::Complete) => continue,
                Some(Package::Close) => break,
                Some(package @ (Package::Chunk { .. } | Package::Full { .. })) => {
                    let size = package.data().map_or(0, <[u8]>::len) as u64;
                    let frame = package.to_bytes()?;
                    let report = broadcast(&room.subscribers(), &frame).await;

                    metrics.chunks_relayed.fetch_add(1, Ordering::Relaxed);
                    metrics
                        .bytes_relayed
                        .fetch_add(size * report.delivered as u64, Ordering::Relaxed);
                }
                Some(other) => self.unexpected(&other),
                None => {}
            }
        }

        let complete = Package::Complete.to_bytes()?;
        let report = broadcast(&room.subscribers(), &complete).await;
        tracing::info!("[PUB] Transfer complete for {} subscriber(s)", report.delivered);
        Ok(())
    }

    // ── subscriber ─────────────────────────────────────────────

    async fn run_subscriber(&mut self, name: &str) -> SessionResult<()> {
        self.state = SessionState::Subscriber(SubscriberState::AwaitingRoom);
        tracing::info!("[SUB] Waiting for room {:?}", name);

        let room = match self.relay.rendezvous().wait_for_room(name).await {
            Ok(room) => room,
            Err(e) => {
                self.relay
                    .metrics()
                    .rendezvous_timeouts
                    .fetch_add(1, Ordering::Relaxed);
                tracing::info!("[SUB] {}", e);
                self.state = SessionState::Subscriber(SubscriberState::Terminated);
                return Err(e);
            }
        };

        let id = room.attach(self.connection.clone())?;
        self.state = SessionState::Subscriber(SubscriberState::Attached);
        tracing::info!("[SUB] Attached to room {:?}", name);

        let result = self.subscribe(&room, id).await;
        if let Err(e) = &result {
            if room.detach(id) {
                tracing::warn!("[SUB] Left room {:?}: {}", name, e);
            }
        }

        self.state = SessionState::Subscriber(SubscriberState::Terminated);
        result
    }

    async fn subscribe(&mut self, room: &Room, id: SubscriberId) -> SessionResult<()> {
        self.state = SessionState::Subscriber(SubscriberState::ReportingMissing);
        let payload = self
            .relay
            .transport()
            .receive(self.connection.as_ref())
            .await?;
        let missing = MissingSet::from_bytes(&payload)?;
        tracing::debug!("[SUB] Missing {} file(s)", missing.packages.len());
        room.report_missing(id, missing);

        self.state = SessionState::Subscriber(SubscriberState::AwaitingDelivery);
        loop {
            tokio::select! {
                outcome = room.wait_until_ended() => {
                    return match outcome {
                        RoomOutcome::Completed => Ok(()),
                        RoomOutcome::Aborted => Err(SessionError::RoomAborted {
                            room: room.name().to_string(),
                        }),
                    };
                }
                frame = self.connection.recv() => {
                    let _ = frame?;
                    tracing::debug!("[SUB] Ignoring frame while awaiting delivery");
                }
            }
        }
    }

    // ── helpers ────────────────────────────────────────────────

    /// Receive the next package. `None` means the frame did not decode; it
    /// has already been logged and counted.
    async fn recv_package(&self) -> SessionResult<Option<Package>> {
        let frame = self.connection.recv().await?;
        match Package::from_bytes(&frame) {
            Ok(package) => Ok(Some(package)),
            Err(e) => {
                self.relay.metrics().errors_total.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Malformed envelope from {}: {}", self.connection.remote_addr(), e);
                Ok(None)
            }
        }
    }

    fn unexpected(&self, package: &Package) {
        self.relay.metrics().errors_total.fetch_add(1, Ordering::Relaxed);
        tracing::warn!("Unexpected {} package in state {:?}", package.kind(), self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::connection::{Connection, MemoryConnection};
    use std::net::SocketAddr;

    fn relay() -> Arc<CraneRelay> {
        Arc::new(CraneRelay::new(Config::default()))
    }

    fn connect(port: u16) -> (PeerConnection, MemoryConnection) {
        let relay_addr: SocketAddr = "127.0.0.1:8765".parse().unwrap();
        let client_addr: SocketAddr = format!("192.168.1.10:{port}").parse().unwrap();
        let (server_side, client) = MemoryConnection::pair(relay_addr, client_addr);
        (Arc::new(server_side), client)
    }

    #[tokio::test]
    async fn new_session_awaits_handshake() {
        let (server_side, _client) = connect(1);
        let session = Session::new(relay(), server_side);
        assert_eq!(session.state(), SessionState::Handshake);
    }

    #[tokio::test]
    async fn unknown_role_closes_with_reason() {
        let relay = relay();
        let (server_side, client) = connect(1);
        client.send(b"admin").await.unwrap();

        let err = Session::new(relay.clone(), server_side).run().await.unwrap_err();
        assert!(matches!(err, SessionError::MalformedEnvelope { .. }));

        assert!(client.recv().await.is_err());
        assert!(client.close_reason().unwrap().contains("invalid role token"));
        assert_eq!(relay.metrics().errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn bad_announcement_rejected() {
        let (server_side, client) = connect(1);
        client.send(b"pub").await.unwrap();
        client.send(b"\xc1").await.unwrap();

        let err = Session::new(relay(), server_side).run().await.unwrap_err();
        assert!(matches!(err, SessionError::MalformedEnvelope { .. }));
    }

    #[tokio::test]
    async fn duplicate_publisher_rejected() {
        let relay = relay();
        relay.registry().create("proj1").unwrap();

        let (server_side, client) = connect(1);
        client.send(b"pub").await.unwrap();
        client
            .send(&RoomAnnouncement::new("proj1").to_bytes().unwrap())
            .await
            .unwrap();

        let err = Session::new(relay.clone(), server_side).run().await.unwrap_err();
        assert!(matches!(err, SessionError::RoomExists { .. }));
        assert!(client.recv().await.is_err());
        assert_eq!(client.close_reason().as_deref(), Some("Room proj1 is already open"));

        // The existing room survives the rejected publisher
        assert!(relay.registry().lookup("proj1").is_some());
    }

    #[tokio::test]
    async fn late_subscriber_rejected() {
        let relay = relay();
        let room = relay.registry().create("proj1").unwrap();
        room.close_to_newcomers();

        let (server_side, client) = connect(1);
        client.send(b"sub").await.unwrap();
        client
            .send(&RoomAnnouncement::new("proj1").to_bytes().unwrap())
            .await
            .unwrap();

        let err = Session::new(relay, server_side).run().await.unwrap_err();
        assert!(matches!(err, SessionError::RoomClosed { .. }));
        assert_eq!(room.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn negotiating_ignores_unexpected_packages() {
        let relay = relay();
        let (server_side, client) = connect(1);
        let handle = tokio::spawn(Session::new(relay.clone(), server_side).run());

        client.send(b"pub").await.unwrap();
        client
            .send(&RoomAnnouncement::new("proj1").to_bytes().unwrap())
            .await
            .unwrap();
        client.send(&Package::Complete.to_bytes().unwrap()).await.unwrap();
        client.send(b"garbage").await.unwrap();
        client.send(&Package::refresh().to_bytes().unwrap()).await.unwrap();

        let reply = Package::from_bytes(&client.recv().await.unwrap()).unwrap();
        assert_eq!(reply, Package::subscribers(vec![]));
        assert_eq!(relay.metrics().errors_total.load(Ordering::Relaxed), 2);

        drop(client);
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::PeerDisconnected(_)));
        assert!(relay.registry().lookup("proj1").is_none());
    }

    #[tokio::test]
    async fn subscriber_disconnect_only_detaches() {
        let relay = relay();
        let room = relay.registry().create("proj1").unwrap();

        let (server_side, client) = connect(1);
        let handle = tokio::spawn(Session::new(relay.clone(), server_side).run());
        client.send(b"sub").await.unwrap();
        client
            .send(&RoomAnnouncement::new("proj1").to_bytes().unwrap())
            .await
            .unwrap();

        while room.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        drop(client);

        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, SessionError::PeerDisconnected(_)));
        assert_eq!(room.subscriber_count(), 0);
        assert!(relay.registry().lookup("proj1").is_some());
    }
}
