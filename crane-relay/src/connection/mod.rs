//! Connection abstraction for crane-relay.
//!
//! Sessions never touch a socket directly. They talk to a [`Connection`],
//! which moves whole frames (one role token, one envelope) in both
//! directions:
//! - `send()` transmits one frame
//! - `recv()` waits for the next frame
//! - `close()` terminates, optionally telling the peer why
//!
//! The publisher writes to subscriber connections while the subscriber's own
//! session is blocked in `recv()`, so implementations must allow `send()` and
//! `recv()` to run concurrently.

mod memory;
mod websocket;

pub use memory::MemoryConnection;
pub use websocket::WsConnection;

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection closed (by either side).
    #[error("connection closed")]
    ConnectionClosed,

    /// Send failed.
    #[error("send failed: {0}")]
    SendFailed(String),

    /// Receive failed.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Opening handshake failed.
    #[error("handshake failed: {0}")]
    Handshake(String),
}

/// A duplex, frame-oriented peer connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Remote endpoint, reported to publishers as `host:port`.
    fn remote_addr(&self) -> SocketAddr;

    /// Send one frame.
    async fn send(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Receive the next frame.
    ///
    /// Blocks until a frame arrives or the connection closes.
    async fn recv(&self) -> Result<Vec<u8>, TransportError>;

    /// Close the connection, passing `reason` to the peer when given.
    async fn close(&self, reason: Option<&str>) -> Result<(), TransportError>;
}

/// Shared handle to a peer connection.
pub type PeerConnection = Arc<dyn Connection>;
