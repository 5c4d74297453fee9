//! In-process connections for tests and embedding.
//!
//! [`MemoryConnection::pair`] returns two connected halves. Frames sent on
//! one half arrive on the other in order; dropping a half looks like an
//! abrupt disconnect to its peer.

use super::{Connection, TransportError};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};

#[derive(Debug)]
enum Frame {
    Data(Vec<u8>),
    Close(Option<String>),
}

/// One half of an in-memory duplex connection.
#[derive(Debug)]
pub struct MemoryConnection {
    remote_addr: SocketAddr,
    tx: mpsc::UnboundedSender<Frame>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Frame>>,
    /// Set once this half has closed locally.
    closed: watch::Sender<bool>,
    /// Reason the peer gave when it closed us, if any.
    peer_close: Mutex<Option<Option<String>>>,
}

impl MemoryConnection {
    /// Create a connected pair.
    ///
    /// The first half sees `b_addr` as its remote address, the second sees
    /// `a_addr`. For relay tests the first half is the server side of a
    /// client at `b_addr`.
    pub fn pair(a_addr: SocketAddr, b_addr: SocketAddr) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (Self::half(b_addr, a_tx, a_rx), Self::half(a_addr, b_tx, b_rx))
    }

    fn half(
        remote_addr: SocketAddr,
        tx: mpsc::UnboundedSender<Frame>,
        rx: mpsc::UnboundedReceiver<Frame>,
    ) -> Self {
        Self {
            remote_addr,
            tx,
            rx: AsyncMutex::new(rx),
            closed: watch::Sender::new(false),
            peer_close: Mutex::new(None),
        }
    }

    /// Whether the peer has closed this connection with a close frame.
    ///
    /// Only known once `recv()` has observed the close.
    pub fn closed_by_peer(&self) -> bool {
        self.peer_close
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false)
    }

    /// The reason the peer gave when closing, once observed by `recv()`.
    pub fn close_reason(&self) -> Option<String> {
        self.peer_close
            .lock()
            .ok()
            .and_then(|guard| guard.clone().flatten())
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if *self.closed.borrow() {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(Frame::Data(data.to_vec()))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn recv(&self) -> Result<Vec<u8>, TransportError> {
        let mut closed = self.closed.subscribe();
        let mut rx = self.rx.lock().await;

        tokio::select! {
            frame = rx.recv() => match frame {
                Some(Frame::Data(data)) => Ok(data),
                Some(Frame::Close(reason)) => {
                    if let Ok(mut guard) = self.peer_close.lock() {
                        *guard = Some(reason);
                    }
                    Err(TransportError::ConnectionClosed)
                }
                None => Err(TransportError::ConnectionClosed),
            },
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::ConnectionClosed),
        }
    }

    async fn close(&self, reason: Option<&str>) -> Result<(), TransportError> {
        if self.closed.send_replace(true) {
            return Ok(());
        }
        // The peer may already be gone; closing is still successful locally.
        let _ = self.tx.send(Frame::Close(reason.map(str::to_string)));
        Ok(())
    }
}
