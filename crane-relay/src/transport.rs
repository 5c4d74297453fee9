//! Chunked payload transfer and subscriber fan-out.
//!
//! A logical payload travels as a run of `chunk` packages followed by a
//! single `complete`. There is no per-chunk acknowledgment and no checksum;
//! integrity rests on the connection being ordered and reliable.

use crate::config::TransferConfig;
use crate::connection::{Connection, PeerConnection};
use crate::error::{SessionError, SessionResult};
use crane_types::{split_payload, Package};
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::task::JoinError;
use tracing::Instrument;

/// Result of sending one thing to every subscriber.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanOutReport {
    /// Subscribers that received everything.
    pub delivered: usize,
    /// Subscribers whose connection failed part way.
    pub failed: usize,
}

/// Sends and receives payloads as ordered chunk runs.
#[derive(Debug, Clone)]
pub struct ChunkTransport {
    max_chunk_size: usize,
    max_payload_size: usize,
}

impl ChunkTransport {
    /// Create a transport with the configured limits.
    pub fn new(config: &TransferConfig) -> Self {
        Self {
            max_chunk_size: config.max_chunk_size,
            max_payload_size: config.max_payload_size,
        }
    }

    /// Largest `chunk` this transport emits.
    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    /// Encode `payload` as `chunk` frames plus the closing `complete`.
    pub fn frames(&self, payload: &[u8]) -> SessionResult<Vec<Vec<u8>>> {
        let chunks = split_payload(payload, self.max_chunk_size)?;
        let mut frames = Vec::with_capacity(chunks.len() + 1);
        for chunk in chunks {
            frames.push(Package::chunk(chunk.data, chunk.path).to_bytes()?);
        }
        frames.push(Package::Complete.to_bytes()?);
        Ok(frames)
    }

    /// Send `payload` to one peer. Returns the number of chunks sent.
    pub async fn send(&self, connection: &dyn Connection, payload: &[u8]) -> SessionResult<usize> {
        let frames = self.frames(payload)?;
        let chunks = frames.len() - 1;
        for frame in &frames {
            connection.send(frame).await?;
        }
        Ok(chunks)
    }

    /// Receive one chunked payload and return the reassembled bytes.
    ///
    /// `chunk` and `full` data is appended in arrival order until
    /// `complete`. Any other package, or a frame that does not decode, is
    /// logged and skipped.
    pub async fn receive(&self, connection: &dyn Connection) -> SessionResult<Vec<u8>> {
        let mut buffer = Vec::new();
        loop {
            let frame = connection.recv().await?;
            let package = match Package::from_bytes(&frame) {
                Ok(package) => package,
                Err(e) => {
                    tracing::warn!(
                        "Skipping undecodable frame from {} during transfer: {}",
                        connection.remote_addr(),
                        e
                    );
                    continue;
                }
            };

            match package {
                Package::Complete => return Ok(buffer),
                Package::Chunk { data, .. } | Package::Full { data, .. } => {
                    if buffer.len() + data.len() > self.max_payload_size {
                        return Err(SessionError::PayloadTooLarge {
                            size: buffer.len() + data.len(),
                            limit: self.max_payload_size,
                        });
                    }
                    buffer.extend_from_slice(&data);
                }
                other => {
                    tracing::warn!(
                        "Unexpected {} package from {} during transfer",
                        other.kind(),
                        connection.remote_addr()
                    );
                }
            }
        }
    }

    /// Send `payload` to every subscriber concurrently.
    ///
    /// Each subscriber gets its own ordered chunk run on its own task; runs
    /// are not ordered relative to each other. All runs are joined before
    /// returning, and a run already started finishes even if the caller is
    /// dropped.
    pub async fn send_to_all(
        &self,
        subscribers: &[PeerConnection],
        payload: &[u8],
    ) -> SessionResult<FanOutReport> {
        let frames = Arc::new(self.frames(payload)?);
        let sends = subscribers.iter().map(|subscriber| {
            let subscriber = subscriber.clone();
            let frames = frames.clone();
            tokio::spawn(
                async move {
                    for frame in frames.iter() {
                        if let Err(e) = subscriber.send(frame).await {
                            tracing::warn!(
                                "Chunked send to {} failed: {}",
                                subscriber.remote_addr(),
                                e
                            );
                            return false;
                        }
                    }
                    true
                }
                .in_current_span(),
            )
        });
        Ok(tally(join_all(sends).await))
    }
}

/// Send one already-encoded frame to every subscriber concurrently.
///
/// Every send runs on its own task. A failing subscriber is logged and
/// counted; it never stops delivery to the others.
pub async fn broadcast(subscribers: &[PeerConnection], frame: &[u8]) -> FanOutReport {
    let frame: Arc<[u8]> = Arc::from(frame);
    let sends = subscribers.iter().map(|subscriber| {
        let subscriber = subscriber.clone();
        let frame = frame.clone();
        tokio::spawn(
            async move {
                match subscriber.send(&frame).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!("Broadcast to {} failed: {}", subscriber.remote_addr(), e);
                        false
                    }
                }
            }
            .in_current_span(),
        )
    });
    tally(join_all(sends).await)
}

fn tally(results: Vec<Result<bool, JoinError>>) -> FanOutReport {
    let delivered = results
        .iter()
        .filter(|result| matches!(result, Ok(true)))
        .count();
    FanOutReport {
        delivered,
        failed: results.len() - delivered,
    }
}
