//! Error types for the webcrane wire format.

use thiserror::Error;

/// Errors that can occur while encoding or decoding wire frames.
#[derive(Debug, Error)]
pub enum WireError {
    /// MessagePack serialization failed
    #[error("serialization failed: {0}")]
    Serialization(#[source] rmp_serde::encode::Error),

    /// MessagePack deserialization failed
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] rmp_serde::decode::Error),

    /// First frame was not a known role token
    #[error("invalid role token: {0:?}")]
    InvalidRole(String),

    /// Chunk size limit of zero bytes
    #[error("chunk size must be greater than zero")]
    ZeroChunkSize,
}
