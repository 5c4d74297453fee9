//! Error types for crane-relay.

use crate::connection::TransportError;
use crane_types::WireError;
use std::time::Duration;

/// Main error type for crane-relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Session error.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that end a single peer session.
///
/// None of these are retried; each is terminal for the affected connection.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No publisher opened the room in time.
    #[error("publisher did not open room {room:?} within {} seconds", waited.as_secs())]
    RendezvousTimeout {
        /// Room the subscriber asked for.
        room: String,
        /// How long the subscriber waited.
        waited: Duration,
    },

    /// The peer's connection dropped mid-session.
    #[error("peer disconnected: {0}")]
    PeerDisconnected(#[from] TransportError),

    /// The publisher's connection dropped and the room was torn down.
    #[error("room {room:?} aborted by its publisher")]
    RoomAborted {
        /// The aborted room.
        room: String,
    },

    /// A frame that does not fit the protocol at this point.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope {
        /// What was wrong with it.
        reason: String,
    },

    /// A second publisher tried to open a room that is already open.
    #[error("room {room:?} is already open")]
    RoomExists {
        /// The contested room.
        room: String,
    },

    /// A subscriber arrived after the publisher started syncing.
    #[error("room {room:?} is no longer accepting subscribers")]
    RoomClosed {
        /// The closed room.
        room: String,
    },

    /// A chunked payload grew past the configured limit.
    #[error("payload too large: {size} bytes (limit: {limit} bytes)")]
    PayloadTooLarge {
        /// Bytes accumulated so far.
        size: usize,
        /// Maximum allowed size.
        limit: usize,
    },

    /// A frame could not be encoded or decoded.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

impl SessionError {
    /// Reason string sent in the WebSocket close frame, if the peer should
    /// be told why its connection is being closed.
    pub fn close_reason(&self) -> Option<String> {
        match self {
            SessionError::RendezvousTimeout { waited, .. } => Some(format!(
                "Publisher did not create a room during {} seconds",
                waited.as_secs()
            )),
            SessionError::RoomExists { room } => Some(format!("Room {room} is already open")),
            SessionError::RoomClosed { room } => {
                Some(format!("Room {room} is no longer accepting subscribers"))
            }
            SessionError::MalformedEnvelope { reason } => Some(format!("Malformed envelope: {reason}")),
            SessionError::PayloadTooLarge { limit, .. } => {
                Some(format!("Payload exceeds {limit} bytes"))
            }
            SessionError::Wire(_) => Some("Malformed frame".to_string()),
            SessionError::PeerDisconnected(_) | SessionError::RoomAborted { .. } => None,
        }
    }
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for session operations.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_reason_mentions_duration() {
        let err = SessionError::RendezvousTimeout {
            room: "proj2".into(),
            waited: Duration::from_secs(60),
        };
        assert_eq!(
            err.close_reason().as_deref(),
            Some("Publisher did not create a room during 60 seconds")
        );
        assert!(err.to_string().contains("proj2"));
    }

    #[test]
    fn disconnect_has_no_close_reason() {
        let err = SessionError::from(TransportError::ConnectionClosed);
        assert!(matches!(err, SessionError::PeerDisconnected(_)));
        assert!(err.close_reason().is_none());
    }

    #[test]
    fn wire_error_converts() {
        let err: SessionError = WireError::InvalidRole("x".into()).into();
        assert!(matches!(err, SessionError::Wire(_)));
    }

    #[test]
    fn errors_are_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SessionError>();
        assert_send_sync::<RelayError>();
    }
}
