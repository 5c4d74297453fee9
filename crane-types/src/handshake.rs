//! Connection opening frames.
//!
//! Every connection starts with a bare role token followed by a
//! [`RoomAnnouncement`]. Only after both does the tagged [`Package`] stream
//! begin.
//!
//! [`Package`]: crate::Package

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::WireError;

/// Which side of a room a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Owns the authoritative content set and drives the room.
    Publisher,
    /// Receives content and reports what it is missing.
    Subscriber,
}

impl Role {
    /// The token sent on the wire.
    pub fn token(&self) -> &'static str {
        match self {
            Role::Publisher => "pub",
            Role::Subscriber => "sub",
        }
    }

    /// Parse the first frame of a connection.
    ///
    /// Surrounding whitespace is tolerated; anything other than `pub` or
    /// `sub` is rejected.
    pub fn from_frame(frame: &[u8]) -> Result<Self, WireError> {
        let text = String::from_utf8_lossy(frame);
        match text.trim() {
            "pub" => Ok(Role::Publisher),
            "sub" => Ok(Role::Subscriber),
            other => Err(WireError::InvalidRole(other.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.token())
    }
}

/// Second frame of every connection: the project room to open or join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAnnouncement {
    /// Project name, used as the room key
    pub room: String,
}

impl RoomAnnouncement {
    /// Create an announcement for the given project.
    pub fn new(room: impl Into<String>) -> Self {
        Self { room: room.into() }
    }

    /// Serialize to MessagePack bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, WireError> {
        rmp_serde::to_vec_named(self).map_err(WireError::Serialization)
    }

    /// Deserialize from MessagePack bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, WireError> {
        rmp_serde::from_slice(bytes).map_err(WireError::Deserialization)
    }
}
