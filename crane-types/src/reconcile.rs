//! Reconciliation payloads.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::WireError;

/// Content identifiers a peer lacks.
///
/// Sent by each subscriber after it has diffed the publisher's hash manifest,
/// and sent back to the publisher as the union over all subscribers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingSet {
    /// Missing content identifiers
    pub packages: BTreeSet<String>,
}

impl MissingSet {
    /// Build a set from any iterator of identifiers.
    pub fn new<I, S>(packages: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            packages: packages.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether nothing is missing.
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
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
