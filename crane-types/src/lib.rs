//! # crane-types
//!
//! Wire format types for the webcrane relay.
//!
//! This crate provides the types exchanged between the relay and its peers:
//! - [`Role`] - The plain role token every connection opens with
//! - [`RoomAnnouncement`] - Names the project room a peer wants
//! - [`Package`] - Tagged envelope for every later frame
//! - [`MissingSet`] - Reconciliation payload listing missing content ids
//! - [`split_payload`] - Bounded-size splitter used before `chunk` framing
//! - [`WireError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod chunk;
mod error;
mod handshake;
mod package;
mod reconcile;

pub use chunk::{split_payload, Chunk, PACKAGE_MAX_SIZE};
pub use error::WireError;
pub use handshake::{Role, RoomAnnouncement};
pub use package::{Package, PackageType};
pub use reconcile::MissingSet;
