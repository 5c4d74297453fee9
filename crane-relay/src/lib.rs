//! # crane-relay
//!
//! Room relay for webcrane.
//!
//! A publisher opens a named room and pushes a set of files; any number of
//! subscribers join the room by name and receive only the files they are
//! missing. The relay never looks inside the payloads it forwards.
//!
//! ## Architecture
//!
//! ```text
//! Publisher ──┐                     ┌── Subscriber A
//!             │     WebSocket       ├── Subscriber B
//!             ├────────────────────►├── Subscriber C
//!         ┌───┴─────────────────────┴───┐
//!         │         crane-relay         │
//!         │  ┌───────────────────────┐  │
//!         │  │ RoomRegistry (memory) │  │
//!         │  └───────────────────────┘  │
//!         └─────────────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! Every connection first sends a role token (`pub` or `sub`) and a room
//! announcement. Then:
//! - publisher: `refresh` → subscriber list, repeated until `sync`
//! - publisher → subscribers: chunked hash manifest
//! - subscribers → publisher: chunked missing sets, merged by the relay
//! - publisher → subscribers: `chunk`/`full` content, ended by `close`

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod limits;
pub mod registry;
pub mod rendezvous;
pub mod server;
pub mod session;
pub mod transport;
