//! Bounded-size payload splitting.
//!
//! The full content-defined chunker lives with the clients. The relay only
//! needs to re-emit payloads it holds in memory (the hash manifest it fans
//! out, the missing set it hands back to the publisher), so a fixed-size
//! splitter is enough here.

use crate::WireError;

/// Maximum bytes carried by a single `chunk` package (512 KiB).
pub const PACKAGE_MAX_SIZE: usize = 512 * 1024;

/// One fragment of a payload, tagged with its destination path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Fragment bytes
    pub data: Vec<u8>,
    /// Destination path (empty for in-memory payloads)
    pub path: String,
}

/// Split `payload` into ordered chunks of at most `max_chunk_size` bytes.
///
/// An empty payload still yields a single empty chunk. Concatenating the
/// `data` of every chunk in order restores the payload.
pub fn split_payload(payload: &[u8], max_chunk_size: usize) -> Result<Vec<Chunk>, WireError> {
    if max_chunk_size == 0 {
        return Err(WireError::ZeroChunkSize);
    }

    if payload.is_empty() {
        return Ok(vec![Chunk {
            data: Vec::new(),
            path: String::new(),
        }]);
    }

    Ok(payload
        .chunks(max_chunk_size)
        .map(|piece| Chunk {
            data: piece.to_vec(),
            path: String::new(),
        })
        .collect())
}
