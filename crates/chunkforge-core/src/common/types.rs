//! # Domain Types and Protocol Constants
//!
//! Values that both the server and its clients must agree on, plus the
//! lightweight domain types used in place of the generated protobuf messages
//! where a `Copy`/`Hash` type reads better.

use crate::proto;
use core::fmt;

/// Request id used in error frames when none can be recovered from the
/// offending client frame.
pub const UNKNOWN_REQUEST_ID: &str = "unknown";

/// Default chunk edge length (in tiles) when a request leaves `size` unset.
pub const DEFAULT_CHUNK_SIZE: u32 = 32;

/// Largest chunk edge length the reference generator accepts.
pub const MAX_CHUNK_SIZE: u32 = 256;

/// Integer coordinates of a chunk in the world grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkCoords {
    pub x: i32,
    pub y: i32,
}

impl ChunkCoords {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl fmt::Display for ChunkCoords {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

impl From<proto::Coords> for ChunkCoords {
    fn from(coords: proto::Coords) -> Self {
        Self::new(coords.x, coords.y)
    }
}

impl From<ChunkCoords> for proto::Coords {
    fn from(coords: ChunkCoords) -> Self {
        Self {
            x: coords.x,
            y: coords.y,
        }
    }
}
