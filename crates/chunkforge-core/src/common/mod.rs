//! Shared protocol, error and generator definitions.
//!
//! ## Modules
//!
//! - [`proto`] - Protobuf messages and gRPC service bindings generated from
//!   `proto/chunkforge.proto`.
//! - [`error`] - The [`Error`] taxonomy shared by the pool and the relay.
//! - [`types`] - Domain types and protocol constants.
//! - [`generator`] - The [`ChunkGenerator`] / [`PostProcessor`] collaborator
//!   interfaces and the reference [`TerrainGenerator`].

pub mod error;
pub mod generator;
pub mod types;

pub use error::{Error, GenerationError, Result};
pub use generator::{ChunkGenerator, NoopPostProcessor, PostProcessor, TerrainGenerator};
pub use types::ChunkCoords;

/// gRPC service and message definitions generated from
/// `proto/chunkforge.proto`.
///
/// ## Service
///
/// - `ChunkStream.Session` - one bidirectional stream per client connection.
///   Clients send [`ClientFrame`]s (generate or cancel) and receive
///   [`ServerFrame`]s (ready, accepted, result, error, cancelled).
/// - `ChunkStream.Stats` - unary pool snapshot.
///
/// Chunk payloads (`heights`, `tiles`) are generated as [`bytes::Bytes`].
///
/// [`ClientFrame`]: proto::ClientFrame
/// [`ServerFrame`]: proto::ServerFrame
#[allow(clippy::all, clippy::pedantic)]
pub mod proto {
    tonic::include_proto!("chunkforge");

    /// Encoded file descriptor set used to serve gRPC reflection.
    pub const FILE_DESCRIPTOR_SET: &[u8] =
        tonic::include_file_descriptor_set!("chunkforge_descriptor");
}
