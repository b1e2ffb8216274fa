//! gRPC service wrapper.
//!
//! ## Structure
//!
//! - [`handler`] - gRPC service entry point (`ChunkService`) and graceful
//!   shutdown.

pub mod handler;
