//! Streaming between clients, the pool coordinator and worker threads.
//!
//! ## Structure
//!
//! - [`request`] - Coordinator/worker message types.
//! - [`processor`] - Executes one generation task inside a worker.
//! - [`context`] - Per-connection in-flight bookkeeping.
//! - [`frame`] - Server frame constructors.
//! - [`coordinator`] - The per-connection relay loop.

pub mod context;
pub mod coordinator;
pub mod frame;
pub mod processor;
pub mod request;
