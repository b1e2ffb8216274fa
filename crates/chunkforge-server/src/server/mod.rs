//! Server internals.
//!
//! ## Structure
//!
//! - [`config`] - CLI/environment configuration.
//! - [`pool`] - The elastic [`WorkerPool`](pool::WorkerPool) and its worker
//!   threads.
//! - [`streaming`] - Per-connection relay between gRPC streams and the pool.
//! - [`service`] - The tonic service wrapper and graceful shutdown.
//! - [`telemetry`] - Logging, traces and metrics.

pub mod config;
pub mod pool;
pub mod service;
pub mod streaming;
pub mod telemetry;
