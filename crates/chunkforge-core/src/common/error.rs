//! Error types for the chunk generation service.
//!
//! This module defines the central [`Error`] enum, which captures every
//! failure a job or a connection can observe. Errors never cross a
//! connection boundary as panics: the relay turns each one into a
//! `StreamError` frame carrying an [`ErrorKind`], and RPC-level failures are
//! converted into a [`tonic::Status`].
//!
//! ## Error Cases
//! - `PoolDisposed`: A job was submitted after the pool started shutting down.
//! - `Generation`: The generator reported a failure for the job.
//! - `WorkerFailure`: The worker running the job crashed or exited.
//! - `Aborted`: The job was cancelled by its client or by a disconnect.
//! - `CapacityExceeded`: The connection reached its in-flight ceiling.
//! - `Protocol`: An incoming frame was malformed or unsupported.
//! - `UnknownRequest`: A cancel referenced a request that is not in flight.
//! - `ChannelError`: Internal communication failure between tasks.

use crate::proto::ErrorKind;
use tonic::Status;

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for the chunk generation service.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    /// The worker pool has been destroyed and accepts no new work.
    #[error("Worker pool has been disposed")]
    PoolDisposed,

    /// The generator returned an error for this job.
    #[error("Generation failed: {message}")]
    Generation { message: String },

    /// The worker executing this job crashed or exited unexpectedly.
    #[error("Worker {worker_id} failed: {reason}")]
    WorkerFailure { worker_id: u64, reason: String },

    /// The job was cancelled before it could be delivered.
    #[error("Request aborted")]
    Aborted,

    /// The connection already has `limit` requests in flight.
    #[error("Too many in-flight requests (limit {limit})")]
    CapacityExceeded { limit: usize },

    /// The client sent a frame that could not be interpreted.
    #[error("Protocol error: {reason}")]
    Protocol { reason: String },

    /// A cancel referenced a request that is not in flight.
    #[error("Request {request_id} not found or already completed")]
    UnknownRequest { request_id: String },

    /// Internal channel send/receive failure (e.g., closed or full channel).
    #[error("Channel error: {context}")]
    ChannelError { context: String },
}

impl Error {
    pub fn protocol(reason: impl Into<String>) -> Self {
        Self::Protocol {
            reason: reason.into(),
        }
    }

    /// Wire-level classification sent alongside the message in error frames.
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::PoolDisposed => ErrorKind::PoolDisposed,
            Self::Generation { .. } => ErrorKind::Generation,
            Self::WorkerFailure { .. } => ErrorKind::WorkerFailure,
            Self::Aborted => ErrorKind::Aborted,
            Self::CapacityExceeded { .. } => ErrorKind::CapacityExceeded,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::UnknownRequest { .. } => ErrorKind::NotFound,
            Self::ChannelError { .. } => ErrorKind::Internal,
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::PoolDisposed => Status::unavailable("Service is shutting down"),
            Error::Generation { message } => {
                Status::internal(format!("Generation error: {message}"))
            }
            Error::WorkerFailure { worker_id, reason } => {
                Status::internal(format!("Worker {worker_id} failed: {reason}"))
            }
            Error::Aborted => Status::cancelled("Request was cancelled"),
            Error::CapacityExceeded { limit } => {
                Status::resource_exhausted(format!("Too many in-flight requests (limit {limit})"))
            }
            Error::Protocol { reason } => Status::invalid_argument(reason),
            Error::UnknownRequest { request_id } => Status::not_found(format!(
                "Request {request_id} not found or already completed"
            )),
            Error::ChannelError { context } => {
                Status::internal(format!("Channel error: {context}"))
            }
        }
    }
}

/// Failure reported by a [`ChunkGenerator`](crate::ChunkGenerator).
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[error("{message}")]
pub struct GenerationError {
    pub message: String,
}

impl GenerationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<GenerationError> for Error {
    fn from(err: GenerationError) -> Self {
        Self::Generation {
            message: err.message,
        }
    }
}
