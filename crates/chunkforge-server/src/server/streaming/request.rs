//! Messages exchanged between the pool coordinator and worker threads.

use crate::server::pool::{JobId, WorkerId};
use chunkforge_core::{
    ChunkCoords, GenerationError,
    proto::{Chunk, GenerationConfig, Timings},
};

/// Coordinator -> worker.
///
/// A worker holds at most one [`WorkerMessage::Generate`] at a time.
#[derive(Debug)]
pub enum WorkerMessage {
    Generate(GenerateTask),
    Shutdown,
}

/// Everything a worker needs to run one job.
#[derive(Debug, Clone)]
pub struct GenerateTask {
    pub job_id: JobId,
    pub request_id: String,
    pub coords: ChunkCoords,
    pub config: GenerationConfig,
}

/// Worker -> coordinator.
#[derive(Debug)]
pub enum WorkerReport {
    Result(WorkerResult),
    /// The worker thread is about to exit. `reason` is set when it exits
    /// because of a panic.
    Exited {
        worker_id: WorkerId,
        reason: Option<String>,
    },
}

#[derive(Debug)]
pub struct WorkerResult {
    pub worker_id: WorkerId,
    pub job_id: JobId,
    pub request_id: String,
    pub outcome: Result<Chunk, GenerationError>,
    pub timings: Timings,
}
