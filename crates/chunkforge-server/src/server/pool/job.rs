use super::{JobId, WorkerId};
use crate::server::streaming::request::GenerateTask;
use chunkforge_core::{
    ChunkCoords, Error,
    proto::{Chunk, GenerationConfig, Timings},
};
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Successful result of a job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    pub chunk: Chunk,
    pub timings: Timings,
    pub worker_id: WorkerId,
}

pub type JobResult = Result<JobOutput, Error>;

/// One unit of requested work, owned by the pool coordinator.
///
/// A job is settled by consuming it, so its completion channel can resolve at
/// most once.
#[derive(Debug)]
pub struct Job {
    pub id: JobId,
    pub request_id: String,
    pub coords: ChunkCoords,
    pub config: GenerationConfig,
    pub enqueued_at: Instant,
    pub aborted: bool,
    pub assigned_to: Option<WorkerId>,
    cancel: Option<CancellationToken>,
    responder: oneshot::Sender<JobResult>,
}

impl Job {
    pub fn new(
        id: JobId,
        request_id: String,
        coords: ChunkCoords,
        config: GenerationConfig,
        cancel: Option<CancellationToken>,
    ) -> (Self, oneshot::Receiver<JobResult>) {
        let (responder, rx) = oneshot::channel();
        let job = Self {
            id,
            request_id,
            coords,
            config,
            enqueued_at: Instant::now(),
            aborted: false,
            assigned_to: None,
            cancel,
            responder,
        };
        (job, rx)
    }

    /// Whether nobody is waiting for this job anymore: it was aborted, its
    /// cancellation token fired, or the caller dropped its future.
    pub fn is_abandoned(&self) -> bool {
        self.aborted
            || self.responder.is_closed()
            || self.cancel.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    pub fn task(&self) -> GenerateTask {
        GenerateTask {
            job_id: self.id,
            request_id: self.request_id.clone(),
            coords: self.coords,
            config: self.config.clone(),
        }
    }

    /// Resolves the job. Returns `false` if the result was discarded.
    pub fn settle(self, result: JobResult) -> bool {
        if self.is_abandoned() {
            return false;
        }
        self.responder.send(result).is_ok()
    }
}
