//! Worker threads and the coordinator-side handle to them.
//!
//! Generation is synchronous and CPU-bound, so every worker is a dedicated OS
//! thread rather than a Tokio task. A worker processes one
//! [`WorkerMessage::Generate`] at a time and reports back over an unbounded
//! channel owned by the coordinator. Panics raised by the generator are
//! caught at the thread boundary and reported as a crash.

use super::{WorkerId, job::Job};
use crate::server::streaming::{
    processor::handle_generate,
    request::{WorkerMessage, WorkerReport},
};
use chunkforge_core::{ChunkGenerator, Error};
use std::{
    any::Any,
    io,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::Instant,
};
use tokio::sync::mpsc;
use tokio_util::time::delay_queue;

/// Coordinator-side record of one live worker.
#[derive(Debug)]
pub struct WorkerEnvelope {
    pub id: WorkerId,
    pub current_job: Option<Job>,
    pub last_active: Instant,
    pub idle_timer: Option<delay_queue::Key>,
    sender: mpsc::Sender<WorkerMessage>,
    thread: Option<thread::JoinHandle<()>>,
}

impl WorkerEnvelope {
    /// Starts a worker thread named `chunk-worker-{id}`.
    pub fn spawn(
        id: WorkerId,
        generator: Arc<dyn ChunkGenerator>,
        reports: mpsc::UnboundedSender<WorkerReport>,
    ) -> io::Result<Self> {
        // The coordinator only hands a worker its next task once the previous
        // result is in, so one slot is enough.
        let (sender, rx) = mpsc::channel(1);
        let thread = thread::Builder::new()
            .name(format!("chunk-worker-{id}"))
            .spawn(move || worker_loop(id, rx, generator, reports))?;

        Ok(Self {
            id,
            current_job: None,
            last_active: Instant::now(),
            idle_timer: None,
            sender,
            thread: Some(thread),
        })
    }

    pub const fn is_busy(&self) -> bool {
        self.current_job.is_some()
    }

    /// Hands a message to the worker without waiting.
    pub fn send(&self, message: WorkerMessage) -> Result<(), Error> {
        self.sender
            .try_send(message)
            .map_err(|e| Error::ChannelError {
                context: format!("Worker {} channel: {e}", self.id),
            })
    }

    /// Asks the worker to stop and returns its thread handle for joining.
    ///
    /// If the request cannot be queued the worker still stops once this
    /// envelope, and with it the sending half of its channel, is dropped.
    pub fn shutdown(&mut self) -> Option<thread::JoinHandle<()>> {
        let _ = self.sender.try_send(WorkerMessage::Shutdown);
        self.thread.take()
    }
}

/// Main loop of a worker thread.
///
/// Runs until a [`WorkerMessage::Shutdown`] arrives, the coordinator drops
/// the sending half, or the coordinator stops listening for reports. Always
/// finishes with a [`WorkerReport::Exited`].
pub fn worker_loop(
    worker_id: WorkerId,
    mut rx: mpsc::Receiver<WorkerMessage>,
    generator: Arc<dyn ChunkGenerator>,
    reports: mpsc::UnboundedSender<WorkerReport>,
) {
    tracing::trace!("Worker {worker_id} started");

    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        while let Some(message) = rx.blocking_recv() {
            match message {
                WorkerMessage::Generate(task) => {
                    let result = handle_generate(worker_id, generator.as_ref(), task);
                    if reports.send(WorkerReport::Result(result)).is_err() {
                        tracing::debug!("Worker {worker_id} lost its coordinator");
                        break;
                    }
                }
                WorkerMessage::Shutdown => {
                    tracing::debug!("Worker {worker_id} received shutdown signal");
                    break;
                }
            }
        }
    }));

    let reason = run.err().map(|payload| panic_message(payload.as_ref()));
    if let Some(ref reason) = reason {
        tracing::error!("Worker {worker_id} panicked: {reason}");
    }

    let _ = reports.send(WorkerReport::Exited { worker_id, reason });
    tracing::trace!("Worker {worker_id} stopped");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}
