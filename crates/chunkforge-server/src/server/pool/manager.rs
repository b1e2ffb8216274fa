//! Elastic worker pool for chunk generation.
//!
//! This module defines [`WorkerPool`], a cloneable handle to a single
//! coordinator task that owns every piece of mutable pool state: the FIFO job
//! queue, the worker set and the idle-reclaim timers. Handles and worker
//! threads only ever talk to the coordinator through channels, so scheduling
//! decisions are serialized without locks.
//!
//! ## Scheduling
//!
//! After every event (enqueue, abort, worker result, worker exit, idle timer)
//! the coordinator runs a dispatch pass:
//!
//! 1. Top the pool back up to `min_workers`.
//! 2. Give every idle worker the next live job, or arm its idle timer when the
//!    queue is empty.
//! 3. While jobs remain, every worker is busy and the pool is below
//!    `max_workers`, spawn a worker and give it the next job.
//!
//! Jobs whose caller has gone away are skipped without running.

use super::{
    JobId, PoolConfig, PoolEvent, PoolStats, WorkerId,
    job::{Job, JobOutput},
    worker::WorkerEnvelope,
};
use crate::server::{
    streaming::request::{WorkerMessage, WorkerReport, WorkerResult},
    telemetry::{
        increment_worker_failures, record_generation_duration, record_queue_length,
        record_queue_wait,
    },
};
use chunkforge_core::{ChunkCoords, ChunkGenerator, Error, proto::GenerationConfig};
use futures::{
    StreamExt,
    future::{self, BoxFuture},
};
use portable_atomic::{AtomicU64, Ordering};
use std::{
    collections::{BTreeMap, VecDeque},
    sync::Arc,
    time::Instant,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::spawn_blocking,
    time::timeout,
};
use tokio_util::{sync::CancellationToken, time::DelayQueue};

/// Buffered [`PoolEvent`]s per subscriber before lagging receivers skip.
const EVENT_CAPACITY: usize = 256;

enum Command {
    Enqueue(Job),
    Abort(JobId),
    Destroy(oneshot::Sender<()>),
}

/// Handle to an elastic pool of generation workers.
///
/// Cloning the handle is cheap; all clones drive the same pool. The pool is
/// torn down by [`WorkerPool::destroy`], or once the last handle is dropped.
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<Command>,
    stats: watch::Receiver<PoolStats>,
    events: broadcast::Sender<PoolEvent>,
    disposed: CancellationToken,
    next_job_id: Arc<AtomicU64>,
}

impl WorkerPool {
    /// Creates the pool and starts its coordinator, which immediately spawns
    /// `min_workers` workers.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: PoolConfig, generator: Arc<dyn ChunkGenerator>) -> Self {
        let config = config.normalized();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (stats_tx, stats_rx) = watch::channel(PoolStats::idle(&config));
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let coordinator = Coordinator {
            config,
            generator,
            workers: BTreeMap::new(),
            queue: VecDeque::new(),
            idle_timers: DelayQueue::new(),
            next_worker_id: 1,
            disposed: false,
            reports: reports_tx,
            stats: stats_tx,
            events: events_tx.clone(),
            published_queue_length: 0,
        };

        tracing::info!(
            "Starting worker pool (min {}, max {}, idle timeout {:?})",
            config.min_workers,
            config.max_workers,
            config.idle_timeout
        );
        tokio::spawn(coordinator.run(commands_rx, reports_rx));

        Self {
            commands: commands_tx,
            stats: stats_rx,
            events: events_tx,
            disposed: CancellationToken::new(),
            next_job_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Submits a job and returns a future resolving to its outcome.
    ///
    /// The job joins the queue when this method is called, not when the
    /// returned future is first polled, so submission order is preserved.
    ///
    /// Cancelling `cancel` (or dropping the future) aborts the job: a queued
    /// job is removed without running, a running job finishes but its result
    /// is discarded. The future then resolves to [`Error::Aborted`].
    ///
    /// # Errors
    ///
    /// - [`Error::PoolDisposed`] if the pool was destroyed before or while
    ///   the job was pending.
    /// - [`Error::Generation`] if the generator rejected the job.
    /// - [`Error::WorkerFailure`] if the worker crashed while running it.
    /// - [`Error::Aborted`] if `cancel` fired first.
    pub fn enqueue(
        &self,
        request_id: impl Into<String>,
        coords: ChunkCoords,
        config: GenerationConfig,
        cancel: Option<CancellationToken>,
    ) -> BoxFuture<'static, Result<JobOutput, Error>> {
        if self.is_disposed() {
            return Box::pin(future::ready(Err(Error::PoolDisposed)));
        }
        if cancel.as_ref().is_some_and(CancellationToken::is_cancelled) {
            return Box::pin(future::ready(Err(Error::Aborted)));
        }

        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        let (job, rx) = Job::new(job_id, request_id.into(), coords, config, cancel.clone());
        if self.commands.send(Command::Enqueue(job)).is_err() {
            return Box::pin(future::ready(Err(Error::PoolDisposed)));
        }

        let Some(cancel) = cancel else {
            return Box::pin(async move { rx.await.unwrap_or(Err(Error::PoolDisposed)) });
        };

        let commands = self.commands.clone();
        Box::pin(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let _ = commands.send(Command::Abort(job_id));
                    Err(Error::Aborted)
                }
                result = rx => result.unwrap_or(Err(Error::PoolDisposed)),
            }
        })
    }

    /// Latest published [`PoolStats`].
    pub fn stats(&self) -> PoolStats {
        *self.stats.borrow()
    }

    /// Subscribes to [`PoolEvent`]s emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<PoolEvent> {
        self.events.subscribe()
    }

    /// Whether [`WorkerPool::destroy`] has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    /// Disposes of the pool.
    ///
    /// New and pending jobs reject with [`Error::PoolDisposed`]. Waits for
    /// every worker thread to stop, bounded by the configured shutdown
    /// timeout per worker. Calling this more than once is harmless.
    pub async fn destroy(&self) {
        self.disposed.cancel();

        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Destroy(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

struct Coordinator {
    config: PoolConfig,
    generator: Arc<dyn ChunkGenerator>,
    workers: BTreeMap<WorkerId, WorkerEnvelope>,
    queue: VecDeque<Job>,
    idle_timers: DelayQueue<WorkerId>,
    next_worker_id: WorkerId,
    disposed: bool,
    reports: mpsc::UnboundedSender<WorkerReport>,
    stats: watch::Sender<PoolStats>,
    events: broadcast::Sender<PoolEvent>,
    published_queue_length: usize,
}

impl Coordinator {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<WorkerReport>,
    ) {
        self.dispatch();
        self.publish();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Enqueue(job)) => self.enqueue(job),
                    Some(Command::Abort(job_id)) => self.abort(job_id),
                    Some(Command::Destroy(done)) => {
                        self.destroy().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        tracing::debug!("All pool handles dropped");
                        self.destroy().await;
                        break;
                    }
                },
                Some(report) = reports.recv() => self.handle_report(report),
                Some(expired) = self.idle_timers.next() => {
                    self.handle_idle_timeout(expired.into_inner());
                }
            }

            self.publish();
        }
    }

    fn enqueue(&mut self, job: Job) {
        if self.disposed {
            job.settle(Err(Error::PoolDisposed));
            return;
        }

        tracing::trace!(
            "Queued job {} ({} at {})",
            job.id,
            job.request_id,
            job.coords
        );
        self.queue.push_back(job);
        self.dispatch();
    }

    fn abort(&mut self, job_id: JobId) {
        if let Some(pos) = self.queue.iter().position(|job| job.id == job_id) {
            if let Some(job) = self.queue.remove(pos) {
                tracing::debug!("Removed queued job {job_id} ({})", job.request_id);
                job.settle(Err(Error::Aborted));
            }
            return;
        }

        let running = self
            .workers
            .values_mut()
            .filter_map(|worker| worker.current_job.as_mut())
            .find(|job| job.id == job_id);

        if let Some(job) = running {
            job.aborted = true;
            tracing::debug!(
                "Job {job_id} ({}) aborted while running on worker {:?}",
                job.request_id,
                job.assigned_to
            );
        }
    }

    fn handle_report(&mut self, report: WorkerReport) {
        match report {
            WorkerReport::Result(result) => self.handle_result(result),
            WorkerReport::Exited { worker_id, reason } => self.handle_exit(worker_id, reason),
        }
    }

    fn handle_result(&mut self, result: WorkerResult) {
        let WorkerResult {
            worker_id,
            job_id,
            request_id,
            outcome,
            timings,
        } = result;

        let Some(worker) = self.workers.get_mut(&worker_id) else {
            tracing::debug!("Dropping result of job {job_id} from retired worker {worker_id}");
            return;
        };

        let job = match worker.current_job.take() {
            Some(job) if job.id == job_id => job,
            other => {
                worker.current_job = other;
                tracing::warn!("Worker {worker_id} reported job {job_id} it was not running");
                return;
            }
        };
        worker.last_active = Instant::now();
        record_generation_duration(timings.generation_ms);

        let settled = match outcome {
            Ok(chunk) => job.settle(Ok(JobOutput {
                chunk,
                timings,
                worker_id,
            })),
            Err(e) => job.settle(Err(e.into())),
        };
        if !settled {
            tracing::debug!("Discarded result of abandoned job {job_id} ({request_id})");
        }

        self.dispatch();
    }

    fn handle_exit(&mut self, worker_id: WorkerId, reason: Option<String>) {
        if !self.workers.contains_key(&worker_id) {
            // Reclaimed or shut down on purpose.
            tracing::trace!("Worker {worker_id} exited");
            return;
        }

        let reason = reason.unwrap_or_else(|| "worker exited unexpectedly".to_string());
        self.fail_worker(worker_id, reason);
        self.dispatch();
    }

    fn handle_idle_timeout(&mut self, worker_id: WorkerId) {
        let above_floor = self.workers.len() > self.config.min_workers;
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        worker.idle_timer = None;

        if worker.is_busy() || !above_floor {
            return;
        }

        if let Some(mut worker) = self.workers.remove(&worker_id) {
            tracing::debug!(
                "Reclaiming worker {worker_id} after {:?} idle",
                worker.last_active.elapsed()
            );
            // The thread exits on its own; nothing waits for it.
            let _ = worker.shutdown();
            self.emit(PoolEvent::WorkerIdleTerminate { worker_id });
            self.emit(PoolEvent::WorkerExit { worker_id });
        }
    }

    /// Removes a crashed worker and fails the job it was running.
    fn fail_worker(&mut self, worker_id: WorkerId, reason: String) {
        let Some(mut worker) = self.workers.remove(&worker_id) else {
            return;
        };
        if let Some(key) = worker.idle_timer.take() {
            self.idle_timers.try_remove(&key);
        }

        tracing::error!("Worker {worker_id} failed: {reason}");
        increment_worker_failures();
        self.emit(PoolEvent::WorkerError {
            worker_id,
            message: reason.clone(),
        });

        if let Some(job) = worker.current_job.take() {
            let job_id = job.id;
            if !job.settle(Err(Error::WorkerFailure { worker_id, reason })) {
                tracing::debug!("Job {job_id} was abandoned before worker {worker_id} failed");
            }
        }

        self.emit(PoolEvent::WorkerExit { worker_id });
    }

    fn dispatch(&mut self) {
        if self.disposed {
            return;
        }

        self.ensure_min_workers();

        let idle: Vec<WorkerId> = self
            .workers
            .values()
            .filter(|worker| !worker.is_busy())
            .map(|worker| worker.id)
            .collect();

        for worker_id in idle {
            match self.next_job() {
                Some(job) => self.assign(worker_id, job),
                None => self.arm_idle_timer(worker_id),
            }
        }

        while !self.queue.is_empty()
            && self.workers.len() < self.config.max_workers
            && self.workers.values().all(WorkerEnvelope::is_busy)
        {
            let Some(worker_id) = self.spawn_worker() else {
                break;
            };
            match self.next_job() {
                Some(job) => self.assign(worker_id, job),
                None => {
                    self.arm_idle_timer(worker_id);
                    break;
                }
            }
        }
    }

    fn ensure_min_workers(&mut self) {
        while self.workers.len() < self.config.min_workers {
            let Some(worker_id) = self.spawn_worker() else {
                break;
            };
            self.arm_idle_timer(worker_id);
        }
    }

    /// Pops the oldest job that still has someone waiting for it.
    fn next_job(&mut self) -> Option<Job> {
        while let Some(job) = self.queue.pop_front() {
            if job.is_abandoned() {
                tracing::trace!("Skipping abandoned job {} ({})", job.id, job.request_id);
                continue;
            }
            return Some(job);
        }
        None
    }

    fn assign(&mut self, worker_id: WorkerId, mut job: Job) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            self.queue.push_front(job);
            return;
        };

        if let Some(key) = worker.idle_timer.take() {
            self.idle_timers.try_remove(&key);
        }

        match worker.send(WorkerMessage::Generate(job.task())) {
            Ok(()) => {
                tracing::trace!("Assigned job {} to worker {worker_id}", job.id);
                record_queue_wait(job.enqueued_at.elapsed().as_secs_f64() * 1_000.0);
                job.assigned_to = Some(worker_id);
                worker.current_job = Some(job);
                worker.last_active = Instant::now();
            }
            Err(e) => {
                self.queue.push_front(job);
                self.fail_worker(worker_id, e.to_string());
            }
        }
    }

    fn spawn_worker(&mut self) -> Option<WorkerId> {
        let worker_id = self.next_worker_id;
        self.next_worker_id += 1;

        match WorkerEnvelope::spawn(
            worker_id,
            Arc::clone(&self.generator),
            self.reports.clone(),
        ) {
            Ok(worker) => {
                tracing::debug!("Spawned worker {worker_id}");
                self.workers.insert(worker_id, worker);
                self.emit(PoolEvent::WorkerSpawn { worker_id });
                Some(worker_id)
            }
            Err(e) => {
                tracing::error!("Failed to spawn worker {worker_id}: {e}");
                self.emit(PoolEvent::WorkerError {
                    worker_id,
                    message: e.to_string(),
                });
                None
            }
        }
    }

    fn arm_idle_timer(&mut self, worker_id: WorkerId) {
        let Some(worker) = self.workers.get_mut(&worker_id) else {
            return;
        };
        if worker.idle_timer.is_none() {
            worker.idle_timer = Some(self.idle_timers.insert(worker_id, self.config.idle_timeout));
        }
    }

    fn snapshot(&self) -> PoolStats {
        PoolStats {
            queue_length: self.queue.len(),
            total_workers: self.workers.len(),
            busy_workers: self.workers.values().filter(|w| w.is_busy()).count(),
            min_workers: self.config.min_workers,
            max_workers: self.config.max_workers,
        }
    }

    fn publish(&mut self) {
        let stats = self.snapshot();
        self.stats.send_if_modified(|current| {
            if *current == stats {
                false
            } else {
                *current = stats;
                true
            }
        });

        if stats.queue_length != self.published_queue_length {
            self.published_queue_length = stats.queue_length;
            record_queue_length(stats.queue_length);
            self.emit(PoolEvent::QueueUpdate {
                queue_length: stats.queue_length,
            });
        }
    }

    fn emit(&self, event: PoolEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn destroy(&mut self) {
        tracing::info!("Shutting down worker pool");
        self.disposed = true;
        self.idle_timers.clear();

        let dropped = self.queue.len();
        // Dropping a job closes its completion channel, which the caller
        // observes as `PoolDisposed`.
        self.queue.clear();
        if dropped > 0 {
            tracing::debug!("Dropped {dropped} queued jobs");
        }

        let mut handles = Vec::with_capacity(self.workers.len());
        for (worker_id, mut worker) in core::mem::take(&mut self.workers) {
            if let Some(handle) = worker.shutdown() {
                handles.push((worker_id, handle));
            }
            self.emit(PoolEvent::WorkerExit { worker_id });
        }
        self.publish();

        let shutdown_timeout = self.config.shutdown_timeout;
        tracing::debug!(
            "Waiting for up to {shutdown_timeout:?} per worker for {} workers to stop",
            handles.len()
        );

        let joins = handles.into_iter().map(|(worker_id, handle)| async move {
            match timeout(shutdown_timeout, spawn_blocking(move || handle.join())).await {
                Ok(Ok(Ok(()))) => tracing::trace!("Worker {worker_id} stopped"),
                Ok(Ok(Err(_))) => tracing::warn!("Worker {worker_id} panicked while stopping"),
                Ok(Err(e)) => tracing::error!("Failed to join worker {worker_id}: {e}"),
                Err(_) => tracing::warn!("Worker {worker_id} shutdown timed out"),
            }
        });
        future::join_all(joins).await;

        tracing::info!("Worker pool shutdown complete");
    }
}
