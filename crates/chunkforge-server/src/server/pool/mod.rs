//! Elastic worker pool.
//!
//! The pool runs generation jobs on dedicated OS threads. It grows from
//! `min_workers` up to `max_workers` while there is a backlog and every
//! worker is busy, reclaims workers that stay idle for `idle_timeout`, and
//! replaces workers that crash.
//!
//! All mutable pool state is owned by a single coordinator task (see
//! [`manager`]); callers talk to it through the cloneable [`WorkerPool`]
//! handle.

pub mod job;
pub mod manager;
pub mod worker;

pub use job::JobOutput;
pub use manager::WorkerPool;

use chunkforge_core::proto;
use core::time::Duration;

pub type WorkerId = u64;
pub type JobId = u64;

/// Sizing and timing parameters of a [`WorkerPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub idle_timeout: Duration,
    /// Upper bound on how long `destroy` waits for each worker thread.
    pub shutdown_timeout: Duration,
}

impl PoolConfig {
    pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

    pub const fn new(min_workers: usize, max_workers: usize, idle_timeout: Duration) -> Self {
        Self {
            min_workers,
            max_workers,
            idle_timeout,
            shutdown_timeout: Self::DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    /// Clamps the bounds so that `1 <= max_workers` and
    /// `min_workers <= max_workers`.
    pub(crate) fn normalized(mut self) -> Self {
        if self.max_workers == 0 {
            tracing::warn!("max_workers was 0, using 1");
            self.max_workers = 1;
        }
        if self.min_workers > self.max_workers {
            tracing::warn!(
                "min_workers ({}) exceeds max_workers ({}), clamping",
                self.min_workers,
                self.max_workers
            );
            self.min_workers = self.max_workers;
        }
        self
    }
}

/// Point-in-time view of the pool, published after every coordinator step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub queue_length: usize,
    pub total_workers: usize,
    pub busy_workers: usize,
    pub min_workers: usize,
    pub max_workers: usize,
}

impl PoolStats {
    pub const fn idle(config: &PoolConfig) -> Self {
        Self {
            queue_length: 0,
            total_workers: 0,
            busy_workers: 0,
            min_workers: config.min_workers,
            max_workers: config.max_workers,
        }
    }
}

fn saturating_u32(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

impl From<PoolStats> for proto::PoolStats {
    fn from(stats: PoolStats) -> Self {
        Self {
            queue_length: saturating_u32(stats.queue_length),
            total_workers: saturating_u32(stats.total_workers),
            busy_workers: saturating_u32(stats.busy_workers),
            min_workers: saturating_u32(stats.min_workers),
            max_workers: saturating_u32(stats.max_workers),
        }
    }
}

/// Lifecycle notifications broadcast by the pool. See
/// [`WorkerPool::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolEvent {
    QueueUpdate { queue_length: usize },
    WorkerSpawn { worker_id: WorkerId },
    WorkerError { worker_id: WorkerId, message: String },
    WorkerExit { worker_id: WorkerId },
    WorkerIdleTerminate { worker_id: WorkerId },
}
