use crate::server::pool::PoolConfig;
use anyhow::bail;
use chunkforge_core::types::MAX_CHUNK_SIZE;
use clap::Parser;
use core::time::Duration;

/// Upper bound for the default worker ceiling, regardless of core count.
const DEFAULT_MAX_WORKERS_CAP: usize = 8;

fn default_max_workers() -> usize {
    num_cpus::get().clamp(1, DEFAULT_MAX_WORKERS_CAP)
}

/// Runtime configuration for the `chunkforge-server` binary.
///
/// These settings control the elasticity of the worker pool, per-connection
/// limits and buffering of the chunk stream. All values are parsed from CLI
/// arguments or environment variables (a `.env` file is loaded first).
#[derive(Parser, Debug, Clone)]
#[command(
    name = "chunkforge-server",
    version,
    about = "A gRPC service streaming procedurally generated chunks from an elastic worker pool"
)]
pub struct CliArgs {
    /// Maximum number of worker threads the pool may grow to.
    ///
    /// The pool only grows when there is a backlog and every live worker is
    /// busy. Defaults to the number of available cores, capped at 8.
    ///
    /// Environment variable: `MAX_WORKERS`
    #[arg(long, env = "MAX_WORKERS", default_value_t = default_max_workers())]
    pub max_workers: usize,

    /// Number of worker threads kept alive even when idle.
    ///
    /// Environment variable: `MIN_WORKERS`
    #[arg(long, env = "MIN_WORKERS", default_value_t = 1)]
    pub min_workers: usize,

    /// Milliseconds a worker may stay unassigned before it is reclaimed (as
    /// long as the pool stays at or above `MIN_WORKERS`).
    ///
    /// Environment variable: `IDLE_TIMEOUT_MS`
    #[arg(long, env = "IDLE_TIMEOUT_MS", default_value_t = 30_000)]
    pub idle_timeout_ms: u64,

    /// Maximum number of unresolved generate requests per connection.
    ///
    /// Requests beyond this ceiling are answered with an error frame and never
    /// reach the pool.
    ///
    /// Environment variable: `MAX_INFLIGHT`
    #[arg(long, env = "MAX_INFLIGHT", default_value_t = 64)]
    pub max_inflight: usize,

    /// Capacity of the outbound frame buffer of each connection.
    ///
    /// Lower values propagate client backpressure sooner; higher values allow
    /// more frames to queue while the client is slow to read.
    ///
    /// Environment variable: `STREAM_BUFFER_SIZE`
    #[arg(long, env = "STREAM_BUFFER_SIZE", default_value_t = 32)]
    pub stream_buffer_size: usize,

    /// Chunk edge length (in tiles) used when a request leaves `size` unset.
    ///
    /// Environment variable: `CHUNK_SIZE`
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 32)]
    pub chunk_size: u32,

    /// Seconds to wait for connections to drain, and for each worker to stop,
    /// during shutdown.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT`
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value_t = 3)]
    pub shutdown_timeout: u64,

    /// Address to listen on (TCP or Unix socket path; use --uds for Unix
    /// socket).
    ///
    /// Example: "0.0.0.0:50051" or "/tmp/chunkforge.sock"
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:50051"))]
    pub server_addr: String,

    /// Listen on a Unix socket instead of TCP. If set, `SERVER_ADDR` must be a
    /// file path.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub idle_timeout: Duration,
    pub max_inflight: usize,
    pub stream_buffer_size: usize,
    pub chunk_size: u32,
    pub shutdown_timeout: Duration,
    pub server_addr: String,
    pub uds: bool,
}

impl ServerConfig {
    pub const fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            idle_timeout: self.idle_timeout,
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.max_workers == 0 {
            bail!("MAX_WORKERS must be greater than 0");
        }

        if args.min_workers > args.max_workers {
            bail!(
                "MIN_WORKERS ({}) must not exceed MAX_WORKERS ({})",
                args.min_workers,
                args.max_workers
            );
        }

        if args.idle_timeout_ms == 0 {
            bail!("IDLE_TIMEOUT_MS must be greater than 0");
        }

        if args.max_inflight == 0 {
            bail!("MAX_INFLIGHT must be greater than 0");
        }

        if args.stream_buffer_size == 0 {
            bail!("STREAM_BUFFER_SIZE must be greater than 0");
        }

        if args.chunk_size == 0 || args.chunk_size > MAX_CHUNK_SIZE {
            bail!(
                "CHUNK_SIZE ({}) must be between 1 and {}",
                args.chunk_size,
                MAX_CHUNK_SIZE
            );
        }

        Ok(Self {
            min_workers: args.min_workers,
            max_workers: args.max_workers,
            idle_timeout: Duration::from_millis(args.idle_timeout_ms),
            max_inflight: args.max_inflight,
            stream_buffer_size: args.stream_buffer_size,
            chunk_size: args.chunk_size,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout),
            server_addr: args.server_addr,
            uds: args.uds,
        })
    }
}
