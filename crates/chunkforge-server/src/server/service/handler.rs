//! gRPC service implementation for streamed chunk generation.
//!
//! This module defines [`ChunkService`], the concrete implementation of the
//! [`ChunkStream`] gRPC service. Each `Session` call is one client connection:
//! the inbound half carries generate/cancel frames, the outbound half carries
//! ready, accepted, result, error and cancelled frames.
//!
//! ## Responsibilities
//!
//! - Own the [`WorkerPool`] and the [`Relay`] configuration.
//! - Spawn one relay task per connection and track how many are open.
//! - Refuse new connections while shutting down, then drain, cancel and
//!   dispose of the pool.

use crate::server::{
    config::ServerConfig,
    pool::WorkerPool,
    streaming::coordinator::Relay,
    telemetry::{
        decrement_connections_inflight, increment_connections_inflight,
        record_connection_duration,
    },
};
use chunkforge_core::{
    ChunkGenerator, Error, PostProcessor,
    proto::{ClientFrame, PoolStats, ServerFrame, StatsRequest, chunk_stream_server::ChunkStream},
};
use core::{pin::Pin, time::Duration};
use portable_atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::{sync::Arc, time::Instant};
use tokio::{
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_stream::{Stream, wrappers::ReceiverStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use tracing::Instrument;

#[derive(Debug, Default)]
struct ServiceState {
    shutting_down: AtomicBool,
    connections: AtomicUsize,
    next_connection_id: AtomicU64,
    /// Closes every open connection.
    shutdown_token: CancellationToken,
}

/// gRPC front end of the chunk generation pool.
///
/// Cloning is cheap; clones share the pool and the connection registry.
#[derive(Clone)]
pub struct ChunkService {
    config: ServerConfig,
    relay: Relay,
    state: Arc<ServiceState>,
}

impl ChunkService {
    /// Creates the service and starts its worker pool.
    pub fn new(
        config: ServerConfig,
        generator: Arc<dyn ChunkGenerator>,
        post_processor: Arc<dyn PostProcessor>,
    ) -> Self {
        let pool = WorkerPool::new(config.pool_config(), generator);
        let relay = Relay::new(pool, post_processor, config.max_inflight);

        Self {
            config,
            relay,
            state: Arc::new(ServiceState::default()),
        }
    }

    pub const fn pool(&self) -> &WorkerPool {
        self.relay.pool()
    }

    /// Number of open `Session` streams.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::Acquire)
    }

    /// Gracefully shuts the service down.
    ///
    /// New connections are refused immediately. Open connections get up to
    /// the configured shutdown timeout to finish on their own before they are
    /// closed, aborting whatever they still have in flight. Finally the
    /// worker pool is destroyed.
    pub async fn shutdown(&self) -> Result<(), Error> {
        // === Phase 0: Stop accepting new connections ===
        tracing::info!("Refusing new connections");
        self.state.shutting_down.store(true, Ordering::Release);

        // === Phase 1: Wait for open connections to drain ===
        tracing::info!("Draining open connections ({} active)", self.connections());
        let drained = timeout(self.config.shutdown_timeout, async {
            while self.connections() > 0 {
                sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        match drained {
            Ok(()) => tracing::debug!("All connections drained"),
            Err(_) => tracing::warn!(
                "Graceful drain timed out ({} connections still open)",
                self.connections()
            ),
        }

        // === Phase 2: Close whatever is left ===
        tracing::debug!("Closing remaining connections");
        self.state.shutdown_token.cancel();

        // === Phase 3: Dispose of the worker pool ===
        self.relay.pool().destroy().await;
        Ok(())
    }
}

#[tonic::async_trait]
impl ChunkStream for ChunkService {
    type SessionStream = Pin<Box<dyn Stream<Item = Result<ServerFrame, Status>> + Send>>;

    /// Opens a chunk stream for one client connection.
    ///
    /// The returned stream starts with a `StreamReady` frame and stays open
    /// until the client closes its side or the server shuts down.
    #[tracing::instrument(skip_all)]
    async fn session(
        &self,
        req: Request<Streaming<ClientFrame>>,
    ) -> Result<Response<Self::SessionStream>, Status> {
        if self.state.shutting_down.load(Ordering::Acquire) {
            return Err(Error::PoolDisposed.into());
        }

        let connection_id = self.state.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let inbound = req.into_inner();
        let (tx, rx) = mpsc::channel(self.config.stream_buffer_size);

        let relay = self.relay.clone();
        let state = Arc::clone(&self.state);
        let shutdown = state.shutdown_token.clone();
        let start = Instant::now();

        state.connections.fetch_add(1, Ordering::AcqRel);
        increment_connections_inflight();

        let fut = async move {
            relay.serve(connection_id, inbound, tx, shutdown).await;
            state.connections.fetch_sub(1, Ordering::AcqRel);
            decrement_connections_inflight();
            record_connection_duration(start.elapsed().as_secs_f64() * 1_000.0);
        };
        tokio::spawn(fut.instrument(tracing::info_span!("connection", connection_id)));

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }

    async fn stats(&self, _req: Request<StatsRequest>) -> Result<Response<PoolStats>, Status> {
        Ok(Response::new(self.relay.pool().stats().into()))
    }
}
