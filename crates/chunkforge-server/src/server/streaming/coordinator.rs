//! Per-connection relay between a client stream and the [`WorkerPool`].
//!
//! Each connection is served by one [`Relay::serve`] loop. The loop
//! exclusively owns the connection's [`ClientContext`], so in-flight
//! bookkeeping needs no locking. Every accepted generate request gets its own
//! task that awaits the pool, runs the post-processing hook and hands the
//! result or error frame back to the loop. The loop is the only writer of
//! terminal frames, so a cancel and a delivery for the same request can never
//! both reach the client.
//!
//! Frame ordering per request is `Accepted` then exactly one of `Result`,
//! `Error` or nothing at all (if the request was cancelled or the client went
//! away). Frames of different requests interleave freely.

use super::{
    context::{ClientContext, FrameSender},
    frame,
};
use crate::server::{
    pool::WorkerPool,
    telemetry::{increment_chunks_generated, increment_request_errors, increment_requests},
};
use chunkforge_core::{
    ChunkCoords, Error, PostProcessor,
    proto::{ClientFrame, GenerateRequest, ServerFrame, client_frame},
    types::UNKNOWN_REQUEST_ID,
};
use ferroid::id::ULID;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::{Code, Status};
use tracing::Instrument;

/// A request that settled, identified by id and registration sequence,
/// together with the frame that answers it.
struct Settled {
    request_id: String,
    seq: u64,
    frame: ServerFrame,
}

/// Shared, cloneable relay configuration.
#[derive(Clone)]
pub struct Relay {
    pool: WorkerPool,
    post_processor: Arc<dyn PostProcessor>,
    max_inflight: usize,
}

impl Relay {
    pub fn new(
        pool: WorkerPool,
        post_processor: Arc<dyn PostProcessor>,
        max_inflight: usize,
    ) -> Self {
        Self {
            pool,
            post_processor,
            max_inflight,
        }
    }

    pub const fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Serves one connection until the client closes its stream, the stream
    /// fails, or `shutdown` fires.
    ///
    /// On exit every pending request is aborted and no further frames are
    /// written for them. Returns the number of requests aborted that way.
    pub async fn serve<S>(
        &self,
        connection_id: u64,
        mut inbound: S,
        outbound: FrameSender,
        shutdown: CancellationToken,
    ) -> usize
    where
        S: Stream<Item = Result<ClientFrame, Status>> + Unpin + Send,
    {
        let mut ctx = ClientContext::new(connection_id, outbound);
        let (settled_tx, mut settled_rx) = mpsc::unbounded_channel::<Settled>();

        tracing::debug!("Connection {connection_id} opened");
        if ctx.send(frame::ready(self.pool.stats())).await {
            loop {
                tokio::select! {
                    // Settlements first, so a client that reacts to a result
                    // frame always sees the freed in-flight slot.
                    biased;
                    () = shutdown.cancelled() => {
                        tracing::debug!("Connection {connection_id} closing for shutdown");
                        break;
                    }
                    Some(Settled { request_id, seq, frame }) = settled_rx.recv() => {
                        if ctx.complete(&request_id, seq) {
                            ctx.send(frame).await;
                        } else {
                            tracing::trace!("Dropping late frame for cancelled {request_id}");
                        }
                    }
                    frame = inbound.next() => match frame {
                        Some(Ok(frame)) => self.handle_frame(&mut ctx, frame, &settled_tx).await,
                        Some(Err(status)) => {
                            tracing::debug!("Connection {connection_id} failed: {status}");
                            // The stream cannot resume after a decode failure.
                            if matches!(status.code(), Code::Internal | Code::InvalidArgument) {
                                let reason = format!("undecodable frame: {}", status.message());
                                reject(&ctx, UNKNOWN_REQUEST_ID, &Error::protocol(reason)).await;
                            }
                            break;
                        }
                        None => {
                            tracing::debug!("Connection {connection_id} closed by client");
                            break;
                        }
                    },
                }
            }
        }

        let aborted = ctx.disconnect();
        if aborted > 0 {
            tracing::debug!("Connection {connection_id} aborted {aborted} in-flight requests");
        }
        aborted
    }

    async fn handle_frame(
        &self,
        ctx: &mut ClientContext,
        frame: ClientFrame,
        settled: &mpsc::UnboundedSender<Settled>,
    ) {
        let request_id = frame.request_id.filter(|id| !id.is_empty());

        match frame.kind {
            Some(client_frame::Kind::Generate(request)) => {
                let request_id = request_id.unwrap_or_else(generate_request_id);
                self.handle_generate(ctx, request_id, request, settled).await;
            }
            Some(client_frame::Kind::Cancel(_)) => {
                let Some(request_id) = request_id else {
                    reject(
                        ctx,
                        UNKNOWN_REQUEST_ID,
                        &Error::protocol("cancel requires a request_id"),
                    )
                    .await;
                    return;
                };
                match ctx.cancel(&request_id) {
                    Ok(()) => {
                        tracing::debug!(
                            "Connection {} cancelled {request_id}",
                            ctx.connection_id()
                        );
                        ctx.send(frame::cancelled(&request_id)).await;
                    }
                    Err(e) => reject(ctx, &request_id, &e).await,
                }
            }
            None => {
                let request_id = request_id.as_deref().unwrap_or(UNKNOWN_REQUEST_ID);
                reject(
                    ctx,
                    request_id,
                    &Error::protocol("frame carries neither generate nor cancel"),
                )
                .await;
            }
        }
    }

    async fn handle_generate(
        &self,
        ctx: &mut ClientContext,
        request_id: String,
        request: GenerateRequest,
        settled: &mpsc::UnboundedSender<Settled>,
    ) {
        let Some(coords) = request.coords else {
            reject(
                ctx,
                &request_id,
                &Error::protocol("generate request is missing coords"),
            )
            .await;
            return;
        };
        let coords = ChunkCoords::from(coords);
        let config = request.config.unwrap_or_default();

        if self.pool.is_disposed() {
            reject(ctx, &request_id, &Error::PoolDisposed).await;
            return;
        }

        let (seq, abort) = match ctx.register(&request_id, self.max_inflight) {
            Ok(registered) => registered,
            Err(e) => {
                reject(ctx, &request_id, &e).await;
                return;
            }
        };

        increment_requests();
        tracing::trace!(
            "Connection {} accepted {request_id} for {coords}",
            ctx.connection_id()
        );
        ctx.send(frame::accepted(&request_id, self.pool.stats().queue_length))
            .await;

        let job = self
            .pool
            .enqueue(request_id.clone(), coords, config, Some(abort.clone()));
        let post_processor = Arc::clone(&self.post_processor);
        let settled = settled.clone();

        let deliver = async move {
            let outcome = job.await;

            if abort.is_cancelled() {
                return;
            }

            let frame = match outcome {
                Ok(output) => {
                    if let Err(e) = post_processor.post_process(coords, &output.chunk) {
                        tracing::warn!("Post-processing {coords} for {request_id} failed: {e}");
                    }
                    increment_chunks_generated();
                    frame::result(&request_id, coords, output)
                }
                Err(e) => {
                    tracing::debug!("Request {request_id} failed: {e}");
                    increment_request_errors();
                    frame::error(&request_id, &e)
                }
            };

            if settled
                .send(Settled {
                    request_id,
                    seq,
                    frame,
                })
                .is_err()
            {
                tracing::debug!("Connection closed before a request was delivered");
            }
        };

        tokio::spawn(deliver.in_current_span());
    }
}

async fn reject(ctx: &ClientContext, request_id: &str, err: &Error) {
    tracing::debug!(
        "Connection {} rejected {request_id}: {err}",
        ctx.connection_id()
    );
    increment_request_errors();
    ctx.send(frame::error(request_id, err)).await;
}

/// Server-assigned id for generate requests that arrive without one.
fn generate_request_id() -> String {
    ULID::now().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::pool::PoolConfig;
    use chunkforge_core::{
        ChunkGenerator, GenerationError, NoopPostProcessor, TerrainGenerator,
        generator::BoxError,
        proto::{
            CancelRequest, Chunk, Coords, ErrorKind, GenerationConfig, server_frame::Kind,
        },
    };
    use core::time::Duration;
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };
    use tokio::{task::JoinHandle, time::timeout};
    use tokio_stream::wrappers::ReceiverStream;

    struct Harness {
        inbound: mpsc::Sender<Result<ClientFrame, Status>>,
        outbound: mpsc::Receiver<Result<ServerFrame, Status>>,
        relay: JoinHandle<usize>,
        pool: WorkerPool,
    }

    impl Harness {
        fn start(generator: Arc<dyn ChunkGenerator>, max_inflight: usize) -> Self {
            Self::with_post_processor(generator, Arc::new(NoopPostProcessor), max_inflight)
        }

        fn with_post_processor(
            generator: Arc<dyn ChunkGenerator>,
            post_processor: Arc<dyn PostProcessor>,
            max_inflight: usize,
        ) -> Self {
            let pool = WorkerPool::new(PoolConfig::new(1, 1, Duration::from_secs(30)), generator);
            let relay = Relay::new(pool.clone(), post_processor, max_inflight);
            let (in_tx, in_rx) = mpsc::channel(16);
            let (out_tx, out_rx) = mpsc::channel(16);
            let handle = tokio::spawn(async move {
                relay
                    .serve(
                        1,
                        ReceiverStream::new(in_rx),
                        out_tx,
                        CancellationToken::new(),
                    )
                    .await
            });

            Self {
                inbound: in_tx,
                outbound: out_rx,
                relay: handle,
                pool,
            }
        }

        async fn send(&self, frame: ClientFrame) {
            self.inbound.send(Ok(frame)).await.unwrap();
        }

        async fn next(&mut self) -> Kind {
            timeout(Duration::from_secs(5), self.outbound.recv())
                .await
                .expect("timed out waiting for a frame")
                .expect("stream closed")
                .expect("unexpected status")
                .kind
                .expect("empty frame")
        }

        async fn expect_silence(&mut self, window: Duration) {
            if let Ok(Some(frame)) = timeout(window, self.outbound.recv()).await {
                panic!("unexpected frame {frame:?}");
            }
        }
    }

    fn generate(request_id: Option<&str>, x: i32, y: i32) -> ClientFrame {
        ClientFrame {
            request_id: request_id.map(str::to_string),
            kind: Some(client_frame::Kind::Generate(GenerateRequest {
                coords: Some(Coords { x, y }),
                config: Some(GenerationConfig {
                    seed: 1,
                    size: Some(8),
                    ..Default::default()
                }),
            })),
        }
    }

    fn cancel(request_id: &str) -> ClientFrame {
        ClientFrame {
            request_id: Some(request_id.to_string()),
            kind: Some(client_frame::Kind::Cancel(CancelRequest {})),
        }
    }

    fn slow(delay: Duration) -> Arc<dyn ChunkGenerator> {
        Arc::new(
            move |coords: ChunkCoords, _: &GenerationConfig| -> Result<Chunk, GenerationError> {
                std::thread::sleep(delay);
                Ok(Chunk {
                    coords: Some(coords.into()),
                    size: 1,
                    ..Default::default()
                })
            },
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn streams_ready_accepted_then_result() {
        let mut h = Harness::start(Arc::new(TerrainGenerator::default()), 8);

        match h.next().await {
            Kind::Ready(ready) => assert_eq!(ready.stats.unwrap().max_workers, 1),
            other => panic!("expected ready, got {other:?}"),
        }

        h.send(generate(Some("r1"), 0, 0)).await;
        match h.next().await {
            Kind::Accepted(accepted) => {
                assert_eq!(accepted.request_id, "r1");
                assert_eq!(accepted.queue_size, 0);
            }
            other => panic!("expected accepted, got {other:?}"),
        }
        match h.next().await {
            Kind::Result(result) => {
                assert_eq!(result.request_id, "r1");
                assert_eq!(result.coords, Some(Coords { x: 0, y: 0 }));
                assert_eq!(result.chunk.unwrap().tiles.len(), 64);
                assert!(result.timings.unwrap().generation_ms >= 0.0);
            }
            other => panic!("expected result, got {other:?}"),
        }
        h.pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn enforces_the_inflight_ceiling() {
        let mut h = Harness::start(slow(Duration::from_millis(200)), 2);
        h.next().await;

        h.send(generate(Some("a"), 0, 0)).await;
        h.send(generate(Some("b"), 1, 0)).await;
        h.send(generate(Some("c"), 2, 0)).await;

        assert!(matches!(h.next().await, Kind::Accepted(a) if a.request_id == "a"));
        assert!(matches!(h.next().await, Kind::Accepted(b) if b.request_id == "b"));
        match h.next().await {
            Kind::Error(err) => {
                assert_eq!(err.request_id, "c");
                assert_eq!(err.kind(), ErrorKind::CapacityExceeded);
            }
            other => panic!("expected capacity error, got {other:?}"),
        }

        // Once `a` is delivered its slot is free again.
        assert!(matches!(h.next().await, Kind::Result(r) if r.request_id == "a"));
        h.send(generate(Some("d"), 3, 0)).await;
        assert!(matches!(h.next().await, Kind::Accepted(d) if d.request_id == "d"));
        h.pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_acknowledges_and_suppresses_the_result() {
        let mut h = Harness::start(slow(Duration::from_millis(150)), 8);
        h.next().await;

        h.send(generate(Some("a"), 0, 0)).await;
        assert!(matches!(h.next().await, Kind::Accepted(_)));

        h.send(cancel("a")).await;
        assert!(matches!(h.next().await, Kind::Cancelled(c) if c.request_id == "a"));
        h.expect_silence(Duration::from_millis(400)).await;

        h.send(cancel("a")).await;
        match h.next().await {
            Kind::Error(err) => {
                assert_eq!(err.request_id, "a");
                assert_eq!(err.kind(), ErrorKind::NotFound);
                assert_eq!(err.message, "Request a not found or already completed");
            }
            other => panic!("expected not-found error, got {other:?}"),
        }
        h.pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn answers_malformed_frames_with_protocol_errors() {
        let mut h = Harness::start(slow(Duration::ZERO), 8);
        h.next().await;

        h.send(ClientFrame {
            request_id: None,
            kind: None,
        })
        .await;
        match h.next().await {
            Kind::Error(err) => {
                assert_eq!(err.request_id, UNKNOWN_REQUEST_ID);
                assert_eq!(err.kind(), ErrorKind::Protocol);
            }
            other => panic!("expected protocol error, got {other:?}"),
        }

        h.send(ClientFrame {
            request_id: Some("x".to_string()),
            kind: Some(client_frame::Kind::Generate(GenerateRequest {
                coords: None,
                config: None,
            })),
        })
        .await;
        assert!(
            matches!(h.next().await, Kind::Error(e) if e.request_id == "x" && e.kind() == ErrorKind::Protocol)
        );

        h.send(ClientFrame {
            request_id: None,
            kind: Some(client_frame::Kind::Cancel(CancelRequest {})),
        })
        .await;
        assert!(
            matches!(h.next().await, Kind::Error(e) if e.request_id == UNKNOWN_REQUEST_ID)
        );

        // The connection survives.
        h.send(generate(Some("ok"), 0, 0)).await;
        assert!(matches!(h.next().await, Kind::Accepted(_)));
        assert!(matches!(h.next().await, Kind::Result(_)));
        h.pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_undecodable_frames_before_closing() {
        let mut h = Harness::start(slow(Duration::ZERO), 8);
        h.next().await;

        h.inbound
            .send(Err(Status::internal("failed to decode ClientFrame")))
            .await
            .unwrap();
        match h.next().await {
            Kind::Error(err) => {
                assert_eq!(err.request_id, UNKNOWN_REQUEST_ID);
                assert_eq!(err.kind(), ErrorKind::Protocol);
                assert!(err.message.contains("failed to decode ClientFrame"));
            }
            other => panic!("expected protocol error, got {other:?}"),
        }

        let Harness {
            mut outbound,
            relay,
            pool,
            ..
        } = h;
        assert_eq!(relay.await.unwrap(), 0);
        assert!(outbound.recv().await.is_none());
        pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn transport_errors_close_without_a_frame() {
        let mut h = Harness::start(slow(Duration::ZERO), 8);
        h.next().await;

        h.inbound
            .send(Err(Status::cancelled("client reset")))
            .await
            .unwrap();
        let Harness {
            mut outbound,
            relay,
            pool,
            ..
        } = h;
        assert_eq!(relay.await.unwrap(), 0);
        assert!(outbound.recv().await.is_none());
        pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_during_delivery_sends_only_cancelled() {
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        // Holds the delivery task after it has decided to deliver.
        let hook = move |_: ChunkCoords, _: &Chunk| -> Result<(), BoxError> {
            let _ = release_rx
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(2));
            Ok(())
        };
        let mut h = Harness::with_post_processor(slow(Duration::ZERO), Arc::new(hook), 8);
        h.next().await;

        h.send(generate(Some("a"), 0, 0)).await;
        assert!(matches!(h.next().await, Kind::Accepted(_)));
        tokio::time::sleep(Duration::from_millis(100)).await;

        h.send(cancel("a")).await;
        assert!(matches!(h.next().await, Kind::Cancelled(c) if c.request_id == "a"));
        release_tx.send(()).unwrap();
        h.expect_silence(Duration::from_millis(300)).await;
        h.pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejects_duplicate_inflight_ids() {
        let mut h = Harness::start(slow(Duration::from_millis(100)), 8);
        h.next().await;

        h.send(generate(Some("a"), 0, 0)).await;
        h.send(generate(Some("a"), 1, 0)).await;
        assert!(matches!(h.next().await, Kind::Accepted(_)));
        assert!(
            matches!(h.next().await, Kind::Error(e) if e.request_id == "a" && e.kind() == ErrorKind::Protocol)
        );
        assert!(matches!(h.next().await, Kind::Result(r) if r.request_id == "a"));
        h.pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn disconnect_aborts_pending_requests_silently() {
        let mut h = Harness::start(slow(Duration::from_millis(150)), 8);
        h.next().await;

        h.send(generate(Some("a"), 0, 0)).await;
        h.send(generate(Some("b"), 1, 0)).await;
        assert!(matches!(h.next().await, Kind::Accepted(_)));
        assert!(matches!(h.next().await, Kind::Accepted(_)));

        let Harness {
            inbound,
            mut outbound,
            relay,
            pool,
        } = h;
        drop(inbound);
        assert_eq!(relay.await.unwrap(), 2);

        // Only the relay loop writes frames, so its exit closes the stream.
        let rest = timeout(Duration::from_secs(2), outbound.recv())
            .await
            .expect("stream never closed");
        assert!(rest.is_none());
        pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn failed_post_processing_still_delivers() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let hook = move |_: ChunkCoords, _: &Chunk| -> Result<(), BoxError> {
            counter.fetch_add(1, Ordering::SeqCst);
            Err("spawner unavailable".into())
        };
        let mut h =
            Harness::with_post_processor(slow(Duration::ZERO), Arc::new(hook), 8);
        h.next().await;

        h.send(generate(Some("a"), 4, 2)).await;
        assert!(matches!(h.next().await, Kind::Accepted(_)));
        match h.next().await {
            Kind::Result(result) => assert_eq!(result.coords, Some(Coords { x: 4, y: 2 })),
            other => panic!("expected result, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        h.pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_generation_failures() {
        let generator: Arc<dyn ChunkGenerator> = Arc::new(
            |_: ChunkCoords, _: &GenerationConfig| -> Result<Chunk, GenerationError> {
                Err(GenerationError::new("void chunk"))
            },
        );
        let mut h = Harness::start(generator, 8);
        h.next().await;

        h.send(generate(Some("a"), 0, 0)).await;
        assert!(matches!(h.next().await, Kind::Accepted(_)));
        match h.next().await {
            Kind::Error(err) => {
                assert_eq!(err.kind(), ErrorKind::Generation);
                assert_eq!(err.message, "Generation failed: void chunk");
            }
            other => panic!("expected generation error, got {other:?}"),
        }
        h.pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn assigns_ids_to_anonymous_requests() {
        let mut h = Harness::start(slow(Duration::ZERO), 8);
        h.next().await;

        h.send(generate(None, 0, 0)).await;
        let id = match h.next().await {
            Kind::Accepted(accepted) => accepted.request_id,
            other => panic!("expected accepted, got {other:?}"),
        };
        assert_eq!(id.len(), 26);
        assert!(matches!(h.next().await, Kind::Result(r) if r.request_id == id));
        h.pool.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn rejects_work_once_the_pool_is_disposed() {
        let mut h = Harness::start(slow(Duration::ZERO), 8);
        h.next().await;
        h.pool.destroy().await;

        h.send(generate(Some("late"), 0, 0)).await;
        assert!(
            matches!(h.next().await, Kind::Error(e) if e.kind() == ErrorKind::PoolDisposed)
        );
    }
}
