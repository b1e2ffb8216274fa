#![doc = include_str!("../README.md")]

mod server;

use chunkforge_core::{
    NoopPostProcessor, TerrainGenerator,
    proto::{FILE_DESCRIPTOR_SET, chunk_stream_server::ChunkStreamServer},
};
use clap::Parser;
use futures::Stream;
use server::{
    config::{CliArgs, ServerConfig},
    service::handler::ChunkService,
    telemetry::init_telemetry,
};
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    signal,
};
use tonic::{
    codec::CompressionEncoding,
    transport::{Server, server::Connected},
};
use tonic_health::server::HealthReporter;
use tonic_web::GrpcWebLayer;
use tower_http::cors::CorsLayer;

// Using mimalloc for better performance under contention, especially in musl
// environments.
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

type ChunkStreamService = ChunkStreamServer<ChunkService>;

const ENCODINGS: [CompressionEncoding; 3] = [
    CompressionEncoding::Zstd,
    CompressionEncoding::Gzip,
    CompressionEncoding::Deflate,
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = ServerConfig::try_from(CliArgs::parse())?;
    let providers = init_telemetry()?;

    tracing::info!(
        "Serving chunks on {} ({}) with {}..={} workers",
        config.server_addr,
        if config.uds { "unix socket" } else { "tcp" },
        config.min_workers,
        config.max_workers
    );
    tracing::debug!("Resolved configuration: {config:#?}");

    let served = if config.uds {
        serve_unix(config).await
    } else {
        serve_tcp(config).await
    };

    providers.shutdown();
    served
}

async fn serve_tcp(config: ServerConfig) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    serve(tokio_stream::wrappers::TcpListenerStream::new(listener), config).await
}

#[cfg(unix)]
async fn serve_unix(config: ServerConfig) -> anyhow::Result<()> {
    let path = config.server_addr.clone();
    let listener = tokio::net::UnixListener::bind(&path)?;
    let served = serve(tokio_stream::wrappers::UnixListenerStream::new(listener), config).await;

    // A panic can still leave the socket file behind.
    if let Err(e) = std::fs::remove_file(&path) {
        tracing::warn!("Failed to remove socket {path}: {e}");
    }
    served
}

#[cfg(not(unix))]
async fn serve_unix(_config: ServerConfig) -> anyhow::Result<()> {
    anyhow::bail!("Unix domain sockets are not supported on this platform")
}

async fn serve<I, IO, IE>(incoming: I, config: ServerConfig) -> anyhow::Result<()>
where
    I: Stream<Item = Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<tower::BoxError>,
{
    let service = ChunkService::new(
        config.clone(),
        Arc::new(TerrainGenerator::new(config.chunk_size)),
        Arc::new(NoopPostProcessor),
    );

    let (health, health_service) = tonic_health::server::health_reporter();
    health.set_serving::<ChunkStreamService>().await;

    let reflection = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(FILE_DESCRIPTOR_SET)
        .build_v1()?;

    let chunks = ENCODINGS
        .into_iter()
        .fold(ChunkStreamServer::new(service.clone()), |svc, encoding| {
            svc.send_compressed(encoding).accept_compressed(encoding)
        });

    Server::builder()
        .accept_http1(true)
        .http2_adaptive_window(Some(true))
        .layer(CorsLayer::permissive())
        .layer(GrpcWebLayer::new())
        .add_service(health_service)
        .add_service(reflection)
        .add_service(chunks)
        .serve_with_incoming_shutdown(incoming, drain_on_signal(service, health))
        .await?;

    tracing::info!("Server stopped");
    Ok(())
}

/// Resolves once the service has drained after SIGTERM or Ctrl+C.
async fn drain_on_signal(service: ChunkService, health: HealthReporter) {
    wait_for_signal().await;

    health.set_not_serving::<ChunkStreamService>().await;
    if let Err(e) = service.shutdown().await {
        tracing::error!("Error during service shutdown: {e}");
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received Ctrl+C, draining"),
        () = terminate => tracing::info!("Received SIGTERM, draining"),
    }
}
