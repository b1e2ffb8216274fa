use core::{fmt, hint::black_box};
use chunkforge_core::proto::{
    ClientFrame, Coords, GenerateRequest, GenerationConfig, chunk_stream_client::ChunkStreamClient,
    client_frame, server_frame::Kind,
};
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use futures::stream::FuturesUnordered;
use std::{
    net::TcpStream,
    process::{Command, Stdio},
    thread,
    time::{Duration, Instant},
};
use tokio::{runtime::Builder, sync::mpsc};
use tokio_stream::{StreamExt, wrappers::ReceiverStream};
use tonic::{
    codec::CompressionEncoding,
    transport::{Channel, Uri},
};

#[derive(Clone, Copy, Debug)]
enum Compression {
    None,
    Deflate,
    Gzip,
    Zstd,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Deflate => write!(f, "deflate"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

impl From<Compression> for Option<CompressionEncoding> {
    fn from(value: Compression) -> Self {
        match value {
            Compression::None => None,
            Compression::Deflate => Some(CompressionEncoding::Deflate),
            Compression::Gzip => Some(CompressionEncoding::Gzip),
            Compression::Zstd => Some(CompressionEncoding::Zstd),
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct GrpcBenchParams {
    chunks_per_session: u64,
    chunk_size: u32,
    concurrency: usize,
    compression: Compression,
}

fn grpc_bench(c: &mut Criterion) {
    let uri = Uri::try_from("http://0.0.0.0:50051").expect("Invalid URI");
    // Start the server. This may require a full compilation so set the timeout
    // high. Adjust features and CLI args to the server as necessary.
    let mut server = Command::new("cargo")
        .args([
            "run",
            "--bin",
            "chunkforge-server",
            "--release",
            "--features",
            "traces",
            "--",
            "--min-workers",
            "2",
            "--max-workers",
            "16",
            "--max-inflight",
            "256",
        ])
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .expect("Failed to start chunkforge-server");
    wait_for_port(uri.authority().expect("missing authority").as_str(), 300);

    let chunks_per_session_cases = [16, 128];
    let chunk_size_cases = [32, 128];
    let concurrency_cases = [1, 4, 16];
    let compression_cases = [
        Compression::None,
        Compression::Zstd,
        Compression::Gzip,
        Compression::Deflate,
    ];

    let mut cases = Vec::new();
    for &chunks_per_session in &chunks_per_session_cases {
        for &chunk_size in &chunk_size_cases {
            for &concurrency in &concurrency_cases {
                for &compression in &compression_cases {
                    cases.push(GrpcBenchParams {
                        chunks_per_session,
                        chunk_size,
                        concurrency,
                        compression,
                    });
                }
            }
        }
    }
    let rt = Builder::new_multi_thread().enable_all().build().unwrap();

    for params in &cases {
        let mut group = c.benchmark_group("grpc/session");
        group.throughput(Throughput::Elements(
            params.chunks_per_session * params.concurrency as u64,
        ));

        group.bench_function(
            format!(
                "chunks/{}/size/{}/conc/{}/comp/{}",
                params.chunks_per_session,
                params.chunk_size,
                params.concurrency,
                params.compression,
            ),
            |b| {
                b.to_async(&rt).iter_custom(|iters| {
                    let uri = uri.clone();
                    async move {
                        let channel = Channel::builder(uri)
                            .connect()
                            .await
                            .expect("Failed to connect to server");

                        let start = Instant::now();

                        for _ in 0..iters {
                            run_grpc_session_bench(&channel, params).await;
                        }

                        start.elapsed()
                    }
                });
            },
        );

        group.finish();
    }

    if server.kill().is_err() {
        eprintln!("failed to kill server");
    }
}

fn generate_frame(index: u64, chunk_size: u32) -> ClientFrame {
    ClientFrame {
        request_id: Some(format!("bench-{index}")),
        kind: Some(client_frame::Kind::Generate(GenerateRequest {
            coords: Some(Coords {
                x: (index % 64) as i32,
                y: (index / 64) as i32,
            }),
            config: Some(GenerationConfig {
                seed: 42,
                size: Some(chunk_size),
                ..Default::default()
            }),
        })),
    }
}

async fn run_grpc_session_bench(channel: &Channel, params: &GrpcBenchParams) {
    let mut tasks = FuturesUnordered::new();

    for _ in 0..params.concurrency {
        let channel = channel.clone();
        let params = *params;

        tasks.push(tokio::spawn(async move {
            let mut client = ChunkStreamClient::new(channel);
            if let Some(encoding) = params.compression.into() {
                client = client.accept_compressed(encoding).send_compressed(encoding)
            }

            let (tx, rx) = mpsc::channel(params.chunks_per_session as usize);
            let mut frames = client
                .session(ReceiverStream::new(rx))
                .await
                .expect("session call failed")
                .into_inner();

            for index in 0..params.chunks_per_session {
                tx.send(generate_frame(index, params.chunk_size))
                    .await
                    .expect("session closed");
            }

            let mut remaining = params.chunks_per_session;
            while remaining > 0 {
                let frame = frames
                    .next()
                    .await
                    .expect("stream ended early")
                    .expect("frame");
                match frame.kind {
                    Some(Kind::Result(result)) => {
                        let chunk = result.chunk.expect("chunk");
                        assert_eq!(chunk.heights.len(), chunk.tiles.len());
                        black_box(chunk);
                        remaining -= 1;
                    }
                    Some(Kind::Error(err)) => panic!("request failed: {err:?}"),
                    _ => {}
                }
            }
        }));
    }

    while let Some(res) = tasks.next().await {
        res.unwrap();
    }
}

pub fn wait_for_port(addr: &str, timeout_secs: u64) {
    let start = Instant::now();
    while start.elapsed().as_secs() < timeout_secs {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Server did not start listening on {}", addr);
}

criterion_group!(grpc_benches, grpc_bench);
criterion_main!(grpc_benches);
