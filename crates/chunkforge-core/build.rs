/// Builds the gRPC client and server code for the `chunkforge.proto` definition
/// using `tonic-prost-build`.
///
/// # Byte Field Optimization
///
/// The `heights` and `tiles` fields of `Chunk` are explicitly marked with
/// `.bytes(...)` so they are generated as `bytes::Bytes` instead of `Vec<u8>`.
/// Chunks are produced on worker threads and handed to the response stream
/// without copying the tile buffers again.
///
/// # Files and Paths
///
/// - Proto file: `proto/chunkforge.proto`
/// - Includes: `proto/`
/// - Descriptor set: `$OUT_DIR/chunkforge_descriptor.bin` (used for gRPC
///   reflection)
///
/// # Panics
///
/// Panics if code generation fails (e.g. `protoc` is missing).
use std::env;
use std::path::PathBuf;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());
    let descriptor_path = out_dir.join("chunkforge_descriptor.bin");

    let mut config = tonic_prost_build::Config::new();

    config
        .bytes([".chunkforge.Chunk.heights", ".chunkforge.Chunk.tiles"])
        .file_descriptor_set_path(&descriptor_path);

    println!("cargo:rerun-if-changed=proto/chunkforge.proto");

    tonic_prost_build::configure()
        .compile_with_config(config, &["proto/chunkforge.proto"], &["proto"])
        .unwrap();
}
