//! Collaborator interfaces invoked by the worker pool and the relay.
//!
//! The pool treats generation as a pure function
//! `generate(coords, config) -> chunk | error` executed on a worker thread; it
//! never looks inside the configuration or the produced chunk. After a chunk
//! is delivered, the relay gives a [`PostProcessor`] the chance to react to it
//! (e.g. spawning secondary entities for the region). Post-processing is
//! best-effort: its failures are logged and never block delivery.
//!
//! [`TerrainGenerator`] is a small deterministic reference implementation
//! (seeded value noise classified into terrain tiles) so that the server is
//! usable out of the box.

use crate::{
    error::GenerationError,
    proto::{Chunk, GenerationConfig},
    types::{ChunkCoords, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE},
};
use bytes::Bytes;

/// Boxed error returned by post-processing hooks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Produces the content of one chunk.
///
/// Implementations run on dedicated worker threads and may be CPU-bound.
/// Returning `Err` fails only the current job. Panicking is treated as a
/// worker crash: the worker is replaced and the job fails with
/// [`Error::WorkerFailure`](crate::Error::WorkerFailure).
pub trait ChunkGenerator: Send + Sync + 'static {
    fn generate(
        &self,
        coords: ChunkCoords,
        config: &GenerationConfig,
    ) -> Result<Chunk, GenerationError>;
}

impl<F> ChunkGenerator for F
where
    F: Fn(ChunkCoords, &GenerationConfig) -> Result<Chunk, GenerationError> + Send + Sync + 'static,
{
    fn generate(
        &self,
        coords: ChunkCoords,
        config: &GenerationConfig,
    ) -> Result<Chunk, GenerationError> {
        self(coords, config)
    }
}

/// Hook run after a chunk has been generated, before it is sent to the
/// client.
pub trait PostProcessor: Send + Sync + 'static {
    fn post_process(&self, coords: ChunkCoords, chunk: &Chunk) -> Result<(), BoxError>;
}

impl<F> PostProcessor for F
where
    F: Fn(ChunkCoords, &Chunk) -> Result<(), BoxError> + Send + Sync + 'static,
{
    fn post_process(&self, coords: ChunkCoords, chunk: &Chunk) -> Result<(), BoxError> {
        self(coords, chunk)
    }
}

/// Post-processor that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopPostProcessor;

impl PostProcessor for NoopPostProcessor {
    fn post_process(&self, _coords: ChunkCoords, _chunk: &Chunk) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Terrain class stored per tile in [`Chunk::tiles`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Terrain {
    Water = 0,
    Sand = 1,
    Grass = 2,
    Rock = 3,
    Snow = 4,
}

impl Terrain {
    fn classify(height: f64, sea_level: f64) -> Self {
        if height < sea_level {
            Self::Water
        } else if height < sea_level + 0.05 {
            Self::Sand
        } else if height < 0.7 {
            Self::Grass
        } else if height < 0.85 {
            Self::Rock
        } else {
            Self::Snow
        }
    }
}

const DEFAULT_SCALE: f64 = 48.0;
const DEFAULT_SEA_LEVEL: f64 = 0.4;
const OCTAVES: u32 = 4;

/// Deterministic heightmap generator.
///
/// Heights are fractal value noise sampled in world space, so neighbouring
/// chunks generated with the same seed and size line up seamlessly.
#[derive(Clone, Debug)]
pub struct TerrainGenerator {
    default_size: u32,
}

impl TerrainGenerator {
    /// Creates a generator that uses `default_size` for requests without an
    /// explicit size.
    pub const fn new(default_size: u32) -> Self {
        Self { default_size }
    }

    pub const fn default_size(&self) -> u32 {
        self.default_size
    }
}

impl Default for TerrainGenerator {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkGenerator for TerrainGenerator {
    fn generate(
        &self,
        coords: ChunkCoords,
        config: &GenerationConfig,
    ) -> Result<Chunk, GenerationError> {
        let size = config.size.unwrap_or(self.default_size);
        if size == 0 || size > MAX_CHUNK_SIZE {
            return Err(GenerationError::new(format!(
                "chunk size {size} out of range (1..={MAX_CHUNK_SIZE})"
            )));
        }

        let scale = config.scale.unwrap_or(DEFAULT_SCALE);
        if !scale.is_finite() || scale <= 0.0 {
            return Err(GenerationError::new(format!("invalid scale {scale}")));
        }

        let sea_level = config.sea_level.unwrap_or(DEFAULT_SEA_LEVEL);
        if !(0.0..=1.0).contains(&sea_level) {
            return Err(GenerationError::new(format!(
                "sea level {sea_level} outside [0, 1]"
            )));
        }

        let edge = size as usize;
        let mut heights = Vec::with_capacity(edge * edge);
        let mut tiles = Vec::with_capacity(edge * edge);
        let origin_x = i64::from(coords.x) * i64::from(size);
        let origin_y = i64::from(coords.y) * i64::from(size);

        for ty in 0..i64::from(size) {
            for tx in 0..i64::from(size) {
                let wx = (origin_x + tx) as f64 / scale;
                let wy = (origin_y + ty) as f64 / scale;
                let height = fractal_noise(config.seed, wx, wy);
                heights.push((height * 255.0).round() as u8);
                tiles.push(Terrain::classify(height, sea_level) as u8);
            }
        }

        Ok(Chunk {
            coords: Some(coords.into()),
            size,
            heights: Bytes::from(heights),
            tiles: Bytes::from(tiles),
        })
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Uniform value in `[0, 1)` attached to an integer lattice point.
fn lattice(seed: u64, x: i64, y: i64) -> f64 {
    let h = splitmix64(
        seed ^ (x as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
            ^ (y as u64).wrapping_mul(0xC2B2_AE3D_27D4_EB4F),
    );
    (h >> 11) as f64 / (1_u64 << 53) as f64
}

fn smoothstep(t: f64) -> f64 {
    t * t * (3.0 - 2.0 * t)
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

fn value_noise(seed: u64, x: f64, y: f64) -> f64 {
    let x0 = x.floor();
    let y0 = y.floor();
    let (ix, iy) = (x0 as i64, y0 as i64);
    let fx = smoothstep(x - x0);
    let fy = smoothstep(y - y0);

    // Casts saturate for far-away sample points; the lattice wraps there.
    let (jx, jy) = (ix.wrapping_add(1), iy.wrapping_add(1));

    let top = lerp(lattice(seed, ix, iy), lattice(seed, jx, iy), fx);
    let bottom = lerp(lattice(seed, ix, jy), lattice(seed, jx, jy), fx);
    lerp(top, bottom, fy)
}

fn fractal_noise(seed: u64, x: f64, y: f64) -> f64 {
    let mut total = 0.0;
    let mut amplitude = 1.0;
    let mut frequency = 1.0;
    let mut norm = 0.0;

    for octave in 0..OCTAVES {
        let octave_seed = seed.wrapping_add(u64::from(octave).wrapping_mul(0x632B_E59B_D9B4_E019));
        total += value_noise(octave_seed, x * frequency, y * frequency) * amplitude;
        norm += amplitude;
        amplitude *= 0.5;
        frequency *= 2.0;
    }

    (total / norm).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(seed: u64) -> GenerationConfig {
        GenerationConfig {
            seed,
            ..Default::default()
        }
    }

    #[test]
    fn same_inputs_produce_identical_chunks() {
        let generator = TerrainGenerator::default();
        let a = generator.generate(ChunkCoords::new(3, -2), &config(1)).unwrap();
        let b = generator.generate(ChunkCoords::new(3, -2), &config(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn chunk_matches_requested_size() {
        let generator = TerrainGenerator::new(16);
        let chunk = generator.generate(ChunkCoords::new(0, 0), &config(7)).unwrap();
        assert_eq!(chunk.size, 16);
        assert_eq!(chunk.heights.len(), 16 * 16);
        assert_eq!(chunk.tiles.len(), 16 * 16);
        assert!(chunk.tiles.iter().all(|&t| t <= Terrain::Snow as u8));

        let explicit = GenerationConfig {
            size: Some(8),
            ..config(7)
        };
        let chunk = generator.generate(ChunkCoords::new(0, 0), &explicit).unwrap();
        assert_eq!(chunk.tiles.len(), 64);
    }

    #[test]
    fn seeds_and_coords_change_the_output() {
        let generator = TerrainGenerator::default();
        let base = generator.generate(ChunkCoords::new(0, 0), &config(1)).unwrap();
        let other_seed = generator.generate(ChunkCoords::new(0, 0), &config(2)).unwrap();
        let other_coords = generator.generate(ChunkCoords::new(1, 0), &config(1)).unwrap();
        assert_ne!(base.heights, other_seed.heights);
        assert_ne!(base.heights, other_coords.heights);
    }

    #[test]
    fn rejects_out_of_range_parameters() {
        let generator = TerrainGenerator::default();
        let too_big = GenerationConfig {
            size: Some(MAX_CHUNK_SIZE + 1),
            ..config(1)
        };
        assert!(generator.generate(ChunkCoords::default(), &too_big).is_err());

        let bad_scale = GenerationConfig {
            scale: Some(0.0),
            ..config(1)
        };
        assert!(generator.generate(ChunkCoords::default(), &bad_scale).is_err());

        let bad_sea = GenerationConfig {
            sea_level: Some(1.5),
            ..config(1)
        };
        assert!(generator.generate(ChunkCoords::default(), &bad_sea).is_err());
    }

    #[test]
    fn tiny_scales_sample_far_from_the_origin_without_overflow() {
        let generator = TerrainGenerator::new(4);
        for scale in [1e-300, f64::MIN_POSITIVE] {
            let tiny = GenerationConfig {
                scale: Some(scale),
                ..config(3)
            };
            let chunk = generator
                .generate(ChunkCoords::new(i32::MAX, i32::MIN), &tiny)
                .unwrap();
            assert_eq!(chunk.heights.len(), 16);
        }
    }

    #[test]
    fn closures_are_generators() {
        let failing = |_: ChunkCoords, _: &GenerationConfig| -> Result<Chunk, GenerationError> {
            Err(GenerationError::new("nope"))
        };
        let err = failing
            .generate(ChunkCoords::default(), &config(0))
            .unwrap_err();
        assert_eq!(err.message, "nope");
    }
}
