use super::request::{GenerateTask, WorkerResult};
use crate::server::pool::WorkerId;
use chunkforge_core::{ChunkGenerator, proto::Timings};
use std::time::Instant;

/// Runs a single generation task on the calling worker thread.
///
/// The generator call is timed and its outcome (chunk or generation error) is
/// packaged together with the identifiers the coordinator needs to correlate
/// it with the assigned job. Panics are not caught here; the worker loop
/// treats them as a crash of the whole worker.
pub fn handle_generate(
    worker_id: WorkerId,
    generator: &dyn ChunkGenerator,
    task: GenerateTask,
) -> WorkerResult {
    let GenerateTask {
        job_id,
        request_id,
        coords,
        config,
    } = task;

    tracing::trace!("Worker {worker_id} generating {coords} for {request_id}");

    let start = Instant::now();
    let outcome = generator.generate(coords, &config);
    let generation_ms = start.elapsed().as_secs_f64() * 1_000.0;

    if let Err(ref e) = outcome {
        tracing::debug!("Worker {worker_id} failed to generate {coords}: {e}");
    }

    WorkerResult {
        worker_id,
        job_id,
        request_id,
        outcome,
        timings: Timings { generation_ms },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkforge_core::{
        ChunkCoords, GenerationError, TerrainGenerator,
        proto::{Chunk, GenerationConfig},
    };

    fn task(x: i32) -> GenerateTask {
        GenerateTask {
            job_id: 7,
            request_id: "r7".to_string(),
            coords: ChunkCoords::new(x, 0),
            config: GenerationConfig {
                seed: 42,
                size: Some(8),
                ..Default::default()
            },
        }
    }

    #[test]
    fn packages_successful_generation() {
        let result = handle_generate(3, &TerrainGenerator::default(), task(1));
        assert_eq!(result.worker_id, 3);
        assert_eq!(result.job_id, 7);
        assert_eq!(result.request_id, "r7");
        assert!(result.timings.generation_ms >= 0.0);

        let chunk = result.outcome.unwrap();
        assert_eq!(chunk.size, 8);
        assert_eq!(chunk.tiles.len(), 64);
    }

    #[test]
    fn passes_generation_errors_through() {
        let failing = |_: ChunkCoords, _: &GenerationConfig| -> Result<Chunk, GenerationError> {
            Err(GenerationError::new("no terrain here"))
        };
        let result = handle_generate(1, &failing, task(0));
        assert_eq!(
            result.outcome.unwrap_err(),
            GenerationError::new("no terrain here")
        );
    }
}
