//! Constructors for [`ServerFrame`]s.

use crate::server::pool::{JobOutput, PoolStats};
use chunkforge_core::{
    ChunkCoords, Error,
    proto::{
        Accepted, Cancelled, ChunkResult, ServerFrame, StreamError, StreamReady, server_frame::Kind,
    },
};

pub fn ready(stats: PoolStats) -> ServerFrame {
    ServerFrame {
        kind: Some(Kind::Ready(StreamReady {
            stats: Some(stats.into()),
        })),
    }
}

pub fn accepted(request_id: &str, queue_size: usize) -> ServerFrame {
    ServerFrame {
        kind: Some(Kind::Accepted(Accepted {
            request_id: request_id.to_string(),
            queue_size: u32::try_from(queue_size).unwrap_or(u32::MAX),
        })),
    }
}

pub fn result(request_id: &str, coords: ChunkCoords, output: JobOutput) -> ServerFrame {
    ServerFrame {
        kind: Some(Kind::Result(ChunkResult {
            request_id: request_id.to_string(),
            coords: Some(coords.into()),
            chunk: Some(output.chunk),
            timings: Some(output.timings),
        })),
    }
}

pub fn error(request_id: &str, err: &Error) -> ServerFrame {
    ServerFrame {
        kind: Some(Kind::Error(StreamError {
            request_id: request_id.to_string(),
            message: err.to_string(),
            kind: err.kind().into(),
        })),
    }
}

pub fn cancelled(request_id: &str) -> ServerFrame {
    ServerFrame {
        kind: Some(Kind::Cancelled(Cancelled {
            request_id: request_id.to_string(),
        })),
    }
}
