//! Per-connection state.

use chunkforge_core::{Error, proto::ServerFrame};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::Status;

pub type FrameSender = mpsc::Sender<Result<ServerFrame, Status>>;

#[derive(Debug)]
struct Inflight {
    /// Distinguishes successive requests that reuse the same id.
    seq: u64,
    abort: CancellationToken,
}

/// Requests in flight on one client connection and the channel their frames
/// are written to.
///
/// Owned by the connection's relay loop; only that loop mutates it.
#[derive(Debug)]
pub struct ClientContext {
    connection_id: u64,
    outbound: FrameSender,
    inflight: HashMap<String, Inflight>,
    next_seq: u64,
}

impl ClientContext {
    pub fn new(connection_id: u64, outbound: FrameSender) -> Self {
        Self {
            connection_id,
            outbound,
            inflight: HashMap::new(),
            next_seq: 0,
        }
    }

    pub const fn connection_id(&self) -> u64 {
        self.connection_id
    }

    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    /// Registers a new request and returns its sequence number and abort
    /// token.
    ///
    /// # Errors
    ///
    /// - [`Error::CapacityExceeded`] if `max_inflight` requests are already
    ///   pending.
    /// - [`Error::Protocol`] if `request_id` is already pending.
    pub fn register(
        &mut self,
        request_id: &str,
        max_inflight: usize,
    ) -> Result<(u64, CancellationToken), Error> {
        if self.inflight.len() >= max_inflight {
            return Err(Error::CapacityExceeded {
                limit: max_inflight,
            });
        }
        if self.inflight.contains_key(request_id) {
            return Err(Error::protocol(format!(
                "request {request_id} is already in flight"
            )));
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let abort = CancellationToken::new();
        self.inflight.insert(
            request_id.to_string(),
            Inflight {
                seq,
                abort: abort.clone(),
            },
        );
        Ok((seq, abort))
    }

    /// Aborts and forgets a pending request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownRequest`] if the request is not pending.
    pub fn cancel(&mut self, request_id: &str) -> Result<(), Error> {
        match self.inflight.remove(request_id) {
            Some(entry) => {
                entry.abort.cancel();
                Ok(())
            }
            None => Err(Error::UnknownRequest {
                request_id: request_id.to_string(),
            }),
        }
    }

    /// Forgets a settled request. Ignored if the id has since been reused
    /// by a newer request.
    pub fn complete(&mut self, request_id: &str, seq: u64) -> bool {
        match self.inflight.get(request_id) {
            Some(entry) if entry.seq == seq => {
                self.inflight.remove(request_id);
                true
            }
            _ => false,
        }
    }

    /// Aborts every pending request. Returns how many were aborted.
    pub fn disconnect(&mut self) -> usize {
        let aborted = self.inflight.len();
        for (_, entry) in self.inflight.drain() {
            entry.abort.cancel();
        }
        aborted
    }

    /// Writes a frame to the client. Returns `false` if the client is gone.
    pub async fn send(&self, frame: ServerFrame) -> bool {
        if self.outbound.send(Ok(frame)).await.is_err() {
            tracing::debug!("Connection {} closed before frame was sent", self.connection_id);
            return false;
        }
        true
    }
}
