//! Proxy half of a transfer: claim a segment, hand the request to the
//! daemon, and relay the answer to the client chunk by chunk.

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::control::{ControlMessage, RequestQueue};
use crate::error::{CacheError, Result};
use crate::logger::{NoopLogger, TransferLogger};
use crate::pool::SegmentPool;
use crate::protocol::GfStatus;

/// What the cache relay needs from a client connection.
pub trait Responder {
    /// Send the response header.
    fn send_status(&mut self, status: GfStatus, len: u64) -> io::Result<()>;
    /// Send body bytes; returns how many were written.
    fn send_bytes(&mut self, data: &[u8]) -> io::Result<usize>;
    /// Drop the connection without finishing the response.
    fn abort(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Delivered { bytes: u64, chunks: u64 },
    NotFound,
}

/// Serves GETFILE requests out of the cache daemon.
pub struct CacheRelay {
    pool: Arc<SegmentPool>,
    queue: Arc<dyn RequestQueue>,
    logger: Arc<dyn TransferLogger>,
    peer_timeout: Option<Duration>,
}

impl CacheRelay {
    pub fn new(pool: Arc<SegmentPool>, queue: Arc<dyn RequestQueue>) -> Self {
        CacheRelay {
            pool,
            queue,
            logger: Arc::new(NoopLogger),
            peer_timeout: None,
        }
    }

    pub fn with_logger(mut self, logger: Arc<dyn TransferLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn with_peer_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.peer_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &SegmentPool {
        &self.pool
    }

    /// Relay `path` to `ctx`.
    ///
    /// If the client goes away mid-body the remaining chunks are still pulled
    /// from the daemon and discarded, so the segment is only released once
    /// its worker is done with it. The client error is returned afterwards.
    pub fn relay(&self, ctx: &mut dyn Responder, path: &str) -> Result<RelayOutcome> {
        if !ControlMessage::carries_path(path) {
            let _ = ctx.send_status(GfStatus::Invalid, 0);
            return Err(CacheError::InvalidPath(path.to_string()));
        }

        let claim = self.pool.claim();
        let segment = claim.segment()?;
        segment.reset()?;
        self.logger.request(path, claim.id());
        self.queue
            .send(&ControlMessage::new(claim.id(), segment.capacity(), path))?;

        let end = segment.proxy_end(self.peer_timeout);
        let Some(file_size) = end.wait_file_size()? else {
            claim.release()?;
            self.logger.not_found(path);
            ctx.send_status(GfStatus::FileNotFound, 0)
                .map_err(CacheError::Transport)?;
            return Ok(RelayOutcome::NotFound);
        };

        let started = Instant::now();
        let mut client_error = ctx
            .send_status(GfStatus::Ok, file_size)
            .err()
            .map(CacheError::Transport);

        let mut chunk = Vec::with_capacity(segment.capacity());
        let mut transferred = 0u64;
        let mut chunks = 0u64;
        while transferred < file_size {
            end.request_chunk()?;
            let len = end.take_chunk(&mut chunk)?;
            if transferred + len as u64 > file_size {
                return Err(CacheError::CorruptChunk {
                    id: claim.id(),
                    len: len as i64,
                    capacity: segment.capacity(),
                });
            }
            transferred += len as u64;
            chunks += 1;
            if client_error.is_some() {
                continue;
            }
            match ctx.send_bytes(&chunk) {
                Ok(written) if written == len => {}
                Ok(written) => {
                    client_error = Some(CacheError::ShortWrite {
                        expected: len,
                        written,
                    })
                }
                Err(e) => client_error = Some(CacheError::Transport(e)),
            }
        }
        claim.release()?;

        if let Some(err) = client_error {
            ctx.abort();
            self.logger.error("relay", path, &err.to_string());
            return Err(err);
        }
        self.logger
            .served(path, transferred, chunks, started.elapsed().as_secs_f64());
        Ok(RelayOutcome::Delivered {
            bytes: transferred,
            chunks,
        })
    }
}
