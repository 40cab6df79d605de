//! Cache daemon: a fixed pool of worker threads draining the control queue.
//!
//! Each worker takes one message at a time, maps the named segment, answers
//! with the file size and then feeds the proxy one chunk per request until
//! the whole file is through.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;

use crate::control::{ControlMessage, RequestQueue};
use crate::error::{CacheError, Result};
use crate::resolver::FileResolver;
use crate::segment::Segment;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    Served { bytes: u64, chunks: u64 },
    NotFound,
}

/// Run the daemon half of one transfer.
pub fn serve_request(
    msg: &ControlMessage,
    resolver: &FileResolver,
    segment_prefix: &str,
    peer_timeout: Option<Duration>,
) -> Result<ServeOutcome> {
    if msg.region_size == 0 {
        return Err(CacheError::MalformedMessage(format!(
            "segment {} has zero region size",
            msg.segment_id
        )));
    }
    let segment = Segment::open(segment_prefix, msg.segment_id, msg.region_size)?;
    let end = segment.cache_end(peer_timeout);

    let Some((mut file, size)) = resolver.open(&msg.path) else {
        end.publish_file_size(None)?;
        return Ok(ServeOutcome::NotFound);
    };
    end.publish_file_size(Some(size))?;

    let mut sent = 0u64;
    let mut chunks = 0u64;
    while sent < size {
        end.wait_chunk_request()?;
        let want = (size - sent).min(msg.region_size as u64) as usize;
        sent += end.fill_chunk(&mut file, want, &msg.path)? as u64;
        chunks += 1;
    }
    Ok(ServeOutcome::Served {
        bytes: sent,
        chunks,
    })
}

pub struct CacheDaemon {
    queue: Arc<dyn RequestQueue>,
    resolver: Arc<FileResolver>,
    segment_prefix: String,
    peer_timeout: Option<Duration>,
}

impl CacheDaemon {
    pub fn new(
        queue: Arc<dyn RequestQueue>,
        resolver: Arc<FileResolver>,
        segment_prefix: &str,
    ) -> Self {
        CacheDaemon {
            queue,
            resolver,
            segment_prefix: segment_prefix.to_string(),
            peer_timeout: None,
        }
    }

    pub fn with_peer_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.peer_timeout = timeout;
        self
    }

    /// One worker's loop. Returns Ok when the queue is closed, Err on the
    /// first IPC failure.
    pub fn run_worker(&self, worker: usize) -> Result<()> {
        loop {
            let msg = match self.queue.receive() {
                Ok(msg) => msg,
                Err(CacheError::QueueClosed) => return Ok(()),
                Err(e) => return Err(e),
            };
            log::debug!(
                "worker {} got segment={} region={} path={}",
                worker,
                msg.segment_id,
                msg.region_size,
                msg.path
            );
            match serve_request(&msg, &self.resolver, &self.segment_prefix, self.peer_timeout)? {
                ServeOutcome::Served { bytes, chunks } => log::info!(
                    "served {} ({} bytes, {} chunks) via segment {}",
                    msg.path,
                    bytes,
                    chunks,
                    msg.segment_id
                ),
                ServeOutcome::NotFound => log::info!("not found: {}", msg.path),
            }
        }
    }

    /// Start `threads` workers and block until all of them finish or one of
    /// them fails. The first failure is returned without waiting for the
    /// remaining workers.
    pub fn run(self: Arc<Self>, threads: usize) -> Result<()> {
        let threads = threads.max(1);
        let (done_tx, done_rx) = unbounded();
        for worker in 0..threads {
            let daemon = Arc::clone(&self);
            let done_tx = done_tx.clone();
            thread::Builder::new()
                .name(format!("gfcached-worker-{}", worker))
                .spawn(move || {
                    let _ = done_tx.send(daemon.run_worker(worker));
                })
                .map_err(CacheError::Spawn)?;
        }
        drop(done_tx);
        for result in done_rx.iter() {
            result?;
        }
        Ok(())
    }
}
