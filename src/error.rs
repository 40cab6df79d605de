//! Error types for the shared-memory cache relay.
//!
//! The IPC layer has no degraded mode: a failed `shm_open`, semaphore call or
//! queue operation means the environment is broken. Those errors are still
//! returned as values so the binaries decide how to die and tests can assert
//! on them. [`CacheError::is_fatal`] separates them from the few failures
//! that only concern a single client connection.

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    /// shm_open / ftruncate / mmap / shm_unlink failures
    #[error("shared memory {op} failed for {name}: {source}")]
    SharedMemory {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    /// sem_init / sem_wait / sem_post failures
    #[error("semaphore {op} failed on segment {segment}: {source}")]
    Semaphore {
        op: &'static str,
        segment: usize,
        #[source]
        source: io::Error,
    },

    /// mq_open / mq_send / mq_receive failures
    #[error("control queue {op} failed for {name}: {source}")]
    Queue {
        op: &'static str,
        name: String,
        #[source]
        source: io::Error,
    },

    /// The in-process queue was closed by its owner.
    #[error("control queue closed")]
    QueueClosed,

    #[error("control message too long: {len} bytes (max {max})")]
    MessageTooLong { len: usize, max: usize },

    #[error("malformed control message: {0}")]
    MalformedMessage(String),

    /// Path cannot travel as the final token of a control message.
    #[error("path {0:?} cannot be carried in a control message")]
    InvalidPath(String),

    #[error("segment {id} out of range (pool has {count} segments)")]
    SegmentOutOfRange { id: usize, count: usize },

    #[error("segment {0} released but not claimed")]
    NotClaimed(usize),

    #[error("segment {id} reported chunk length {len} (capacity {capacity})")]
    CorruptChunk { id: usize, len: i64, capacity: usize },

    #[error("timed out waiting for peer on segment {0}")]
    PeerTimeout(usize),

    #[error("short read from {path}: expected {expected} bytes: {source}")]
    ShortRead {
        path: String,
        expected: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// Writing to the network client failed.
    #[error("client write failed: {0}")]
    Transport(#[source] io::Error),

    #[error("short write to client: expected {expected} bytes, wrote {written}")]
    ShortWrite { expected: usize, written: usize },
}

impl CacheError {
    /// Fatal errors end the process; the rest end one connection.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CacheError::Transport(_) | CacheError::ShortWrite { .. } | CacheError::InvalidPath(_)
        )
    }

    pub(crate) fn shm(op: &'static str, name: &str) -> Self {
        CacheError::SharedMemory {
            op,
            name: name.to_string(),
            source: io::Error::last_os_error(),
        }
    }

    pub(crate) fn queue(op: &'static str, name: &str, source: io::Error) -> Self {
        CacheError::Queue {
            op,
            name: name.to_string(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
