//! gfcache library
//!
//! A GETFILE proxy that relays file bodies from a separate cache daemon
//! through a pool of POSIX shared memory segments, with a message queue
//! carrying the request assignments.

#[cfg(not(target_os = "linux"))]
compile_error!("gfcache needs POSIX shared memory, unnamed semaphores and message queues (Linux)");

pub mod cli;
pub mod config;
pub mod control;
pub mod daemon;
pub mod error;
pub mod gfclient;
pub mod gfserver;
pub mod logger;
pub mod pool;
pub mod protocol;
pub mod resolver;
pub mod segment;
pub mod transfer;

pub use error::{CacheError, Result};
