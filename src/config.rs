//! Runtime configuration for gfproxy and gfcached.
//!
//! Values come from an optional TOML file; command-line flags are merged on
//! top (see `cli`). Every field has a default so an empty file is valid.

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::control::RetryPolicy;
use crate::protocol::{control, segment, MAX_PATH_LEN};

/// Settings both processes must agree on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpcConfig {
    pub segment_prefix: String,
    pub queue_name: String,
    pub queue_capacity: usize,
    pub max_message_size: usize,
    /// Give up on a silent peer after this many ms; unset waits forever.
    pub peer_timeout_ms: Option<u64>,
    pub open_retry_ms: u64,
    /// Unset retries forever.
    pub open_retries: Option<u32>,
}

impl Default for IpcConfig {
    fn default() -> Self {
        IpcConfig {
            segment_prefix: segment::PREFIX.to_string(),
            queue_name: control::QUEUE_NAME.to_string(),
            queue_capacity: control::MAX_MSG_NUM,
            max_message_size: control::MAX_MSG_SIZE,
            peer_timeout_ms: None,
            open_retry_ms: 100,
            open_retries: None,
        }
    }
}

impl IpcConfig {
    pub fn peer_timeout(&self) -> Option<Duration> {
        self.peer_timeout_ms.map(Duration::from_millis)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            interval: Duration::from_millis(self.open_retry_ms),
            attempts: self.open_retries,
        }
    }

    fn validate(&self) -> Result<()> {
        let names = [
            ("segment_prefix", &self.segment_prefix),
            ("queue_name", &self.queue_name),
        ];
        for (what, name) in names {
            if !name.starts_with('/') || name[1..].contains('/') {
                bail!("{} must be a single '/'-prefixed name, got {:?}", what, name);
            }
        }
        if self.queue_capacity == 0 {
            bail!("queue_capacity must be at least 1");
        }
        // Room for the tag, two numbers and the longest accepted path
        let needed = control::TAG.len() + 2 * 21 + 3 + MAX_PATH_LEN;
        if self.max_message_size < needed {
            bail!("max_message_size must be at least {} bytes", needed);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub bind: String,
    pub port: u16,
    /// Worker threads; 0 means one per CPU.
    pub threads: usize,
    pub max_pending: usize,
    pub segments: usize,
    pub segment_size: usize,
    pub log_file: Option<PathBuf>,
    pub ipc: IpcConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        ProxyConfig {
            bind: "0.0.0.0".to_string(),
            port: 8888,
            threads: 1,
            max_pending: 10,
            segments: 1,
            segment_size: 4096,
            log_file: None,
            ipc: IpcConfig::default(),
        }
    }
}

impl ProxyConfig {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn worker_threads(&self) -> usize {
        worker_threads(self.threads)
    }

    pub fn validate(&self) -> Result<()> {
        if self.segments == 0 {
            bail!("segment count must be at least 1");
        }
        if self.segment_size == 0 {
            bail!("segment size must be at least 1 byte");
        }
        if self.max_pending == 0 {
            bail!("max_pending must be at least 1");
        }
        self.ipc.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Worker threads; 0 means one per CPU.
    pub threads: usize,
    /// Manifest file or directory served by the daemon.
    pub cache_dir: PathBuf,
    pub ipc: IpcConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            threads: 1,
            cache_dir: PathBuf::from("locals.txt"),
            ipc: IpcConfig::default(),
        }
    }
}

impl DaemonConfig {
    pub fn worker_threads(&self) -> usize {
        worker_threads(self.threads)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.cache_dir.exists() {
            bail!("cache dir does not exist: {}", self.cache_dir.display());
        }
        self.ipc.validate()
    }
}

fn worker_threads(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get().max(1)
    } else {
        requested
    }
}

/// Load a config file, or defaults when no path is given.
pub fn load<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(p) = path else {
        return Ok(T::default());
    };
    let data = std::fs::read_to_string(p)
        .with_context(|| format!("read config {}", p.display()))?;
    toml::from_str(&data).with_context(|| format!("parse config {}", p.display()))
}
