//! Command-line options for gfproxy and gfcached.
//!
//! Flags are all optional so a config file can supply the value; anything
//! given on the command line wins.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use crate::config::{self, DaemonConfig, ProxyConfig};

/// GETFILE proxy backed by the shared-memory cache
#[derive(Clone, Debug, Default, Parser)]
#[command(name = "gfproxy", version)]
pub struct ProxyOpts {
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Listen port [default: 8888]
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Listen address [default: 0.0.0.0]
    #[arg(long)]
    pub bind: Option<String>,

    /// Worker threads, 0 for one per CPU [default: 1]
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Number of shared memory segments [default: 1]
    #[arg(short = 'n', long = "segment-count")]
    pub segments: Option<usize>,

    /// Segment buffer size in bytes [default: 4096]
    #[arg(short = 'z', long = "segment-size")]
    pub segment_size: Option<usize>,

    /// Connections allowed to queue for a worker [default: 10]
    #[arg(long)]
    pub max_pending: Option<usize>,

    /// Append per-request transfer lines to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Give up on an unresponsive cache daemon after this many ms
    #[arg(long)]
    pub peer_timeout_ms: Option<u64>,
}

impl ProxyOpts {
    /// Config file values with command-line overrides applied, validated.
    pub fn resolve(&self) -> Result<ProxyConfig> {
        let mut cfg: ProxyConfig = config::load(self.config.as_deref())?;
        if let Some(v) = self.port {
            cfg.port = v;
        }
        if let Some(v) = &self.bind {
            cfg.bind = v.clone();
        }
        if let Some(v) = self.threads {
            cfg.threads = v;
        }
        if let Some(v) = self.segments {
            cfg.segments = v;
        }
        if let Some(v) = self.segment_size {
            cfg.segment_size = v;
        }
        if let Some(v) = self.max_pending {
            cfg.max_pending = v;
        }
        if let Some(v) = &self.log_file {
            cfg.log_file = Some(v.clone());
        }
        if let Some(v) = self.peer_timeout_ms {
            cfg.ipc.peer_timeout_ms = Some(v);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Cache daemon serving files to gfproxy over shared memory
#[derive(Clone, Debug, Default, Parser)]
#[command(name = "gfcached", version)]
pub struct DaemonOpts {
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Worker threads, 0 for one per CPU [default: 1]
    #[arg(short = 't', long)]
    pub threads: Option<usize>,

    /// Manifest file or directory to serve [default: locals.txt]
    #[arg(short = 'c', long = "cachedir")]
    pub cache_dir: Option<PathBuf>,

    /// Give up on an unresponsive proxy after this many ms
    #[arg(long)]
    pub peer_timeout_ms: Option<u64>,
}

impl DaemonOpts {
    pub fn resolve(&self) -> Result<DaemonConfig> {
        let mut cfg: DaemonConfig = config::load(self.config.as_deref())?;
        if let Some(v) = self.threads {
            cfg.threads = v;
        }
        if let Some(v) = &self.cache_dir {
            cfg.cache_dir = v.clone();
        }
        if let Some(v) = self.peer_timeout_ms {
            cfg.ipc.peer_timeout_ms = Some(v);
        }
        cfg.validate()?;
        Ok(cfg)
    }
}
