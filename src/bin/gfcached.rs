use anyhow::{Context, Result};
use clap::Parser;
use std::process;
use std::sync::Arc;

use gfcache::cli::DaemonOpts;
use gfcache::control::PosixQueue;
use gfcache::daemon::CacheDaemon;
use gfcache::resolver::FileResolver;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cfg = DaemonOpts::parse().resolve()?;

    let resolver = FileResolver::from_cache_dir(&cfg.cache_dir)
        .with_context(|| format!("load cache dir {}", cfg.cache_dir.display()))?;
    match resolver.manifest_entries() {
        Some(n) => log::info!("serving {} entries from {}", n, cfg.cache_dir.display()),
        None => log::info!("serving directory {}", cfg.cache_dir.display()),
    }

    let queue = Arc::new(
        PosixQueue::open(&cfg.ipc.queue_name, cfg.ipc.retry_policy())
            .context("open control queue")?,
    );

    {
        let queue_name = cfg.ipc.queue_name.clone();
        ctrlc::set_handler(move || {
            log::info!("signal received, shutting down");
            let _ = PosixQueue::unlink(&queue_name);
            process::exit(0);
        })
        .context("install signal handler")?;
    }

    let threads = cfg.worker_threads();
    log::info!("starting {} workers", threads);
    let daemon = Arc::new(
        CacheDaemon::new(queue, Arc::new(resolver), &cfg.ipc.segment_prefix)
            .with_peer_timeout(cfg.ipc.peer_timeout()),
    );
    daemon.run(threads).context("cache daemon failed")?;
    Ok(())
}
