use anyhow::{Context, Result};
use clap::Parser;
use std::process;
use std::sync::Arc;

use gfcache::cli::ProxyOpts;
use gfcache::control::{PosixQueue, RequestQueue};
use gfcache::gfserver::GfServer;
use gfcache::logger::{NoopLogger, TextLogger, TransferLogger};
use gfcache::pool::SegmentPool;
use gfcache::transfer::CacheRelay;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cfg = ProxyOpts::parse().resolve()?;

    let pool = Arc::new(
        SegmentPool::initialize(&cfg.ipc.segment_prefix, cfg.segments, cfg.segment_size)
            .context("create segment pool")?,
    );
    let queue: Arc<dyn RequestQueue> = match PosixQueue::create(
        &cfg.ipc.queue_name,
        cfg.ipc.queue_capacity,
        cfg.ipc.max_message_size,
    ) {
        Ok(q) => Arc::new(q),
        Err(e) => {
            pool.teardown();
            return Err(e).context("create control queue");
        }
    };

    // Removes every IPC object this process created
    let cleanup = {
        let pool = Arc::clone(&pool);
        let queue_name = cfg.ipc.queue_name.clone();
        Arc::new(move || {
            pool.teardown();
            if let Err(e) = PosixQueue::unlink(&queue_name) {
                log::warn!("{}", e);
            }
        })
    };

    {
        let cleanup = Arc::clone(&cleanup);
        ctrlc::set_handler(move || {
            log::info!("signal received, shutting down");
            cleanup();
            process::exit(0);
        })
        .context("install signal handler")?;
    }

    let logger: Arc<dyn TransferLogger> = match &cfg.log_file {
        Some(p) => Arc::new(
            TextLogger::new(p).with_context(|| format!("open log file {}", p.display()))?,
        ),
        None => Arc::new(NoopLogger),
    };
    let relay = CacheRelay::new(Arc::clone(&pool), queue)
        .with_logger(logger)
        .with_peer_timeout(cfg.ipc.peer_timeout());

    log::info!(
        "{} segments of {} bytes under {}*, queue {}",
        cfg.segments,
        cfg.segment_size,
        cfg.ipc.segment_prefix,
        cfg.ipc.queue_name
    );

    let server = GfServer::bind(&cfg.listen_addr(), Arc::new(relay))?
        .with_workers(cfg.worker_threads())
        .with_max_pending(cfg.max_pending)
        .on_fatal({
            let cleanup = Arc::clone(&cleanup);
            move |e| {
                log::error!("fatal cache error, exiting: {}", e);
                cleanup();
                process::exit(1);
            }
        });
    let result = server.serve();
    cleanup();
    result
}
