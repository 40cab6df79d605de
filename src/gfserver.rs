//! Minimal multi-threaded GETFILE server.
//!
//! The accept loop pushes connections into a bounded channel drained by a
//! fixed set of worker threads. Each worker reads one request header, hands
//! the path to the registered [`RequestHandler`] and closes the connection.

use anyhow::{Context, Result};
use crossbeam_channel::bounded;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::error::{CacheError, Result as CacheResult};
use crate::protocol::{
    parse_request, response_header, timeouts, GfStatus, HEADER_END, MAX_REQUEST_HEADER,
};
use crate::transfer::{CacheRelay, Responder};

/// Produces the response for one request path.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, ctx: &mut dyn Responder, path: &str) -> CacheResult<()>;
}

impl RequestHandler for CacheRelay {
    fn handle(&self, ctx: &mut dyn Responder, path: &str) -> CacheResult<()> {
        self.relay(ctx, path).map(|_| ())
    }
}

type FatalHook = Arc<dyn Fn(&CacheError) + Send + Sync>;

/// Per-connection context handed to handlers.
pub struct GfContext {
    stream: TcpStream,
    header_sent: bool,
}

impl GfContext {
    pub fn new(stream: TcpStream) -> Self {
        GfContext {
            stream,
            header_sent: false,
        }
    }

    pub fn header_sent(&self) -> bool {
        self.header_sent
    }
}

impl Responder for GfContext {
    fn send_status(&mut self, status: GfStatus, len: u64) -> io::Result<()> {
        self.stream
            .write_all(response_header(status, len).as_bytes())?;
        self.header_sent = true;
        Ok(())
    }

    fn send_bytes(&mut self, data: &[u8]) -> io::Result<usize> {
        self.stream.write_all(data)?;
        Ok(data.len())
    }

    fn abort(&mut self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

pub struct GfServer {
    listener: TcpListener,
    workers: usize,
    max_pending: usize,
    handler: Arc<dyn RequestHandler>,
    on_fatal: FatalHook,
}

impl GfServer {
    pub fn bind(addr: &str, handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let listener = TcpListener::bind(addr).with_context(|| format!("bind {}", addr))?;
        Ok(GfServer {
            listener,
            workers: 1,
            max_pending: 10,
            handler,
            on_fatal: Arc::new(|_: &CacheError| {}),
        })
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Accepted connections allowed to wait for a free worker.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending.max(1);
        self
    }

    /// Called with every fatal handler error, after it is logged.
    pub fn on_fatal<F>(mut self, hook: F) -> Self
    where
        F: Fn(&CacheError) + Send + Sync + 'static,
    {
        self.on_fatal = Arc::new(hook);
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve forever.
    pub fn serve(self) -> Result<()> {
        let (tx, rx) = bounded::<TcpStream>(self.max_pending);
        for worker in 0..self.workers {
            let rx = rx.clone();
            let handler = Arc::clone(&self.handler);
            let on_fatal = Arc::clone(&self.on_fatal);
            thread::Builder::new()
                .name(format!("gfproxy-worker-{}", worker))
                .spawn(move || {
                    for stream in rx.iter() {
                        handle_conn(stream, handler.as_ref(), on_fatal.as_ref());
                    }
                })
                .context("spawn server worker")?;
        }

        log::info!(
            "GETFILE server listening on {} ({} workers)",
            self.local_addr()?,
            self.workers
        );
        for conn in self.listener.incoming() {
            match conn {
                Ok(stream) => {
                    if tx.send(stream).is_err() {
                        break;
                    }
                }
                Err(e) => log::warn!("accept error: {}", e),
            }
        }
        Ok(())
    }
}

fn handle_conn(
    stream: TcpStream,
    handler: &dyn RequestHandler,
    on_fatal: &(dyn Fn(&CacheError) + Send + Sync),
) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let _ = stream.set_nodelay(true);
    let _ = stream.set_read_timeout(Some(Duration::from_millis(timeouts::REQUEST_READ_MS)));
    let mut ctx = GfContext::new(stream);

    let header = match read_request_header(&mut ctx.stream) {
        Ok(h) => h,
        Err(e) => {
            log::debug!("{}: reading request failed: {}", peer, e);
            return;
        }
    };
    let Some(path) = header.as_deref().and_then(parse_request) else {
        log::debug!("{}: invalid request", peer);
        let _ = ctx.send_status(GfStatus::Invalid, 0);
        return;
    };

    log::debug!("{}: GET {}", peer, path);
    if let Err(e) = handler.handle(&mut ctx, path) {
        if e.is_fatal() {
            log::error!("{}: {} failed: {}", peer, path, e);
            if !ctx.header_sent() {
                let _ = ctx.send_status(GfStatus::Error, 0);
            }
            ctx.abort();
            on_fatal(&e);
        } else {
            log::warn!("{}: {} aborted: {}", peer, path, e);
            ctx.abort();
        }
    }
}

/// Read until the header terminator. Ok(None) when the client closed or
/// sent too much without one.
fn read_request_header(stream: &mut TcpStream) -> io::Result<Option<String>> {
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        if let Some(end) = find_terminator(&buf) {
            buf.truncate(end + HEADER_END.len());
            return Ok(String::from_utf8(buf).ok());
        }
        if buf.len() >= MAX_REQUEST_HEADER {
            return Ok(None);
        }
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            return Ok(None);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

pub(crate) fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len()).position(|w| w == HEADER_END)
}
