use anyhow::Result;
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

/// Per-request transfer events recorded by the proxy.
pub trait TransferLogger: Send + Sync {
    fn request(&self, _path: &str, _segment: usize) {}
    fn served(&self, _path: &str, _bytes: u64, _chunks: u64, _seconds: f64) {}
    fn not_found(&self, _path: &str) {}
    fn error(&self, _context: &str, _path: &str, _msg: &str) {}
}

pub struct NoopLogger;
impl TransferLogger for NoopLogger {}

pub struct TextLogger {
    file: Mutex<File>,
}

impl TextLogger {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let f = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(f),
        })
    }

    fn line(&self, s: &str) {
        if let Ok(mut f) = self.file.lock() {
            let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
        }
    }
}

impl TransferLogger for TextLogger {
    fn request(&self, path: &str, segment: usize) {
        self.line(&format!("REQUEST path={} segment={}", path, segment));
    }
    fn served(&self, path: &str, bytes: u64, chunks: u64, seconds: f64) {
        self.line(&format!(
            "SERVED path={path} bytes={bytes} chunks={chunks} seconds={seconds:.3}"
        ));
    }
    fn not_found(&self, path: &str) {
        self.line(&format!("NOT_FOUND path={}", path));
    }
    fn error(&self, context: &str, path: &str, msg: &str) {
        self.line(&format!("ERROR ctx={} path={} msg={}", context, path, msg));
    }
}
