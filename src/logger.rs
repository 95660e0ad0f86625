use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Session diagnostics. stdout/stdin carry the wire protocol, so anything
/// observable goes through here instead.
pub trait Logger: Send + Sync {
    fn start(&self, _role: &str) {}
    fn sent(&self, _path: &Path, _bytes: u64) {}
    fn received(&self, _path: &Path, _bytes: u64) {}
    fn error(&self, _msg: &str) {}
    fn done(&self, _files: u64, _bytes: u64, _seconds: f64) {}
}

pub struct NoopLogger;
impl Logger for NoopLogger {}

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
        let mut f = self.file.lock();
        let _ = writeln!(f, "[{}] {}", Utc::now().to_rfc3339(), s);
    }
}

impl Logger for TextLogger {
    fn start(&self, role: &str) {
        self.line(&format!("START role={role}"));
    }
    fn sent(&self, path: &Path, bytes: u64) {
        self.line(&format!("SEND path={} bytes={}", path.display(), bytes));
    }
    fn received(&self, path: &Path, bytes: u64) {
        self.line(&format!("RECV path={} bytes={}", path.display(), bytes));
    }
    fn error(&self, msg: &str) {
        self.line(&format!("ERROR msg={msg}"));
    }
    fn done(&self, files: u64, bytes: u64, seconds: f64) {
        self.line(&format!("DONE files={files} bytes={bytes} seconds={seconds:.3}"));
    }
}
