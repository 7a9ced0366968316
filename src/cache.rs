//! Temp-file-backed buffer for received bytes: an append-only write stream
//! to a scratch file, a separate read path that never contends with
//! appends for long, and a total-bytes counter used to verify the file on
//! disk actually holds what was written to it. Uses the `tempfile` crate
//! so the scratch file is removed automatically when the cache is dropped.

use crate::log::{Level, Logger, StdoutLogger};
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotInitialized,
    IoFailure,
    IntegrityMismatch,
}

#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    description: String,
}

impl Error {
    fn new(kind: ErrorKind, description: impl Into<String>) -> Error {
        Error {
            kind,
            description: description.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.description)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Error {
        Error::new(ErrorKind::IoFailure, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

struct FileState {
    temp_file: Option<NamedTempFile>,
}

/// Thread-safe append/read buffer backed by a named temp file, used by the
/// receive path to hold inbound bytes without keeping them all in memory.
pub struct ReceiveCache {
    state: Mutex<FileState>,
    total_received_bytes: AtomicU64,
    initialized: AtomicBool,
    verbose_logging: AtomicBool,
    logger: Arc<dyn Logger>,
}

impl ReceiveCache {
    pub fn new() -> ReceiveCache {
        Self::with_logger(Arc::new(StdoutLogger::default()))
    }

    pub fn with_logger(logger: Arc<dyn Logger>) -> ReceiveCache {
        ReceiveCache {
            state: Mutex::new(FileState { temp_file: None }),
            total_received_bytes: AtomicU64::new(0),
            initialized: AtomicBool::new(false),
            verbose_logging: AtomicBool::new(false),
            logger,
        }
    }

    pub fn set_verbose_logging(&self, enabled: bool) {
        self.verbose_logging.store(enabled, Ordering::Relaxed);
    }

    fn log_detail(&self, message: &str) {
        if self.verbose_logging.load(Ordering::Relaxed) {
            self.logger.log(Level::Debug, message);
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Creates the scratch file, truncating any prior contents and
    /// resetting counters. Safe to call again after `shutdown`.
    pub fn initialize(&self) -> Result<()> {
        let temp_file = NamedTempFile::new().map_err(Error::from)?;
        let mut state = self.state.lock().unwrap();
        state.temp_file = Some(temp_file);
        drop(state);
        self.total_received_bytes.store(0, Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);
        self.logger.info("receive cache initialized");
        Ok(())
    }

    /// Closes and deletes the scratch file and resets all state.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.temp_file = None;
        drop(state);
        self.total_received_bytes.store(0, Ordering::SeqCst);
        self.initialized.store(false, Ordering::SeqCst);
        self.logger.info("receive cache shut down");
    }

    /// Appends `data`, flushing to disk before returning. Attempts recovery
    /// once if the backing file was unexpectedly closed.
    pub fn append_data(&self, data: &[u8]) -> Result<()> {
        if !self.is_initialized() && !self.check_and_recover()? {
            return Err(Error::new(ErrorKind::NotInitialized, "receive cache is not initialized"));
        }

        let mut state = self.state.lock().unwrap();
        if state.temp_file.is_none() {
            drop(state);
            self.check_and_recover()?;
            state = self.state.lock().unwrap();
        }

        Self::write_unlocked(&mut state, data)?;
        drop(state);

        self.total_received_bytes.fetch_add(data.len() as u64, Ordering::SeqCst);
        self.log_detail(&format!("appended {} bytes", data.len()));
        Ok(())
    }

    fn write_unlocked(state: &mut FileState, data: &[u8]) -> Result<()> {
        let file = state
            .temp_file
            .as_mut()
            .ok_or_else(|| Error::new(ErrorKind::NotInitialized, "receive cache file is not open"))?;
        file.as_file_mut().write_all(data).map_err(Error::from)?;
        file.as_file_mut().flush().map_err(Error::from)?;
        Ok(())
    }

    /// Reads `length` bytes starting at `offset`; `length == 0` reads to the
    /// end of the file.
    pub fn read_data(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let file = state
            .temp_file
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotInitialized, "receive cache file is not open"))?;

        let before = self.total_received_bytes.load(Ordering::SeqCst);
        let mut reader = file.reopen().map_err(Error::from)?;
        reader.seek(SeekFrom::Start(offset)).map_err(Error::from)?;

        let mut out = Vec::new();
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if length > 0 && out.len() >= length {
                out.truncate(length);
                break;
            }
            let want = if length > 0 {
                chunk.len().min(length - out.len())
            } else {
                chunk.len()
            };
            let n = reader.read(&mut chunk[..want]).map_err(Error::from)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }

        let after = self.total_received_bytes.load(Ordering::SeqCst);
        if after != before {
            self.log_detail("read_data observed concurrent writes; result reflects the snapshot at read start");
        }
        Ok(out)
    }

    pub fn read_all_data(&self) -> Result<Vec<u8>> {
        self.read_data(0, 0)
    }

    /// Streams the cache contents to `target_path` in 64KiB chunks.
    pub fn copy_to_file(&self, target_path: &str) -> Result<u64> {
        let state = self.state.lock().unwrap();
        let file = state
            .temp_file
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotInitialized, "receive cache file is not open"))?;
        let mut reader = file.reopen().map_err(Error::from)?;
        reader.seek(SeekFrom::Start(0)).map_err(Error::from)?;

        let mut target = File::create(target_path).map_err(Error::from)?;
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut written = 0u64;
        loop {
            let n = reader.read(&mut chunk).map_err(Error::from)?;
            if n == 0 {
                break;
            }
            target.write_all(&chunk[..n]).map_err(Error::from)?;
            written += n as u64;
        }
        self.logger.info(&format!("copied {} bytes to {}", written, target_path));
        Ok(written)
    }

    pub fn total_received_bytes(&self) -> u64 {
        self.total_received_bytes.load(Ordering::SeqCst)
    }

    pub fn file_size(&self) -> u64 {
        let state = self.state.lock().unwrap();
        match state.temp_file.as_ref() {
            Some(f) => f.as_file().metadata().map(|m| m.len()).unwrap_or(0),
            None => 0,
        }
    }

    /// Compares the on-disk file size against the tracked byte counter.
    pub fn verify_file_integrity(&self) -> bool {
        let on_disk = self.file_size();
        let tracked = self.total_received_bytes();
        if on_disk != tracked {
            self.logger.warn(&format!(
                "integrity mismatch: on-disk {} bytes vs tracked {} bytes",
                on_disk, tracked
            ));
            return false;
        }
        true
    }

    /// Re-opens the scratch file if it was unexpectedly dropped, or
    /// initializes one from scratch if none exists yet.
    pub fn check_and_recover(&self) -> Result<bool> {
        let needs_init = {
            let state = self.state.lock().unwrap();
            state.temp_file.is_none()
        };
        if needs_init {
            self.initialize()?;
        }
        Ok(self.verify_file_integrity())
    }
}

impl Default for ReceiveCache {
    fn default() -> ReceiveCache {
        ReceiveCache::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_all() {
        let cache = ReceiveCache::new();
        cache.initialize().unwrap();
        cache.append_data(b"hello ").unwrap();
        cache.append_data(b"world").unwrap();
        assert_eq!(cache.read_all_data().unwrap(), b"hello world");
        assert_eq!(cache.total_received_bytes(), 11);
    }

    #[test]
    fn partial_range_read() {
        let cache = ReceiveCache::new();
        cache.initialize().unwrap();
        cache.append_data(b"0123456789").unwrap();
        assert_eq!(cache.read_data(3, 4).unwrap(), b"3456");
    }

    #[test]
    fn integrity_check_passes_after_append() {
        let cache = ReceiveCache::new();
        cache.initialize().unwrap();
        cache.append_data(b"abc").unwrap();
        assert!(cache.verify_file_integrity());
    }

    #[test]
    fn shutdown_resets_state() {
        let cache = ReceiveCache::new();
        cache.initialize().unwrap();
        cache.append_data(b"abc").unwrap();
        cache.shutdown();
        assert!(!cache.is_initialized());
        assert_eq!(cache.total_received_bytes(), 0);
    }

    #[test]
    fn copy_to_file_writes_expected_bytes() {
        let cache = ReceiveCache::new();
        cache.initialize().unwrap();
        cache.append_data(b"payload").unwrap();
        let dest = NamedTempFile::new().unwrap();
        let path = dest.path().to_str().unwrap().to_string();
        let written = cache.copy_to_file(&path).unwrap();
        assert_eq!(written, 7);
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    }
}
