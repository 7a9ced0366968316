//! Logging: a `Level` enum ordered so `<=` compares severity, a
//! `FileLogger` that timestamps lines with `chrono` and appends them to a
//! file, and free functions that write to stdout. The file logger is a
//! `Logger` trait object so it can be constructor-injected into
//! `ReliableChannel`, `Transport` impls, and `ReceiveCache` instead of
//! going through a process-global — the free functions remain as the
//! convenience default those constructors fall back to when no logger is
//! supplied.

use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialOrd, PartialEq, Eq, Ord)]
pub enum Level {
    Off,
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
}

impl ToString for Level {
    fn to_string(&self) -> String {
        match self {
            Level::Off => "".to_string(),
            Level::Debug => "DEBUG".to_string(),
            Level::Info => "INFO".to_string(),
            Level::Warning => "WARN".to_string(),
            Level::Error => "ERROR".to_string(),
            Level::Fatal => "FATAL".to_string(),
        }
    }
}

/// Constructor-injected logging sink. Implementations must be safe to call
/// from any worker thread concurrently.
pub trait Logger: Send + Sync {
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }
    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }
    fn warn(&self, message: &str) {
        self.log(Level::Warning, message);
    }
    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }
    fn fatal(&self, message: &str) {
        self.log(Level::Fatal, message);
    }
}

/// Writes timestamped lines to stdout. The default logger everything in this
/// crate falls back to when callers don't inject one of their own.
pub struct StdoutLogger {
    level: Level,
}

impl StdoutLogger {
    pub fn new(level: Level) -> StdoutLogger {
        StdoutLogger { level }
    }
}

impl Default for StdoutLogger {
    fn default() -> StdoutLogger {
        StdoutLogger::new(Level::Debug)
    }
}

impl Logger for StdoutLogger {
    fn log(&self, level: Level, message: &str) {
        if level == Level::Off || level > self.level {
            return;
        }
        let dt = Local::now().to_rfc3339();
        println!("[{}] [{}] {}", dt, level.to_string(), message);
    }
}

/// Appends timestamped lines to a file.
pub struct FileLogger {
    file: Mutex<File>,
    level: Level,
}

impl FileLogger {
    pub fn new(path: &str, level: Level) -> std::io::Result<FileLogger> {
        Ok(FileLogger {
            file: Mutex::new(OpenOptions::new().append(true).create(true).open(path)?),
            level,
        })
    }
}

impl Logger for FileLogger {
    fn log(&self, level: Level, message: &str) {
        if level == Level::Off || level > self.level {
            return;
        }
        let dt = Local::now().to_rfc3339();
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "[{}] [{}] {}", dt, level.to_string(), message);
        }
    }
}

const LOGLEVEL: Level = Level::Debug;

pub fn log(level: Level, s: &str) {
    if level == Level::Off || level > LOGLEVEL {
        return;
    }
    let dt = Local::now().to_rfc3339();
    println!("[{}] [{}] {}", dt, level.to_string(), s);
}

pub fn debug(s: &str) {
    log(Level::Debug, s);
}

pub fn info(s: &str) {
    log(Level::Info, s);
}

pub fn warn(s: &str) {
    log(Level::Warning, s);
}

pub fn error(s: &str) {
    log(Level::Error, s);
}

pub fn fatal(s: &str) {
    log(Level::Fatal, s);
}
