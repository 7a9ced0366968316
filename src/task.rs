//! Transmission task state machine and coordinator: a worker that chunks a
//! payload, checks cancellation/pause between chunks, dispatches each chunk
//! through either the reliable channel or raw transport, and emits progress
//! at a bounded rate.

use crate::reliable::ReliableChannel;
use crate::transport::{self, SharedTransport};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Ready,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotReady,
    AlreadyRunning,
    Cancelled,
    TransportNotReady,
}

#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    description: String,
}

impl Error {
    pub fn new(kind: ErrorKind, description: impl Into<String>) -> Error {
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

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy)]
pub struct TaskConfig {
    pub chunk_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub progress_update_interval_ms: u64,
}

impl Default for TaskConfig {
    fn default() -> TaskConfig {
        TaskConfig {
            chunk_size: 4096,
            max_retries: 3,
            retry_delay_ms: 200,
            progress_update_interval_ms: 100,
        }
    }
}

pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;
pub type CompletionCallback = Box<dyn Fn(TaskState) + Send + Sync>;

/// How a task dispatches a chunk: through the reliable ARQ channel, or
/// directly through the raw transport with its own inline retry.
enum Sink {
    Reliable(Arc<ReliableChannel>),
    Raw(SharedTransport),
}

struct Shared {
    state: Mutex<TaskState>,
    pause_cv: Condvar,
    cancelled: AtomicBool,
    bytes_sent: AtomicU64,
    progress_cb: Mutex<Option<ProgressCallback>>,
    completion_cb: Mutex<Option<CompletionCallback>>,
}

/// A single chunked send operation over either a `ReliableChannel` or a raw
/// `Transport`. Created fresh per transfer by `TransmissionCoordinator`.
pub struct TransmissionTask {
    shared: Arc<Shared>,
    sink: Sink,
    config: TaskConfig,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TransmissionTask {
    fn new(sink: Sink, config: TaskConfig) -> TransmissionTask {
        TransmissionTask {
            shared: Arc::new(Shared {
                state: Mutex::new(TaskState::Ready),
                pause_cv: Condvar::new(),
                cancelled: AtomicBool::new(false),
                bytes_sent: AtomicU64::new(0),
                progress_cb: Mutex::new(None),
                completion_cb: Mutex::new(None),
            }),
            sink,
            config,
            worker: Mutex::new(None),
        }
    }

    pub fn reliable(channel: Arc<ReliableChannel>, config: TaskConfig) -> TransmissionTask {
        TransmissionTask::new(Sink::Reliable(channel), config)
    }

    pub fn raw(transport: SharedTransport, config: TaskConfig) -> TransmissionTask {
        TransmissionTask::new(Sink::Raw(transport), config)
    }

    pub fn state(&self) -> TaskState {
        *self.shared.state.lock().unwrap()
    }

    pub fn bytes_sent(&self) -> u64 {
        self.shared.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn set_progress_callback(&self, cb: ProgressCallback) {
        *self.shared.progress_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_completion_callback(&self, cb: CompletionCallback) {
        *self.shared.completion_cb.lock().unwrap() = Some(cb);
    }

    /// Spawns the chunking worker. `data` is moved into the worker thread.
    pub fn start(&self, data: Vec<u8>) -> Result<()> {
        {
            let mut state = self.shared.state.lock().unwrap();
            if *state != TaskState::Ready {
                return Err(Error::new(ErrorKind::AlreadyRunning, "task is not in the Ready state"));
            }
            *state = TaskState::Running;
        }

        let shared = self.shared.clone();
        let config = self.config;
        let total = data.len() as u64;
        let sink = match &self.sink {
            Sink::Reliable(c) => Sink::Reliable(c.clone()),
            Sink::Raw(t) => Sink::Raw(t.clone()),
        };

        let handle = thread::spawn(move || {
            let final_state = run_chunks(&shared, &sink, &data, &config, total);
            *shared.state.lock().unwrap() = final_state;
            if let Some(cb) = shared.completion_cb.lock().unwrap().as_ref() {
                cb(final_state);
            }
        });
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    pub fn pause(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if *state == TaskState::Running {
            *state = TaskState::Paused;
        }
    }

    pub fn resume(&self) {
        let mut state = self.shared.state.lock().unwrap();
        if *state == TaskState::Paused {
            *state = TaskState::Running;
            self.shared.pause_cv.notify_all();
        }
    }

    /// Asynchronous: returns immediately. The worker observes the flag on
    /// its next chunk-boundary check and exits.
    pub fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        let mut state = self.shared.state.lock().unwrap();
        if *state != TaskState::Completed && *state != TaskState::Failed {
            *state = TaskState::Cancelled;
        }
        self.shared.pause_cv.notify_all();
    }

    /// Blocks until the worker thread exits. Not required before dropping
    /// the task — cancel is fire-and-forget by design.
    pub fn join(&self) {
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// For `Sink::Raw`, a successful `write()` call has actually placed the
/// bytes on the wire, so bytes-queued and bytes-delivered coincide. For
/// `Sink::Reliable`, `channel.send()` only enqueues the chunk for the send
/// thread — the only honest measure of delivery is the channel's own
/// ACKed-byte count, so progress is read from there instead of from how much
/// has been handed to `dispatch_chunk`.
fn delivered_bytes(sink: &Sink, queued: u64) -> u64 {
    match sink {
        Sink::Reliable(channel) => channel.acked_bytes(),
        Sink::Raw(_) => queued,
    }
}

fn run_chunks(shared: &Arc<Shared>, sink: &Sink, data: &[u8], config: &TaskConfig, total: u64) -> TaskState {
    let mut queued: u64 = 0;
    let mut last_progress = Instant::now();
    let progress_interval = Duration::from_millis(config.progress_update_interval_ms);

    for chunk in data.chunks(config.chunk_size.max(1)) {
        loop {
            if shared.cancelled.load(Ordering::SeqCst) {
                return TaskState::Cancelled;
            }
            let state = *shared.state.lock().unwrap();
            if state != TaskState::Paused {
                break;
            }
            let guard = shared.state.lock().unwrap();
            let _ = shared
                .pause_cv
                .wait_timeout(guard, Duration::from_millis(50))
                .unwrap();
        }

        match dispatch_chunk(sink, chunk, config) {
            Ok(()) => queued += chunk.len() as u64,
            Err(_) => return TaskState::Failed,
        }

        let sent = delivered_bytes(sink, queued);
        shared.bytes_sent.store(sent, Ordering::Relaxed);

        let is_last = queued >= total;
        if is_last || last_progress.elapsed() >= progress_interval {
            if let Some(cb) = shared.progress_cb.lock().unwrap().as_ref() {
                cb(sent, total);
            }
            last_progress = Instant::now();
        }
    }

    // All chunks are queued; for a reliable sink the peer may not have ACKed
    // the tail yet. Keep polling the real ACKed count for a bounded window so
    // the final progress report and bytes_sent() reflect delivery rather than
    // freezing at whatever had been ACKed the moment the loop exited.
    if let Sink::Reliable(_) = sink {
        let deadline = Instant::now() + Duration::from_millis(config.progress_update_interval_ms * 20 + 2000);
        loop {
            let sent = delivered_bytes(sink, queued);
            shared.bytes_sent.store(sent, Ordering::Relaxed);
            if sent >= total || shared.cancelled.load(Ordering::SeqCst) || Instant::now() >= deadline {
                if let Some(cb) = shared.progress_cb.lock().unwrap().as_ref() {
                    cb(sent, total);
                }
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        if shared.cancelled.load(Ordering::SeqCst) {
            return TaskState::Cancelled;
        }
    }

    TaskState::Completed
}

fn dispatch_chunk(sink: &Sink, chunk: &[u8], config: &TaskConfig) -> Result<()> {
    match sink {
        Sink::Reliable(channel) => {
            if channel.send(chunk) {
                Ok(())
            } else {
                Err(Error::new(ErrorKind::TransportNotReady, "reliable channel is closed"))
            }
        }
        Sink::Raw(transport) => {
            let mut attempt = 0;
            loop {
                match transport.write(chunk) {
                    Ok(_) => return Ok(()),
                    Err(e) if e.kind() == transport::ErrorKind::Busy && attempt < config.max_retries => {
                        attempt += 1;
                        thread::sleep(Duration::from_millis(config.retry_delay_ms));
                    }
                    Err(e) => {
                        return Err(Error::new(ErrorKind::TransportNotReady, e.to_string()));
                    }
                }
            }
        }
    }
}

/// Owns exactly one `TransmissionTask` at a time, picking the reliable or
/// raw subtype based on which of `{reliable_channel.is_connected,
/// transport.is_open}` holds.
pub struct TransmissionCoordinator {
    transport: SharedTransport,
    reliable_channel: Option<Arc<ReliableChannel>>,
    current: Mutex<Option<Arc<TransmissionTask>>>,
    config: TaskConfig,
}

impl TransmissionCoordinator {
    pub fn new(
        transport: SharedTransport,
        reliable_channel: Option<Arc<ReliableChannel>>,
        config: TaskConfig,
    ) -> TransmissionCoordinator {
        TransmissionCoordinator {
            transport,
            reliable_channel,
            current: Mutex::new(None),
            config,
        }
    }

    pub fn start_transfer(&self, data: Vec<u8>) -> Result<Arc<TransmissionTask>> {
        let mut current = self.current.lock().unwrap();
        if let Some(task) = current.as_ref() {
            if task.state() == TaskState::Running || task.state() == TaskState::Paused {
                return Err(Error::new(ErrorKind::AlreadyRunning, "a transfer is already in progress"));
            }
        }

        let task = Arc::new(match &self.reliable_channel {
            Some(channel) if channel.is_connected() => TransmissionTask::reliable(channel.clone(), self.config),
            _ if self.transport.is_open() => TransmissionTask::raw(self.transport.clone(), self.config),
            _ => return Err(Error::new(ErrorKind::NotReady, "neither the reliable channel nor the transport is open")),
        });
        task.start(data)?;
        *current = Some(task.clone());
        Ok(task)
    }

    pub fn current_task(&self) -> Option<Arc<TransmissionTask>> {
        self.current.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reliable::{ReliableChannel, ReliableConfig};
    use crate::transport::loopback::LoopbackTransport;
    use crate::transport::TransportConfig;

    #[test]
    fn raw_task_completes_over_loopback() {
        let transport: SharedTransport = Arc::new(LoopbackTransport::new());
        transport.open(&TransportConfig::default()).unwrap();

        let task = TransmissionTask::raw(transport, TaskConfig { chunk_size: 4, ..TaskConfig::default() });
        task.start(vec![1, 2, 3, 4, 5, 6, 7]).unwrap();
        task.join();
        assert_eq!(task.state(), TaskState::Completed);
        assert_eq!(task.bytes_sent(), 7);
    }

    #[test]
    fn cancel_stops_the_worker() {
        let transport: SharedTransport = Arc::new(LoopbackTransport::new());
        transport.open(&TransportConfig::default()).unwrap();

        let data = vec![0u8; 1024 * 1024];
        let task = TransmissionTask::raw(transport, TaskConfig { chunk_size: 16, ..TaskConfig::default() });
        task.start(data).unwrap();
        thread::sleep(Duration::from_millis(5));
        task.cancel();
        task.join();
        assert_eq!(task.state(), TaskState::Cancelled);
    }

    #[test]
    fn reliable_task_completes_with_fully_acked_bytes() {
        let transport: SharedTransport = Arc::new(LoopbackTransport::new());
        transport.open(&TransportConfig::default()).unwrap();
        let channel = Arc::new(ReliableChannel::new(
            transport,
            ReliableConfig { window_size: 4, max_payload_size: 64, ..ReliableConfig::default() },
        ));
        channel.connect().unwrap();
        channel.ensure_session_started().unwrap();

        let task = TransmissionTask::reliable(channel.clone(), TaskConfig { chunk_size: 32, ..TaskConfig::default() });
        let data = vec![7u8; 500];
        task.start(data.clone()).unwrap();
        task.join();

        assert_eq!(task.state(), TaskState::Completed);
        // Every reported byte must have actually been ACKed by the channel,
        // not merely handed to it for queuing.
        assert_eq!(task.bytes_sent(), data.len() as u64);
        assert_eq!(channel.acked_bytes(), data.len() as u64);
    }
}
