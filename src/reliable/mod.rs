//! Sliding-window selective-repeat ARQ channel over a `Transport`: four
//! long-lived worker threads (process, send, receive, heartbeat), a
//! handshake that snaps the receive window to the sender's starting
//! sequence, RTT-adaptive timeouts, and selective retransmission.

pub mod config;
pub mod window;

pub use config::{ReliableConfig, ReliableStats};
use window::{Packet, ReceiveWindow, SendWindow};

use crate::frame::{Frame, FrameCodec, FrameType, StartMetadata};
use crate::log::{Level, Logger, StdoutLogger};
use crate::transport::{self, SharedTransport};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    HandshakeTimeout,
    WindowFull,
    MaxRetriesExceeded,
    InvalidFrame,
    IntegrityMismatch,
    SessionClosed,
    TransportError,
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

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Error {
        Error::new(ErrorKind::TransportError, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Initialized,
    Connected,
    ShutdownRequested,
    Retransmitting,
}

pub type ErrorCallback = Box<dyn Fn(Error) + Send + Sync>;
pub type CompletionCallback = Box<dyn Fn(bool, &str) + Send + Sync>;
pub type ProgressCallback = Box<dyn Fn(u64, Option<u64>) + Send + Sync>;

struct RttState {
    rtt_ms: f64,
    timeout_ms: u64,
}

struct Handshake {
    completed: bool,
    sequence: Option<u16>,
    window_synced: bool,
}

/// END-underflow grace: when a short transfer's END arrives before the
/// expected byte count has been received, the receiver waits this long for
/// straggling DATA before declaring failure.
const END_SHORT_GRACE: Duration = Duration::from_secs(30);
const END_TOLERANCE_BYTES: u64 = 1024;

struct Shared {
    transport: SharedTransport,
    logger: Arc<dyn Logger>,
    config: ReliableConfig,
    verbose_logging: AtomicBool,

    state: Mutex<ChannelState>,
    send_window: Mutex<SendWindow>,
    send_cv: Condvar,
    receive_window: Mutex<ReceiveWindow>,
    receive_cv: Condvar,

    session_id: Mutex<Option<u16>>,
    handshake: Mutex<Handshake>,
    handshake_cv: Condvar,

    rtt: Mutex<RttState>,
    stats: Mutex<ReliableStats>,

    heartbeat_sequence: Mutex<u16>,
    last_frame_seen: Mutex<Instant>,

    send_queue: (Sender<Vec<u8>>, Receiver<Vec<u8>>),
    deliver_queue: (Sender<Vec<u8>>, Receiver<Vec<u8>>),

    shutdown: AtomicBool,
    expected_file_size: Mutex<Option<u64>>,
    received_bytes: AtomicU64,
    acked_bytes: AtomicU64,
    completion_done: AtomicBool,
    end_grace_deadline: Mutex<Option<Instant>>,
    stream_end_pending: AtomicBool,

    error_cb: Mutex<Option<ErrorCallback>>,
    completion_cb: Mutex<Option<CompletionCallback>>,
    progress_cb: Mutex<Option<ProgressCallback>>,
}

impl Shared {
    fn log(&self, level: Level, msg: &str) {
        self.logger.log(level, msg);
    }

    fn vlog(&self, msg: &str) {
        if self.verbose_logging.load(Ordering::Relaxed) {
            self.logger.debug(msg);
        }
    }

    fn report_error(&self, err: Error) {
        self.stats.lock().unwrap().errors += 1;
        self.logger.error(&err.to_string());
        if let Some(cb) = self.error_cb.lock().unwrap().as_ref() {
            cb(err);
        }
    }

    fn complete_once(&self, success: bool, reason: &str) {
        if self.completion_done.swap(true, Ordering::SeqCst) {
            return;
        }
        self.logger.info(&format!("transfer complete: success={} ({})", success, reason));
        if let Some(cb) = self.completion_cb.lock().unwrap().as_ref() {
            cb(success, reason);
        }
    }

    fn notify_progress(&self) {
        let received = self.received_bytes.load(Ordering::Relaxed);
        let expected = *self.expected_file_size.lock().unwrap();
        if let Some(cb) = self.progress_cb.lock().unwrap().as_ref() {
            cb(received, expected);
        }
    }

    fn current_timeout(&self) -> Duration {
        Duration::from_millis(self.rtt.lock().unwrap().timeout_ms)
    }

    fn record_rtt_sample(&self, sample_ms: f64) {
        let mut rtt = self.rtt.lock().unwrap();
        rtt.rtt_ms = (rtt.rtt_ms * 7.0 + sample_ms) / 8.0;
        let computed = (2.0 * rtt.rtt_ms) as u64;
        rtt.timeout_ms = computed.clamp(self.config.timeout_base_ms, self.config.timeout_max_ms);
    }

    fn write_frame(&self, bytes: &[u8]) -> Result<()> {
        self.transport.write(bytes).map(|_| ()).map_err(Error::from)
    }
}

/// Sliding-window selective-repeat reliable channel over a shared transport.
pub struct ReliableChannel {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ReliableChannel {
    pub fn new(transport: SharedTransport, config: ReliableConfig) -> ReliableChannel {
        Self::with_logger(transport, config, Arc::new(StdoutLogger::default()))
    }

    pub fn with_logger(
        transport: SharedTransport,
        config: ReliableConfig,
        logger: Arc<dyn Logger>,
    ) -> ReliableChannel {
        let queue_cap = 10 * config.window_size as usize;
        ReliableChannel {
            shared: Arc::new(Shared {
                transport,
                logger,
                config,
                verbose_logging: AtomicBool::new(false),
                state: Mutex::new(ChannelState::Initialized),
                send_window: Mutex::new(SendWindow::new(config.window_size)),
                send_cv: Condvar::new(),
                receive_window: Mutex::new(ReceiveWindow::new(config.window_size)),
                receive_cv: Condvar::new(),
                session_id: Mutex::new(None),
                handshake: Mutex::new(Handshake {
                    completed: false,
                    sequence: None,
                    window_synced: false,
                }),
                handshake_cv: Condvar::new(),
                rtt: Mutex::new(RttState {
                    rtt_ms: config.timeout_base_ms as f64 / 2.0,
                    timeout_ms: config.timeout_base_ms,
                }),
                stats: Mutex::new(ReliableStats::default()),
                heartbeat_sequence: Mutex::new(0),
                last_frame_seen: Mutex::new(Instant::now()),
                send_queue: bounded(queue_cap),
                deliver_queue: bounded(queue_cap.max(64)),
                shutdown: AtomicBool::new(false),
                expected_file_size: Mutex::new(None),
                received_bytes: AtomicU64::new(0),
                acked_bytes: AtomicU64::new(0),
                completion_done: AtomicBool::new(false),
                end_grace_deadline: Mutex::new(None),
                stream_end_pending: AtomicBool::new(false),
                error_cb: Mutex::new(None),
                completion_cb: Mutex::new(None),
                progress_cb: Mutex::new(None),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn set_verbose_logging(&self, on: bool) {
        self.shared.verbose_logging.store(on, Ordering::Relaxed);
    }

    pub fn set_error_callback(&self, cb: ErrorCallback) {
        *self.shared.error_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_completion_callback(&self, cb: CompletionCallback) {
        *self.shared.completion_cb.lock().unwrap() = Some(cb);
    }

    pub fn set_progress_callback(&self, cb: ProgressCallback) {
        *self.shared.progress_cb.lock().unwrap() = Some(cb);
    }

    pub fn stats(&self) -> ReliableStats {
        *self.shared.stats.lock().unwrap()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.state.lock().unwrap() == ChannelState::Connected
    }

    pub fn has_completed_transfer(&self) -> bool {
        self.shared.completion_done.load(Ordering::SeqCst)
    }

    /// Cumulative application payload bytes that have actually been ACKed by
    /// the peer, as opposed to bytes merely queued for send.
    pub fn acked_bytes(&self) -> u64 {
        self.shared.acked_bytes.load(Ordering::Relaxed)
    }

    /// Starts the four worker threads. Idempotent: calling twice on an
    /// already-running channel is a no-op.
    pub fn connect(&self) -> Result<()> {
        let mut workers = self.workers.lock().unwrap();
        if !workers.is_empty() {
            return Ok(());
        }
        *self.shared.state.lock().unwrap() = ChannelState::Connected;
        *self.shared.last_frame_seen.lock().unwrap() = Instant::now();

        workers.push(spawn_process_thread(self.shared.clone()));
        workers.push(spawn_send_thread(self.shared.clone()));
        workers.push(spawn_receive_thread(self.shared.clone()));
        workers.push(spawn_heartbeat_thread(self.shared.clone()));
        Ok(())
    }

    /// Stops all workers and releases blocked callers. Never call this from
    /// one of the channel's own worker threads.
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        *self.shared.state.lock().unwrap() = ChannelState::ShutdownRequested;
        self.shared.send_cv.notify_all();
        self.shared.receive_cv.notify_all();
        self.shared.handshake_cv.notify_all();

        let mut workers = self.workers.lock().unwrap();
        for handle in workers.drain(..) {
            let _ = handle.join();
        }
    }

    /// Low 16 bits of a monotonic clock reading, with 0 remapped to 1 since
    /// a session id of 0 means "no session".
    fn generate_session_id() -> u16 {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let id = (nanos & 0xFFFF) as u16;
        if id == 0 {
            1
        } else {
            id
        }
    }

    /// Performs the handshake if it hasn't already completed for this
    /// session. Must be called before the first `send()`.
    pub fn ensure_session_started(&self) -> Result<()> {
        {
            let handshake = self.shared.handshake.lock().unwrap();
            if handshake.completed {
                return Ok(());
            }
        }

        let session_id = Self::generate_session_id();
        *self.shared.session_id.lock().unwrap() = Some(session_id);

        let seq = allocate_sequence(&self.shared);
        {
            let mut handshake = self.shared.handshake.lock().unwrap();
            handshake.sequence = Some(seq);
        }

        let meta = StartMetadata {
            version: self.shared.config.version,
            flags: 0,
            session_id,
            file_size: 0,
            modify_time: 0,
            file_name: String::new(),
        };
        let frame_bytes = FrameCodec::encode_start(seq, &meta);
        self.shared
            .send_window
            .lock()
            .unwrap()
            .insert(Packet::new(seq, frame_bytes.clone(), 0));
        self.shared.write_frame(&frame_bytes)?;
        self.shared.stats.lock().unwrap().packets_sent += 1;

        let timeout = Duration::from_millis(self.shared.config.timeout_max_ms);
        let handshake = self.shared.handshake.lock().unwrap();
        let (handshake, timed_out) = self
            .shared
            .handshake_cv
            .wait_timeout_while(handshake, timeout, |h| {
                !h.completed && !self.shared.shutdown.load(Ordering::SeqCst)
            })
            .unwrap();

        if timed_out.timed_out() && !handshake.completed {
            return Err(Error::new(ErrorKind::HandshakeTimeout, "handshake timed out"));
        }
        Ok(())
    }

    /// Queues `data` for reliable delivery, blocking if the send queue is
    /// saturated. A zero-length payload is a no-op that returns `true`
    /// without emitting a DATA frame. Returns `false` if the channel has
    /// been shut down.
    pub fn send(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return true;
        }
        if self.shared.shutdown.load(Ordering::SeqCst) {
            return false;
        }
        self.shared.send_queue.0.send(data.to_vec()).is_ok()
    }

    pub fn send_file(&self, file_name: &str, data: &[u8]) -> Result<()> {
        self.ensure_session_started()?;
        let session_id = self.shared.session_id.lock().unwrap().unwrap_or(0);
        let seq = allocate_sequence(&self.shared);
        let meta = StartMetadata {
            version: self.shared.config.version,
            flags: 0,
            session_id,
            file_size: data.len() as u64,
            modify_time: chrono::Utc::now().timestamp() as u64,
            file_name: file_name.to_string(),
        };
        let frame_bytes = FrameCodec::encode_start(seq, &meta);
        self.shared
            .send_window
            .lock()
            .unwrap()
            .insert(Packet::new(seq, frame_bytes.clone(), 0));
        self.shared.write_frame(&frame_bytes)?;

        let chunk_size = self.shared.config.max_payload_size as usize;
        for chunk in data.chunks(chunk_size.max(1)) {
            if !self.send(chunk) {
                return Err(Error::new(ErrorKind::SessionClosed, "channel closed mid-send"));
            }
        }
        self.send_end()
    }

    pub fn send_end(&self) -> Result<()> {
        let seq = allocate_sequence(&self.shared);
        let frame_bytes = FrameCodec::encode_end(seq);
        self.shared.write_frame(&frame_bytes)?;
        Ok(())
    }

    /// Blocks up to `timeout` for the next in-order payload delivered by the
    /// receive thread.
    pub fn recv(&self, timeout: Duration) -> Result<Vec<u8>> {
        match self.shared.deliver_queue.1.recv_timeout(timeout) {
            Ok(data) => Ok(data),
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::new(ErrorKind::IntegrityMismatch, "recv timed out"))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::new(ErrorKind::SessionClosed, "channel closed"))
            }
        }
    }
}

impl Drop for ReliableChannel {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Blocks on the send-window condvar while the window is full, then
/// reserves and returns the next sequence number. Polls shutdown every 50ms
/// so a torn-down channel releases callers promptly instead of hanging.
fn allocate_sequence(shared: &Arc<Shared>) -> u16 {
    let mut window = shared.send_window.lock().unwrap();
    loop {
        if !window.is_full() {
            return window.allocate();
        }
        if shared.shutdown.load(Ordering::SeqCst) {
            return window.allocate();
        }
        let (guard, _) = shared
            .send_cv
            .wait_timeout(window, Duration::from_millis(50))
            .unwrap();
        window = guard;
    }
}

fn spawn_process_thread(shared: Arc<Shared>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut codec = FrameCodec::new(shared.config.max_payload_size as usize);
        let mut buf = [0u8; 4096];
        while !shared.shutdown.load(Ordering::SeqCst) {
            match shared.transport.read(&mut buf, Duration::from_millis(100)) {
                Ok(n) if n > 0 => {
                    codec.append(&buf[..n]);
                    while let Some(frame) = codec.try_get_frame() {
                        dispatch_frame(&shared, frame);
                    }
                }
                Ok(_) => {}
                Err(e) if e.kind() == transport::ErrorKind::Timeout => {}
                Err(e) => shared.report_error(Error::from(e)),
            }

            scan_retransmissions(&shared);
        }
    })
}

fn dispatch_frame(shared: &Arc<Shared>, frame: Frame) {
    *shared.last_frame_seen.lock().unwrap() = Instant::now();

    if !frame.valid {
        shared.stats.lock().unwrap().packets_invalid += 1;
        return;
    }
    shared.stats.lock().unwrap().packets_received += 1;

    match frame.frame_type {
        FrameType::Data => process_data_frame(shared, frame),
        FrameType::Ack => process_ack_frame(shared, frame.sequence),
        FrameType::Nak => process_nak_frame(shared, frame.sequence),
        FrameType::Start => process_start_frame(shared, frame),
        FrameType::End => process_end_frame(shared),
        FrameType::Heartbeat => shared.vlog("heartbeat received"),
    }
}

fn process_data_frame(shared: &Arc<Shared>, frame: Frame) {
    let seq = frame.sequence;
    let mut window = shared.receive_window.lock().unwrap();

    if !window.in_window(seq) {
        // Outside the window: likely a duplicate of something already
        // delivered. Re-ACK the last byte we actually accepted.
        let dup_ack = window.base.wrapping_sub(1);
        drop(window);
        let ack_bytes = FrameCodec::encode_ack(dup_ack);
        let _ = shared.write_frame(&ack_bytes);
        return;
    }

    if window.already_has(seq) {
        // Retransmission of something we already buffered: just re-ACK.
        drop(window);
        let ack_bytes = FrameCodec::encode_ack(seq);
        let _ = shared.write_frame(&ack_bytes);
        return;
    }

    window.insert(Packet::new(seq, frame.payload.clone(), 0));
    drop(window);

    shared.stats.lock().unwrap().bytes_received += frame.payload.len() as u64;
    let ack_bytes = FrameCodec::encode_ack(seq);
    let _ = shared.write_frame(&ack_bytes);
    shared.receive_cv.notify_all();
}

fn process_ack_frame(shared: &Arc<Shared>, seq: u16) {
    let (sample_ms, payload_len, already_acked) = {
        let mut window = shared.send_window.lock().unwrap();
        let (sample, payload_len, already_acked) = match window.get(seq) {
            Some(p) => (Some(p.timestamp.elapsed().as_millis() as f64), p.payload_len, p.acknowledged),
            None => (None, 0, true),
        };
        window.acknowledge(seq);
        window.advance_base();
        (sample, payload_len, already_acked)
    };
    shared.send_cv.notify_all();

    if let Some(sample) = sample_ms {
        shared.record_rtt_sample(sample);
    }
    // A retransmitted ACK for an already-acknowledged sequence must not be
    // double-counted against the transfer's real byte total.
    if !already_acked && payload_len > 0 {
        shared.acked_bytes.fetch_add(payload_len, Ordering::SeqCst);
    }

    let mut handshake = shared.handshake.lock().unwrap();
    if handshake.sequence == Some(seq) && !handshake.completed {
        handshake.completed = true;
        shared.handshake_cv.notify_all();
    }
}

fn process_nak_frame(shared: &Arc<Shared>, seq: u16) {
    let mut window = shared.send_window.lock().unwrap();
    if let Some(packet) = window.get_mut(seq) {
        packet.retry_count += 1;
        packet.timestamp = Instant::now();
        let bytes = packet.data.clone();
        drop(window);
        shared.stats.lock().unwrap().packets_retransmitted += 1;
        let _ = shared.write_frame(&bytes);
    }
}

fn process_start_frame(shared: &Arc<Shared>, frame: Frame) {
    let meta = match FrameCodec::decode_start_metadata(&frame.payload) {
        Some(m) => m,
        None => {
            shared.report_error(Error::new(ErrorKind::InvalidFrame, "malformed START payload"));
            return;
        }
    };

    let mut handshake = shared.handshake.lock().unwrap();
    if !handshake.window_synced {
        let mut window = shared.receive_window.lock().unwrap();
        window.reset_to(frame.sequence.wrapping_add(1));
        handshake.window_synced = true;
        shared.log(Level::Info, &format!("session {} started, window resynced", meta.session_id));
    }
    drop(handshake);

    if meta.file_size > 0 {
        *shared.expected_file_size.lock().unwrap() = Some(meta.file_size);
    }
    shared.received_bytes.store(0, Ordering::SeqCst);
    shared.completion_done.store(false, Ordering::SeqCst);

    let ack_bytes = FrameCodec::encode_ack(frame.sequence);
    let _ = shared.write_frame(&ack_bytes);
}

fn process_end_frame(shared: &Arc<Shared>) {
    let expected = *shared.expected_file_size.lock().unwrap();
    let received = shared.received_bytes.load(Ordering::SeqCst);

    match expected {
        // Pure stream mode: no announced size to check underflow/overflow
        // against. Completion still waits for the receive window to have
        // nothing buffered and at least one byte to have actually arrived,
        // rather than firing the instant END lands.
        None => {
            let drained = {
                let window = shared.receive_window.lock().unwrap();
                window.base == window.next
            };
            if received > 0 && drained {
                shared.complete_once(true, "stream complete");
            } else {
                shared.stream_end_pending.store(true, Ordering::SeqCst);
            }
        }
        Some(expected) => {
            let diff = if received >= expected {
                received - expected
            } else {
                expected - received
            };
            if diff <= END_TOLERANCE_BYTES {
                shared.complete_once(true, "file complete");
            } else if received < expected {
                *shared.end_grace_deadline.lock().unwrap() = Some(Instant::now() + END_SHORT_GRACE);
            } else {
                shared.complete_once(true, "file complete (longer than expected)");
            }
        }
    }
}

fn spawn_send_thread(shared: Arc<Shared>) -> JoinHandle<()> {
    thread::spawn(move || {
        while !shared.shutdown.load(Ordering::SeqCst) {
            let data = match shared.send_queue.1.recv_timeout(Duration::from_millis(100)) {
                Ok(d) => d,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };

            let seq = allocate_sequence(&shared);
            let frame_bytes = FrameCodec::encode_data(seq, &data);
            {
                let mut window = shared.send_window.lock().unwrap();
                window.insert(Packet::new(seq, frame_bytes.clone(), data.len() as u64));
            }
            match shared.write_frame(&frame_bytes) {
                Ok(()) => {
                    let mut stats = shared.stats.lock().unwrap();
                    stats.packets_sent += 1;
                    stats.bytes_sent += data.len() as u64;
                }
                Err(e) => shared.report_error(e),
            }
        }
    })
}

fn spawn_receive_thread(shared: Arc<Shared>) -> JoinHandle<()> {
    thread::spawn(move || {
        while !shared.shutdown.load(Ordering::SeqCst) {
            let drained = {
                let window = shared.receive_window.lock().unwrap();
                let (mut window, _) = shared
                    .receive_cv
                    .wait_timeout(window, Duration::from_millis(100))
                    .unwrap();
                window.drain_contiguous()
            };

            for payload in drained {
                shared.received_bytes.fetch_add(payload.len() as u64, Ordering::SeqCst);
                if shared.deliver_queue.0.send(payload).is_err() {
                    break;
                }
            }
            shared.notify_progress();

            if shared.stream_end_pending.load(Ordering::SeqCst) {
                let drained = {
                    let window = shared.receive_window.lock().unwrap();
                    window.base == window.next
                };
                if drained && shared.received_bytes.load(Ordering::SeqCst) > 0 {
                    shared.stream_end_pending.store(false, Ordering::SeqCst);
                    shared.complete_once(true, "stream complete");
                }
            }

            let grace_expired = {
                let deadline = shared.end_grace_deadline.lock().unwrap();
                deadline.map(|d| Instant::now() >= d).unwrap_or(false)
            };
            if grace_expired {
                shared.complete_once(false, "END underflow grace expired");
                *shared.end_grace_deadline.lock().unwrap() = None;
            }
        }
    })
}

fn spawn_heartbeat_thread(shared: Arc<Shared>) -> JoinHandle<()> {
    thread::spawn(move || {
        let interval = Duration::from_millis(shared.config.heartbeat_interval_ms);
        let disconnect_after = Duration::from_millis(shared.config.timeout_max_ms * 3);
        let poll_slice = Duration::from_millis(50).min(interval);
        let mut last_beat = Instant::now() - interval;

        while !shared.shutdown.load(Ordering::SeqCst) {
            thread::sleep(poll_slice);
            if last_beat.elapsed() < interval {
                continue;
            }
            last_beat = Instant::now();

            let seq = {
                let mut hb = shared.heartbeat_sequence.lock().unwrap();
                let seq = *hb;
                *hb = hb.wrapping_add(1);
                seq
            };
            let bytes = FrameCodec::encode_heartbeat(seq);
            if let Err(e) = shared.write_frame(&bytes) {
                shared.report_error(e);
            }

            let elapsed = shared.last_frame_seen.lock().unwrap().elapsed();
            if elapsed > disconnect_after {
                shared.stats.lock().unwrap().timeouts += 1;
                shared.report_error(Error::new(
                    ErrorKind::HandshakeTimeout,
                    "no frames observed within heartbeat liveness window",
                ));
                *shared.state.lock().unwrap() = ChannelState::ShutdownRequested;
                shared.shutdown.store(true, Ordering::SeqCst);
            }
        }
    })
}

fn scan_retransmissions(shared: &Arc<Shared>) {
    let timeout = shared.current_timeout();
    let max_retries = shared.config.max_retries;
    let mut window = shared.send_window.lock().unwrap();
    let base = window.base;
    let mut to_retransmit = Vec::new();
    let mut to_fail = Vec::new();

    for packet in window.pending() {
        if packet.timestamp.elapsed() <= timeout {
            continue;
        }
        if packet.retry_count >= max_retries {
            to_fail.push(packet.sequence);
        } else {
            packet.retry_count += 1;
            packet.timestamp = Instant::now();
            to_retransmit.push((packet.sequence, packet.data.clone()));
        }
    }

    if to_fail.contains(&base) {
        window.force_advance_past_base();
    }
    drop(window);

    if !to_retransmit.is_empty() {
        *shared.state.lock().unwrap() = ChannelState::Retransmitting;
        shared.stats.lock().unwrap().packets_retransmitted += to_retransmit.len() as u64;
    }
    for (_, bytes) in &to_retransmit {
        let _ = shared.write_frame(bytes);
    }
    if !to_fail.is_empty() {
        shared.stats.lock().unwrap().errors += to_fail.len() as u64;
        for seq in to_fail {
            shared.report_error(Error::new(
                ErrorKind::MaxRetriesExceeded,
                format!("sequence {} exceeded max_retries", seq),
            ));
        }
    }
    if *shared.state.lock().unwrap() == ChannelState::Retransmitting {
        *shared.state.lock().unwrap() = ChannelState::Connected;
    }
}
