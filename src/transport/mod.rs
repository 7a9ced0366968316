//! Transport abstraction: a uniform byte-stream interface over heterogeneous
//! physical channels, plus the per-backend implementations.
//!
//! Every backend honors the same open/close/read/write/async-read lifecycle
//! and the same callback contract (§4.2 of the design spec): callbacks are
//! invoked from at most one thread at a time per transport, and never while
//! the transport's internal lock is held.

pub mod loopback;
pub mod printer;
pub mod serial;
pub mod tcp;
pub mod termios;
pub mod udp;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Endpoint descriptor consumed once by `Transport::open`.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub port_type: PortType,
    pub port_name: String,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub buffer_size: usize,
    pub async_mode: bool,

    // Serial-specific.
    pub baud_rate: u32,
    pub data_bits: u8,
    pub parity: Parity,
    pub stop_bits: StopBits,
    pub flow_control: FlowControl,

    // TCP/UDP-specific.
    pub ip: String,
    pub port: u16,
    pub is_server: bool,

    // Loopback-specific.
    pub delay_ms: u64,
    pub jitter_max_ms: u64,
    pub error_rate_percent: u8,
    pub packet_loss_rate_percent: u8,
    pub max_queue_size: usize,
}

impl Default for TransportConfig {
    fn default() -> TransportConfig {
        TransportConfig {
            port_type: PortType::Loopback,
            port_name: String::new(),
            read_timeout: Duration::from_millis(2000),
            write_timeout: Duration::from_millis(2000),
            buffer_size: 4096,
            async_mode: false,
            baud_rate: 9600,
            data_bits: 8,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
            ip: String::new(),
            port: 0,
            is_server: false,
            delay_ms: 0,
            jitter_max_ms: 0,
            error_rate_percent: 0,
            packet_loss_rate_percent: 0,
            max_queue_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortType {
    Serial,
    Parallel,
    UsbPrint,
    NetworkPrint,
    Loopback,
    Tcp,
    Udp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Parity {
    None,
    Odd,
    Even,
    Mark,
    Space,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopBits {
    One,
    OnePointFive,
    Two,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowControl {
    None,
    Software,
    Hardware,
}

/// Running counters owned by each transport; read-only snapshot to callers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_error: u64,
    pub throughput_bps: f64,
    pub last_error_code: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Closed,
    Opening,
    Open,
    Closing,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Success,
    OpenFailed,
    CloseFailed,
    ReadFailed,
    WriteFailed,
    Timeout,
    Busy,
    NotOpen,
    InvalidParameter,
    InvalidConfig,
    AlreadyOpen,
    ConnectionClosed,
    FlushFailed,
    ConfigFailed,
    AuthenticationFailed,
    AccessDenied,
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

    pub fn description(&self) -> &str {
        &self.description
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
        let kind = match e.kind() {
            std::io::ErrorKind::TimedOut => ErrorKind::Timeout,
            std::io::ErrorKind::WouldBlock => ErrorKind::Busy,
            std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe => ErrorKind::ConnectionClosed,
            std::io::ErrorKind::NotConnected => ErrorKind::NotOpen,
            _ => ErrorKind::ReadFailed,
        };
        Error::new(kind, e.to_string())
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Error {
        Error::new(ErrorKind::ReadFailed, e.desc())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub type DataReceivedCallback = Box<dyn Fn(&[u8]) + Send + Sync>;
pub type StateChangedCallback = Box<dyn Fn(TransportState) + Send + Sync>;
pub type ErrorOccurredCallback = Box<dyn Fn(ErrorKind, &str) + Send + Sync>;

/// The uniform byte-stream contract every backend must honor.
pub trait Transport: Send + Sync {
    fn open(&self, config: &TransportConfig) -> Result<()>;
    fn close(&self) -> Result<()>;
    fn write(&self, bytes: &[u8]) -> Result<usize>;
    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize>;
    fn start_async_read(&self) -> Result<()>;
    fn stop_async_read(&self) -> Result<()>;
    fn flush(&self) -> Result<()>;
    fn available(&self) -> usize;
    fn get_stats(&self) -> TransportStats;
    fn reset_stats(&self);
    fn state(&self) -> TransportState;
    fn is_open(&self) -> bool {
        self.state() == TransportState::Open
    }
    fn port_name(&self) -> String;

    fn set_data_received_callback(&self, callback: DataReceivedCallback);
    fn set_state_changed_callback(&self, callback: StateChangedCallback);
    fn set_error_callback(&self, callback: ErrorOccurredCallback);
}

pub type SharedTransport = Arc<dyn Transport>;
