//! TCP transport backend: client mode dials out, server mode binds and
//! accepts exactly one connection (the first one) and uses it as the
//! transport's single peer. Follows the same open/close/read/write
//! contract as `serial.rs`, adapted to the connection-oriented half of the
//! transport abstraction.

use super::{
    DataReceivedCallback, Error, ErrorKind, ErrorOccurredCallback, Result, StateChangedCallback,
    Transport, TransportConfig, TransportState, TransportStats,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Inner {
    stream: Option<TcpStream>,
    listener: Option<TcpListener>,
    state: TransportState,
    config: TransportConfig,
}

struct Shared {
    inner: Mutex<Inner>,
    stats: Mutex<TransportStats>,
    data_cb: Mutex<Option<DataReceivedCallback>>,
    state_cb: Mutex<Option<StateChangedCallback>>,
    error_cb: Mutex<Option<ErrorOccurredCallback>>,
    async_running: AtomicBool,
    reader_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn set_state(&self, state: TransportState) {
        self.inner.lock().unwrap().state = state;
        if let Some(cb) = self.state_cb.lock().unwrap().as_ref() {
            cb(state);
        }
    }

    fn report_error(&self, kind: ErrorKind, msg: &str) {
        if let Some(cb) = self.error_cb.lock().unwrap().as_ref() {
            cb(kind, msg);
        }
    }

    fn deliver(&self, data: &[u8]) {
        if let Some(cb) = self.data_cb.lock().unwrap().as_ref() {
            cb(data);
        }
    }
}

pub struct TcpTransport {
    shared: Arc<Shared>,
}

impl TcpTransport {
    pub fn new() -> TcpTransport {
        TcpTransport {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    stream: None,
                    listener: None,
                    state: TransportState::Closed,
                    config: TransportConfig::default(),
                }),
                stats: Mutex::new(TransportStats::default()),
                data_cb: Mutex::new(None),
                state_cb: Mutex::new(None),
                error_cb: Mutex::new(None),
                async_running: AtomicBool::new(false),
                reader_handle: Mutex::new(None),
            }),
        }
    }

    fn clone_stream(&self) -> Result<TcpStream> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .stream
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotOpen, "tcp transport is not connected"))?
            .try_clone()
            .map_err(Error::from)
    }
}

impl Transport for TcpTransport {
    fn open(&self, config: &TransportConfig) -> Result<()> {
        {
            let inner = self.shared.inner.lock().unwrap();
            if inner.state != TransportState::Closed && inner.state != TransportState::Error {
                return Err(Error::new(ErrorKind::AlreadyOpen, "tcp transport already open"));
            }
        }
        self.shared.set_state(TransportState::Opening);

        let addr = format!("{}:{}", config.ip, config.port);
        let result = if config.is_server {
            TcpListener::bind(&addr).and_then(|listener| {
                listener.accept().map(|(stream, _)| {
                    (Some(stream), Some(listener))
                })
            })
        } else {
            let deadline = config.write_timeout.max(Duration::from_millis(1));
            use std::net::ToSocketAddrs;
            let sockaddr = addr
                .to_socket_addrs()
                .map_err(Error::from)?
                .next()
                .ok_or_else(|| Error::new(ErrorKind::InvalidConfig, "unresolvable tcp address"))?;
            TcpStream::connect_timeout(&sockaddr, deadline).map(|s| (Some(s), None))
        };

        match result {
            Ok((stream, listener)) => {
                if let Some(ref s) = stream {
                    let _ = s.set_read_timeout(Some(config.read_timeout));
                    let _ = s.set_write_timeout(Some(config.write_timeout));
                    let _ = s.set_nodelay(true);
                }
                let mut inner = self.shared.inner.lock().unwrap();
                inner.stream = stream;
                inner.listener = listener;
                inner.config = config.clone();
            }
            Err(e) => {
                self.shared.set_state(TransportState::Error);
                return Err(Error::from(e));
            }
        }

        self.shared.set_state(TransportState::Open);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.stop_async_read()?;
        let mut inner = self.shared.inner.lock().unwrap();
        inner.stream = None;
        inner.listener = None;
        drop(inner);
        self.shared.set_state(TransportState::Closed);
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<usize> {
        let mut stream = self.clone_stream()?;
        match stream.write(bytes) {
            Ok(n) => {
                let mut stats = self.shared.stats.lock().unwrap();
                stats.bytes_sent += n as u64;
                stats.packets_sent += 1;
                Ok(n)
            }
            Err(e) => {
                self.shared.report_error(ErrorKind::WriteFailed, &e.to_string());
                Err(Error::from(e))
            }
        }
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let mut stream = self.clone_stream()?;
        let _ = stream.set_read_timeout(Some(timeout));
        match stream.read(buf) {
            Ok(0) => Err(Error::new(ErrorKind::ConnectionClosed, "peer closed the connection")),
            Ok(n) => {
                let mut stats = self.shared.stats.lock().unwrap();
                stats.bytes_received += n as u64;
                stats.packets_received += 1;
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                Err(Error::new(ErrorKind::Timeout, "tcp read timed out"))
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    fn start_async_read(&self) -> Result<()> {
        if self.shared.async_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut stream = match self.clone_stream() {
            Ok(s) => s,
            Err(e) => {
                self.shared.async_running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let _ = stream.set_read_timeout(Some(Duration::from_millis(200)));

        let shared = self.shared.clone();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4096];
            while shared.async_running.load(Ordering::SeqCst) {
                match stream.read(&mut buf) {
                    Ok(0) => {
                        shared.set_state(TransportState::Closed);
                        break;
                    }
                    Ok(n) => {
                        {
                            let mut stats = shared.stats.lock().unwrap();
                            stats.bytes_received += n as u64;
                            stats.packets_received += 1;
                        }
                        shared.deliver(&buf[..n]);
                    }
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        continue;
                    }
                    Err(e) => {
                        shared.report_error(ErrorKind::ReadFailed, &e.to_string());
                        break;
                    }
                }
            }
        });
        *self.shared.reader_handle.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn stop_async_read(&self) -> Result<()> {
        if !self.shared.async_running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(handle) = self.shared.reader_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut stream = self.clone_stream()?;
        stream.flush().map_err(Error::from)
    }

    fn available(&self) -> usize {
        0
    }

    fn get_stats(&self) -> TransportStats {
        *self.shared.stats.lock().unwrap()
    }

    fn reset_stats(&self) {
        *self.shared.stats.lock().unwrap() = TransportStats::default();
    }

    fn state(&self) -> TransportState {
        self.shared.inner.lock().unwrap().state
    }

    fn port_name(&self) -> String {
        let inner = self.shared.inner.lock().unwrap();
        format!("{}:{}", inner.config.ip, inner.config.port)
    }

    fn set_data_received_callback(&self, callback: DataReceivedCallback) {
        *self.shared.data_cb.lock().unwrap() = Some(callback);
    }

    fn set_state_changed_callback(&self, callback: StateChangedCallback) {
        *self.shared.state_cb.lock().unwrap() = Some(callback);
    }

    fn set_error_callback(&self, callback: ErrorOccurredCallback) {
        *self.shared.error_cb.lock().unwrap() = Some(callback);
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
