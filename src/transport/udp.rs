//! UDP transport backend: datagram-oriented, unlike the stream backends.
//! Each `write` call sends exactly one datagram; the async reader delivers
//! exactly one callback invocation per received datagram, never coalescing
//! or splitting them.

use super::{
    DataReceivedCallback, Error, ErrorKind, ErrorOccurredCallback, Result, StateChangedCallback,
    Transport, TransportConfig, TransportState, TransportStats,
};
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

struct Inner {
    socket: Option<UdpSocket>,
    peer: Option<String>,
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

pub struct UdpTransport {
    shared: Arc<Shared>,
}

impl UdpTransport {
    pub fn new() -> UdpTransport {
        UdpTransport {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    socket: None,
                    peer: None,
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

    fn clone_socket(&self) -> Result<UdpSocket> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .socket
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::NotOpen, "udp transport is not open"))?
            .try_clone()
            .map_err(Error::from)
    }
}

impl Transport for UdpTransport {
    fn open(&self, config: &TransportConfig) -> Result<()> {
        {
            let inner = self.shared.inner.lock().unwrap();
            if inner.state != TransportState::Closed && inner.state != TransportState::Error {
                return Err(Error::new(ErrorKind::AlreadyOpen, "udp transport already open"));
            }
        }
        self.shared.set_state(TransportState::Opening);

        let bind_addr = if config.is_server {
            format!("0.0.0.0:{}", config.port)
        } else {
            "0.0.0.0:0".to_string()
        };

        let socket = match UdpSocket::bind(&bind_addr) {
            Ok(s) => s,
            Err(e) => {
                self.shared.set_state(TransportState::Error);
                return Err(Error::from(e));
            }
        };
        let _ = socket.set_read_timeout(Some(config.read_timeout));
        let _ = socket.set_write_timeout(Some(config.write_timeout));

        let peer = if !config.is_server {
            let addr = format!("{}:{}", config.ip, config.port);
            if let Err(e) = socket.connect(&addr) {
                self.shared.set_state(TransportState::Error);
                return Err(Error::from(e));
            }
            Some(addr)
        } else {
            None
        };

        let mut inner = self.shared.inner.lock().unwrap();
        inner.socket = Some(socket);
        inner.peer = peer;
        inner.config = config.clone();
        drop(inner);

        self.shared.set_state(TransportState::Open);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.stop_async_read()?;
        let mut inner = self.shared.inner.lock().unwrap();
        inner.socket = None;
        inner.peer = None;
        drop(inner);
        self.shared.set_state(TransportState::Closed);
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<usize> {
        let socket = self.clone_socket()?;
        let peer = self.shared.inner.lock().unwrap().peer.clone();
        let result = match peer {
            Some(addr) => socket.send_to(bytes, addr),
            None => socket.send(bytes),
        };
        match result {
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
        let socket = self.clone_socket()?;
        let _ = socket.set_read_timeout(Some(timeout));
        match socket.recv_from(buf) {
            Ok((n, _)) => {
                let mut stats = self.shared.stats.lock().unwrap();
                stats.bytes_received += n as u64;
                stats.packets_received += 1;
                Ok(n)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock || e.kind() == std::io::ErrorKind::TimedOut => {
                Err(Error::new(ErrorKind::Timeout, "udp read timed out"))
            }
            Err(e) => Err(Error::from(e)),
        }
    }

    fn start_async_read(&self) -> Result<()> {
        if self.shared.async_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let socket = match self.clone_socket() {
            Ok(s) => s,
            Err(e) => {
                self.shared.async_running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let _ = socket.set_read_timeout(Some(Duration::from_millis(200)));

        let shared = self.shared.clone();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 65536];
            while shared.async_running.load(Ordering::SeqCst) {
                match socket.recv_from(&mut buf) {
                    Ok((n, _addr)) => {
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
        Ok(())
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

impl Drop for UdpTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
