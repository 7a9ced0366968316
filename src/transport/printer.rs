//! Printer transport backend: write-only. Data handed to `write` is spooled
//! to the system print queue via `lp(1)`; `read`/`start_async_read` never
//! produce data since a print spooler has no return channel.

use super::{
    DataReceivedCallback, Error, ErrorKind, ErrorOccurredCallback, Result, StateChangedCallback,
    Transport, TransportConfig, TransportState, TransportStats,
};
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

struct Inner {
    state: TransportState,
    config: TransportConfig,
}

pub struct PrinterTransport {
    inner: Mutex<Inner>,
    stats: Mutex<TransportStats>,
    data_cb: Mutex<Option<DataReceivedCallback>>,
    state_cb: Mutex<Option<StateChangedCallback>>,
    error_cb: Mutex<Option<ErrorOccurredCallback>>,
}

impl PrinterTransport {
    pub fn new() -> PrinterTransport {
        PrinterTransport {
            inner: Mutex::new(Inner {
                state: TransportState::Closed,
                config: TransportConfig::default(),
            }),
            stats: Mutex::new(TransportStats::default()),
            data_cb: Mutex::new(None),
            state_cb: Mutex::new(None),
            error_cb: Mutex::new(None),
        }
    }

    fn set_state(&self, state: TransportState) {
        self.inner.lock().unwrap().state = state;
        if let Some(cb) = self.state_cb.lock().unwrap().as_ref() {
            cb(state);
        }
    }
}

impl Transport for PrinterTransport {
    fn open(&self, config: &TransportConfig) -> Result<()> {
        {
            let inner = self.inner.lock().unwrap();
            if inner.state != TransportState::Closed && inner.state != TransportState::Error {
                return Err(Error::new(ErrorKind::AlreadyOpen, "printer transport already open"));
            }
        }
        self.set_state(TransportState::Opening);
        self.inner.lock().unwrap().config = config.clone();
        self.set_state(TransportState::Open);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.set_state(TransportState::Closed);
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<usize> {
        let printer_name = self.inner.lock().unwrap().config.port_name.clone();
        let mut command = Command::new("lp");
        if !printer_name.is_empty() {
            command.arg("-d").arg(&printer_name);
        }
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::new(ErrorKind::WriteFailed, format!("failed to spawn lp: {}", e)))?;

        {
            let stdin = child
                .stdin
                .as_mut()
                .ok_or_else(|| Error::new(ErrorKind::WriteFailed, "lp stdin unavailable"))?;
            stdin
                .write_all(bytes)
                .map_err(|e| Error::new(ErrorKind::WriteFailed, e.to_string()))?;
        }

        let status = child
            .wait()
            .map_err(|e| Error::new(ErrorKind::WriteFailed, e.to_string()))?;
        if !status.success() {
            let mut stats = self.stats.lock().unwrap();
            stats.packets_error += 1;
            if let Some(cb) = self.error_cb.lock().unwrap().as_ref() {
                cb(ErrorKind::WriteFailed, "lp exited with a non-zero status");
            }
            return Err(Error::new(ErrorKind::WriteFailed, "lp exited with a non-zero status"));
        }

        let mut stats = self.stats.lock().unwrap();
        stats.bytes_sent += bytes.len() as u64;
        stats.packets_sent += 1;
        Ok(bytes.len())
    }

    fn read(&self, _buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        Ok(0)
    }

    fn start_async_read(&self) -> Result<()> {
        Ok(())
    }

    fn stop_async_read(&self) -> Result<()> {
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn available(&self) -> usize {
        0
    }

    fn get_stats(&self) -> TransportStats {
        *self.stats.lock().unwrap()
    }

    fn reset_stats(&self) {
        *self.stats.lock().unwrap() = TransportStats::default();
    }

    fn state(&self) -> TransportState {
        self.inner.lock().unwrap().state
    }

    fn port_name(&self) -> String {
        self.inner.lock().unwrap().config.port_name.clone()
    }

    fn set_data_received_callback(&self, callback: DataReceivedCallback) {
        *self.data_cb.lock().unwrap() = Some(callback);
    }

    fn set_state_changed_callback(&self, callback: StateChangedCallback) {
        *self.state_cb.lock().unwrap() = Some(callback);
    }

    fn set_error_callback(&self, callback: ErrorOccurredCallback) {
        *self.error_cb.lock().unwrap() = Some(callback);
    }
}
