//! Serial (COM port) transport backend: a raw fd opened with `O_NONBLOCK`,
//! configured through POSIX termios, with VTIME/VMIN driving the read
//! deadline. Adds an async-read worker, callback delivery, and DTR/RTS/CTS/DSR
//! line control on top of plain open/read/write/close.

use super::termios::{get_termios, set_termios};
use super::{
    DataReceivedCallback, Error, ErrorKind, ErrorOccurredCallback, Result, StateChangedCallback,
    Transport, TransportConfig, TransportState, TransportStats,
};
use nix::fcntl::{self, OFlag};
use nix::sys::stat::Mode;
use nix::sys::termios::{
    cfsetispeed, cfsetospeed, BaudRate, ControlFlags, InputFlags, LocalFlags, OutputFlags,
    SpecialCharacterIndices,
};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const TIOCM_DTR: libc::c_int = 0x002;
const TIOCM_RTS: libc::c_int = 0x004;
const TIOCM_CTS: libc::c_int = 0x020;
const TIOCM_DSR: libc::c_int = 0x100;

fn baud_rate_from_u32(baud: u32) -> BaudRate {
    match baud {
        1200 => BaudRate::B1200,
        2400 => BaudRate::B2400,
        4800 => BaudRate::B4800,
        9600 => BaudRate::B9600,
        19200 => BaudRate::B19200,
        38400 => BaudRate::B38400,
        57600 => BaudRate::B57600,
        115200 => BaudRate::B115200,
        230400 => BaudRate::B230400,
        _ => BaudRate::B9600,
    }
}

struct Inner {
    fd: Option<RawFd>,
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

pub struct SerialTransport {
    shared: Arc<Shared>,
}

impl SerialTransport {
    pub fn new() -> SerialTransport {
        SerialTransport {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    fd: None,
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

    fn raw_write(fd: RawFd, data: &[u8]) -> nix::Result<usize> {
        nix::unistd::write(fd, data)
    }

    fn raw_read(fd: RawFd, buf: &mut [u8]) -> nix::Result<usize> {
        nix::unistd::read(fd, buf)
    }

    fn modem_bits(fd: RawFd) -> libc::c_int {
        let mut bits: libc::c_int = 0;
        unsafe {
            libc::ioctl(fd, libc::TIOCMGET, &mut bits as *mut libc::c_int);
        }
        bits
    }

    fn modem_set(fd: RawFd, bit: libc::c_int, on: bool) {
        unsafe {
            let cmd = if on { libc::TIOCMBIS } else { libc::TIOCMBIC };
            let mut arg = bit;
            libc::ioctl(fd, cmd, &mut arg as *mut libc::c_int);
        }
    }

    fn fd(&self) -> Result<RawFd> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .fd
            .ok_or_else(|| Error::new(ErrorKind::NotOpen, "serial port is not open"))
    }

    pub fn set_dtr(&self, on: bool) -> Result<()> {
        Self::modem_set(self.fd()?, TIOCM_DTR, on);
        Ok(())
    }

    pub fn set_rts(&self, on: bool) -> Result<()> {
        Self::modem_set(self.fd()?, TIOCM_RTS, on);
        Ok(())
    }

    pub fn get_cts(&self) -> Result<bool> {
        Ok(Self::modem_bits(self.fd()?) & TIOCM_CTS != 0)
    }

    pub fn get_dsr(&self) -> Result<bool> {
        Ok(Self::modem_bits(self.fd()?) & TIOCM_DSR != 0)
    }
}

impl Transport for SerialTransport {
    fn open(&self, config: &TransportConfig) -> Result<()> {
        {
            let inner = self.shared.inner.lock().unwrap();
            if inner.state != TransportState::Closed && inner.state != TransportState::Error {
                return Err(Error::new(ErrorKind::AlreadyOpen, "serial port already open"));
            }
        }
        self.shared.set_state(TransportState::Opening);

        let fd = match fcntl::open(
            Path::new(&config.port_name),
            OFlag::O_NOCTTY | OFlag::O_RDWR | OFlag::O_NONBLOCK,
            Mode::empty(),
        ) {
            Ok(fd) => fd,
            Err(e) => {
                self.shared.set_state(TransportState::Error);
                return Err(Error::from(e));
            }
        };

        let configure = || -> Result<()> {
            let mut settings = get_termios(fd)?;
            settings.control_flags &= !ControlFlags::PARENB;
            settings.control_flags &= !ControlFlags::CSTOPB;
            settings.control_flags &= !ControlFlags::CSIZE;
            settings.control_flags |= ControlFlags::CS8;
            settings.control_flags &= !ControlFlags::CRTSCTS;
            settings.control_flags |= ControlFlags::CREAD | ControlFlags::CLOCAL;
            settings.local_flags &= !LocalFlags::ICANON;
            settings.local_flags &= !LocalFlags::ECHO;
            settings.local_flags &= !LocalFlags::ECHOE;
            settings.local_flags &= !LocalFlags::ECHONL;
            settings.local_flags &= !LocalFlags::ISIG;
            settings.input_flags &= !(InputFlags::IXON | InputFlags::IXOFF | InputFlags::IXANY);
            settings.input_flags &= !(InputFlags::IGNBRK
                | InputFlags::BRKINT
                | InputFlags::PARMRK
                | InputFlags::ISTRIP
                | InputFlags::INLCR
                | InputFlags::ICRNL);
            settings.output_flags &= !OutputFlags::OPOST;
            settings.output_flags &= !OutputFlags::ONLCR;

            if config.parity == super::Parity::Even {
                settings.control_flags |= ControlFlags::PARENB;
            } else if config.parity == super::Parity::Odd {
                settings.control_flags |= ControlFlags::PARENB | ControlFlags::PARODD;
            }
            if config.stop_bits == super::StopBits::Two {
                settings.control_flags |= ControlFlags::CSTOPB;
            }
            if config.flow_control == super::FlowControl::Hardware {
                settings.control_flags |= ControlFlags::CRTSCTS;
            } else if config.flow_control == super::FlowControl::Software {
                settings.input_flags |= InputFlags::IXON | InputFlags::IXOFF;
            }

            let vtime = {
                let secs = config.read_timeout.as_secs_f32();
                if secs > 25.5 {
                    255
                } else {
                    (secs * 10.0) as u8
                }
            };
            settings.control_chars[SpecialCharacterIndices::VTIME as usize] = vtime;
            settings.control_chars[SpecialCharacterIndices::VMIN as usize] = 0;

            let baud = baud_rate_from_u32(config.baud_rate);
            cfsetospeed(&mut settings, baud)?;
            cfsetispeed(&mut settings, baud)?;
            set_termios(fd, &settings)?;
            Ok(())
        };

        if let Err(e) = configure() {
            let _ = nix::unistd::close(fd);
            self.shared.set_state(TransportState::Error);
            return Err(e);
        }

        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.fd = Some(fd);
            inner.config = config.clone();
        }
        self.shared.set_state(TransportState::Open);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.stop_async_read()?;
        let fd = { self.shared.inner.lock().unwrap().fd.take() };
        if let Some(fd) = fd {
            self.shared.set_state(TransportState::Closing);
            let _ = nix::unistd::close(fd);
        }
        self.shared.set_state(TransportState::Closed);
        Ok(())
    }

    fn write(&self, bytes: &[u8]) -> Result<usize> {
        let (fd, timeout) = {
            let inner = self.shared.inner.lock().unwrap();
            let fd = inner
                .fd
                .ok_or_else(|| Error::new(ErrorKind::NotOpen, "serial port is not open"))?;
            (fd, inner.config.write_timeout)
        };

        let deadline = std::time::Instant::now() + timeout.max(Duration::from_millis(1));
        loop {
            match Self::raw_write(fd, bytes) {
                Ok(n) => {
                    let mut stats = self.shared.stats.lock().unwrap();
                    stats.bytes_sent += n as u64;
                    stats.packets_sent += 1;
                    return Ok(n);
                }
                Err(nix::errno::Errno::EAGAIN) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(Error::new(ErrorKind::Timeout, "serial write timed out"));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    self.shared.report_error(ErrorKind::WriteFailed, &e.desc().to_string());
                    return Err(Error::from(e));
                }
            }
        }
    }

    fn read(&self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let fd = self.fd()?;
        let deadline = std::time::Instant::now() + timeout;
        loop {
            match Self::raw_read(fd, buf) {
                Ok(0) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(Error::new(ErrorKind::Timeout, "serial read timed out"));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Ok(n) => {
                    let mut stats = self.shared.stats.lock().unwrap();
                    stats.bytes_received += n as u64;
                    stats.packets_received += 1;
                    return Ok(n);
                }
                Err(nix::errno::Errno::EAGAIN) => {
                    if std::time::Instant::now() >= deadline {
                        return Err(Error::new(ErrorKind::Timeout, "serial read timed out"));
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    fn start_async_read(&self) -> Result<()> {
        if self.shared.async_running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let fd = match self.fd() {
            Ok(fd) => fd,
            Err(e) => {
                self.shared.async_running.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        let shared = self.shared.clone();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 4096];
            while shared.async_running.load(Ordering::SeqCst) {
                match Self::raw_read(fd, &mut buf) {
                    Ok(0) => thread::sleep(Duration::from_millis(10)),
                    Ok(n) => {
                        {
                            let mut stats = shared.stats.lock().unwrap();
                            stats.bytes_received += n as u64;
                            stats.packets_received += 1;
                        }
                        shared.deliver(&buf[..n]);
                    }
                    Err(nix::errno::Errno::EAGAIN) => thread::sleep(Duration::from_millis(10)),
                    Err(e) => {
                        shared.report_error(ErrorKind::ReadFailed, &e.desc().to_string());
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
        let fd = self.fd()?;
        nix::sys::termios::tcflush(fd, nix::sys::termios::FlushArg::TCIOFLUSH).map_err(Error::from)
    }

    fn available(&self) -> usize {
        let fd = match self.fd() {
            Ok(fd) => fd,
            Err(_) => return 0,
        };
        let mut bytes: libc::c_int = 0;
        unsafe {
            libc::ioctl(fd, libc::FIONREAD, &mut bytes as *mut libc::c_int);
        }
        bytes.max(0) as usize
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
        self.shared.inner.lock().unwrap().config.port_name.clone()
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

impl Drop for SerialTransport {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
