//! Binds a `Transport` to an optional `ReliableChannel` and owns the
//! application-level connection state machine. The data callback either
//! feeds a `ReceiveCache` directly (raw mode) or is left alone so the
//! reliable channel's own process loop can pick frames off the transport
//! itself (reliable mode).

use crate::cache::ReceiveCache;
use crate::reliable::{ReliableChannel, ReliableConfig};
use crate::transport::{self, SharedTransport, TransportConfig};
use std::fmt;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    Initializing,
    Ready,
    Connecting,
    Connected,
    Transmitting,
    Paused,
    Disconnecting,
    Error,
    Shutdown,
}

impl ApplicationState {
    /// Whether `to` is a permitted transition from this state. Transitions
    /// not in this table are rejected.
    fn can_transition_to(self, to: ApplicationState) -> bool {
        use ApplicationState::*;
        matches!(
            (self, to),
            (Initializing, Ready)
                | (Ready, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connected, Transmitting)
                | (Connected, Disconnecting)
                | (Transmitting, Connected)
                | (Transmitting, Paused)
                | (Transmitting, Error)
                | (Paused, Transmitting)
                | (Paused, Disconnecting)
                | (Disconnecting, Ready)
                | (Error, Ready)
                | (Error, Disconnecting)
                | (_, Shutdown)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidTransition,
    TransportError,
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

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Error {
        Error::new(ErrorKind::TransportError, e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub struct PortSessionController {
    transport: SharedTransport,
    reliable_channel: Mutex<Option<Arc<ReliableChannel>>>,
    cache: Arc<ReceiveCache>,
    state: Mutex<ApplicationState>,
}

impl PortSessionController {
    pub fn new(transport: SharedTransport, cache: Arc<ReceiveCache>) -> PortSessionController {
        PortSessionController {
            transport,
            reliable_channel: Mutex::new(None),
            cache,
            state: Mutex::new(ApplicationState::Initializing),
        }
    }

    pub fn state(&self) -> ApplicationState {
        *self.state.lock().unwrap()
    }

    fn transition(&self, to: ApplicationState) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !state.can_transition_to(to) {
            return Err(Error::new(
                ErrorKind::InvalidTransition,
                format!("{:?} -> {:?} is not a permitted transition", *state, to),
            ));
        }
        *state = to;
        Ok(())
    }

    pub fn mark_ready(&self) -> Result<()> {
        self.transition(ApplicationState::Ready)
    }

    /// Opens the transport and, if `reliable_mode`, constructs and connects
    /// a `ReliableChannel` on top of it. Installs the data callback that
    /// either forwards raw bytes into the receive cache or lets the
    /// reliable channel's own process thread consume the transport.
    pub fn connect(&self, config: &TransportConfig, reliable_mode: bool, reliable_config: ReliableConfig) -> Result<()> {
        self.transition(ApplicationState::Connecting)?;

        if let Err(e) = self.transport.open(config) {
            let _ = self.transition(ApplicationState::Error);
            return Err(Error::from(e));
        }

        if reliable_mode {
            let channel = Arc::new(ReliableChannel::new(self.transport.clone(), reliable_config));
            channel.connect().map_err(|e| Error::new(ErrorKind::TransportError, e.to_string()))?;
            *self.reliable_channel.lock().unwrap() = Some(channel);
        } else {
            let cache = self.cache.clone();
            if !cache.is_initialized() {
                let _ = cache.initialize();
            }
            self.transport
                .set_data_received_callback(Box::new(move |data: &[u8]| {
                    let _ = cache.append_data(data);
                }));
            self.transport.start_async_read().map_err(Error::from)?;
        }

        self.transition(ApplicationState::Connected)?;
        Ok(())
    }

    pub fn start_receive_session(&self) -> Result<()> {
        self.transport.start_async_read().map_err(Error::from)
    }

    /// Tears both layers down in reverse order: reliable channel first
    /// (joins its workers), then the transport.
    pub fn disconnect(&self) -> Result<()> {
        self.transition(ApplicationState::Disconnecting)?;
        if let Some(channel) = self.reliable_channel.lock().unwrap().take() {
            channel.shutdown();
        }
        let _ = self.transport.close();
        self.transition(ApplicationState::Ready)
    }

    pub fn reliable_channel(&self) -> Option<Arc<ReliableChannel>> {
        self.reliable_channel.lock().unwrap().clone()
    }

    pub fn transport(&self) -> SharedTransport {
        self.transport.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_transitions_outside_the_table() {
        let state = ApplicationState::Initializing;
        assert!(state.can_transition_to(ApplicationState::Ready));
        assert!(!state.can_transition_to(ApplicationState::Transmitting));
    }

    #[test]
    fn any_state_can_shut_down() {
        assert!(ApplicationState::Connected.can_transition_to(ApplicationState::Shutdown));
        assert!(ApplicationState::Error.can_transition_to(ApplicationState::Shutdown));
    }
}
