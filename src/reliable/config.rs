//! Protocol parameters and running counters for a `ReliableChannel`.

/// Protocol parameters negotiated (trivially — no renegotiation wire format
/// exists) once per session and held immutable for its lifetime.
#[derive(Debug, Clone, Copy)]
pub struct ReliableConfig {
    pub version: u8,
    pub window_size: u16,
    pub max_payload_size: u16,
    pub max_retries: u32,
    pub timeout_base_ms: u64,
    pub timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub enable_compression: bool,
    pub enable_encryption: bool,
}

impl Default for ReliableConfig {
    fn default() -> ReliableConfig {
        ReliableConfig {
            version: 1,
            window_size: 32,
            max_payload_size: 1024,
            max_retries: 3,
            timeout_base_ms: 5000,
            timeout_max_ms: 15000,
            heartbeat_interval_ms: 1000,
            enable_compression: false,
            enable_encryption: false,
        }
    }
}

impl ReliableConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.window_size == 0 || self.window_size > 256 {
            return Err(format!("window_size out of range: {}", self.window_size));
        }
        if self.max_payload_size == 0 {
            return Err("max_payload_size must be non-zero".to_string());
        }
        if self.timeout_base_ms == 0 || self.timeout_base_ms > self.timeout_max_ms {
            return Err("timeout_base_ms must be non-zero and <= timeout_max_ms".to_string());
        }
        Ok(())
    }
}

/// Counters accumulated over a `ReliableChannel`'s lifetime.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReliableStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_retransmitted: u64,
    pub packets_invalid: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub timeouts: u64,
    pub errors: u64,
}
