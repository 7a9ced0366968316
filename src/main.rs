//! Minimal command-line harness: opens a configured endpoint, optionally
//! runs the reliable handshake, then tears down. No GUI shell here.

use portmaster_core::cache::ReceiveCache;
use portmaster_core::config::Config;
use portmaster_core::log;
use portmaster_core::session::PortSessionController;
use portmaster_core::transport::loopback::LoopbackTransport;
use portmaster_core::transport::printer::PrinterTransport;
use portmaster_core::transport::serial::SerialTransport;
use portmaster_core::transport::tcp::TcpTransport;
use portmaster_core::transport::udp::UdpTransport;
use portmaster_core::transport::{PortType, SharedTransport};
use std::sync::Arc;

fn build_transport(port_type: PortType) -> SharedTransport {
    match port_type {
        PortType::Serial => Arc::new(SerialTransport::new()),
        PortType::Tcp => Arc::new(TcpTransport::new()),
        PortType::Udp => Arc::new(UdpTransport::new()),
        PortType::Parallel | PortType::UsbPrint | PortType::NetworkPrint => Arc::new(PrinterTransport::new()),
        PortType::Loopback => Arc::new(LoopbackTransport::new()),
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let config_path = args.get(1).cloned().unwrap_or_else(|| "portmaster.conf".to_string());
    let reliable_mode = args.iter().any(|a| a == "--reliable");

    let config = match Config::new(&config_path) {
        Ok(c) => c,
        Err(e) => {
            log::error(&format!("failed to read config {}: {}", config_path, e));
            std::process::exit(1);
        }
    };

    let port_type = match config.get("port.type").map(|s| s.as_str()) {
        Some("serial") => PortType::Serial,
        Some("tcp") => PortType::Tcp,
        Some("udp") => PortType::Udp,
        Some("printer") => PortType::UsbPrint,
        _ => PortType::Loopback,
    };

    let transport = build_transport(port_type);
    let transport_config = config.transport_config(port_type);
    let reliable_config = config.reliable_config();

    let cache = Arc::new(ReceiveCache::new());
    let controller = PortSessionController::new(transport, cache);

    if let Err(e) = controller.mark_ready() {
        log::error(&e.to_string());
        std::process::exit(2);
    }
    if let Err(e) = controller.connect(&transport_config, reliable_mode, reliable_config) {
        log::error(&format!("failed to open transport: {}", e));
        std::process::exit(2);
    }

    log::info(&format!("connected (reliable={})", reliable_mode));

    if reliable_mode {
        if let Some(channel) = controller.reliable_channel() {
            if let Err(e) = channel.ensure_session_started() {
                log::error(&format!("handshake failed: {}", e));
                std::process::exit(3);
            }
        }
    }

    let _ = controller.disconnect();
}
