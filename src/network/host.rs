//! Host network provider.
//!
//! The OS handles networking. Availability can be switched off to exercise
//! the "no network" path without touching real interfaces.

use super::{NetworkError, NetworkProvider};
use log::info;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Host network provider.
pub struct HostNetwork {
    available: AtomicBool,
    ip_addr: Mutex<Option<IpAddr>>,
}

impl HostNetwork {
    pub fn new() -> Self {
        Self {
            available: AtomicBool::new(true),
            ip_addr: Mutex::new(None),
        }
    }

    /// Simulate the interface going down or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
        info!(
            "Host network {}",
            if available { "available" } else { "unavailable" }
        );
    }

    /// Local address of the default route.
    ///
    /// "Connecting" a UDP socket sends nothing but makes the OS pick the
    /// outgoing interface.
    fn detect_local_ip() -> Option<IpAddr> {
        use std::net::UdpSocket;

        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }
}

impl Default for HostNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkProvider for HostNetwork {
    fn connect(&self) -> Result<(), NetworkError> {
        let ip = Self::detect_local_ip();
        *self.ip_addr.lock().unwrap_or_else(|e| e.into_inner()) = ip;

        match ip {
            Some(ip) => info!("Host network ready, local IP: {}", ip),
            None => info!("Host network ready, no default route"),
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn ip_addr(&self) -> Option<IpAddr> {
        if !self.is_connected() {
            return None;
        }
        *self.ip_addr.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_network_available_by_default() {
        let network = HostNetwork::new();
        assert!(network.is_connected());
        assert!(network.connect().is_ok());
    }

    #[test]
    fn test_unavailable_hides_address() {
        let network = HostNetwork::new();
        network.connect().unwrap();
        network.set_available(false);
        assert!(!network.is_connected());
        assert_eq!(network.ip_addr(), None);

        network.set_available(true);
        assert!(network.is_connected());
    }
}
