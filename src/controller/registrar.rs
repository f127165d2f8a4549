//! Registration with the management server.

use crate::config::{RegistrationConfig, ServerUrl};
use log::{debug, info, warn};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// Management-server registration.
///
/// `register` is bounded: it makes its own limited retries and returns.
pub trait Registrar: Send + Sync {
    fn register(&self) -> bool;

    /// Tell the server the device is going away. Best effort.
    fn deregister(&self) {}
}

/// Treats a reachable management server as a successful registration.
///
/// With no server configured every registration succeeds, which suits
/// development without a management backend.
#[derive(Debug, Clone)]
pub struct TcpProbeRegistrar {
    server: Option<ServerUrl>,
    attempts: u32,
    timeout: Duration,
}

impl TcpProbeRegistrar {
    pub fn new(config: &RegistrationConfig) -> Self {
        Self {
            server: config.server.clone(),
            attempts: config.attempts.max(1),
            timeout: config.attempt_timeout(),
        }
    }

    fn probe(&self, server: &ServerUrl) -> bool {
        let addrs = match server.address().to_socket_addrs() {
            Ok(addrs) => addrs,
            Err(e) => {
                warn!("Cannot resolve management server {}: {}", server, e);
                return false;
            }
        };
        addrs
            .into_iter()
            .any(|addr| TcpStream::connect_timeout(&addr, self.timeout).is_ok())
    }
}

impl Registrar for TcpProbeRegistrar {
    fn register(&self) -> bool {
        let Some(server) = &self.server else {
            debug!("No management server configured, registering locally");
            return true;
        };

        for attempt in 1..=self.attempts {
            if self.probe(server) {
                info!("Registered with {} (attempt {})", server, attempt);
                return true;
            }
            debug!("Registration attempt {} to {} failed", attempt, server);
        }
        warn!(
            "Registration with {} failed after {} attempts",
            server, self.attempts
        );
        false
    }

    fn deregister(&self) {
        if let Some(server) = &self.server {
            info!("Deregistering from {}", server);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn config(server: Option<ServerUrl>) -> RegistrationConfig {
        RegistrationConfig {
            server,
            attempts: 2,
            attempt_timeout_ms: 200,
        }
    }

    #[test]
    fn test_no_server_registers() {
        assert!(TcpProbeRegistrar::new(&config(None)).register());
    }

    #[test]
    fn test_reachable_server_registers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = ServerUrl::new("127.0.0.1", port).unwrap();
        assert!(TcpProbeRegistrar::new(&config(Some(url))).register());
    }

    #[test]
    fn test_unreachable_server_fails() {
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let url = ServerUrl::new("127.0.0.1", port).unwrap();
        assert!(!TcpProbeRegistrar::new(&config(Some(url))).register());
    }
}
