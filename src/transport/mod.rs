//! Network transport for audio datagrams.
//!
//! # Components
//!
//! - [`Link`] / [`Connector`] - driver seam: one connected socket and the
//!   thing that opens it
//! - [`HostConnector`] - std::net implementation (host and ESP-IDF lwIP)
//! - [`DatagramTransport`] - assembly buffer, time-boxed sends and
//!   failure-duration tracking on top of a [`Link`]

mod datagram;
mod host;

pub use datagram::{DatagramTransport, SendError};
pub use host::{HostConnector, HostLink};

use crate::config::{ServerUrl, TransportMode};
use std::fmt;
use std::io;
use std::time::Duration;

/// One connected socket. Only the sender worker writes to it.
pub trait Link: Send {
    /// Write some bytes; may write fewer than `data.len()`.
    fn send(&mut self, data: &[u8]) -> Result<usize, LinkError>;

    /// Close the socket. Further sends fail with [`LinkError::NoSocket`].
    fn close(&mut self);

    fn mode(&self) -> TransportMode;
}

/// Opens links to the audio server.
pub trait Connector: Send + Sync {
    /// Resolve `url` and connect within `timeout`.
    fn connect(
        &self,
        mode: TransportMode,
        url: &ServerUrl,
        timeout: Duration,
    ) -> Result<Box<dyn Link>, ConnectError>;
}

/// Error codes of a send on an open link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkError {
    /// Peer is not reachable.
    NoConnection,
    /// Established connection dropped.
    ConnectionLost,
    /// Socket is closed or was never opened.
    NoSocket,
    /// Send did not complete in time.
    Timeout,
}

impl LinkError {
    /// Fatal errors end the session at once; timeouts only count.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Timeout)
    }
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConnection => write!(f, "no connection"),
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::NoSocket => write!(f, "no socket"),
            Self::Timeout => write!(f, "send timed out"),
        }
    }
}

impl std::error::Error for LinkError {}

impl From<io::Error> for LinkError {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind::*;
        match e.kind() {
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof => {
                Self::ConnectionLost
            }
            NotConnected | ConnectionRefused | AddrNotAvailable => Self::NoConnection,
            // Everything else is treated as transient; sustained failures
            // still end the session through the failure-duration threshold.
            _ => Self::Timeout,
        }
    }
}

/// Errors opening a link.
#[derive(Debug)]
pub enum ConnectError {
    /// Network interface is down.
    NetworkUnavailable,
    /// DNS resolution failed.
    Dns(io::Error),
    /// Name resolved to no addresses.
    NoAddresses,
    /// Socket could not be created or configured.
    Socket(io::Error),
    /// Connect failed or timed out.
    Connect(io::Error),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NetworkUnavailable => write!(f, "network unavailable"),
            Self::Dns(e) => write!(f, "DNS resolution failed: {}", e),
            Self::NoAddresses => write!(f, "no addresses found for hostname"),
            Self::Socket(e) => write!(f, "socket open failed: {}", e),
            Self::Connect(e) => write!(f, "connection failed: {}", e),
        }
    }
}

impl std::error::Error for ConnectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dns(e) | Self::Socket(e) | Self::Connect(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted link and connector for tests.

    use super::*;
    use crate::clock::ManualClock;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Observable state shared between a [`FakeLink`] and the test.
    #[derive(Debug, Default)]
    pub struct LinkProbe {
        pub sent: Mutex<Vec<Vec<u8>>>,
        pub script: Mutex<VecDeque<Result<usize, LinkError>>>,
        /// Result for sends once the script is exhausted; `None` = accept all.
        pub fallback: Mutex<Option<LinkError>>,
        pub closed: AtomicBool,
        pub sends: AtomicUsize,
        /// Clock advanced by a fixed cost on every send.
        pub cost: Mutex<Option<(Arc<ManualClock>, u64)>>,
        /// Real time every send blocks for.
        pub delay: Mutex<Option<Duration>>,
    }

    impl LinkProbe {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn push(&self, result: Result<usize, LinkError>) {
            self.script.lock().unwrap().push_back(result);
        }

        pub fn fail_always(&self, error: LinkError) {
            *self.fallback.lock().unwrap() = Some(error);
        }

        pub fn charge(&self, clock: Arc<ManualClock>, us_per_send: u64) {
            *self.cost.lock().unwrap() = Some((clock, us_per_send));
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        pub fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().unwrap().clone()
        }
    }

    pub struct FakeLink {
        pub probe: Arc<LinkProbe>,
        pub mode: TransportMode,
    }

    impl Link for FakeLink {
        fn send(&mut self, data: &[u8]) -> Result<usize, LinkError> {
            self.probe.sends.fetch_add(1, Ordering::SeqCst);
            if let Some((clock, us)) = self.probe.cost.lock().unwrap().as_ref() {
                clock.advance_us(*us);
            }
            let delay = *self.probe.delay.lock().unwrap();
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            if self.probe.is_closed() {
                return Err(LinkError::NoSocket);
            }
            let scripted = self.probe.script.lock().unwrap().pop_front();
            let result = match scripted {
                Some(r) => r,
                None => match *self.probe.fallback.lock().unwrap() {
                    Some(e) => Err(e),
                    None => Ok(data.len()),
                },
            };
            if let Ok(n) = result {
                let n = n.min(data.len());
                self.probe.sent.lock().unwrap().push(data[..n].to_vec());
                return Ok(n);
            }
            result
        }

        fn close(&mut self) {
            self.probe.closed.store(true, Ordering::SeqCst);
        }

        fn mode(&self) -> TransportMode {
            self.mode
        }
    }

    /// Connector handing out [`FakeLink`]s; each connect gets a fresh probe.
    #[derive(Default)]
    pub struct FakeConnector {
        pub probes: Mutex<Vec<Arc<LinkProbe>>>,
        pub targets: Mutex<Vec<(TransportMode, ServerUrl)>>,
        pub refuse: AtomicBool,
        /// Applied to every new probe.
        pub fail_always: Mutex<Option<LinkError>>,
        /// Send delay applied to every new probe.
        pub send_delay: Mutex<Option<Duration>>,
    }

    impl FakeConnector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn last_probe(&self) -> Option<Arc<LinkProbe>> {
            self.probes.lock().unwrap().last().cloned()
        }

        pub fn targets(&self) -> Vec<(TransportMode, ServerUrl)> {
            self.targets.lock().unwrap().clone()
        }
    }

    impl Connector for FakeConnector {
        fn connect(
            &self,
            mode: TransportMode,
            url: &ServerUrl,
            _timeout: Duration,
        ) -> Result<Box<dyn Link>, ConnectError> {
            if self.refuse.load(Ordering::SeqCst) {
                return Err(ConnectError::Connect(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            let probe = LinkProbe::new();
            if let Some(e) = *self.fail_always.lock().unwrap() {
                probe.fail_always(e);
            }
            *probe.delay.lock().unwrap() = *self.send_delay.lock().unwrap();
            self.probes.lock().unwrap().push(probe.clone());
            self.targets.lock().unwrap().push((mode, url.clone()));
            Ok(Box::new(FakeLink { probe, mode }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timeout_is_transient() {
        assert!(!LinkError::Timeout.is_fatal());
        assert!(LinkError::ConnectionLost.is_fatal());
        assert!(LinkError::NoConnection.is_fatal());
        assert!(LinkError::NoSocket.is_fatal());
    }

    #[test]
    fn test_io_error_mapping() {
        let lost: LinkError = io::Error::from(io::ErrorKind::BrokenPipe).into();
        assert_eq!(lost, LinkError::ConnectionLost);
        let refused: LinkError = io::Error::from(io::ErrorKind::ConnectionRefused).into();
        assert_eq!(refused, LinkError::NoConnection);
        let slow: LinkError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(slow, LinkError::Timeout);
    }
}
