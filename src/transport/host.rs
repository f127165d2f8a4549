//! std::net links.
//!
//! Works on host directly and on ESP32 through ESP-IDF's lwIP sockets, as long
//! as the network is up (the caller's [`NetworkProvider`] decides).

use super::{ConnectError, Connector, Link, LinkError};
use crate::config::{ServerUrl, TransportMode};
use crate::network::NetworkProvider;
use log::{debug, error, info, warn};
use std::io::Write;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

/// Opens TCP or UDP links with std::net.
pub struct HostConnector {
    network: Arc<dyn NetworkProvider>,
    write_timeout: Duration,
}

impl HostConnector {
    /// `write_timeout` bounds a single socket write; the per-send budget in
    /// [`DatagramTransport`](super::DatagramTransport) bounds the retries.
    pub fn new(network: Arc<dyn NetworkProvider>, write_timeout: Duration) -> Self {
        Self {
            network,
            write_timeout,
        }
    }

    fn resolve(url: &ServerUrl) -> Result<SocketAddr, ConnectError> {
        url.address()
            .to_socket_addrs()
            .map_err(|e| {
                error!("DNS resolution failed for {}: {}", url.host(), e);
                ConnectError::Dns(e)
            })?
            .next()
            .ok_or_else(|| {
                error!("No addresses found for {}", url.host());
                ConnectError::NoAddresses
            })
    }
}

impl Connector for HostConnector {
    fn connect(
        &self,
        mode: TransportMode,
        url: &ServerUrl,
        timeout: Duration,
    ) -> Result<Box<dyn Link>, ConnectError> {
        if !self.network.is_connected() {
            return Err(ConnectError::NetworkUnavailable);
        }

        let addr = Self::resolve(url)?;
        debug!("Resolved {} to {}", url.host(), addr);

        let link = match mode {
            TransportMode::Tcp => {
                let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| {
                    error!("TCP connection failed to {}: {}", addr, e);
                    ConnectError::Connect(e)
                })?;
                if let Err(e) = stream.set_write_timeout(Some(self.write_timeout)) {
                    warn!("Failed to set write timeout: {}", e);
                }
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to disable Nagle's algorithm: {}", e);
                }
                HostLink::Tcp(stream)
            }
            TransportMode::Udp => {
                let local: SocketAddr = if addr.is_ipv4() {
                    ([0, 0, 0, 0], 0).into()
                } else {
                    (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(local).map_err(ConnectError::Socket)?;
                socket.connect(addr).map_err(ConnectError::Connect)?;
                if let Err(e) = socket.set_write_timeout(Some(self.write_timeout)) {
                    warn!("Failed to set write timeout: {}", e);
                }
                HostLink::Udp(socket)
            }
        };

        info!("Audio link open: {} {}", mode, addr);
        Ok(Box::new(link))
    }
}

/// A connected std::net socket.
#[derive(Debug)]
pub enum HostLink {
    Tcp(TcpStream),
    Udp(UdpSocket),
    Closed(TransportMode),
}

impl Link for HostLink {
    fn send(&mut self, data: &[u8]) -> Result<usize, LinkError> {
        match self {
            Self::Tcp(stream) => match stream.write(data) {
                Ok(0) if !data.is_empty() => Err(LinkError::ConnectionLost),
                Ok(n) => Ok(n),
                Err(e) => Err(e.into()),
            },
            Self::Udp(socket) => socket.send(data).map_err(LinkError::from),
            Self::Closed(_) => Err(LinkError::NoSocket),
        }
    }

    fn close(&mut self) {
        let mode = self.mode();
        if let Self::Tcp(stream) = self {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        *self = Self::Closed(mode);
    }

    fn mode(&self) -> TransportMode {
        match self {
            Self::Tcp(_) => TransportMode::Tcp,
            Self::Udp(_) => TransportMode::Udp,
            Self::Closed(mode) => *mode,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::HostNetwork;
    use std::io::Read;
    use std::net::TcpListener;

    fn connector(online: bool) -> HostConnector {
        let network = HostNetwork::new();
        network.set_available(online);
        HostConnector::new(Arc::new(network), Duration::from_millis(200))
    }

    #[test]
    fn test_offline_network_is_reported() {
        let url = ServerUrl::new("127.0.0.1", 9).unwrap();
        let result = connector(false).connect(TransportMode::Udp, &url, Duration::from_secs(1));
        assert!(matches!(result, Err(ConnectError::NetworkUnavailable)));
    }

    #[test]
    fn test_udp_link_delivers_datagram() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let url = ServerUrl::new("127.0.0.1", port).unwrap();

        let mut link = connector(true)
            .connect(TransportMode::Udp, &url, Duration::from_secs(1))
            .unwrap();
        assert_eq!(link.mode(), TransportMode::Udp);
        assert_eq!(link.send(&[1, 2, 3, 4]).unwrap(), 4);

        let mut buf = [0u8; 16];
        let n = server.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3, 4]);

        link.close();
        assert_eq!(link.send(&[1]), Err(LinkError::NoSocket));
    }

    #[test]
    fn test_tcp_link_delivers_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let url = ServerUrl::new("127.0.0.1", port).unwrap();

        let mut link = connector(true)
            .connect(TransportMode::Tcp, &url, Duration::from_secs(1))
            .unwrap();
        let (mut peer, _) = listener.accept().unwrap();

        let payload = vec![7u8; 64];
        let mut written = 0;
        while written < payload.len() {
            written += link.send(&payload[written..]).unwrap();
        }
        link.close();

        let mut received = Vec::new();
        peer.read_to_end(&mut received).unwrap();
        assert_eq!(received, payload);
    }

    #[test]
    fn test_tcp_connect_refused() {
        // Bind then drop to get a port nobody listens on.
        let port = TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let url = ServerUrl::new("127.0.0.1", port).unwrap();
        let result = connector(true).connect(TransportMode::Tcp, &url, Duration::from_secs(1));
        assert!(matches!(result, Err(ConnectError::Connect(_))));
    }
}
