//! HTTP stats server for node monitoring.
//!
//! `GET /stats` returns the node status as JSON. Uses `tiny_http`, which runs
//! on both host and ESP32 (via std::net).
//!
//! # Example Response
//!
//! ```json
//! {
//!   "uptime_secs": 3600,
//!   "mode": "ready",
//!   "wake_tick_counter": 12,
//!   "streaming": true,
//!   "external_power": false,
//!   "ip_addr": "192.168.1.40",
//!   "last_session_end": null,
//!   "diagnostics": { "total_datagrams": 90210, "send_failures": 0, ... }
//! }
//! ```

use crate::diagnostics::DiagnosticsSnapshot;
use log::{error, info, warn};
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tiny_http::{Header, Method, Request, Response, Server};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Status document served at `/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStatus {
    pub uptime_secs: u64,
    /// Current mode, `"asleep"` between modes.
    pub mode: String,
    pub wake_tick_counter: u32,
    pub streaming: bool,
    pub external_power: bool,
    /// Local address, `null` while the network is down.
    pub ip_addr: Option<IpAddr>,
    pub last_session_end: Option<String>,
    pub diagnostics: DiagnosticsSnapshot,
}

/// Produces a fresh [`NodeStatus`] per request.
pub trait StatusSource: Send + Sync {
    fn status(&self) -> NodeStatus;
}

/// HTTP stats server.
///
/// Runs in a background thread. Drop it to stop the server.
pub struct StatsServer {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
    local_addr: Option<SocketAddr>,
}

impl StatsServer {
    /// Start serving on `bind_addr:port` (`None` binds all interfaces; port 0
    /// picks a free port).
    pub fn start(
        bind_addr: Option<IpAddr>,
        port: u16,
        source: Arc<dyn StatusSource>,
    ) -> Result<Self, std::io::Error> {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, format!("{}", e)))?;
        let local_addr = server.server_addr().to_ip();

        info!(
            "Stats server listening on http://{}/stats",
            local_addr.map_or(addr, |a| a.to_string())
        );

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::Builder::new()
            .name("stats-server".into())
            .spawn(move || run_server(server, source, shutdown_clone))?;

        Ok(Self {
            handle: Some(handle),
            shutdown,
            local_addr,
        })
    }

    /// Bound address, useful when started on port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Stop the server. Takes up to one poll interval.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

fn header(name: &str, value: &str) -> Option<Header> {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).ok()
}

fn respond(request: Request, mut response: Response<std::io::Cursor<Vec<u8>>>, extra: Option<Header>) {
    if let Some(h) = extra {
        response.add_header(h);
    }
    let status = response.status_code().0;
    if let Err(e) = request.respond(response) {
        warn!("Failed to send {} response: {}", status, e);
    }
}

fn run_server(server: Server, source: Arc<dyn StatusSource>, shutdown: Arc<AtomicBool>) {
    loop {
        if shutdown.load(Ordering::Acquire) {
            info!("Stats server shutting down");
            break;
        }

        let request = match server.recv_timeout(POLL_INTERVAL) {
            Ok(Some(request)) => request,
            Ok(None) => continue,
            Err(e) => {
                error!("Stats server error: {}", e);
                break;
            }
        };

        if request.method() != &Method::Get {
            let response = Response::from_string("Method Not Allowed").with_status_code(405);
            respond(request, response, header("Allow", "GET"));
            continue;
        }

        match request.url() {
            "/stats" | "/stats/" => match serde_json::to_string(&source.status()) {
                Ok(json) => {
                    let response = Response::from_string(json).with_status_code(200);
                    respond(request, response, header("Content-Type", "application/json"));
                }
                Err(e) => {
                    error!("Failed to encode status: {}", e);
                    let response = Response::from_string("Internal Error").with_status_code(500);
                    respond(request, response, None);
                }
            },
            "/" => {
                let response =
                    Response::from_string("See /stats for node statistics").with_status_code(302);
                respond(request, response, header("Location", "/stats"));
            }
            _ => {
                let response = Response::from_string("Not Found").with_status_code(404);
                respond(request, response, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::Diagnostics;
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpStream};

    struct FixedStatus(Diagnostics);

    impl StatusSource for FixedStatus {
        fn status(&self) -> NodeStatus {
            NodeStatus {
                uptime_secs: 42,
                mode: "ready".into(),
                wake_tick_counter: 3,
                streaming: false,
                external_power: true,
                ip_addr: Some(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40))),
                last_session_end: Some("requested".into()),
                diagnostics: self.0.snapshot(),
            }
        }
    }

    fn server() -> StatsServer {
        StatsServer::start(
            Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            0,
            Arc::new(FixedStatus(Diagnostics::new())),
        )
        .unwrap()
    }

    fn request(server: &StatsServer, method: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(server.local_addr().unwrap()).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        write!(
            stream,
            "{} {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            method, path
        )
        .unwrap();
        let mut response = String::new();
        let _ = stream.read_to_string(&mut response);
        response
    }

    #[test]
    fn test_stats_returns_json() {
        let server = server();
        let response = request(&server, "GET", "/stats");
        assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
        assert!(response.contains("application/json"));
        assert!(response.contains("\"mode\":\"ready\""));
        assert!(response.contains("\"wake_tick_counter\":3"));
        assert!(response.contains("\"ip_addr\":\"192.168.1.40\""));
        assert!(response.contains("\"diagnostics\":{"));
    }

    #[test]
    fn test_root_redirects() {
        let server = server();
        let response = request(&server, "GET", "/");
        assert!(response.starts_with("HTTP/1.1 302"), "{}", response);
        assert!(response.contains("Location: /stats"));
    }

    #[test]
    fn test_other_paths_and_methods() {
        let server = server();
        assert!(request(&server, "GET", "/nope").starts_with("HTTP/1.1 404"));
        assert!(request(&server, "POST", "/stats").starts_with("HTTP/1.1 405"));
    }

    #[test]
    fn test_stop_joins_thread() {
        let mut server = server();
        server.stop();
        assert!(server.handle.is_none());
    }
}
