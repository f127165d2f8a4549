//! Audio session lifecycle.
//!
//! ```text
//! capture event ──▶ codec.encode_block ──▶ on_datagram_ready ──▶ ReadySignal
//!                                                                   │
//!                 DatagramTransport ◀── take_ready_datagram ◀── sender worker
//! ```
//!
//! One session at a time. Starting acquires, in order: link, codec, sender
//! worker, capture; any failure unwinds what was acquired. Stopping releases
//! in the order that keeps the socket valid while anything can still write
//! to it:
//!
//! 1. stop capture (no new blocks)
//! 2. wait the drain interval (in-flight encoding settles)
//! 3. signal and join the sender worker, which hands back the transport
//! 4. close the socket
//! 5. mark the session idle
//!
//! Transport failures and duration expiry stop the session through the event
//! queue, the same path an explicit stop takes.

use super::capture::{CaptureHandler, CaptureSource};
use super::codec::{Codec, CodecEvents};
use super::signal::{ready_signal, ReadyNotifier, ReadyWaiter};
use crate::clock::MonotonicClock;
use crate::config::{AudioConfig, CaptureConfig, TransportTuning};
use crate::diagnostics::Diagnostics;
use crate::scheduler::{EventId, EventQueue};
use crate::transport::{ConnectError, Connector, DatagramTransport, SendError};
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Period of the bytes-per-second roll.
const THROUGHPUT_PERIOD: Duration = Duration::from_secs(1);

/// Lifecycle state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Starting,
    Active,
    Stopping,
}

/// Why the last session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// Explicit stop (remote write, shutdown).
    Requested,
    /// Configured duration limit elapsed.
    DurationElapsed,
    /// Fatal or sustained transport failure.
    TransportFailure,
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Requested => "requested",
            Self::DurationElapsed => "duration elapsed",
            Self::TransportFailure => "transport failure",
        };
        write!(f, "{}", name)
    }
}

/// Shared dependencies of the pipeline.
pub struct PipelineDeps {
    pub queue: Arc<EventQueue>,
    pub connector: Arc<dyn Connector>,
    pub codec: Arc<dyn Codec>,
    pub capture: Box<dyn CaptureSource>,
    pub clock: Arc<dyn MonotonicClock>,
    pub diagnostics: Arc<Diagnostics>,
}

/// Real-time audio path from capture to network.
pub struct AudioPipeline {
    this: Weak<AudioPipeline>,
    lifecycle: Mutex<Lifecycle>,
    state: Mutex<SessionState>,
    pending: Mutex<AudioConfig>,
    generation: AtomicU64,
    queue: Arc<EventQueue>,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn Codec>,
    clock: Arc<dyn MonotonicClock>,
    diagnostics: Arc<Diagnostics>,
    tuning: TransportTuning,
}

struct Lifecycle {
    capture: Box<dyn CaptureSource>,
    session: Option<ActiveSession>,
    last_config: Option<AudioConfig>,
    last_end: Option<SessionEnd>,
}

struct ActiveSession {
    id: u64,
    config: AudioConfig,
    shutdown: CancellationToken,
    notifier: ReadyNotifier,
    worker: JoinHandle<DatagramTransport>,
    duration_event: Option<EventId>,
    throughput_event: EventId,
}

impl AudioPipeline {
    pub fn new(
        deps: PipelineDeps,
        initial: AudioConfig,
        tuning: TransportTuning,
        capture_config: &CaptureConfig,
    ) -> Arc<Self> {
        debug!(
            "Audio pipeline: {} Hz, {} samples per block",
            capture_config.sample_rate_hz, capture_config.block_samples
        );
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            lifecycle: Mutex::new(Lifecycle {
                capture: deps.capture,
                session: None,
                last_config: None,
                last_end: None,
            }),
            state: Mutex::new(SessionState::Idle),
            pending: Mutex::new(AudioConfig {
                streaming_enabled: false,
                ..initial
            }),
            generation: AtomicU64::new(0),
            queue: deps.queue,
            connector: deps.connector,
            codec: deps.codec,
            clock: deps.clock,
            diagnostics: deps.diagnostics,
            tuning,
        })
    }

    fn lock_lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> MutexGuard<'_, AudioConfig> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: SessionState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether a session is starting or running.
    pub fn is_streaming(&self) -> bool {
        matches!(self.state(), SessionState::Starting | SessionState::Active)
    }

    /// Parameters the next session will use.
    pub fn pending_config(&self) -> AudioConfig {
        self.lock_pending().clone()
    }

    /// Replace the pending parameters. A running session is not affected.
    pub fn set_pending_config(&self, config: AudioConfig) {
        *self.lock_pending() = config;
    }

    /// Edit the pending parameters in place.
    pub fn update_pending<F: FnOnce(&mut AudioConfig)>(&self, f: F) {
        f(&mut self.lock_pending());
    }

    /// Parameters of the running session, or of the last one (with
    /// `streaming_enabled` cleared) once it has stopped.
    pub fn active_config(&self) -> Option<AudioConfig> {
        let lifecycle = self.lock_lifecycle();
        match &lifecycle.session {
            Some(session) => Some(session.config.clone()),
            None => lifecycle.last_config.clone(),
        }
    }

    pub fn last_end(&self) -> Option<SessionEnd> {
        self.lock_lifecycle().last_end
    }

    /// Start a session from the pending parameters.
    pub fn start_from_pending(&self) -> Result<(), StartError> {
        let mut config = self.pending_config();
        config.streaming_enabled = true;
        self.start_session(config)
    }

    /// Start a session with a frozen copy of `config`.
    pub fn start_session(&self, mut config: AudioConfig) -> Result<(), StartError> {
        config.streaming_enabled = true;
        let mut lifecycle = self.lock_lifecycle();
        if lifecycle.session.is_some() {
            return Err(StartError::AlreadyActive);
        }

        self.set_state(SessionState::Starting);
        let id = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            "Starting audio session {}: {} to {}",
            id, config.transport_mode, config.server_url
        );

        match self.open_session(&mut lifecycle, id, config) {
            Ok(session) => {
                lifecycle.session = Some(session);
                self.lock_pending().streaming_enabled = true;
                self.set_state(SessionState::Active);
                Ok(())
            }
            Err(e) => {
                warn!("Audio session {} failed to start: {}", id, e);
                self.lock_pending().streaming_enabled = false;
                self.set_state(SessionState::Idle);
                Err(e)
            }
        }
    }

    fn open_session(
        &self,
        lifecycle: &mut Lifecycle,
        id: u64,
        config: AudioConfig,
    ) -> Result<ActiveSession, StartError> {
        self.diagnostics.reset();

        let mut link = self.connector.connect(
            config.transport_mode,
            &config.server_url,
            self.tuning.connect_timeout(),
        )?;

        let (notifier, waiter) = ready_signal();
        let events = Arc::new(SessionEvents {
            notifier: notifier.clone(),
            diagnostics: self.diagnostics.clone(),
        });
        if !self.codec.init(config.gain, events) {
            link.close();
            return Err(StartError::CodecInitFailure);
        }

        let transport = DatagramTransport::new(
            link,
            self.codec.datagram_len(),
            &self.tuning,
            self.clock.clone(),
            self.diagnostics.clone(),
        );

        let shutdown = CancellationToken::new();
        let worker = SenderWorker {
            session: id,
            transport,
            codec: self.codec.clone(),
            waiter,
            shutdown: shutdown.clone(),
            diagnostics: self.diagnostics.clone(),
            signal_wait: self.tuning.signal_wait(),
            pipeline: self.this.clone(),
            queue: self.queue.clone(),
        };
        let worker = std::thread::Builder::new()
            .name("audio-sender".into())
            .spawn(move || worker.run())
            .map_err(|e| {
                // The closure, and the link inside it, are dropped with the error.
                self.codec.deinit();
                StartError::WorkerSpawnFailure(e)
            })?;

        let handler = CaptureHandler::new(self.codec.clone(), self.diagnostics.clone());
        if let Err(e) = lifecycle.capture.start(handler) {
            shutdown.cancel();
            notifier.notify();
            match worker.join() {
                Ok(mut transport) => transport.close(),
                Err(_) => error!("Sender worker panicked"),
            }
            self.codec.deinit();
            return Err(StartError::CaptureStartFailure(e));
        }

        let diagnostics = self.diagnostics.clone();
        let throughput_event = self
            .queue
            .call_every(THROUGHPUT_PERIOD, move || diagnostics.roll_second());

        let duration_event = config.duration_limit().map(|limit| {
            let pipeline = self.this.clone();
            self.queue.call_in(limit, move || {
                if let Some(pipeline) = pipeline.upgrade() {
                    pipeline.stop_if_current(id, SessionEnd::DurationElapsed);
                }
            })
        });

        Ok(ActiveSession {
            id,
            config,
            shutdown,
            notifier,
            worker,
            duration_event,
            throughput_event,
        })
    }

    /// Stop the running session. Idempotent; returns once the worker is
    /// joined and the socket is closed.
    pub fn stop_session(&self) {
        let mut lifecycle = self.lock_lifecycle();
        self.stop_locked(&mut lifecycle, SessionEnd::Requested);
    }

    /// Stop session `id` if it is still the running one.
    fn stop_if_current(&self, id: u64, reason: SessionEnd) {
        let mut lifecycle = self.lock_lifecycle();
        match &lifecycle.session {
            Some(session) if session.id == id => self.stop_locked(&mut lifecycle, reason),
            _ => debug!("Ignoring stop for stale session {}", id),
        }
    }

    fn stop_locked(&self, lifecycle: &mut Lifecycle, reason: SessionEnd) {
        let Some(session) = lifecycle.session.take() else {
            return;
        };
        self.set_state(SessionState::Stopping);

        if let Some(event) = &session.duration_event {
            event.cancel();
        }
        session.throughput_event.cancel();

        lifecycle.capture.stop();
        std::thread::sleep(self.tuning.drain_interval());

        session.shutdown.cancel();
        session.notifier.notify();
        match session.worker.join() {
            Ok(mut transport) => transport.close(),
            Err(_) => error!("Sender worker panicked"),
        }
        self.codec.deinit();

        let mut config = session.config;
        config.streaming_enabled = false;
        lifecycle.last_config = Some(config);
        lifecycle.last_end = Some(reason);
        self.lock_pending().streaming_enabled = false;
        self.set_state(SessionState::Idle);

        let snap = self.diagnostics.snapshot();
        info!(
            "Audio session {} stopped ({}): {} datagrams, {} failures",
            session.id, reason, snap.total_datagrams, snap.send_failures
        );
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        let lifecycle = self.lifecycle.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(session) = lifecycle.session.take() {
            lifecycle.capture.stop();
            session.shutdown.cancel();
            session.notifier.notify();
            if let Ok(mut transport) = session.worker.join() {
                transport.close();
            }
        }
    }
}

/// Codec notifications for one session.
struct SessionEvents {
    notifier: ReadyNotifier,
    diagnostics: Arc<Diagnostics>,
}

impl CodecEvents for SessionEvents {
    fn on_datagram_ready(&self) {
        self.notifier.notify();
    }

    fn on_overflow_begin(&self) {
        self.diagnostics.record_overflow_begin();
    }

    fn on_overflow_end(&self, dropped: u32) {
        self.diagnostics.record_overflow_end(dropped);
    }
}

/// Drains ready datagrams into the transport until told to stop.
struct SenderWorker {
    session: u64,
    transport: DatagramTransport,
    codec: Arc<dyn Codec>,
    waiter: ReadyWaiter,
    shutdown: CancellationToken,
    diagnostics: Arc<Diagnostics>,
    signal_wait: Duration,
    pipeline: Weak<AudioPipeline>,
    queue: Arc<EventQueue>,
}

impl SenderWorker {
    fn run(mut self) -> DatagramTransport {
        debug!("Sender worker for session {} running", self.session);
        'session: while !self.shutdown.is_cancelled() {
            self.waiter.wait(self.signal_wait);

            while let Some(datagram) = self.codec.take_ready_datagram() {
                self.diagnostics
                    .record_free_datagrams(self.codec.free_low_water_mark());
                match self.transport.submit(datagram) {
                    Ok(()) | Err(SendError::Dropped(_)) => {}
                    Err(SendError::Fatal(e)) => {
                        error!("Audio session {} transport failed: {}", self.session, e);
                        self.request_stop();
                        break 'session;
                    }
                }
                if self.shutdown.is_cancelled() {
                    break 'session;
                }
            }
        }
        self.diagnostics
            .record_free_datagrams(self.codec.free_low_water_mark());
        debug!("Sender worker for session {} exiting", self.session);
        self.transport
    }

    fn request_stop(&self) {
        let pipeline = self.pipeline.clone();
        let session = self.session;
        self.queue.post(move || {
            if let Some(pipeline) = pipeline.upgrade() {
                pipeline.stop_if_current(session, SessionEnd::TransportFailure);
            }
        });
    }
}

/// Reasons a session could not start.
#[derive(Debug)]
pub enum StartError {
    /// A session is already running.
    AlreadyActive,
    /// Network interface is down.
    NetworkUnavailable,
    /// Server name did not resolve.
    DnsFailure(Option<std::io::Error>),
    /// Socket could not be opened.
    SocketOpenFailure(std::io::Error),
    /// Connect failed or timed out.
    ConnectFailure(std::io::Error),
    /// Codec refused to initialise.
    CodecInitFailure,
    /// Sender worker thread could not be spawned.
    WorkerSpawnFailure(std::io::Error),
    /// Capture driver did not start.
    CaptureStartFailure(super::CaptureError),
}

impl fmt::Display for StartError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActive => write!(f, "a session is already active"),
            Self::NetworkUnavailable => write!(f, "network unavailable"),
            Self::DnsFailure(Some(e)) => write!(f, "DNS resolution failed: {}", e),
            Self::DnsFailure(None) => write!(f, "DNS resolution returned no addresses"),
            Self::SocketOpenFailure(e) => write!(f, "socket open failed: {}", e),
            Self::ConnectFailure(e) => write!(f, "connect failed: {}", e),
            Self::CodecInitFailure => write!(f, "codec initialisation failed"),
            Self::WorkerSpawnFailure(e) => write!(f, "sender worker spawn failed: {}", e),
            Self::CaptureStartFailure(e) => write!(f, "capture start failed: {}", e),
        }
    }
}

impl std::error::Error for StartError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DnsFailure(Some(e))
            | Self::SocketOpenFailure(e)
            | Self::ConnectFailure(e)
            | Self::WorkerSpawnFailure(e) => Some(e),
            Self::CaptureStartFailure(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConnectError> for StartError {
    fn from(e: ConnectError) -> Self {
        match e {
            ConnectError::NetworkUnavailable => Self::NetworkUnavailable,
            ConnectError::Dns(e) => Self::DnsFailure(Some(e)),
            ConnectError::NoAddresses => Self::DnsFailure(None),
            ConnectError::Socket(e) => Self::SocketOpenFailure(e),
            ConnectError::Connect(e) => Self::ConnectFailure(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{CaptureError, CaptureEvent, PcmCodec};
    use crate::clock::SystemClock;
    use crate::config::{ServerUrl, TransportMode};
    use crate::transport::fake::FakeConnector;
    use crate::transport::LinkError;
    use std::sync::atomic::AtomicBool;
    use std::time::Instant;

    /// Capture driver that fires events from a thread and reports its state.
    struct TestCapture {
        running: Arc<AtomicBool>,
        fail_start: bool,
        thread: Option<std::thread::JoinHandle<()>>,
        stop: Arc<AtomicBool>,
    }

    impl TestCapture {
        fn new(running: Arc<AtomicBool>, fail_start: bool) -> Self {
            Self {
                running,
                fail_start,
                thread: None,
                stop: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    impl CaptureSource for TestCapture {
        fn start(&mut self, handler: CaptureHandler) -> Result<(), CaptureError> {
            if self.fail_start {
                return Err(CaptureError::Driver("no microphone".into()));
            }
            self.stop.store(false, Ordering::SeqCst);
            self.running.store(true, Ordering::SeqCst);
            let stop = self.stop.clone();
            self.thread = Some(std::thread::spawn(move || {
                let region = [500i16; 320 * 2];
                let mut half = true;
                while !stop.load(Ordering::SeqCst) {
                    let event = if half {
                        CaptureEvent::half()
                    } else {
                        CaptureEvent::complete()
                    };
                    handler.on_event(event, &region);
                    half = !half;
                    std::thread::sleep(Duration::from_millis(2));
                }
            }));
            Ok(())
        }

        fn stop(&mut self) {
            self.stop.store(true, Ordering::SeqCst);
            if let Some(t) = self.thread.take() {
                let _ = t.join();
            }
            self.running.store(false, Ordering::SeqCst);
        }
    }

    /// Capture driver that encodes `blocks` halves inside `start`, then goes quiet.
    struct BurstCapture {
        blocks: usize,
    }

    impl CaptureSource for BurstCapture {
        fn start(&mut self, handler: CaptureHandler) -> Result<(), CaptureError> {
            let region = [500i16; 320 * 2];
            for i in 0..self.blocks {
                let event = if i % 2 == 0 {
                    CaptureEvent::half()
                } else {
                    CaptureEvent::complete()
                };
                handler.on_event(event, &region);
            }
            Ok(())
        }

        fn stop(&mut self) {}
    }

    struct Rig {
        pipeline: Arc<AudioPipeline>,
        connector: Arc<FakeConnector>,
        capture_running: Arc<AtomicBool>,
        diagnostics: Arc<Diagnostics>,
        _queue: Arc<EventQueue>,
    }

    fn tuning() -> TransportTuning {
        TransportTuning {
            send_budget_ms: 5,
            fatal_failure_threshold_ms: 100,
            signal_wait_ms: 10,
            drain_interval_ms: 5,
            ..TransportTuning::default()
        }
    }

    fn rig_with(fail_capture: bool) -> Rig {
        let queue = Arc::new(EventQueue::start().unwrap());
        let capture_running = Arc::new(AtomicBool::new(false));
        let capture = TestCapture::new(capture_running.clone(), fail_capture);
        rig_from(queue, Box::new(capture), capture_running)
    }

    fn rig_from(
        queue: Arc<EventQueue>,
        capture: Box<dyn CaptureSource>,
        capture_running: Arc<AtomicBool>,
    ) -> Rig {
        let connector = FakeConnector::new();
        let diagnostics = Arc::new(Diagnostics::new());
        let capture_config = CaptureConfig::default();
        let deps = PipelineDeps {
            queue: queue.clone(),
            connector: connector.clone(),
            codec: Arc::new(PcmCodec::new(&capture_config)),
            capture,
            clock: Arc::new(SystemClock::new()),
            diagnostics: diagnostics.clone(),
        };
        let pipeline = AudioPipeline::new(deps, AudioConfig::default(), tuning(), &capture_config);
        Rig {
            pipeline,
            connector,
            capture_running,
            diagnostics,
            _queue: queue,
        }
    }

    fn rig() -> Rig {
        rig_with(false)
    }

    fn udp_config() -> AudioConfig {
        AudioConfig {
            streaming_enabled: true,
            transport_mode: TransportMode::Udp,
            server_url: ServerUrl::new("10.0.0.1", 5000).unwrap(),
            ..AudioConfig::default()
        }
    }

    fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        f()
    }

    #[test]
    fn test_start_streams_and_stop_tears_down() {
        let r = rig();
        r.pipeline.start_session(udp_config()).unwrap();
        assert!(r.pipeline.is_streaming());
        assert!(r.capture_running.load(Ordering::SeqCst));
        assert!(r.pipeline.pending_config().streaming_enabled);

        let probe = r.connector.last_probe().unwrap();
        assert!(wait_until(Duration::from_secs(2), || probe.sent().len() >= 4));

        r.pipeline.stop_session();
        assert_eq!(r.pipeline.state(), SessionState::Idle);
        assert!(!r.capture_running.load(Ordering::SeqCst));
        assert!(probe.is_closed());
        assert_eq!(r.pipeline.last_end(), Some(SessionEnd::Requested));

        // No network activity once stop has returned.
        let sends = probe.sends.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(probe.sends.load(Ordering::SeqCst), sends);
    }

    #[test]
    fn test_second_start_is_rejected() {
        let r = rig();
        r.pipeline.start_session(udp_config()).unwrap();
        assert!(matches!(
            r.pipeline.start_session(udp_config()),
            Err(StartError::AlreadyActive)
        ));
        assert_eq!(r.connector.targets().len(), 1);
        r.pipeline.stop_session();
    }

    #[test]
    fn test_stop_twice_is_noop() {
        let r = rig();
        r.pipeline.stop_session();
        r.pipeline.start_session(udp_config()).unwrap();
        r.pipeline.stop_session();
        r.pipeline.stop_session();
        assert_eq!(r.pipeline.state(), SessionState::Idle);
        assert_eq!(r.pipeline.last_end(), Some(SessionEnd::Requested));
    }

    #[test]
    fn test_active_config_frozen_while_streaming() {
        let r = rig();
        r.pipeline.start_session(udp_config()).unwrap();

        r.pipeline.update_pending(|c| {
            c.transport_mode = TransportMode::Tcp;
            c.server_url = ServerUrl::new("10.9.9.9", 7000).unwrap();
        });
        let active = r.pipeline.active_config().unwrap();
        assert_eq!(active.transport_mode, TransportMode::Udp);
        assert_eq!(active.server_url.host(), "10.0.0.1");

        r.pipeline.stop_session();
        r.pipeline.start_from_pending().unwrap();
        let targets = r.connector.targets();
        assert_eq!(targets[1].0, TransportMode::Tcp);
        assert_eq!(targets[1].1.port(), 7000);
        r.pipeline.stop_session();
    }

    #[test]
    fn test_duration_limit_stops_session() {
        let r = rig();
        let config = AudioConfig {
            duration_limit_secs: Some(1),
            ..udp_config()
        };
        r.pipeline.start_session(config).unwrap();
        assert!(wait_until(Duration::from_secs(3), || !r.pipeline.is_streaming()));
        assert_eq!(r.pipeline.last_end(), Some(SessionEnd::DurationElapsed));
        assert!(!r.pipeline.active_config().unwrap().streaming_enabled);
        assert!(!r.pipeline.pending_config().streaming_enabled);
        assert!(r.connector.last_probe().unwrap().is_closed());
    }

    #[test]
    fn test_five_second_limit_stops_at_boundary() {
        let queue = Arc::new(EventQueue::start_paused().unwrap());
        let running = Arc::new(AtomicBool::new(false));
        let capture = TestCapture::new(running.clone(), false);
        let r = rig_from(queue.clone(), Box::new(capture), running);

        // Start and arm the checks from one handler so the paused clock
        // cannot move in between.
        let (tx, rx) = std::sync::mpsc::channel();
        let pipeline = r.pipeline.clone();
        let checks = queue.clone();
        queue.post(move || {
            let config = AudioConfig {
                duration_limit_secs: Some(5),
                ..udp_config()
            };
            pipeline.start_session(config).unwrap();
            for at_ms in [4_900u64, 5_001] {
                let pipeline = pipeline.clone();
                let tx = tx.clone();
                checks.call_in(Duration::from_millis(at_ms), move || {
                    let _ = tx.send((at_ms, pipeline.state(), pipeline.last_end()));
                });
            }
        });

        let before = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(before, (4_900, SessionState::Active, None));
        let after = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(
            after,
            (5_001, SessionState::Idle, Some(SessionEnd::DurationElapsed))
        );
        assert!(r.connector.last_probe().unwrap().is_closed());
    }

    #[test]
    fn test_min_free_tracks_codec_low_water_mark() {
        let queue = Arc::new(EventQueue::start().unwrap());
        let running = Arc::new(AtomicBool::new(false));
        // 40 halves make 160 datagrams for a 64 slot pool.
        let r = rig_from(queue, Box::new(BurstCapture { blocks: 40 }), running);
        *r.connector.send_delay.lock().unwrap() = Some(Duration::from_millis(20));

        r.pipeline.start_session(udp_config()).unwrap();
        assert!(wait_until(Duration::from_secs(3), || {
            r.diagnostics.total_datagrams() >= 3
        }));
        r.pipeline.stop_session();

        let snap = r.diagnostics.snapshot();
        assert_eq!(snap.min_free_datagrams, Some(0));
        assert!(snap.overflow_events >= 1);
    }

    #[test]
    fn test_connection_lost_stops_session_without_caller() {
        let r = rig();
        *r.connector.fail_always.lock().unwrap() = Some(LinkError::ConnectionLost);
        r.pipeline.start_session(udp_config()).unwrap();

        assert!(wait_until(Duration::from_secs(3), || !r.pipeline.is_streaming()));
        assert_eq!(r.pipeline.last_end(), Some(SessionEnd::TransportFailure));
        assert!(r.connector.last_probe().unwrap().is_closed());
        assert!(!r.capture_running.load(Ordering::SeqCst));
        assert!(r.diagnostics.send_failures() >= 1);
    }

    #[test]
    fn test_sustained_timeouts_stop_session() {
        let r = rig();
        *r.connector.fail_always.lock().unwrap() = Some(LinkError::Timeout);
        r.pipeline.start_session(udp_config()).unwrap();

        assert!(wait_until(Duration::from_secs(5), || !r.pipeline.is_streaming()));
        assert_eq!(r.pipeline.last_end(), Some(SessionEnd::TransportFailure));
    }

    #[test]
    fn test_connect_failure_reports_and_clears_pending() {
        let r = rig();
        r.connector.refuse.store(true, Ordering::SeqCst);
        r.pipeline.update_pending(|c| c.streaming_enabled = true);
        let err = r.pipeline.start_from_pending().unwrap_err();
        assert!(matches!(err, StartError::ConnectFailure(_)));
        assert_eq!(r.pipeline.state(), SessionState::Idle);
        assert!(!r.pipeline.pending_config().streaming_enabled);
        assert!(r.pipeline.active_config().is_none());
    }

    #[test]
    fn test_capture_failure_unwinds_link() {
        let r = rig_with(true);
        let err = r.pipeline.start_session(udp_config()).unwrap_err();
        assert!(matches!(err, StartError::CaptureStartFailure(_)));
        assert!(r.connector.last_probe().unwrap().is_closed());
        assert!(!r.pipeline.is_streaming());
    }

    #[test]
    fn test_stale_stop_is_ignored() {
        let r = rig();
        r.pipeline.start_session(udp_config()).unwrap();
        r.pipeline.stop_session();
        r.pipeline.start_session(udp_config()).unwrap();

        // Session 1 is gone; a late stop for it must not end session 2.
        r.pipeline.stop_if_current(1, SessionEnd::DurationElapsed);
        assert!(r.pipeline.is_streaming());
        r.pipeline.stop_session();
    }
}
