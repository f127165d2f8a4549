//! The node: drivers, audio pipeline, duty-cycle controller and resources
//! wired together.
//!
//! # Example
//!
//! ```ignore
//! let config = NodeConfig::load(Path::new("node.json"))?;
//! let drivers = NodeDrivers::host(&config)?;
//! let mut node = Node::new(config, drivers)?;
//!
//! let exit = CancellationToken::new();
//! node.run(&exit)?;
//! ```
//!
//! `run` is the boot loop. Each pass reads the retained record, resumes or
//! starts the awake modes, and ends in a halt or at the exit signal. A halt
//! that returns (always on host) is treated as the reset that follows a
//! wake, so the loop boots again.

use crate::audio::{AudioPipeline, CaptureSource, Codec, PcmCodec, PipelineDeps, ToneCapture};
use crate::clock::{MonotonicClock, Rtc, SimulatedRtc, SystemClock};
use crate::config::{ConfigError, NodeConfig};
use crate::controller::{
    ControllerDeps, ControllerHandle, DutyCycleController, ModeExit, Registrar, ResumeAction,
    SleepLevel, TcpProbeRegistrar,
};
use crate::diagnostics::Diagnostics;
use crate::network::{HostNetwork, NetworkProvider, NodeStatus, StatsServer, StatusSource};
use crate::persistence_host::FileRetainedStore;
use crate::power::{PowerControl, SimulatedPower};
use crate::resource::{bind_node_resources, ResourceRegistry};
use crate::scheduler::{EventQueue, SchedulerError};
use crate::state::RetainedStore;
use crate::transport::{Connector, HostConnector};
use log::{info, warn};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tone frequency of the synthetic capture source.
const TONE_HZ: f32 = 440.0;

/// Real time a simulated halt takes, so host nodes do not spin through
/// reboot cycles.
const SIMULATED_HALT_PAUSE: Duration = Duration::from_secs(1);

/// Hardware (or simulated hardware) the node runs on.
pub struct NodeDrivers {
    pub power: Arc<dyn PowerControl>,
    pub rtc: Arc<dyn Rtc>,
    pub store: Box<dyn RetainedStore>,
    pub network: Arc<dyn NetworkProvider>,
    pub connector: Arc<dyn Connector>,
    pub codec: Arc<dyn Codec>,
    pub capture: Box<dyn CaptureSource>,
    pub registrar: Arc<dyn Registrar>,
    pub clock: Arc<dyn MonotonicClock>,
}

impl NodeDrivers {
    /// Host drivers: simulated power and RTC, a file for retained state, OS
    /// sockets, a PCM codec fed by a synthetic tone.
    pub fn host(config: &NodeConfig) -> Result<Self, NodeError> {
        let rtc = SimulatedRtc::new();
        let store = match &config.retained_state_path {
            Some(path) => FileRetainedStore::new(path),
            None => FileRetainedStore::at_default_path().map_err(NodeError::Io)?,
        };
        info!("Retained state at {:?}", store.path());

        let network: Arc<dyn NetworkProvider> = Arc::new(HostNetwork::new());
        Ok(Self {
            power: Arc::new(SimulatedPower::new(
                rtc.clone(),
                config.external_power,
                SIMULATED_HALT_PAUSE,
            )),
            rtc,
            store: Box::new(store),
            connector: Arc::new(HostConnector::new(
                network.clone(),
                config.transport.send_budget(),
            )),
            network,
            codec: Arc::new(PcmCodec::new(&config.capture)),
            capture: Box::new(ToneCapture::new(config.capture, TONE_HZ)),
            registrar: Arc::new(TcpProbeRegistrar::new(&config.registration)),
            clock: Arc::new(SystemClock::new()),
        })
    }
}

/// Serves `/stats` from live node state.
struct StatusView {
    network: Arc<dyn NetworkProvider>,
    controller: ControllerHandle,
    pipeline: Arc<AudioPipeline>,
    diagnostics: Arc<Diagnostics>,
}

impl StatusSource for StatusView {
    fn status(&self) -> NodeStatus {
        NodeStatus {
            uptime_secs: self.diagnostics.uptime().as_secs(),
            mode: self
                .controller
                .mode()
                .map_or("asleep".to_string(), |m| m.to_string()),
            wake_tick_counter: self.controller.wake_tick_counter(),
            streaming: self.pipeline.is_streaming(),
            external_power: self.controller.external_power(),
            ip_addr: self.network.ip_addr(),
            last_session_end: self.pipeline.last_end().map(|end| end.to_string()),
            diagnostics: self.diagnostics.snapshot(),
        }
    }
}

/// A complete node.
pub struct Node {
    network: Arc<dyn NetworkProvider>,
    pipeline: Arc<AudioPipeline>,
    controller: DutyCycleController,
    registry: Arc<ResourceRegistry>,
    diagnostics: Arc<Diagnostics>,
    stats: Option<StatsServer>,
    // Last, so the queue thread outlives everything that schedules on it.
    queue: Arc<EventQueue>,
}

impl Node {
    /// Wire up the node. Starts the event queue and, if configured, the stats
    /// server; nothing else runs until [`run`](Self::run).
    pub fn new(config: NodeConfig, drivers: NodeDrivers) -> Result<Self, NodeError> {
        config.validate()?;

        let queue = Arc::new(EventQueue::start()?);
        let diagnostics = Arc::new(Diagnostics::new());

        let pipeline = AudioPipeline::new(
            PipelineDeps {
                queue: queue.clone(),
                connector: drivers.connector,
                codec: drivers.codec,
                capture: drivers.capture,
                clock: drivers.clock,
                diagnostics: diagnostics.clone(),
            },
            config.audio.clone(),
            config.transport,
            &config.capture,
        );

        let mut controller = DutyCycleController::new(
            ControllerDeps {
                store: drivers.store,
                power: drivers.power,
                rtc: drivers.rtc,
                registrar: drivers.registrar,
                queue: queue.clone(),
                session: pipeline.clone(),
            },
            config.duty,
            config.audio.clone(),
        );

        let registry = Arc::new(ResourceRegistry::new());
        bind_node_resources(
            &registry,
            pipeline.clone(),
            controller.handle(),
            diagnostics.clone(),
        );
        let observed = registry.clone();
        controller.set_refresh_hook(move || observed.notify_prefix("diag/"));

        let stats = match config.stats_port {
            Some(port) => {
                let view = Arc::new(StatusView {
                    network: drivers.network.clone(),
                    controller: controller.handle(),
                    pipeline: pipeline.clone(),
                    diagnostics: diagnostics.clone(),
                });
                Some(StatsServer::start(None, port, view).map_err(NodeError::Io)?)
            }
            None => None,
        };

        Ok(Self {
            network: drivers.network,
            pipeline,
            controller,
            registry,
            diagnostics,
            stats,
            queue,
        })
    }

    pub fn registry(&self) -> &Arc<ResourceRegistry> {
        &self.registry
    }

    pub fn pipeline(&self) -> &Arc<AudioPipeline> {
        &self.pipeline
    }

    pub fn controller(&self) -> ControllerHandle {
        self.controller.handle()
    }

    pub fn diagnostics(&self) -> &Arc<Diagnostics> {
        &self.diagnostics
    }

    pub fn stats_addr(&self) -> Option<SocketAddr> {
        self.stats.as_ref().and_then(|s| s.local_addr())
    }

    /// Boot loop. Returns once `exit` fires.
    pub fn run(&mut self, exit: &CancellationToken) -> Result<(), NodeError> {
        if let Err(e) = self.network.connect() {
            // Sessions report NetworkUnavailable until the link comes up.
            warn!("Network connect failed: {}", e);
        }

        while !exit.is_cancelled() {
            let action = self.controller.boot();
            self.pipeline
                .set_pending_config(self.controller.pending_audio());

            let outcome = match action {
                ResumeAction::ResumeStandbySleep(remaining) => self.controller.enter_sleep(
                    SleepLevel::DeregisteredSleep,
                    remaining.as_secs().max(1) as u32,
                ),
                ResumeAction::ResumeOff | ResumeAction::RunInitialisation => self.run_awake(exit),
            };

            match outcome {
                ModeExit::Halted(level) => info!("Woke from {:?}, rebooting", level),
                ModeExit::Shutdown => break,
                ModeExit::Registered => {}
            }
        }

        self.pipeline.stop_session();
        info!("Node stopped");
        Ok(())
    }

    fn run_awake(&mut self, exit: &CancellationToken) -> ModeExit {
        match self.controller.run_initialisation_mode(exit) {
            ModeExit::Registered => {}
            other => return other,
        }

        if self.pipeline.pending_config().streaming_enabled {
            if let Err(e) = self.pipeline.start_from_pending() {
                warn!("Configured audio session did not start: {}", e);
            }
        }

        loop {
            match self.controller.run_ready_mode(exit) {
                ModeExit::Registered => continue,
                other => return other,
            }
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.pipeline.stop_session();
        self.queue.shutdown();
    }
}

/// Errors building or running a node.
#[derive(Debug)]
pub enum NodeError {
    /// Configuration failed validation.
    Config(ConfigError),
    /// The event queue thread could not start.
    Scheduler(SchedulerError),
    /// Retained-state path or stats server setup failed.
    Io(std::io::Error),
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "configuration error: {}", e),
            Self::Scheduler(e) => write!(f, "scheduler error: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for NodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Scheduler(e) => Some(e),
            Self::Io(e) => Some(e),
        }
    }
}

impl From<ConfigError> for NodeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<SchedulerError> for NodeError {
    fn from(e: SchedulerError) -> Self {
        Self::Scheduler(e)
    }
}
