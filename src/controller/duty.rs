//! The duty-cycle state machine.
//!
//! Tick handlers run on the [`EventQueue`] and never sleep; they report mode
//! changes to the main context over a channel. The main context waits for
//! those reports in chunks of at most `max_sleep_chunk`, feeding the liveness
//! watchdog between chunks, and performs every sleep transition itself.

use super::{DeviceMode, ModeExit, Registrar, ResumeAction, SessionMonitor, SleepLevel};
use crate::clock::Rtc;
use crate::config::{AudioConfig, ConfigError, DutyCycleConfig};
use crate::power::PowerControl;
use crate::scheduler::EventQueue;
use crate::state::{HistoryMarker, PersistentState, RetainedStore, SleepWindow};
use log::{debug, error, info, warn};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

type RefreshHook = Arc<dyn Fn() + Send + Sync>;

/// Report from a tick handler to the main context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeEvent {
    Registered,
    Sleep(SleepLevel, u32),
    Period(TickPeriod),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickPeriod {
    Short,
    Long,
}

/// State shared with tick handlers and the resource layer.
struct Shared {
    state: Mutex<PersistentState>,
    mode: Mutex<Option<DeviceMode>>,
    power: Arc<dyn PowerControl>,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, PersistentState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn bump_counter(&self) -> u32 {
        let mut state = self.state();
        state.wake_tick_counter = state.wake_tick_counter.saturating_add(1);
        state.wake_tick_counter
    }

    fn reset_counter(&self) {
        self.state().wake_tick_counter = 0;
    }

    fn set_mode(&self, mode: Option<DeviceMode>) {
        *self.mode.lock().unwrap_or_else(|e| e.into_inner()) = mode;
    }
}

/// Cheap, cloneable view of the controller.
#[derive(Clone)]
pub struct ControllerHandle {
    shared: Arc<Shared>,
}

impl ControllerHandle {
    /// A remote write landed. On external power this extends the awake
    /// period by restarting the tick count.
    pub fn instruction_received(&self) {
        if self.shared.power.is_external_power_present() {
            self.shared.reset_counter();
            debug!("Instruction received, wake tick counter reset");
        }
    }

    pub fn wake_tick_counter(&self) -> u32 {
        self.shared.state().wake_tick_counter
    }

    pub fn mode(&self) -> Option<DeviceMode> {
        *self.shared.mode.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn external_power(&self) -> bool {
        self.shared.power.is_external_power_present()
    }

    /// Duty-cycle timing waiting to be applied at the next mode entry.
    pub fn pending_duty(&self) -> DutyCycleConfig {
        self.shared.state().pending_duty
    }

    /// Replace the pending timing after validating it.
    pub fn set_pending_duty(&self, config: DutyCycleConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.shared.state().pending_duty = config;
        Ok(())
    }
}

/// Drivers and collaborators of the controller.
pub struct ControllerDeps {
    pub store: Box<dyn RetainedStore>,
    pub power: Arc<dyn PowerControl>,
    pub rtc: Arc<dyn Rtc>,
    pub registrar: Arc<dyn Registrar>,
    pub queue: Arc<EventQueue>,
    pub session: Arc<dyn SessionMonitor>,
}

/// Crash-resumable device lifecycle.
pub struct DutyCycleController {
    shared: Arc<Shared>,
    defaults: DutyCycleConfig,
    default_audio: AudioConfig,
    active: DutyCycleConfig,
    store: Box<dyn RetainedStore>,
    rtc: Arc<dyn Rtc>,
    registrar: Arc<dyn Registrar>,
    queue: Arc<EventQueue>,
    session: Arc<dyn SessionMonitor>,
    refresh: Option<RefreshHook>,
}

impl DutyCycleController {
    /// `defaults` apply after a power-on reset; afterwards the retained
    /// pending values take over.
    pub fn new(deps: ControllerDeps, defaults: DutyCycleConfig, default_audio: AudioConfig) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(PersistentState {
                pending_duty: defaults,
                pending_audio: default_audio.clone(),
                ..PersistentState::default()
            }),
            mode: Mutex::new(None),
            power: deps.power,
        });
        Self {
            shared,
            defaults,
            default_audio,
            active: defaults,
            store: deps.store,
            rtc: deps.rtc,
            registrar: deps.registrar,
            queue: deps.queue,
            session: deps.session,
            refresh: None,
        }
    }

    pub fn handle(&self) -> ControllerHandle {
        ControllerHandle {
            shared: self.shared.clone(),
        }
    }

    /// Called on every Ready tick to refresh externally observable values.
    pub fn set_refresh_hook<F>(&mut self, hook: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.refresh = Some(Arc::new(hook));
    }

    /// Pending audio parameters recovered at boot.
    pub fn pending_audio(&self) -> AudioConfig {
        self.shared.state().pending_audio.clone()
    }

    /// Timing currently in effect.
    pub fn active_duty(&self) -> DutyCycleConfig {
        self.active
    }

    fn power_on_state(&self) -> PersistentState {
        PersistentState {
            pending_duty: self.defaults,
            pending_audio: self.default_audio.clone(),
            ..PersistentState::default()
        }
    }

    /// Read the retained record and decide how to resume.
    ///
    /// An unknown marker is a power-on reset and the clock is not trusted.
    /// A Standby record entered "in the future" means the RTC was reset, which
    /// is also treated as power-on.
    pub fn boot(&mut self) -> ResumeAction {
        let mut state = self.store.load();
        let now = self.rtc.now_secs();

        let action = match state.history_marker {
            HistoryMarker::Unknown => {
                info!("Power-on boot");
                state = self.power_on_state();
                ResumeAction::RunInitialisation
            }
            HistoryMarker::Normal => {
                info!("Reset while awake, restarting");
                ResumeAction::RunInitialisation
            }
            HistoryMarker::Off => {
                info!("Resuming from off");
                state.wake_tick_counter = 0;
                ResumeAction::ResumeOff
            }
            HistoryMarker::Standby => {
                let window = state.sleep_window;
                if window.entered_at > now {
                    warn!(
                        "Sleep entered at {} but clock reads {}, treating as power-on",
                        window.entered_at, now
                    );
                    state = self.power_on_state();
                    ResumeAction::RunInitialisation
                } else if window.wake_at > now {
                    let remaining = Duration::from_secs(window.wake_at - now);
                    info!("Woke early, {}s of standby left", remaining.as_secs());
                    ResumeAction::ResumeStandbySleep(remaining)
                } else {
                    info!(
                        "Standby over, wake tick counter {}",
                        state.wake_tick_counter
                    );
                    ResumeAction::RunInitialisation
                }
            }
        };

        state.history_marker = HistoryMarker::Normal;
        self.active = state.pending_duty;
        *self.shared.state() = state;
        action
    }

    /// Register with the management server.
    ///
    /// The first tick fires at once, then every `init_tick_period`. Each tick
    /// counts; at `init_tick_modulo` the count restarts and, without external
    /// power, the device switches off. Otherwise the tick attempts
    /// registration: success enters Ready, failure halts in
    /// DeregisteredSleep for the rest of the tick period.
    pub fn run_initialisation_mode(&mut self, exit: &CancellationToken) -> ModeExit {
        self.apply_pending_duty();
        self.shared.set_mode(Some(DeviceMode::Initialisation));
        info!(
            "Initialisation mode: tick {}s, modulo {}",
            self.active.init_tick_period_secs, self.active.init_tick_modulo
        );

        let (tx, rx) = mpsc::channel();
        let mut tick = InitTick {
            shared: self.shared.clone(),
            registrar: self.registrar.clone(),
            period: self.active.init_tick_period(),
            modulo: self.active.init_tick_modulo,
            done: false,
        };
        let id = self
            .queue
            .call_every_after(Duration::ZERO, self.active.init_tick_period(), move || {
                if let Some(event) = tick.run() {
                    let _ = tx.send(event);
                }
            });

        let event = self.wait_for(&rx, exit);
        id.cancel();

        match event {
            Some(ModeEvent::Registered) => {
                self.shared.reset_counter();
                info!("Registered, entering Ready mode");
                ModeExit::Registered
            }
            Some(ModeEvent::Sleep(level, secs)) => self.enter_sleep(level, secs),
            Some(ModeEvent::Period(_)) | None => self.shutdown(),
        }
    }

    /// Periodic reporting until the exit signal.
    ///
    /// Ticks run every `ready_tick_period1`. At `ready_tick_modulo` the count
    /// restarts and the next period is chosen: an active audio session keeps
    /// the short period even without external power, external power selects
    /// the long period, otherwise the device switches off.
    pub fn run_ready_mode(&mut self, exit: &CancellationToken) -> ModeExit {
        self.apply_pending_duty();
        self.shared.set_mode(Some(DeviceMode::Ready));
        self.shared.reset_counter();
        info!(
            "Ready mode: ticks {}s/{}s, modulo {}",
            self.active.ready_tick_period1_secs,
            self.active.ready_tick_period2_secs,
            self.active.ready_tick_modulo
        );

        let (tx, rx) = mpsc::channel();
        let mut period = TickPeriod::Short;
        loop {
            let mut tick = ReadyTick {
                shared: self.shared.clone(),
                session: self.session.clone(),
                refresh: self.refresh.clone(),
                modulo: self.active.ready_tick_modulo,
                current: period,
                done: false,
            };
            let tx = tx.clone();
            let every = match period {
                TickPeriod::Short => self.active.ready_tick_period1(),
                TickPeriod::Long => self.active.ready_tick_period2(),
            };
            let id = self.queue.call_every(every, move || {
                if let Some(event) = tick.run() {
                    let _ = tx.send(event);
                }
            });

            let event = self.wait_for(&rx, exit);
            id.cancel();

            match event {
                Some(ModeEvent::Period(next)) => {
                    info!("Ready tick period now {:?}", next);
                    period = next;
                }
                Some(ModeEvent::Sleep(level, secs)) => return self.enter_sleep(level, secs),
                Some(ModeEvent::Registered) => {}
                None => return self.shutdown(),
            }
        }
    }

    /// A remote write landed.
    pub fn instruction_received(&self) {
        self.handle().instruction_received();
    }

    /// Apply a sleep level for `duration_secs`.
    ///
    /// Registered levels block in liveness-fed chunks and return
    /// [`ModeExit::Registered`]. Halting levels persist the record and halt;
    /// on hardware that does not return.
    pub fn enter_sleep(&mut self, level: SleepLevel, duration_secs: u32) -> ModeExit {
        if !level.halts() {
            debug!("{:?} for {}s", level, duration_secs);
            self.sleep_registered(Duration::from_secs(duration_secs as u64));
            return ModeExit::Registered;
        }

        if self.handle().mode() == Some(DeviceMode::Ready) {
            self.registrar.deregister();
        }
        self.session.end_session();

        let now = self.rtc.now_secs();
        let state = {
            let mut state = self.shared.state();
            let (marker, wake_at) = match level {
                SleepLevel::Off => (HistoryMarker::Off, now),
                _ => (HistoryMarker::Standby, now + duration_secs as u64),
            };
            state.history_marker = marker;
            state.sleep_window = SleepWindow {
                entered_at: now,
                wake_at,
            };
            state.pending_audio = AudioConfig {
                streaming_enabled: false,
                ..self.session.pending_audio()
            };
            state.clone()
        };
        if let Err(e) = self.store.store(&state) {
            error!("Failed to persist state before {:?}: {}", level, e);
        }

        self.shared.set_mode(None);
        let halt_secs = match level {
            SleepLevel::Off => 0,
            _ => duration_secs,
        };
        info!(
            "Entering {:?} for {}s (wake tick counter {})",
            level, halt_secs, state.wake_tick_counter
        );
        self.shared.power.enter_low_power(halt_secs);
        ModeExit::Halted(level)
    }

    fn sleep_registered(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let chunk = self.active.max_sleep_chunk();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            std::thread::sleep(remaining.min(chunk));
            self.shared.power.feed_liveness();
        }
    }

    fn apply_pending_duty(&mut self) {
        let pending = self.shared.state().pending_duty;
        if pending != self.active {
            info!("Applying new duty-cycle timing");
            self.active = pending;
        }
    }

    /// Wait for a tick report, feeding liveness every chunk. `None` means the
    /// exit signal fired.
    fn wait_for(&self, rx: &Receiver<ModeEvent>, exit: &CancellationToken) -> Option<ModeEvent> {
        let chunk = self.active.max_sleep_chunk();
        loop {
            if exit.is_cancelled() {
                return None;
            }
            match rx.recv_timeout(chunk) {
                Ok(event) => return Some(event),
                Err(RecvTimeoutError::Timeout) => self.shared.power.feed_liveness(),
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn shutdown(&mut self) -> ModeExit {
        if self.handle().mode() == Some(DeviceMode::Ready) {
            self.registrar.deregister();
        }
        self.shared.set_mode(None);
        info!("Controller exiting");
        ModeExit::Shutdown
    }
}

struct InitTick {
    shared: Arc<Shared>,
    registrar: Arc<dyn Registrar>,
    period: Duration,
    modulo: u32,
    done: bool,
}

impl InitTick {
    fn run(&mut self) -> Option<ModeEvent> {
        if self.done {
            return None;
        }
        let started = Instant::now();

        let counter = self.shared.bump_counter();
        if counter >= self.modulo {
            self.shared.reset_counter();
            if !self.shared.power.is_external_power_present() {
                info!("No external power after {} ticks, switching off", counter);
                self.done = true;
                return Some(ModeEvent::Sleep(SleepLevel::Off, 0));
            }
        }

        debug!("Registration attempt on tick {}", counter);
        self.done = true;
        if self.registrar.register() {
            Some(ModeEvent::Registered)
        } else {
            let remaining = self.period.saturating_sub(started.elapsed());
            let secs = remaining.as_millis().div_ceil(1000).max(1) as u32;
            info!("Registration failed, sleeping {}s", secs);
            Some(ModeEvent::Sleep(SleepLevel::DeregisteredSleep, secs))
        }
    }
}

struct ReadyTick {
    shared: Arc<Shared>,
    session: Arc<dyn SessionMonitor>,
    refresh: Option<RefreshHook>,
    modulo: u32,
    current: TickPeriod,
    done: bool,
}

impl ReadyTick {
    fn run(&mut self) -> Option<ModeEvent> {
        if self.done {
            return None;
        }
        if let Some(refresh) = &self.refresh {
            refresh();
        }

        let counter = self.shared.bump_counter();
        if counter < self.modulo {
            return None;
        }
        self.shared.reset_counter();

        let next = if self.session.is_streaming() {
            TickPeriod::Short
        } else if self.shared.power.is_external_power_present() {
            TickPeriod::Long
        } else {
            info!("Idle without external power, switching off");
            self.done = true;
            return Some(ModeEvent::Sleep(SleepLevel::Off, 0));
        };

        if next == self.current {
            None
        } else {
            self.done = true;
            Some(ModeEvent::Period(next))
        }
    }
}
