//! Double-buffered microphone capture.
//!
//! The capture driver fills a region of `2 * block_samples` samples and raises
//! an event each time one half is full. [`CaptureHandler`] hands exactly that
//! half to the codec while the driver fills the other one.

use super::Codec;
use crate::config::CaptureConfig;
use crate::diagnostics::Diagnostics;
use log::{debug, warn};
use std::f32::consts::TAU;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Shortest gap between synthetic events.
const MIN_BLOCK_PERIOD: Duration = Duration::from_micros(100);

/// Event mask delivered by the capture interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureEvent(pub u32);

impl CaptureEvent {
    /// First half of the region is full.
    pub const HALF_COMPLETE: u32 = 1 << 0;
    /// Second half of the region is full.
    pub const COMPLETE: u32 = 1 << 1;

    pub fn half() -> Self {
        Self(Self::HALF_COMPLETE)
    }

    pub fn complete() -> Self {
        Self(Self::COMPLETE)
    }

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }
}

/// Interrupt-side callback: routes each filled half to the codec.
#[derive(Clone)]
pub struct CaptureHandler {
    codec: Arc<dyn Codec>,
    diagnostics: Arc<Diagnostics>,
}

impl CaptureHandler {
    pub fn new(codec: Arc<dyn Codec>, diagnostics: Arc<Diagnostics>) -> Self {
        Self { codec, diagnostics }
    }

    /// Handle one capture event for `region` (both halves).
    ///
    /// An event with neither flag set is a driver fault: it is logged and
    /// counted, and no data is encoded.
    pub fn on_event(&self, event: CaptureEvent, region: &[i16]) {
        let mid = region.len() / 2;
        if event.contains(CaptureEvent::HALF_COMPLETE) {
            self.codec.encode_block(&region[..mid]);
        } else if event.contains(CaptureEvent::COMPLETE) {
            self.codec.encode_block(&region[mid..]);
        } else {
            warn!("Unexpected capture event mask {:#x}", event.0);
            self.diagnostics.record_capture_fault();
        }
    }
}

/// A capture driver.
pub trait CaptureSource: Send {
    /// Start delivering events to `handler`.
    fn start(&mut self, handler: CaptureHandler) -> Result<(), CaptureError>;

    /// Stop delivering events. Returns once no further event will fire.
    fn stop(&mut self);
}

/// Capture start errors.
#[derive(Debug)]
pub enum CaptureError {
    /// Capture is already running.
    AlreadyRunning,
    /// Driver thread could not be spawned.
    Spawn(std::io::Error),
    /// Hardware driver rejected the request.
    Driver(String),
}

impl fmt::Display for CaptureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRunning => write!(f, "capture already running"),
            Self::Spawn(e) => write!(f, "failed to spawn capture thread: {}", e),
            Self::Driver(msg) => write!(f, "capture driver error: {}", msg),
        }
    }
}

impl std::error::Error for CaptureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(e) => Some(e),
            _ => None,
        }
    }
}

/// Synthetic capture: a sine tone delivered at the real block rate.
pub struct ToneCapture {
    config: CaptureConfig,
    frequency_hz: f32,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ToneCapture {
    pub fn new(config: CaptureConfig, frequency_hz: f32) -> Self {
        Self {
            config,
            frequency_hz,
            stop: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }
}

impl CaptureSource for ToneCapture {
    fn start(&mut self, handler: CaptureHandler) -> Result<(), CaptureError> {
        if self.thread.is_some() {
            return Err(CaptureError::AlreadyRunning);
        }
        self.stop.store(false, Ordering::Release);

        let stop = self.stop.clone();
        let block = self.config.block_samples;
        let period = self.config.block_period().max(MIN_BLOCK_PERIOD);
        let step = TAU * self.frequency_hz / self.config.sample_rate_hz as f32;

        let thread = std::thread::Builder::new()
            .name("capture".into())
            .spawn(move || {
                let mut region = vec![0i16; block * 2];
                let mut phase = 0f32;
                let mut next = Instant::now() + period;
                let mut first_half = true;

                while !stop.load(Ordering::Acquire) {
                    let half = if first_half {
                        &mut region[..block]
                    } else {
                        &mut region[block..]
                    };
                    for sample in half.iter_mut() {
                        *sample = (phase.sin() * 8000.0) as i16;
                        phase = (phase + step) % TAU;
                    }

                    let now = Instant::now();
                    if next > now {
                        std::thread::sleep(next - now);
                    }
                    next += period;

                    let event = if first_half {
                        CaptureEvent::half()
                    } else {
                        CaptureEvent::complete()
                    };
                    handler.on_event(event, &region);
                    first_half = !first_half;
                }
                debug!("Capture thread stopped");
            })
            .map_err(CaptureError::Spawn)?;

        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for ToneCapture {
    fn drop(&mut self) {
        self.stop();
    }
}
