//! Cooperative event queue.
//!
//! One queue serializes every tick handler and every piece of deferred work
//! (`call_in` / `call_every`). It runs a current-thread tokio runtime on a
//! dedicated thread, so handlers never run concurrently with each other.
//!
//! Handlers run to completion on the queue thread. They must not block
//! indefinitely; bounded blocking work (a registration attempt, joining a
//! worker that has already been told to stop) is acceptable.
//!
//! # Example
//!
//! ```
//! use iot_audio_node::scheduler::EventQueue;
//! use std::sync::mpsc;
//! use std::time::Duration;
//!
//! let queue = EventQueue::start().unwrap();
//! let (tx, rx) = mpsc::channel();
//! queue.call_in(Duration::from_millis(10), move || tx.send("fired").unwrap());
//! assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), "fired");
//! ```

use log::{debug, error};
use std::fmt;
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::runtime::{Builder, Handle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Shortest accepted period for repeating events.
const MIN_PERIOD: Duration = Duration::from_millis(1);

/// Handle to a scheduled event. Cancelling is idempotent.
#[derive(Debug, Clone)]
pub struct EventId(CancellationToken);

impl EventId {
    /// Cancel the event. A handler already running completes.
    pub fn cancel(&self) {
        self.0.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.is_cancelled()
    }
}

/// Single-threaded scheduler for ticks and deferred work.
pub struct EventQueue {
    handle: Handle,
    shutdown: CancellationToken,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    /// Start the queue on its own thread.
    pub fn start() -> Result<Self, SchedulerError> {
        Self::spawn(false)
    }

    /// Start a queue whose clock is paused and auto-advances whenever every
    /// handler is idle, so long tick periods elapse instantly.
    #[cfg(test)]
    pub fn start_paused() -> Result<Self, SchedulerError> {
        Self::spawn(true)
    }

    fn spawn(paused: bool) -> Result<Self, SchedulerError> {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let (tx, rx) = std::sync::mpsc::channel();

        let thread = std::thread::Builder::new()
            .name("event-queue".into())
            .spawn(move || {
                let mut builder = Builder::new_current_thread();
                builder.enable_time();
                #[cfg(test)]
                if paused {
                    builder.start_paused(true);
                }
                #[cfg(not(test))]
                let _ = paused;

                match builder.build() {
                    Ok(runtime) => {
                        let _ = tx.send(Ok(runtime.handle().clone()));
                        runtime.block_on(token.cancelled());
                        debug!("Event queue stopped");
                    }
                    Err(e) => {
                        error!("Failed to build event queue runtime: {}", e);
                        let _ = tx.send(Err(e));
                    }
                }
            })
            .map_err(SchedulerError::Spawn)?;

        let handle = rx
            .recv()
            .map_err(|_| SchedulerError::Startup)?
            .map_err(SchedulerError::Runtime)?;

        Ok(Self {
            handle,
            shutdown,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Run `f` once after `delay`.
    pub fn call_in<F>(&self, delay: Duration, f: F) -> EventId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = EventId(self.shutdown.child_token());
        let token = id.0.clone();
        self.handle.spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => f(),
            }
        });
        id
    }

    /// Run `f` as soon as the queue is free.
    pub fn post<F>(&self, f: F) -> EventId
    where
        F: FnOnce() + Send + 'static,
    {
        self.call_in(Duration::ZERO, f)
    }

    /// Run `f` every `period`, first after one period.
    pub fn call_every<F>(&self, period: Duration, f: F) -> EventId
    where
        F: FnMut() + Send + 'static,
    {
        self.call_every_after(period, period, f)
    }

    /// Run `f` first after `first`, then every `period`.
    ///
    /// A handler may cancel its own [`EventId`]; no further call happens after
    /// it returns. Late ticks are delayed, not bunched.
    pub fn call_every_after<F>(&self, first: Duration, period: Duration, mut f: F) -> EventId
    where
        F: FnMut() + Send + 'static,
    {
        let id = EventId(self.shutdown.child_token());
        let token = id.0.clone();
        let period = period.max(MIN_PERIOD);
        self.handle.spawn(async move {
            let start = tokio::time::Instant::now() + first;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => f(),
                }
            }
        });
        id
    }

    /// Cancel every event and stop the queue thread.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(thread) = thread {
            if thread.thread().id() != std::thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

impl Drop for EventQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Scheduler startup errors.
#[derive(Debug)]
pub enum SchedulerError {
    /// Queue thread could not be spawned.
    Spawn(std::io::Error),
    /// Runtime could not be built.
    Runtime(std::io::Error),
    /// Queue thread exited before reporting its handle.
    Startup,
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Spawn(e) => write!(f, "failed to spawn event queue thread: {}", e),
            Self::Runtime(e) => write!(f, "failed to build event queue runtime: {}", e),
            Self::Startup => write!(f, "event queue thread exited during startup"),
        }
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Spawn(e) | Self::Runtime(e) => Some(e),
            Self::Startup => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;

    #[test]
    fn test_call_in_fires_once() {
        let queue = EventQueue::start().unwrap();
        let (tx, rx) = mpsc::channel();
        queue.call_in(Duration::from_millis(5), move || tx.send(1).unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_cancelled_call_in_never_fires() {
        let queue = EventQueue::start().unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        let id = queue.call_in(Duration::from_secs(60), move || tx.send(()).unwrap());
        id.cancel();
        assert!(id.is_cancelled());
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }

    #[test]
    fn test_call_every_paused_clock_elapses_quickly() {
        let queue = EventQueue::start_paused().unwrap();
        let (tx, rx) = mpsc::channel();
        let count = Arc::new(AtomicU32::new(0));
        let counter = count.clone();
        let id = queue.call_every(Duration::from_secs(3600), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 3 {
                tx.send(n).unwrap();
            }
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 3);
        id.cancel();
    }

    #[test]
    fn test_handler_can_cancel_itself() {
        let queue = Arc::new(EventQueue::start_paused().unwrap());
        let count = Arc::new(AtomicU32::new(0));
        let slot: Arc<Mutex<Option<EventId>>> = Arc::new(Mutex::new(None));
        let (tx, rx) = mpsc::channel();

        let counter = count.clone();
        let own = slot.clone();
        // Holding the slot while arming makes the handler wait until its id is stored.
        let mut guard = slot.lock().unwrap();
        let id = queue.call_every_after(Duration::ZERO, Duration::from_secs(1), move || {
            let own = own.lock().unwrap();
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                if let Some(id) = own.as_ref() {
                    id.cancel();
                }
                tx.send(()).unwrap();
            }
        });
        *guard = Some(id);
        drop(guard);

        rx.recv_timeout(Duration::from_secs(2)).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_shutdown_cancels_pending_events() {
        let queue = EventQueue::start().unwrap();
        let (tx, rx) = mpsc::channel::<()>();
        queue.call_in(Duration::from_secs(10), move || tx.send(()).unwrap());
        queue.shutdown();
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
    }
}
