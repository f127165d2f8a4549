//! Ready signal from the codec notification to the sender worker.
//!
//! A wake-up only: it carries no data and coalesces, so a burst of ready
//! datagrams costs the producer one `try_send` each and never blocks it.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::time::Duration;

/// Create a connected notifier/waiter pair.
pub fn ready_signal() -> (ReadyNotifier, ReadyWaiter) {
    let (tx, rx) = mpsc::sync_channel(1);
    (ReadyNotifier(tx), ReadyWaiter(rx))
}

/// Producer side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ReadyNotifier(SyncSender<()>);

impl ReadyNotifier {
    /// Wake the waiter. Never blocks; a pending wake-up absorbs this one.
    pub fn notify(&self) {
        match self.0.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) | Err(TrySendError::Disconnected(())) => {}
        }
    }
}

/// Consumer side, owned by the sender worker.
#[derive(Debug)]
pub struct ReadyWaiter(Receiver<()>);

impl ReadyWaiter {
    /// Wait up to `timeout` for a wake-up. Returns `true` if one arrived.
    pub fn wait(&self, timeout: Duration) -> bool {
        match self.0.recv_timeout(timeout) {
            Ok(()) => true,
            Err(RecvTimeoutError::Timeout) => false,
            // Every notifier is gone; behave like a timeout so the caller
            // still polls its shutdown flag.
            Err(RecvTimeoutError::Disconnected) => {
                std::thread::sleep(timeout);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notifications_coalesce() {
        let (notifier, waiter) = ready_signal();
        for _ in 0..10 {
            notifier.notify();
        }
        assert!(waiter.wait(Duration::from_millis(10)));
        assert!(!waiter.wait(Duration::from_millis(10)));
    }

    #[test]
    fn test_wait_times_out_without_signal() {
        let (_notifier, waiter) = ready_signal();
        assert!(!waiter.wait(Duration::from_millis(5)));
    }

    #[test]
    fn test_cross_thread_wake() {
        let (notifier, waiter) = ready_signal();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(5));
            notifier.notify();
        });
        assert!(waiter.wait(Duration::from_secs(2)));
        t.join().unwrap();
    }
}
