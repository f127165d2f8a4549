//! Time-boxed datagram sending.

use super::{Link, LinkError};
use crate::audio::Datagram;
use crate::clock::MonotonicClock;
use crate::config::{TransportMode, TransportTuning};
use crate::diagnostics::Diagnostics;
use log::{debug, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Outcome of a failed submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// This datagram (or TCP batch) was lost; keep streaming.
    Dropped(LinkError),
    /// The session cannot continue.
    Fatal(LinkError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dropped(e) => write!(f, "datagram dropped: {}", e),
            Self::Fatal(e) => write!(f, "transport failed: {}", e),
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dropped(e) | Self::Fatal(e) => Some(e),
        }
    }
}

/// Sends datagrams over one [`Link`].
///
/// UDP sends every datagram on its own. TCP copies datagrams into an assembly
/// buffer and sends once it holds `tcp_datagrams_per_send` of them.
///
/// Every send retries partial writes until the per-send budget runs out; what
/// is not written by then is dropped. A run of failures lasting longer than
/// the fatal threshold, or any fatal [`LinkError`], ends the session.
pub struct DatagramTransport {
    link: Box<dyn Link>,
    clock: Arc<dyn MonotonicClock>,
    diagnostics: Arc<Diagnostics>,
    send_budget: Duration,
    block_budget: Duration,
    fatal_threshold: Duration,
    assembly: Vec<u8>,
    batch: usize,
    batched: usize,
    failing_since_us: Option<u64>,
}

impl DatagramTransport {
    pub fn new(
        link: Box<dyn Link>,
        datagram_len: usize,
        tuning: &TransportTuning,
        clock: Arc<dyn MonotonicClock>,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        let batch = match link.mode() {
            TransportMode::Tcp => tuning.tcp_datagrams_per_send.max(1),
            TransportMode::Udp => 1,
        };
        let assembly = match link.mode() {
            TransportMode::Tcp => Vec::with_capacity(datagram_len * batch),
            TransportMode::Udp => Vec::new(),
        };
        Self {
            link,
            clock,
            diagnostics,
            send_budget: tuning.send_budget(),
            block_budget: tuning.block_budget(),
            fatal_threshold: tuning.fatal_failure_threshold(),
            assembly,
            batch,
            batched: 0,
            failing_since_us: None,
        }
    }

    pub fn mode(&self) -> TransportMode {
        self.link.mode()
    }

    /// Send (or batch) one datagram.
    ///
    /// UDP datagrams are marked consumed once sent and dropped otherwise. TCP
    /// datagrams are consumed as soon as they are copied into the assembly
    /// buffer; the batch is what succeeds or fails.
    pub fn submit(&mut self, datagram: Datagram) -> Result<(), SendError> {
        match self.link.mode() {
            TransportMode::Udp => {
                let result = send_timed(&mut *self.link, &*self.clock, self.send_budget, &datagram);
                let outcome = self.settle(result, datagram.len(), 1);
                if outcome.is_ok() {
                    datagram.mark_consumed();
                }
                outcome
            }
            TransportMode::Tcp => {
                self.assembly.extend_from_slice(&datagram);
                datagram.mark_consumed();
                self.batched += 1;
                if self.batched >= self.batch {
                    self.flush()
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Send whatever sits in the TCP assembly buffer.
    pub fn flush(&mut self) -> Result<(), SendError> {
        if self.assembly.is_empty() {
            return Ok(());
        }
        let result = send_timed(&mut *self.link, &*self.clock, self.send_budget, &self.assembly);
        let (bytes, datagrams) = (self.assembly.len(), self.batched);
        self.assembly.clear();
        self.batched = 0;
        self.settle(result, bytes, datagrams)
    }

    /// Flush pending TCP bytes and close the socket.
    pub fn close(&mut self) {
        if let Err(e) = self.flush() {
            debug!("Final flush failed: {}", e);
        }
        self.link.close();
    }

    fn settle(
        &mut self,
        result: Result<Duration, LinkError>,
        bytes: usize,
        datagrams: usize,
    ) -> Result<(), SendError> {
        match result {
            Ok(elapsed) => {
                self.failing_since_us = None;
                self.diagnostics
                    .record_send(bytes, datagrams, elapsed, self.block_budget);
                Ok(())
            }
            Err(e) => {
                self.diagnostics.record_failure();
                if e.is_fatal() {
                    return Err(SendError::Fatal(e));
                }
                let now = self.clock.now_us();
                let since = *self.failing_since_us.get_or_insert(now);
                let failing_for = Duration::from_micros(now.saturating_sub(since));
                if failing_for >= self.fatal_threshold {
                    warn!("Sends failing for {:?}, giving up", failing_for);
                    Err(SendError::Fatal(e))
                } else {
                    Err(SendError::Dropped(e))
                }
            }
        }
    }
}

/// Write all of `data`, retrying partial writes and timeouts until `budget`
/// is used up. Returns the time the send took.
fn send_timed(
    link: &mut dyn Link,
    clock: &dyn MonotonicClock,
    budget: Duration,
    data: &[u8],
) -> Result<Duration, LinkError> {
    let start = clock.now_us();
    let elapsed = || Duration::from_micros(clock.now_us().saturating_sub(start));
    let mut offset = 0;

    while offset < data.len() {
        match link.send(&data[offset..]) {
            Ok(n) => offset += n,
            Err(LinkError::Timeout) => {}
            Err(e) => return Err(e),
        }
        if offset < data.len() {
            if elapsed() >= budget {
                return Err(LinkError::Timeout);
            }
            std::thread::yield_now();
        }
    }
    Ok(elapsed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::DatagramPool;
    use crate::clock::ManualClock;
    use crate::transport::fake::{FakeLink, LinkProbe};

    const LEN: usize = 8;

    struct Rig {
        transport: DatagramTransport,
        probe: Arc<LinkProbe>,
        pool: Arc<DatagramPool>,
        clock: Arc<ManualClock>,
        diagnostics: Arc<Diagnostics>,
    }

    fn rig(mode: TransportMode, tuning: TransportTuning) -> Rig {
        let probe = LinkProbe::new();
        let clock = ManualClock::new();
        let diagnostics = Arc::new(Diagnostics::new());
        let link = Box::new(FakeLink {
            probe: probe.clone(),
            mode,
        });
        let transport =
            DatagramTransport::new(link, LEN, &tuning, clock.clone(), diagnostics.clone());
        Rig {
            transport,
            probe,
            pool: DatagramPool::new(LEN, 16),
            clock,
            diagnostics,
        }
    }

    fn datagram(pool: &Arc<DatagramPool>, fill: u8) -> Datagram {
        assert!(pool.push_ready(&[fill; LEN]));
        pool.take_ready().unwrap()
    }

    #[test]
    fn test_udp_sends_each_datagram_and_consumes() {
        let mut r = rig(TransportMode::Udp, TransportTuning::default());
        r.transport.submit(datagram(&r.pool, 1)).unwrap();
        r.transport.submit(datagram(&r.pool, 2)).unwrap();

        assert_eq!(r.probe.sent(), vec![vec![1; LEN], vec![2; LEN]]);
        assert_eq!(r.pool.release_counts(), (2, 0));
        assert_eq!(r.diagnostics.snapshot().total_datagrams, 2);
    }

    #[test]
    fn test_tcp_batches_into_one_send() {
        let tuning = TransportTuning {
            tcp_datagrams_per_send: 3,
            ..TransportTuning::default()
        };
        let mut r = rig(TransportMode::Tcp, tuning);
        r.transport.submit(datagram(&r.pool, 1)).unwrap();
        r.transport.submit(datagram(&r.pool, 2)).unwrap();
        assert!(r.probe.sent().is_empty());
        // Copied datagrams are released immediately.
        assert_eq!(r.pool.free_count(), 16);

        r.transport.submit(datagram(&r.pool, 3)).unwrap();
        let sent = r.probe.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].len(), 3 * LEN);
        assert_eq!(&sent[0][2 * LEN..], &[3; LEN]);

        let snap = r.diagnostics.snapshot();
        assert_eq!(snap.total_sends, 1);
        assert_eq!(snap.total_datagrams, 3);
    }

    #[test]
    fn test_partial_writes_are_completed() {
        let mut r = rig(TransportMode::Udp, TransportTuning::default());
        r.probe.push(Ok(3));
        r.probe.push(Err(LinkError::Timeout));
        r.probe.push(Ok(5));
        r.transport.submit(datagram(&r.pool, 9)).unwrap();

        let joined: Vec<u8> = r.probe.sent().concat();
        assert_eq!(joined, vec![9; LEN]);
    }

    #[test]
    fn test_budget_exhausted_drops_datagram() {
        let mut r = rig(TransportMode::Udp, TransportTuning::default());
        r.probe.fail_always(LinkError::Timeout);
        r.probe.charge(r.clock.clone(), 50_000);

        let err = r.transport.submit(datagram(&r.pool, 1)).unwrap_err();
        assert_eq!(err, SendError::Dropped(LinkError::Timeout));
        assert_eq!(r.pool.release_counts(), (0, 1));
        assert_eq!(r.diagnostics.send_failures(), 1);
    }

    #[test]
    fn test_fatal_error_class_is_immediate() {
        let mut r = rig(TransportMode::Udp, TransportTuning::default());
        r.probe.push(Err(LinkError::ConnectionLost));
        let err = r.transport.submit(datagram(&r.pool, 1)).unwrap_err();
        assert_eq!(err, SendError::Fatal(LinkError::ConnectionLost));
    }

    #[test]
    fn test_sustained_failures_become_fatal() {
        let tuning = TransportTuning {
            send_budget_ms: 10,
            fatal_failure_threshold_ms: 100,
            ..TransportTuning::default()
        };
        let mut r = rig(TransportMode::Udp, tuning);
        r.probe.fail_always(LinkError::Timeout);
        r.probe.charge(r.clock.clone(), 10_000);

        let mut outcomes = Vec::new();
        for i in 0..20 {
            match r.transport.submit(datagram(&r.pool, i)) {
                Err(SendError::Fatal(_)) => {
                    outcomes.push(true);
                    break;
                }
                Err(SendError::Dropped(_)) => outcomes.push(false),
                Ok(()) => panic!("send should fail"),
            }
        }
        assert_eq!(outcomes.last(), Some(&true));
        // Each failure costs 10 ms; the threshold is 100 ms after the first.
        assert_eq!(outcomes.len(), 11);
    }

    #[test]
    fn test_success_resets_failure_run() {
        let tuning = TransportTuning {
            send_budget_ms: 10,
            fatal_failure_threshold_ms: 100,
            ..TransportTuning::default()
        };
        let mut r = rig(TransportMode::Udp, tuning);
        r.probe.charge(r.clock.clone(), 10_000);
        for _ in 0..5 {
            r.probe.push(Err(LinkError::Timeout));
        }
        for i in 0..5 {
            assert!(r.transport.submit(datagram(&r.pool, i)).is_err());
        }
        r.transport.submit(datagram(&r.pool, 7)).unwrap();
        r.clock.advance_us(1_000_000);

        r.probe.push(Err(LinkError::Timeout));
        let err = r.transport.submit(datagram(&r.pool, 8)).unwrap_err();
        assert_eq!(err, SendError::Dropped(LinkError::Timeout));
    }

    #[test]
    fn test_close_flushes_partial_batch() {
        let mut r = rig(TransportMode::Tcp, TransportTuning::default());
        r.transport.submit(datagram(&r.pool, 4)).unwrap();
        r.transport.close();
        assert_eq!(r.probe.sent(), vec![vec![4; LEN]]);
        assert!(r.probe.is_closed());
    }

    #[test]
    fn test_send_duration_recorded_from_clock() {
        let mut r = rig(TransportMode::Udp, TransportTuning::default());
        r.probe.charge(r.clock.clone(), 1_234);
        for i in 0..10 {
            r.transport.submit(datagram(&r.pool, i)).unwrap();
        }
        let snap = r.diagnostics.snapshot();
        assert_eq!(snap.worst_send_us, 1_234);
        assert_eq!(snap.average_send_us, 1_234);
    }

    #[test]
    fn test_thousand_fixed_cost_sends_give_exact_timing() {
        let mut r = rig(TransportMode::Udp, TransportTuning::default());
        r.probe.charge(r.clock.clone(), 1_500);
        for i in 0..1000 {
            r.transport.submit(datagram(&r.pool, i as u8)).unwrap();
        }
        let snap = r.diagnostics.snapshot();
        assert_eq!(snap.total_sends, 1000);
        assert_eq!(snap.total_datagrams, 1000);
        assert_eq!(snap.total_bytes, 1000 * LEN as u64);
        assert_eq!(snap.worst_send_us, 1_500);
        assert_eq!(snap.average_send_us, 1_500);
        assert_eq!(snap.send_failures, 0);
        assert_eq!(snap.percent_over_budget, 0.0);
        assert_eq!(r.pool.release_counts(), (1000, 0));
    }
}
