//! Codec contract and datagram pool.
//!
//! A codec turns raw sample blocks into fixed-size datagrams kept in a bounded
//! [`DatagramPool`]. The sender takes ready datagrams as [`Datagram`] handles:
//! the slot stays owned by the handle until it is either confirmed sent
//! ([`Datagram::mark_consumed`]) or dropped (discarded), and either way returns
//! to the pool's free list.

use crate::config::{CaptureConfig, Gain};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex};

/// Notifications raised by a codec while encoding.
pub trait CodecEvents: Send + Sync {
    /// A datagram became ready.
    fn on_datagram_ready(&self);
    /// The pool ran out of free slots; datagrams are being dropped.
    fn on_overflow_begin(&self);
    /// Free slots are available again after `dropped` datagrams were lost.
    fn on_overflow_end(&self, dropped: u32);
}

/// Audio encoder collaborator.
pub trait Codec: Send + Sync {
    /// Prepare for a new session. Returns `false` if the codec cannot start.
    fn init(&self, gain: Gain, events: Arc<dyn CodecEvents>) -> bool;

    /// Release the session: detach events and discard queued datagrams.
    fn deinit(&self);

    /// Encode one half of the capture buffer.
    fn encode_block(&self, samples: &[i16]);

    /// Oldest ready datagram, if any.
    fn take_ready_datagram(&self) -> Option<Datagram>;

    /// Free slots in the pool.
    fn available_count(&self) -> usize;

    /// Fewest free slots seen since `init`.
    fn free_low_water_mark(&self) -> usize;

    /// Bytes per datagram.
    fn datagram_len(&self) -> usize;
}

/// Bounded store of fixed-size datagram buffers.
pub struct DatagramPool {
    datagram_len: usize,
    capacity: usize,
    inner: Mutex<PoolInner>,
}

struct PoolInner {
    free: Vec<Box<[u8]>>,
    ready: VecDeque<Box<[u8]>>,
    low_water: usize,
    consumed: u64,
    discarded: u64,
}

impl DatagramPool {
    pub fn new(datagram_len: usize, capacity: usize) -> Arc<Self> {
        let free = (0..capacity)
            .map(|_| vec![0u8; datagram_len].into_boxed_slice())
            .collect();
        Arc::new(Self {
            datagram_len,
            capacity,
            inner: Mutex::new(PoolInner {
                free,
                ready: VecDeque::with_capacity(capacity),
                low_water: capacity,
                consumed: 0,
                discarded: 0,
            }),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn datagram_len(&self) -> usize {
        self.datagram_len
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Copy `payload` into a free slot and queue it. Returns `false` when the
    /// pool is full and the payload was dropped.
    pub fn push_ready(&self, payload: &[u8]) -> bool {
        let mut inner = self.lock();
        let Some(mut slot) = inner.free.pop() else {
            return false;
        };
        let n = payload.len().min(slot.len());
        slot[..n].copy_from_slice(&payload[..n]);
        slot[n..].fill(0);
        inner.ready.push_back(slot);
        inner.low_water = inner.low_water.min(inner.free.len());
        true
    }

    /// Take the oldest ready datagram.
    pub fn take_ready(self: &Arc<Self>) -> Option<Datagram> {
        let slot = self.lock().ready.pop_front()?;
        Some(Datagram {
            data: Some(slot),
            pool: self.clone(),
        })
    }

    pub fn free_count(&self) -> usize {
        self.lock().free.len()
    }

    pub fn low_water_mark(&self) -> usize {
        self.lock().low_water
    }

    /// (consumed, discarded) totals.
    pub fn release_counts(&self) -> (u64, u64) {
        let inner = self.lock();
        (inner.consumed, inner.discarded)
    }

    /// Discard queued datagrams and reset the low-water mark.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let queued: Vec<_> = inner.ready.drain(..).collect();
        inner.free.extend(queued);
        inner.low_water = inner.free.len();
    }

    fn release(&self, slot: Box<[u8]>, consumed: bool) {
        let mut inner = self.lock();
        if consumed {
            inner.consumed += 1;
        } else {
            inner.discarded += 1;
        }
        inner.free.push(slot);
    }
}

impl fmt::Debug for DatagramPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatagramPool")
            .field("datagram_len", &self.datagram_len)
            .field("capacity", &self.capacity)
            .field("free", &self.free_count())
            .finish()
    }
}

/// A ready datagram on loan from its pool.
///
/// Dropping the handle discards the datagram; [`mark_consumed`](Self::mark_consumed)
/// records it as sent. Both return the slot to the pool.
pub struct Datagram {
    data: Option<Box<[u8]>>,
    pool: Arc<DatagramPool>,
}

impl Datagram {
    /// Confirm the datagram was sent and free its slot.
    pub fn mark_consumed(mut self) {
        if let Some(slot) = self.data.take() {
            self.pool.release(slot, true);
        }
    }
}

impl Deref for Datagram {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl Drop for Datagram {
    fn drop(&mut self) {
        if let Some(slot) = self.data.take() {
            self.pool.release(slot, false);
        }
    }
}

impl fmt::Debug for Datagram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Datagram({} bytes)", self.len())
    }
}

/// Target peak level of the automatic gain, as a fraction of full scale.
const AGC_TARGET: f32 = 0.5;
const AGC_MIN: f32 = 0.25;
const AGC_MAX: f32 = 16.0;
/// Fraction of the distance to the desired gain covered per block.
const AGC_SMOOTHING: f32 = 0.1;

/// Host codec: gain-scaled 16-bit little-endian PCM.
///
/// Each datagram carries `datagram_len / 2` samples. Samples left over at the
/// end of a block wait for the next block.
pub struct PcmCodec {
    pool: Arc<DatagramPool>,
    state: Mutex<PcmState>,
}

struct PcmState {
    events: Option<Arc<dyn CodecEvents>>,
    gain: Gain,
    agc: f32,
    staging: Vec<u8>,
    overflow_dropped: Option<u32>,
}

impl PcmCodec {
    pub fn new(capture: &CaptureConfig) -> Self {
        Self {
            pool: DatagramPool::new(capture.datagram_bytes, capture.pool_datagrams),
            state: Mutex::new(PcmState {
                events: None,
                gain: Gain::Auto,
                agc: 1.0,
                staging: Vec::with_capacity(capture.datagram_bytes * 2),
                overflow_dropped: None,
            }),
        }
    }

    pub fn pool(&self) -> &Arc<DatagramPool> {
        &self.pool
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PcmState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl PcmState {
    fn scale(&mut self, samples: &[i16]) -> f32 {
        match self.gain.linear() {
            Some(linear) => linear,
            None => {
                let peak = samples
                    .iter()
                    .map(|s| (*s as i32).unsigned_abs())
                    .max()
                    .unwrap_or(0);
                if peak > 0 {
                    let desired = (AGC_TARGET * i16::MAX as f32 / peak as f32)
                        .clamp(AGC_MIN, AGC_MAX);
                    self.agc += (desired - self.agc) * AGC_SMOOTHING;
                }
                self.agc
            }
        }
    }
}

impl Codec for PcmCodec {
    fn init(&self, gain: Gain, events: Arc<dyn CodecEvents>) -> bool {
        self.pool.reset();
        let mut state = self.lock();
        state.events = Some(events);
        state.gain = gain;
        state.agc = 1.0;
        state.staging.clear();
        state.overflow_dropped = None;
        debug!(
            "PCM codec ready: {} x {} byte datagrams, gain {:?}",
            self.pool.capacity(),
            self.pool.datagram_len(),
            gain
        );
        true
    }

    fn deinit(&self) {
        let mut state = self.lock();
        state.events = None;
        state.staging.clear();
        self.pool.reset();
    }

    fn encode_block(&self, samples: &[i16]) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(events) = state.events.clone() else {
            return;
        };

        let scale = state.scale(samples);
        for sample in samples {
            let scaled = (*sample as f32 * scale).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
            state.staging.extend_from_slice(&scaled.to_le_bytes());
        }

        let len = self.pool.datagram_len();
        let mut offset = 0;
        while state.staging.len() - offset >= len {
            let chunk = &state.staging[offset..offset + len];
            offset += len;
            if self.pool.push_ready(chunk) {
                if let Some(dropped) = state.overflow_dropped.take() {
                    info!("Datagram store recovered, {} dropped", dropped);
                    events.on_overflow_end(dropped);
                }
                events.on_datagram_ready();
            } else {
                match state.overflow_dropped.as_mut() {
                    Some(dropped) => *dropped += 1,
                    None => {
                        warn!("Datagram store full, dropping audio");
                        state.overflow_dropped = Some(1);
                        events.on_overflow_begin();
                    }
                }
            }
        }
        state.staging.drain(..offset);
    }

    fn take_ready_datagram(&self) -> Option<Datagram> {
        self.pool.take_ready()
    }

    fn available_count(&self) -> usize {
        self.pool.free_count()
    }

    fn free_low_water_mark(&self) -> usize {
        self.pool.low_water_mark()
    }

    fn datagram_len(&self) -> usize {
        self.pool.datagram_len()
    }
}
