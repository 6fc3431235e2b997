//! This module is responsible for exfilling averaged spectra to the consumer.
//!
//! Completed windows go into a small pool of slots, each behind its own lock.
//! The producer writes slot `write_count % L` while holding that slot's lock,
//! releases it, and only then bumps `write_count`. A consumer that sees
//! `write_count > read_count` can therefore lock slot `read_count % L` and find
//! finished data in it. The producer never waits for the consumer; a consumer
//! that falls a full lap behind is told so and skips ahead.

use std::{
    ops::Deref,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tracing::warn;

use crate::{
    error::{try_zeroed, Result},
    monitoring::OverflowLatch,
    power::ReferenceCounters,
};

pub const MIN_SLOTS: usize = 2;
pub const MAX_SLOTS: usize = 20;

/// Pool size that keeps roughly `max_delay` worth of traces in flight
pub fn ring_capacity(max_delay: Duration, trace_duration: Duration) -> usize {
    let n = (max_delay.as_secs_f64() / trace_duration.as_secs_f64()).floor();
    if n.is_finite() {
        (n as usize).clamp(MIN_SLOTS, MAX_SLOTS)
    } else {
        MAX_SLOTS
    }
}

// Every lock in here guards plain numbers that get completely rewritten by the
// next writer, so a panic while holding one leaves nothing worth refusing to read
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Contents of one ring slot
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SlotData {
    /// Value of `write_count` this slot was published under
    pub generation: u64,
    /// Traces averaged into `spectrum`
    pub averages: u32,
    /// One-sided PSD in V^2/Hz
    pub spectrum: Vec<f64>,
    /// Decimated time trace of the last trace in the window, in V
    pub time_trace: Vec<f64>,
}

#[derive(Debug)]
pub struct Slot {
    data: Mutex<SlotData>,
}

/// Held while reading a slot. Drop it (or call [`SlotGuard::end_read`]) as soon
/// as the copy is done, the producer may be waiting on it.
pub struct SlotGuard<'a>(MutexGuard<'a, SlotData>);

impl SlotGuard<'_> {
    pub fn end_read(self) {}
}

impl Deref for SlotGuard<'_> {
    type Target = SlotData;

    fn deref(&self) -> &SlotData {
        &self.0
    }
}

/// The fixed pool of slots
#[derive(Debug)]
pub struct Ring {
    slots: Box<[Slot]>,
    nbins: usize,
    ntds: usize,
}

impl Ring {
    pub fn new(capacity: usize, nbins: usize, ntds: usize) -> Result<Self> {
        let nsamples = 2 * nbins.saturating_sub(1);
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(Slot {
                data: Mutex::new(SlotData {
                    generation: 0,
                    averages: 0,
                    spectrum: try_zeroed(nbins, nsamples)?,
                    time_trace: try_zeroed(ntds, nsamples)?,
                }),
            });
        }
        Ok(Self {
            slots: slots.into_boxed_slice(),
            nbins,
            ntds,
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn nbins(&self) -> usize {
        self.nbins
    }

    pub fn ntds(&self) -> usize {
        self.ntds
    }

    /// Lock slot `index` for reading
    pub fn begin_read(&self, index: usize) -> SlotGuard<'_> {
        SlotGuard(lock(&self.slots[index].data))
    }

    /// Copy both buffers out of a slot, holding its lock only for the copy
    pub fn read_into(&self, index: usize, out: &mut SlotData) {
        let guard = self.begin_read(index);
        out.generation = guard.generation;
        out.averages = guard.averages;
        out.spectrum.clone_from(&guard.spectrum);
        out.time_trace.clone_from(&guard.time_trace);
        guard.end_read();
    }
}

/// Stream parameters as they ended up after configuration
#[derive(Clone, Debug, PartialEq)]
pub struct StreamInfo {
    /// Actual sample rate, Hz
    pub sample_rate: f64,
    /// Actual samples per trace
    pub nsamples: usize,
    /// Hardware channel the spectra come from
    pub channel: u8,
    /// Display averaging count at configuration time
    pub naverages_rt: u32,
    pub time_decimation: usize,
}

impl StreamInfo {
    pub fn nbins(&self) -> usize {
        self.nsamples / 2 + 1
    }

    /// Length of the time-domain preview
    pub fn ntds(&self) -> usize {
        self.nsamples / self.time_decimation
    }

    pub fn trace_duration(&self) -> Duration {
        crate::span(self.nsamples, self.sample_rate)
    }

    /// Frequency of every spectrum bin, Hz
    pub fn frequencies(&self) -> Vec<f64> {
        let df = self.sample_rate / self.nsamples as f64;
        (0..self.nbins()).map(|k| k as f64 * df).collect()
    }

    /// Time of every time-domain preview sample, s
    pub fn times(&self) -> Vec<f64> {
        let dt = self.time_decimation as f64 / self.sample_rate;
        (0..self.ntds()).map(|i| i as f64 * dt).collect()
    }
}

/// One configuration's worth of publishing. A new session starts with
/// `write_count` at zero; the ring is shared with the previous session unless
/// its shape changed.
#[derive(Debug)]
pub struct Session {
    info: StreamInfo,
    ring: Arc<Ring>,
    write_count: AtomicU64,
}

impl Session {
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    pub fn ring(&self) -> &Arc<Ring> {
        &self.ring
    }

    pub fn write_count(&self) -> u64 {
        self.write_count.load(Ordering::Acquire)
    }
}

/// Everything the producer and consumer share
#[derive(Debug, Default)]
pub struct Exchange {
    session: Mutex<Option<Arc<Session>>>,
    reference: ReferenceCounters,
    reference_psd: Mutex<Vec<f64>>,
}

impl Exchange {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn reference(&self) -> &ReferenceCounters {
        &self.reference
    }

    /// The session being published to, if streaming
    pub fn session(&self) -> Option<Arc<Session>> {
        lock(&self.session).clone()
    }

    /// Start publishing under new settings. Counters restart from zero.
    pub fn begin_session(self: &Arc<Self>, info: StreamInfo, ring: Arc<Ring>) -> Result<Publisher> {
        let fresh = try_zeroed(ring.nbins(), info.nsamples)?;
        *lock(&self.reference_psd) = fresh;
        self.reference.restart();
        let session = Arc::new(Session {
            info,
            ring,
            write_count: AtomicU64::new(0),
        });
        *lock(&self.session) = Some(session.clone());
        Ok(Publisher {
            exchange: self.clone(),
            session,
        })
    }

    /// Nothing to read anymore
    pub fn end_session(&self) {
        *lock(&self.session) = None;
        self.reference.restart();
    }
}

/// Producer half
#[derive(Debug)]
pub struct Publisher {
    exchange: Arc<Exchange>,
    session: Arc<Session>,
}

impl Publisher {
    pub fn ring(&self) -> &Arc<Ring> {
        &self.session.ring
    }

    /// Publish one completed window
    pub fn publish(&self, spectrum: &[f64], time_trace: &[f64], averages: u32) {
        let generation = self.session.write_count.load(Ordering::Relaxed);
        let ring = &self.session.ring;
        let index = (generation % ring.capacity() as u64) as usize;
        {
            let mut slot = lock(&ring.slots[index].data);
            slot.generation = generation;
            slot.averages = averages;
            slot.spectrum.copy_from_slice(spectrum);
            slot.time_trace.copy_from_slice(time_trace);
        }
        // Only once the lock is gone may the consumer learn about this slot
        self.session.write_count.store(generation + 1, Ordering::Release);
    }

    /// Make a finished reference PSD available. Call before the completion count is stored.
    pub fn publish_reference(&self, psd: &[f64]) {
        lock(&self.exchange.reference_psd).copy_from_slice(psd);
    }
}

/// Consumer half. Never blocks on the producer except for the short slot copy.
#[derive(Debug)]
pub struct Reader {
    exchange: Arc<Exchange>,
    session: Option<Arc<Session>>,
    read_count: u64,
    overflow: OverflowLatch,
}

impl Reader {
    pub fn new(exchange: Arc<Exchange>) -> Self {
        Self {
            exchange,
            session: None,
            read_count: 0,
            overflow: OverflowLatch::default(),
        }
    }

    /// Settings of the stream being read, if any
    pub fn info(&self) -> Option<&StreamInfo> {
        self.session.as_deref().map(Session::info)
    }

    pub fn read_count(&self) -> u64 {
        self.read_count
    }

    /// Distinct overflows seen in the current session
    pub fn overflows(&self) -> u64 {
        self.overflow.occurrences()
    }

    // Follow the producer onto a new session, starting over at zero
    fn refresh(&mut self) {
        let current = self.exchange.session();
        let same = match (&current, &self.session) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        if !same {
            self.session = current;
            self.read_count = 0;
            self.overflow = OverflowLatch::default();
        }
    }

    /// Copy out the next unread slot. Returns false if there is nothing new.
    pub fn poll(&mut self, out: &mut SlotData) -> bool {
        self.refresh();
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        let write_count = session.write_count.load(Ordering::Acquire);
        if write_count <= self.read_count {
            // Caught up, the next lap behind is a new overflow
            self.overflow.reset();
            return false;
        }
        let capacity = session.ring.capacity();
        let behind = write_count - self.read_count;
        if self.overflow.observe(behind, capacity) {
            warn!(behind, capacity, "Interprocess buffer overflow, consumer is a full lap behind");
        }
        if behind >= capacity as u64 {
            // Everything older than the newest slot may already be overwritten
            self.read_count = write_count - 1;
        }
        let index = (self.read_count % capacity as u64) as usize;
        session.ring.read_into(index, out);
        // The producer may have lapped us between the snapshot and the lock
        self.read_count = out.generation.max(self.read_count) + 1;
        true
    }

    /// Start a reference measurement over `target` traces
    pub fn start_reference(&self, target: u32) {
        self.exchange.reference.start(target);
    }

    /// (completed, target)
    pub fn reference_progress(&self) -> (u32, u32) {
        let r = &self.exchange.reference;
        (r.completed(), r.target())
    }

    /// Copy out the finished reference PSD, if the measurement is complete
    pub fn read_reference(&self, out: &mut Vec<f64>) -> bool {
        if !self.exchange.reference.is_complete() {
            return false;
        }
        out.clone_from(&lock(&self.exchange.reference_psd));
        true
    }
}
