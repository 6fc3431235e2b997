//! This module contains all the capture logic
//!
//! The acquisition thread does one thing: produce traces at the card's pace and
//! drop their raw bytes into an rtrb ring buffer standing in for the card's DMA
//! buffer. The streaming loop pulls whole traces back out on its own thread.
//! If the loop doesn't keep up and the ring is full, new traces are lost, just
//! like a real card overrunning its buffer.

use std::{
    f64::consts::TAU,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use byte_slice_cast::{AsByteSlice, AsMutByteSlice};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::{
    error::{DaqError, Result},
    settings::{AcquisitionSettings, TriggerMode, FIFO_GRANULARITY, MAX_ADC},
    monitoring::OverflowLatch,
    source::{AcquisitionSource, Configured, TraceView},
};

/// Depth of the DMA buffer, in traces
pub const DMA_TRACES: usize = 8;
// How long next_trace sleeps between looks at the DMA buffer
const POLL_INTERVAL: Duration = Duration::from_micros(200);
// Longest uninterrupted sleep of the acquisition thread, bounds stop latency
const PACING_STEP: Duration = Duration::from_millis(10);

/// What the simulated inputs see
#[derive(Clone, Debug, PartialEq)]
pub struct SimulatedSignal {
    pub tone_frequency: f64,
    /// Tone amplitude in V
    pub tone_amplitude: f64,
    /// RMS of the uniform noise added on top, in V
    pub noise_rms: f64,
    /// Whether hardware triggers arrive. Without them a triggered acquisition never produces data.
    pub external_triggers: bool,
    pub seed: u64,
}

impl Default for SimulatedSignal {
    fn default() -> Self {
        Self {
            tone_frequency: 1.25e6,
            tone_amplitude: 1.0,
            noise_rms: 0.05,
            external_triggers: true,
            seed: 0x5eed,
        }
    }
}

// Fills interleaved traces with a phase-continuous tone plus noise
struct TraceGenerator {
    scales: Vec<f64>,
    amplitude: f64,
    noise: f64,
    dphi: f64,
    phase: f64,
    rng: StdRng,
}

impl TraceGenerator {
    fn new(signal: &SimulatedSignal, configured: &Configured) -> Self {
        Self {
            scales: configured.scales.clone(),
            amplitude: signal.tone_amplitude,
            // Uniform on [-a, a] has an RMS of a / sqrt(3)
            noise: signal.noise_rms * 3f64.sqrt(),
            dphi: TAU * signal.tone_frequency / configured.sample_rate,
            phase: 0.0,
            rng: StdRng::seed_from_u64(signal.seed),
        }
    }

    fn fill(&mut self, samples: &mut [i16]) {
        let nch = self.scales.len();
        for row in samples.chunks_exact_mut(nch) {
            let tone = self.amplitude * self.phase.sin();
            for (s, scale) in row.iter_mut().zip(&self.scales) {
                let v = tone + self.noise * (2.0 * self.rng.gen::<f64>() - 1.0);
                *s = (v / scale).round().clamp(-(MAX_ADC as f64) - 1.0, MAX_ADC as f64) as i16;
            }
            self.phase = (self.phase + self.dphi) % TAU;
        }
    }
}

// Shared between the card and its acquisition thread
#[derive(Debug, Default)]
struct Overruns {
    traces: AtomicU64,
    episodes: AtomicU64,
}

fn acquire(
    mut producer: rtrb::Producer<u8>,
    mut generator: Option<TraceGenerator>,
    trace_len: usize,
    trace_duration: Duration,
    stop: Arc<AtomicBool>,
    overruns: Arc<Overruns>,
) {
    let mut samples = vec![0i16; trace_len];
    let mut latch = OverflowLatch::default();
    let mut lost = 0u64;
    let start = Instant::now();
    let mut count = 0u64;
    loop {
        count += 1;
        // Pace to real time, one trace per trace duration
        let due = start + trace_duration.mul_f64(count as f64);
        loop {
            if stop.load(Ordering::Relaxed) {
                return;
            }
            let now = Instant::now();
            if now >= due {
                break;
            }
            thread::sleep((due - now).min(PACING_STEP));
        }
        // No trigger, no data
        let Some(signal) = generator.as_mut() else {
            continue;
        };
        signal.fill(&mut samples);
        let bytes = samples.as_byte_slice();
        match producer.write_chunk(bytes.len()) {
            Ok(mut chunk) => {
                let (first, second) = chunk.as_mut_slices();
                let split = first.len();
                first.copy_from_slice(&bytes[..split]);
                second.copy_from_slice(&bytes[split..]);
                chunk.commit_all();
                if latch.is_overflowing() {
                    info!(lost, "DMA buffer caught up");
                    latch.reset();
                    lost = 0;
                }
            }
            Err(_) => {
                overruns.traces.fetch_add(1, Ordering::Relaxed);
                lost += 1;
                // One full buffer is one overrun, however long it lasts
                if latch.observe(1, 1) {
                    overruns.episodes.fetch_add(1, Ordering::Relaxed);
                    warn!("DMA buffer overrun, dropping traces");
                }
            }
        }
    }
}

struct CaptureThread {
    consumer: rtrb::Consumer<u8>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

struct CardConfig {
    configured: Configured,
    nchannels: usize,
    timeout: Duration,
    triggered: bool,
}

/// A four channel digitizer that synthesizes its input
pub struct SimulatedCard {
    signal: SimulatedSignal,
    config: Option<CardConfig>,
    capture: Option<CaptureThread>,
    trace: Vec<i16>,
    overruns: Arc<Overruns>,
    closed: bool,
}

impl SimulatedCard {
    pub fn new(signal: SimulatedSignal) -> Self {
        info!("Using a simulated card");
        Self {
            signal,
            config: None,
            capture: None,
            trace: Vec::new(),
            overruns: Arc::default(),
            closed: false,
        }
    }

    /// Traces lost to DMA overruns since the card was opened
    pub fn dropped_traces(&self) -> u64 {
        self.overruns.traces.load(Ordering::Relaxed)
    }

    /// Distinct overruns, each covering one or more dropped traces
    pub fn overruns(&self) -> u64 {
        self.overruns.episodes.load(Ordering::Relaxed)
    }

    pub fn is_streaming(&self) -> bool {
        self.capture.is_some()
    }
}

impl Default for SimulatedCard {
    fn default() -> Self {
        Self::new(SimulatedSignal::default())
    }
}

/// FIFO traces come in whole segments
fn round_to_segments(nsamples: usize) -> usize {
    let segments = (nsamples as f64 / FIFO_GRANULARITY as f64).round() as usize;
    segments.max(1) * FIFO_GRANULARITY
}

impl AcquisitionSource for SimulatedCard {
    fn configure(&mut self, settings: &AcquisitionSettings) -> Result<Configured> {
        if self.closed {
            return Err(DaqError::Disconnected);
        }
        settings.validate()?;
        self.stop()?;

        let nsamples = round_to_segments(settings.nsamples);
        if nsamples != settings.nsamples {
            info!(
                requested = settings.nsamples,
                actual = nsamples,
                "Number of samples changed to a multiple of {} for FIFO mode",
                FIFO_GRANULARITY
            );
        }
        let sample_rate = settings.sample_rate.round().max(1.0);
        if nsamples as f64 / sample_rate >= settings.timeout.as_secs_f64() {
            return Err(DaqError::Configuration(format!(
                "Timeout ({:?}) is shorter than the rounded acquisition time",
                settings.timeout
            )));
        }
        let configured = Configured {
            sample_rate,
            nsamples,
            scales: settings.scales(),
        };
        debug!(
            mode = ?settings.mode,
            trigger = ?settings.trigger,
            clock = ?settings.clock,
            "Card configured"
        );
        self.trace = vec![0; nsamples * settings.channels.len()];
        self.config = Some(CardConfig {
            configured: configured.clone(),
            nchannels: settings.channels.len(),
            timeout: settings.timeout,
            triggered: settings.trigger != TriggerMode::Software,
        });
        Ok(configured)
    }

    fn start(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }
        let cfg = self
            .config
            .as_ref()
            .ok_or_else(|| DaqError::Configuration("Card has not been configured".to_owned()))?;
        let trace_len = cfg.configured.nsamples * cfg.nchannels;
        let (producer, consumer) = rtrb::RingBuffer::new(trace_len * 2 * DMA_TRACES);
        let generator = (!cfg.triggered || self.signal.external_triggers)
            .then(|| TraceGenerator::new(&self.signal, &cfg.configured));
        let trace_duration = cfg.configured.trace_duration();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            let overruns = self.overruns.clone();
            thread::Builder::new()
                .name("acquisition".to_owned())
                .spawn(move || {
                    acquire(producer, generator, trace_len, trace_duration, stop, overruns)
                })
                .map_err(|_| DaqError::Disconnected)?
        };
        self.capture = Some(CaptureThread {
            consumer,
            stop,
            handle,
        });
        debug!("Acquisition started");
        Ok(())
    }

    fn next_trace(&mut self) -> Result<TraceView<'_>> {
        let (cfg, capture) = match (&self.config, &mut self.capture) {
            (Some(cfg), Some(capture)) => (cfg, capture),
            _ => {
                return Err(DaqError::Configuration(
                    "Card is not streaming".to_owned(),
                ))
            }
        };
        let need = self.trace.len() * 2;
        let deadline = Instant::now() + cfg.timeout;
        while capture.consumer.slots() < need {
            if capture.consumer.is_abandoned() {
                return Err(DaqError::Disconnected);
            }
            if Instant::now() >= deadline {
                return Err(DaqError::Timeout(cfg.timeout));
            }
            thread::sleep(POLL_INTERVAL);
        }
        let chunk = capture
            .consumer
            .read_chunk(need)
            .map_err(|_| DaqError::Disconnected)?;
        let (first, second) = chunk.as_slices();
        let dst = self.trace.as_mut_byte_slice();
        dst[..first.len()].copy_from_slice(first);
        dst[first.len()..].copy_from_slice(second);
        chunk.commit_all();
        Ok(TraceView::new(&self.trace, cfg.nchannels))
    }

    fn stop(&mut self) -> Result<()> {
        if let Some(capture) = self.capture.take() {
            capture.stop.store(true, Ordering::Relaxed);
            capture.handle.join().map_err(|_| DaqError::Disconnected)?;
            debug!("Acquisition stopped");
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.stop()?;
        self.config = None;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.stop()?;
        self.closed = true;
        Ok(())
    }
}

impl Drop for SimulatedCard {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}
