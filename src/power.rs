//! Power spectra and the two averaging state machines that consume them.
//!
//! The display accumulator rolls over a fixed number of traces forever. The
//! reference accumulator counts up to a target set from the consumer side and
//! then sits idle until the consumer restarts it.

use std::sync::atomic::{AtomicU32, Ordering};

use realfft::num_complex::Complex;

use crate::error::{try_zeroed, Result};

/// `dst[i] = |src[i]|^2`
pub fn square(dst: &mut [f64], src: &[Complex<f64>]) {
    assert_eq!(dst.len(), src.len());
    for (d, s) in dst.iter_mut().zip(src) {
        *d = s.norm_sqr();
    }
}

/// Start (`is_first`) or continue a running sum in place
pub fn accumulate(acc: &mut [f64], frame: &[f64], is_first: bool) {
    assert_eq!(acc.len(), frame.len());
    if is_first {
        acc.copy_from_slice(frame);
    } else {
        for (a, f) in acc.iter_mut().zip(frame) {
            *a += f;
        }
    }
}

/// Plain average of `count` accumulated frames
pub fn normalize(acc: &mut [f64], count: u32) {
    let c = count as f64;
    for a in acc.iter_mut() {
        *a /= c;
    }
}

/// Turn a sum of `count` squared FFTs into a density in V^2/Hz,
/// `|FFT|^2 / (count * nsamples * sample_rate)`
pub fn normalize_psd(acc: &mut [f64], count: u32, nsamples: usize, sample_rate: f64) {
    let norm = 1.0 / (count as f64 * nsamples as f64 * sample_rate);
    for a in acc.iter_mut() {
        *a *= norm;
    }
}

/// Fold negative frequencies onto positive ones: interior bins doubled,
/// DC (and Nyquist, for even `nsamples`) left alone
pub fn fold_one_sided(psd: &mut [f64], nsamples: usize) {
    let end = if nsamples % 2 == 0 {
        psd.len() - 1
    } else {
        psd.len()
    };
    for p in psd[1..end].iter_mut() {
        *p *= 2.0;
    }
}

/// Everything a published spectrum goes through after accumulation
pub fn finish_psd(acc: &[f64], count: u32, nsamples: usize, sample_rate: f64, out: &mut [f64]) {
    out.copy_from_slice(acc);
    normalize_psd(out, count, nsamples, sample_rate);
    fold_one_sided(out, nsamples);
}

/// Rolling fixed-length average for the live display
pub struct DisplayAccumulator {
    acc: Vec<f64>,
    count: u32,
    // Length of the window in progress, captured when it started
    window: u32,
    next_window: u32,
}

impl DisplayAccumulator {
    pub fn new(nbins: usize, window: u32) -> Result<Self> {
        Ok(Self {
            acc: try_zeroed(nbins, 2 * (nbins - 1))?,
            count: 0,
            window,
            next_window: window,
        })
    }

    /// Takes effect when the next window starts, never in the middle of one
    pub fn set_window(&mut self, window: u32) {
        self.next_window = window.max(1);
    }

    pub fn window(&self) -> u32 {
        self.window
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    /// Add a power spectrum, returns true once the window is full
    pub fn push(&mut self, frame: &[f64]) -> bool {
        let first = self.count == 0;
        if first {
            self.window = self.next_window;
        }
        accumulate(&mut self.acc, frame, first);
        self.count += 1;
        self.count >= self.window
    }

    /// Write out the averaged PSD of the completed window and start over.
    /// Returns how many traces went in.
    pub fn finish(&mut self, nsamples: usize, sample_rate: f64, out: &mut [f64]) -> u32 {
        let count = self.count;
        finish_psd(&self.acc, count, nsamples, sample_rate, out);
        self.count = 0;
        count
    }

    /// Throw away a partial window
    pub fn discard(&mut self) {
        self.count = 0;
    }
}

/// Progress of the reference measurement, shared between the streaming loop
/// (which counts) and the consumer (which sets the target and restarts).
///
/// There's no lock. The consumer only ever decides things with `completed >= target`,
/// so reading a slightly stale count just delays noticing completion.
#[derive(Debug, Default)]
pub struct ReferenceCounters {
    target: AtomicU32,
    completed: AtomicU32,
}

impl ReferenceCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// (Re)start a reference measurement of `target` traces
    pub fn start(&self, target: u32) {
        self.target.store(target, Ordering::Release);
        self.completed.store(0, Ordering::Release);
    }

    /// Abandon the measurement in progress, keeping the target
    pub fn restart(&self) {
        self.completed.store(0, Ordering::Release);
    }

    pub fn target(&self) -> u32 {
        self.target.load(Ordering::Acquire)
    }

    pub fn completed(&self) -> u32 {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        let target = self.target();
        target > 0 && self.completed() >= target
    }

    // Fails if the consumer restarted us in the meantime
    fn advance(&self, from: u32, to: u32) -> bool {
        self.completed
            .compare_exchange(from, to, Ordering::Release, Ordering::Relaxed)
            .is_ok()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReferenceProgress {
    /// Nothing requested, or the target was already reached
    Idle,
    Accumulating(u32),
    /// This trace was the last one
    Completed(u32),
}

/// Open-ended sum for the user-triggered reference measurement
pub struct ReferenceAccumulator {
    acc: Vec<f64>,
}

impl ReferenceAccumulator {
    pub fn new(nbins: usize) -> Result<Self> {
        Ok(Self {
            acc: try_zeroed(nbins, 2 * (nbins - 1))?,
        })
    }

    /// Unnormalized running sum
    pub fn sum(&self) -> &[f64] {
        &self.acc
    }

    /// Add a power spectrum if a measurement is running. `on_complete` sees the
    /// finished sum before the count that marks completion becomes visible.
    pub fn push<F>(
        &mut self,
        frame: &[f64],
        counters: &ReferenceCounters,
        on_complete: F,
    ) -> ReferenceProgress
    where
        F: FnOnce(&[f64], u32),
    {
        let target = counters.target();
        let completed = counters.completed();
        if completed >= target {
            return ReferenceProgress::Idle;
        }
        accumulate(&mut self.acc, frame, completed == 0);
        let done = completed + 1;
        if done == target {
            on_complete(&self.acc, done);
        }
        if !counters.advance(completed, done) {
            // Restarted underneath us, the next trace begins a fresh sum
            return ReferenceProgress::Idle;
        }
        if done == target {
            ReferenceProgress::Completed(done)
        } else {
            ReferenceProgress::Accumulating(done)
        }
    }
}
