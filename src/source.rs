//! The interface we need from whatever owns the card

use std::time::Duration;

use crate::{
    error::Result,
    settings::AcquisitionSettings,
};

/// What the card actually ended up with after configuration.
/// Everything downstream sizes buffers and normalizes with these, never the requested values.
#[derive(Clone, Debug, PartialEq)]
pub struct Configured {
    pub sample_rate: f64,
    pub nsamples: usize,
    /// Volts per code of each enabled channel, in enabled-channel order
    pub scales: Vec<f64>,
}

impl Configured {
    pub fn trace_duration(&self) -> Duration {
        crate::span(self.nsamples, self.sample_rate)
    }
}

/// A borrowed trace of interleaved samples, `nsamples x nchannels`.
///
/// This points into the source's own storage, which gets overwritten by the next
/// call to [`AcquisitionSource::next_trace`]; copy out anything you need to keep.
#[derive(Clone, Copy, Debug)]
pub struct TraceView<'a> {
    samples: &'a [i16],
    nchannels: usize,
}

impl<'a> TraceView<'a> {
    pub fn new(samples: &'a [i16], nchannels: usize) -> Self {
        assert_eq!(samples.len() % nchannels, 0);
        Self { samples, nchannels }
    }

    pub fn samples(&self) -> &'a [i16] {
        self.samples
    }

    pub fn nchannels(&self) -> usize {
        self.nchannels
    }

    pub fn nsamples(&self) -> usize {
        self.samples.len() / self.nchannels
    }

    /// Calibrated copy of the whole trace
    pub fn to_volts(&self, scales: &[f64]) -> Vec<f64> {
        let mut out = vec![0f64; self.samples.len()];
        crate::convert(self.samples, scales, &mut out);
        out
    }
}

/// A digitizer streaming in FIFO mode.
///
/// `next_trace` is the blocking point of the whole pipeline. It must give up
/// with [`crate::DaqError::Timeout`] after the configured timeout instead of hanging.
pub trait AcquisitionSource {
    /// Apply settings. The card may round the requested values.
    fn configure(&mut self, settings: &AcquisitionSettings) -> Result<Configured>;
    /// Arm the card and start the DMA transfer
    fn start(&mut self) -> Result<()>;
    /// Block until the next trace is available
    fn next_trace(&mut self) -> Result<TraceView<'_>>;
    /// Stop the transfer. Idempotent.
    fn stop(&mut self) -> Result<()>;
    /// Stop and return the card to its default settings
    fn reset(&mut self) -> Result<()>;
    /// Release the card. Idempotent.
    fn close(&mut self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_view_shape() {
        let samples = [1i16, -1, 2, -2, 3, -3];
        let view = TraceView::new(&samples, 2);
        assert_eq!(view.nsamples(), 3);
        assert_eq!(view.to_volts(&[1.0, 0.5]), vec![1.0, -0.5, 2.0, -1.0, 3.0, -1.5]);
    }

    #[test]
    fn test_trace_duration() {
        let c = Configured {
            sample_rate: 1000.0,
            nsamples: 500,
            scales: vec![1.0],
        };
        assert_eq!(c.trace_duration(), Duration::from_millis(500));
    }
}
