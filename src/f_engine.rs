//! One-sided FFT of a single real channel.
//!
//! The plan and all of its buffers are built once per trace length and reused
//! for every trace after that. Rebuilding only happens when the card is
//! reconfigured with a different length. Each transform plans with its own
//! planner, so dropping it frees the plan (planners cache every plan they make).

use std::sync::Arc;

use realfft::{num_complex::Complex, RealFftPlanner, RealToComplex};

use crate::error::{try_zeroed, Result};

pub struct SpectralTransform {
    fft: Arc<dyn RealToComplex<f64>>,
    input: Vec<f64>,
    output: Vec<Complex<f64>>,
    scratch: Vec<Complex<f64>>,
}

impl SpectralTransform {
    pub fn new(nsamples: usize) -> Result<Self> {
        let fft = RealFftPlanner::<f64>::new().plan_fft_forward(nsamples);
        Ok(Self {
            input: try_zeroed(nsamples, nsamples)?,
            output: try_zeroed(nsamples / 2 + 1, nsamples)?,
            scratch: try_zeroed(fft.get_scratch_len(), nsamples)?,
            fft,
        })
    }

    /// Samples per transform
    pub fn len(&self) -> usize {
        self.input.len()
    }

    pub fn is_empty(&self) -> bool {
        self.input.is_empty()
    }

    /// Frequency bins out, N/2 + 1
    pub fn nbins(&self) -> usize {
        self.output.len()
    }

    /// Transform `input`. The result lives in our output buffer and is overwritten
    /// by the next call.
    pub fn execute(&mut self, input: &[f64]) -> Result<&[Complex<f64>]> {
        // The transform scrambles its input, so work on our own copy
        self.input.copy_from_slice(input);
        self.fft
            .process_with_scratch(&mut self.input, &mut self.output, &mut self.scratch)?;
        Ok(&self.output)
    }
}
