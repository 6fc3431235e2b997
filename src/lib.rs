//! Real-time averaged power spectra from a digitizer streaming in FIFO mode.
//!
//! The producer side ([`stream::Streamer`]) pulls traces from an
//! [`source::AcquisitionSource`], converts, transforms and accumulates them,
//! and publishes completed windows through [`exfil::Exchange`] for a
//! [`exfil::Reader`] living on another thread.

use std::time::Duration;

use num_traits::AsPrimitive;

pub mod capture;
pub mod error;
pub mod exfil;
pub mod f_engine;
pub mod monitoring;
pub mod power;
pub mod settings;
pub mod source;
pub mod stream;

pub use error::{DaqError, Result};

/// Convert a block of interleaved ADC samples (`nsamples x nchannels`, row-major)
/// into calibrated values, `output[n, c] = input[n, c] * scales[c]`.
///
/// `scales` holds one factor per *enabled* channel, in enabled-channel order.
pub fn convert<T>(input: &[T], scales: &[f64], output: &mut [f64])
where
    T: AsPrimitive<f64>,
{
    let nch = scales.len();
    assert_eq!(input.len(), output.len());
    assert_eq!(input.len() % nch, 0, "Block must hold whole sample rows");
    for (row_out, row_in) in output.chunks_exact_mut(nch).zip(input.chunks_exact(nch)) {
        for ((o, i), s) in row_out.iter_mut().zip(row_in).zip(scales) {
            *o = i.as_() * s;
        }
    }
}

/// Same as [`convert`], but only for the column `channel` of the block
pub fn convert_channel<T>(
    input: &[T],
    nchannels: usize,
    channel: usize,
    scale: f64,
    output: &mut [f64],
) where
    T: AsPrimitive<f64>,
{
    assert!(channel < nchannels);
    assert_eq!(input.len(), output.len() * nchannels);
    for (o, row) in output.iter_mut().zip(input.chunks_exact(nchannels)) {
        *o = row[channel].as_() * scale;
    }
}

/// Time covered by `nsamples` at `sample_rate`. Rates that would make this
/// unrepresentable (zero, tiny, not finite) give [`Duration::MAX`].
pub fn span(nsamples: usize, sample_rate: f64) -> Duration {
    Duration::try_from_secs_f64(nsamples as f64 / sample_rate).unwrap_or(Duration::MAX)
}

/// Keep every `factor`-th sample of `input`
pub fn decimate(input: &[f64], factor: usize, output: &mut [f64]) {
    assert_eq!(output.len(), input.len() / factor);
    for (o, i) in output.iter_mut().zip(input.iter().step_by(factor)) {
        *o = *i;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::prelude::*;

    #[test]
    fn test_convert_exact() {
        let mut rng = rand::thread_rng();
        let scales = [10.0 / 32767.0, 0.5, 2.0];
        let input: Vec<i16> = (0..3 * 512).map(|_| rng.gen()).collect();
        let mut output = vec![0f64; input.len()];
        convert(&input, &scales, &mut output);
        for n in 0..512 {
            for c in 0..3 {
                assert_eq!(output[n * 3 + c], input[n * 3 + c] as f64 * scales[c]);
            }
        }
    }

    #[test]
    fn test_convert_channel_matches_convert() {
        let scales = [0.25, 4.0];
        let input: Vec<i16> = (-64..64).collect();
        let mut full = vec![0f64; input.len()];
        let mut second = vec![0f64; input.len() / 2];
        convert(&input, &scales, &mut full);
        convert_channel(&input, 2, 1, scales[1], &mut second);
        for (n, v) in second.iter().enumerate() {
            assert_eq!(*v, full[2 * n + 1]);
        }
    }

    #[test]
    fn test_decimate() {
        let input: Vec<f64> = (0..1000).map(|x| x as f64).collect();
        let mut output = vec![0f64; 10];
        decimate(&input, 100, &mut output);
        assert_eq!(output[0], 0.0);
        assert_eq!(output[9], 900.0);
    }

    #[test]
    fn test_span_saturates() {
        assert_eq!(span(4096, 4.096e6), Duration::from_millis(1));
        assert_eq!(span(4, 1e-20), Duration::MAX);
        assert_eq!(span(4, 0.0), Duration::MAX);
        assert_eq!(span(4, f64::NAN), Duration::MAX);
    }
}
