use std::{collections::TryReserveError, time::Duration};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DaqError {
    /// Settings the card (or the pipeline) cannot run with
    #[error("Invalid acquisition settings: {0}")]
    Configuration(String),
    /// No trace arrived within the configured hardware timeout
    #[error("Timed out after {0:?} waiting for the next trace")]
    Timeout(Duration),
    #[error("Could not allocate buffers for {nsamples}-sample traces: {source}")]
    Allocation {
        nsamples: usize,
        #[source]
        source: TryReserveError,
    },
    /// The acquisition thread went away underneath us
    #[error("Acquisition source disconnected")]
    Disconnected,
    #[error("FFT failed: {0}")]
    Fft(#[from] realfft::FftError),
}

impl DaqError {
    /// Only these two abort an acquisition that is in progress
    pub fn aborts_acquisition(&self) -> bool {
        matches!(self, DaqError::Configuration(_) | DaqError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, DaqError>;

/// Allocate a zeroed buffer, reporting allocation failure instead of aborting
pub(crate) fn try_zeroed<T: Clone + Default>(len: usize, nsamples: usize) -> Result<Vec<T>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|source| DaqError::Allocation { nsamples, source })?;
    buf.resize(len, T::default());
    Ok(buf)
}
