//! Acquisition settings and the control messages that carry them to the streaming loop

use std::time::Duration;

use crate::error::{DaqError, Result};

/// Number of analog inputs on the card
pub const MAX_CHANNELS: u8 = 4;
/// Largest ADC code (16 bit, signed)
pub const MAX_ADC: i16 = 32767;
/// Input ranges the front end supports, in mV
pub const VALID_FULLRANGES_MV: [u32; 6] = [200, 500, 1000, 2000, 5000, 10000];
/// Sample counts must be a multiple of this
pub const SAMPLE_GRANULARITY: usize = 4;
/// FIFO segments are a multiple of this many samples
pub const FIFO_GRANULARITY: usize = 2048;

/// Card recording modes supported by the streaming loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// One trigger, then traces stream indefinitely
    FifoSingle,
    /// Every trace waits for its own trigger event
    FifoMulti,
}

impl AcquisitionMode {
    /// The mode a given trigger calls for
    pub fn for_trigger(trigger: &TriggerMode) -> Self {
        match trigger {
            TriggerMode::Software => AcquisitionMode::FifoSingle,
            _ => AcquisitionMode::FifoMulti,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    /// 1 MOhm
    HighImpedance,
    /// 50 Ohm
    FiftyOhm,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClockMode {
    InternalPll,
    /// Locked to an external 10 MHz reference
    ExternalReference,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TriggerMode {
    /// Free run
    Software,
    /// Edge on the external trigger input
    External { edge: Edge },
    /// Level crossing on one of the analog inputs
    Channel { channel: u8, edge: Edge, level: f64 },
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ChannelSettings {
    /// Hardware channel number
    pub number: u8,
    pub fullrange_mv: u32,
    pub termination: Termination,
}

impl ChannelSettings {
    pub fn new(number: u8, fullrange_mv: u32, termination: Termination) -> Self {
        Self {
            number,
            fullrange_mv,
            termination,
        }
    }

    /// Volts per ADC code
    pub fn scale(&self) -> f64 {
        self.fullrange_mv as f64 / 1000.0 / MAX_ADC as f64
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct AcquisitionSettings {
    pub mode: AcquisitionMode,
    /// Enabled channels
    pub channels: Vec<ChannelSettings>,
    /// Index into `channels` of the channel we compute spectra for
    pub display_channel: usize,
    /// Requested sample rate in Hz
    pub sample_rate: f64,
    /// Requested samples per trace
    pub nsamples: usize,
    pub trigger: TriggerMode,
    pub clock: ClockMode,
    /// Fraction of the trace recorded before the trigger
    pub pretrig_ratio: f64,
    pub timeout: Duration,
    /// Traces averaged per display window
    pub naverages_rt: u32,
    /// Shrinking factor of the time-domain preview
    pub time_decimation: usize,
}

impl Default for AcquisitionSettings {
    fn default() -> Self {
        Self {
            mode: AcquisitionMode::FifoSingle,
            channels: vec![ChannelSettings::new(0, 10000, Termination::HighImpedance)],
            display_channel: 0,
            sample_rate: 30e6,
            nsamples: 409600,
            trigger: TriggerMode::Software,
            clock: ClockMode::InternalPll,
            pretrig_ratio: 0.0,
            timeout: Duration::from_secs(10),
            naverages_rt: 10,
            time_decimation: 100,
        }
    }
}

fn invalid<T>(msg: impl Into<String>) -> Result<T> {
    Err(DaqError::Configuration(msg.into()))
}

impl AcquisitionSettings {
    /// Duration of one trace at the requested rate
    pub fn trace_duration(&self) -> Duration {
        crate::span(self.nsamples, self.sample_rate)
    }

    /// The channel spectra are computed for
    pub fn displayed(&self) -> &ChannelSettings {
        &self.channels[self.display_channel]
    }

    /// Scale factors of the enabled channels, in the same order as `channels`
    pub fn scales(&self) -> Vec<f64> {
        self.channels.iter().map(ChannelSettings::scale).collect()
    }

    /// Reject anything the card (or the pipeline) can't run with
    pub fn validate(&self) -> Result<()> {
        if ![1, 2, 4].contains(&self.channels.len()) {
            return invalid(format!(
                "{} channels enabled, must be 1, 2 or 4",
                self.channels.len()
            ));
        }
        for (i, ch) in self.channels.iter().enumerate() {
            if ch.number >= MAX_CHANNELS {
                return invalid(format!("No such channel: {}", ch.number));
            }
            if self.channels[..i].iter().any(|c| c.number == ch.number) {
                return invalid(format!("Channel {} enabled twice", ch.number));
            }
            if !VALID_FULLRANGES_MV.contains(&ch.fullrange_mv) {
                return invalid(format!("Invalid full range: {} mV", ch.fullrange_mv));
            }
        }
        if self.display_channel >= self.channels.len() {
            return invalid(format!(
                "Display channel index {} out of {} enabled",
                self.display_channel,
                self.channels.len()
            ));
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return invalid(format!("Invalid sample rate: {}", self.sample_rate));
        }
        if self.nsamples == 0 || self.nsamples % SAMPLE_GRANULARITY != 0 {
            return invalid(format!(
                "Number of samples ({}) must be a positive multiple of {}",
                self.nsamples, SAMPLE_GRANULARITY
            ));
        }
        if !(0.0..1.0).contains(&self.pretrig_ratio) {
            return invalid(format!("Pretrigger ratio {} not in [0, 1)", self.pretrig_ratio));
        }
        if self.timeout <= self.trace_duration() {
            return invalid(format!(
                "Timeout ({:?}) is shorter than the acquisition time ({:?})",
                self.timeout,
                self.trace_duration()
            ));
        }
        if self.naverages_rt == 0 {
            return invalid("Display averaging count must be at least 1");
        }
        if self.time_decimation == 0 || self.time_decimation > self.nsamples {
            return invalid(format!(
                "Time decimation {} not in 1..={}",
                self.time_decimation, self.nsamples
            ));
        }
        match self.trigger {
            TriggerMode::Software if self.mode == AcquisitionMode::FifoMulti => {
                return invalid("Multi-trigger FIFO mode needs a hardware trigger");
            }
            TriggerMode::Channel { channel, level, .. } => {
                let Some(ch) = self.channels.iter().find(|c| c.number == channel) else {
                    return invalid(format!("Trigger channel {} is not enabled", channel));
                };
                // The trigger comparator has 14 bit resolution
                let code = (level / ch.scale() / 4.0).trunc();
                if !code.is_finite() || code.abs() >= MAX_ADC as f64 / 4.0 {
                    return invalid(format!("Trigger level {} V outside the channel range", level));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Requests from the consumer side to the streaming loop
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Re-arm the card with new settings
    Configure(AcquisitionSettings),
    /// Change the display averaging count, starting with the next window
    SetDisplayAverages(u32),
    Stop,
}
