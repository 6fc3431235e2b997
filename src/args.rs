//! Argument parsing for running from the command line

use std::time::Duration;

use clap::{Parser, ValueEnum};
use spectrum_daq::{
    capture::SimulatedSignal,
    settings::{
        AcquisitionMode, AcquisitionSettings, ChannelSettings, ClockMode, Edge, Termination,
        TriggerMode, VALID_FULLRANGES_MV,
    },
    stream::StreamOptions,
};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TriggerArg {
    /// Free run
    Software,
    /// External trigger input
    External,
    /// Level crossing on the displayed channel
    Level,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum TerminationArg {
    /// 1 MOhm
    High,
    /// 50 Ohm
    Fifty,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum EdgeArg {
    Rising,
    Falling,
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Hardware channel to compute spectra for
    #[clap(short, long, default_value_t = 0)]
    #[clap(value_parser = clap::value_parser!(u8).range(0..4))]
    pub channel: u8,
    /// Full-scale range in mV
    #[clap(short, long, default_value_t = 10000, value_parser = valid_fullrange)]
    pub fullrange: u32,
    /// Input termination
    #[clap(long, value_enum, default_value = "high")]
    pub termination: TerminationArg,
    /// Requested sample rate in Hz, the card rounds it
    #[clap(short, long, default_value_t = 30e6)]
    pub sample_rate: f64,
    /// Requested samples per trace, the card rounds it
    #[clap(short = 'n', long, default_value_t = 409600)]
    pub samples: usize,
    #[clap(short, long, value_enum, default_value = "software")]
    pub trigger: TriggerArg,
    /// Edge of the external or level trigger
    #[clap(long, value_enum, default_value = "rising")]
    pub edge: EdgeArg,
    /// Level trigger threshold in V
    #[clap(long, default_value_t = 0.0)]
    pub trigger_level: f64,
    /// Lock the sample clock to an external 10 MHz reference
    #[clap(long)]
    pub external_clock: bool,
    /// Traces averaged per displayed spectrum
    #[clap(short = 'a', long, default_value_t = 10)]
    #[clap(value_parser = clap::value_parser!(u32).range(1..))]
    pub averages: u32,
    /// Traces in the reference measurement, 0 to skip it
    #[clap(short, long, default_value_t = 0)]
    pub reference: u32,
    /// Seconds to wait for a trace before giving up
    #[clap(long, default_value = "10", value_parser = seconds)]
    pub timeout: Duration,
    /// Shrinking factor of the time-domain preview
    #[clap(long, default_value_t = 100)]
    #[clap(value_parser = clap::value_parser!(u64).range(1..))]
    pub decimation: u64,
    /// Target delay between acquisition and display in seconds
    #[clap(long, default_value = "0.5", value_parser = seconds)]
    pub max_delay: Duration,
    /// Seconds between looks at the published spectra
    #[clap(long, default_value = "0.1", value_parser = seconds)]
    pub refresh: Duration,
    /// Stop after this many seconds instead of running until interrupted
    #[clap(short, long, value_parser = seconds)]
    pub duration: Option<Duration>,
    /// Frequency of the simulated tone in Hz
    #[clap(long, default_value_t = 1.25e6)]
    pub tone: f64,
    /// Amplitude of the simulated tone in V
    #[clap(long, default_value_t = 1.0)]
    pub amplitude: f64,
    /// RMS of the simulated noise in V
    #[clap(long, default_value_t = 0.05)]
    pub noise: f64,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn settings(&self) -> AcquisitionSettings {
        let termination = match self.termination {
            TerminationArg::High => Termination::HighImpedance,
            TerminationArg::Fifty => Termination::FiftyOhm,
        };
        let edge = match self.edge {
            EdgeArg::Rising => Edge::Rising,
            EdgeArg::Falling => Edge::Falling,
        };
        let trigger = match self.trigger {
            TriggerArg::Software => TriggerMode::Software,
            TriggerArg::External => TriggerMode::External { edge },
            TriggerArg::Level => TriggerMode::Channel {
                channel: self.channel,
                edge,
                level: self.trigger_level,
            },
        };
        AcquisitionSettings {
            mode: AcquisitionMode::for_trigger(&trigger),
            channels: vec![ChannelSettings::new(self.channel, self.fullrange, termination)],
            display_channel: 0,
            sample_rate: self.sample_rate,
            nsamples: self.samples,
            trigger,
            clock: if self.external_clock {
                ClockMode::ExternalReference
            } else {
                ClockMode::InternalPll
            },
            timeout: self.timeout,
            naverages_rt: self.averages,
            time_decimation: self.decimation as usize,
            ..Default::default()
        }
    }

    pub fn signal(&self) -> SimulatedSignal {
        SimulatedSignal {
            tone_frequency: self.tone,
            tone_amplitude: self.amplitude,
            noise_rms: self.noise,
            ..Default::default()
        }
    }

    pub fn options(&self) -> StreamOptions {
        StreamOptions {
            max_delay: self.max_delay,
            ..Default::default()
        }
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn valid_fullrange(s: &str) -> Result<u32, String> {
    let mv: u32 = s.parse().map_err(|_| format!("Not a number: {}", s))?;
    if VALID_FULLRANGES_MV.contains(&mv) {
        Ok(mv)
    } else {
        Err(format!("Must be one of {:?}", VALID_FULLRANGES_MV))
    }
}

fn seconds(s: &str) -> Result<Duration, String> {
    let secs: f64 = s.parse().map_err(|_| format!("Not a number: {}", s))?;
    Duration::try_from_secs_f64(secs).map_err(|_| "Invalid duration".to_string())
}
