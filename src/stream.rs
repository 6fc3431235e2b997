//! The streaming control loop
//!
//! One producer thread owns the card and every per-trace buffer. It pulls traces,
//! turns them into power spectra, feeds both accumulators and publishes finished
//! display windows to the [`Exchange`]. Commands are only looked at between
//! windows, roughly every `poll_interval` of wall time.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use tracing::{debug, error, info, warn};

use crate::{
    convert_channel, decimate,
    error::{try_zeroed, DaqError, Result},
    exfil::{ring_capacity, Exchange, Publisher, Ring, StreamInfo},
    f_engine::SpectralTransform,
    monitoring::{LagMonitor, LAG_NOTICE_INTERVAL},
    power::{
        finish_psd, square, DisplayAccumulator, ReferenceAccumulator, ReferenceCounters,
        ReferenceProgress,
    },
    settings::{AcquisitionSettings, Command},
    source::{AcquisitionSource, Configured, TraceView},
};

/// Loop cadences
#[derive(Clone, Debug, PartialEq)]
pub struct StreamOptions {
    /// Roughly how often the control channel is checked while streaming
    pub poll_interval: Duration,
    /// Minimum time between two "behind real time" warnings
    pub lag_notice_interval: Duration,
    /// Target delay between acquisition and display, sizes the slot ring
    pub max_delay: Duration,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            lag_notice_interval: LAG_NOTICE_INTERVAL,
            max_delay: Duration::from_millis(500),
        }
    }
}

/// What the loop tells the outside world, best effort
#[derive(Clone, Debug, PartialEq)]
pub enum StreamEvent {
    /// The card is armed and streaming with these parameters
    Configured(StreamInfo),
    /// Settings were refused, the loop carries on with what it had
    Rejected(String),
    /// No trace arrived in time, the card was stopped
    TimedOut,
    /// A reference measurement of this many traces finished
    ReferenceCompleted(u32),
    Stopped,
}

#[derive(Debug)]
pub enum StreamState {
    Configuring(Box<AcquisitionSettings>),
    Streaming,
    /// Card stopped, waiting for a command
    Idle,
    Stopping,
    Stopped,
}

/// Number of finished windows between two looks at the control channel
fn poll_cadence(poll_interval: Duration, window: Duration) -> u64 {
    if window.is_zero() {
        return 1;
    }
    (poll_interval.as_secs_f64() / window.as_secs_f64()).floor().max(1.0) as u64
}

/// Result of pushing one trace through the pipeline
#[derive(Debug, Clone, Copy, PartialEq)]
struct TraceOutcome {
    /// Averages in the display window this trace completed, if any
    window: Option<u32>,
    reference: ReferenceProgress,
}

/// Everything sized by the trace length. Rebuilt only when that changes.
struct StreamContext {
    nsamples: usize,
    nchannels: usize,
    channel: usize,
    scale: f64,
    sample_rate: f64,
    decimation: usize,
    fft: SpectralTransform,
    calibrated: Vec<f64>,
    power: Vec<f64>,
    psd: Vec<f64>,
    reference_psd: Vec<f64>,
    time_trace: Vec<f64>,
    display: DisplayAccumulator,
    reference: ReferenceAccumulator,
}

impl StreamContext {
    fn new(configured: &Configured, settings: &AcquisitionSettings) -> Result<Self> {
        let n = configured.nsamples;
        let fft = SpectralTransform::new(n)?;
        let nbins = fft.nbins();
        let mut ctx = Self {
            nsamples: n,
            nchannels: 0,
            channel: 0,
            scale: 0.0,
            sample_rate: 0.0,
            decimation: 0,
            calibrated: try_zeroed(n, n)?,
            power: try_zeroed(nbins, n)?,
            psd: try_zeroed(nbins, n)?,
            reference_psd: try_zeroed(nbins, n)?,
            time_trace: Vec::new(),
            display: DisplayAccumulator::new(nbins, settings.naverages_rt)?,
            reference: ReferenceAccumulator::new(nbins)?,
            fft,
        };
        ctx.apply(configured, settings)?;
        Ok(ctx)
    }

    /// Take on settings that don't change the trace length
    fn apply(&mut self, configured: &Configured, settings: &AcquisitionSettings) -> Result<()> {
        self.nchannels = settings.channels.len();
        self.channel = settings.display_channel;
        self.scale = configured.scales[settings.display_channel];
        self.sample_rate = configured.sample_rate;
        self.decimation = settings.time_decimation;
        let ntds = self.nsamples / self.decimation;
        if self.time_trace.len() != ntds {
            self.time_trace = try_zeroed(ntds, self.nsamples)?;
        }
        self.display.discard();
        self.display.set_window(settings.naverages_rt);
        Ok(())
    }

    fn trace_duration(&self) -> Duration {
        crate::span(self.nsamples, self.sample_rate)
    }

    fn process(
        &mut self,
        trace: &TraceView<'_>,
        counters: &ReferenceCounters,
        publisher: &Publisher,
    ) -> Result<TraceOutcome> {
        if trace.nsamples() != self.nsamples || trace.nchannels() != self.nchannels {
            return Err(DaqError::Configuration(format!(
                "Got a trace of {} x {} samples, expected {} x {}",
                trace.nsamples(),
                trace.nchannels(),
                self.nsamples,
                self.nchannels
            )));
        }
        convert_channel(
            trace.samples(),
            self.nchannels,
            self.channel,
            self.scale,
            &mut self.calibrated,
        );
        let spectrum = self.fft.execute(&self.calibrated)?;
        square(&mut self.power, spectrum);

        let (nsamples, sample_rate) = (self.nsamples, self.sample_rate);
        let reference_psd = &mut self.reference_psd;
        let reference = self.reference.push(&self.power, counters, |sum, count| {
            finish_psd(sum, count, nsamples, sample_rate, &mut reference_psd[..]);
            publisher.publish_reference(&reference_psd[..]);
        });

        let mut window = None;
        if self.display.push(&self.power) {
            let averages = self.display.finish(nsamples, sample_rate, &mut self.psd);
            decimate(&self.calibrated, self.decimation, &mut self.time_trace);
            publisher.publish(&self.psd, &self.time_trace, averages);
            window = Some(averages);
        }
        Ok(TraceOutcome { window, reference })
    }
}

fn notify(events: &Option<Sender<StreamEvent>>, event: StreamEvent) {
    if let Some(tx) = events {
        // Nobody listening, or listening too slowly, is fine
        let _ = tx.try_send(event);
    }
}

/// Producer side of the pipeline, generic over the card
pub struct Streamer<S> {
    source: S,
    commands: Receiver<Command>,
    exchange: Arc<Exchange>,
    events: Option<Sender<StreamEvent>>,
    options: StreamOptions,
    context: Option<StreamContext>,
    publisher: Option<Publisher>,
    /// Last settings the card accepted
    active: Option<AcquisitionSettings>,
    armed: bool,
    lag: LagMonitor,
    poll_every: u64,
    since_poll: u64,
}

impl<S: AcquisitionSource> Streamer<S> {
    pub fn new(source: S, commands: Receiver<Command>, exchange: Arc<Exchange>) -> Self {
        let options = StreamOptions::default();
        Self {
            source,
            commands,
            exchange,
            events: None,
            lag: LagMonitor::new(options.lag_notice_interval),
            options,
            context: None,
            publisher: None,
            active: None,
            armed: false,
            poll_every: 1,
            since_poll: 0,
        }
    }

    pub fn with_options(mut self, options: StreamOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_events(mut self, events: Sender<StreamEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Run until stopped. Only unrecoverable errors come back out, after the card
    /// has been shut down.
    pub fn run(mut self, initial: AcquisitionSettings) -> Result<()> {
        let mut state = StreamState::Configuring(Box::new(initial));
        loop {
            state = match state {
                StreamState::Configuring(settings) => self.configure(*settings)?,
                StreamState::Streaming => self.stream()?,
                StreamState::Idle => self.idle(),
                StreamState::Stopping => self.stopping(),
                StreamState::Stopped => return Ok(()),
            };
        }
    }

    fn configure(&mut self, settings: AcquisitionSettings) -> Result<StreamState> {
        if self.armed && self.active.as_ref() == Some(&settings) {
            debug!("Settings unchanged, keeping the card as it is");
            return Ok(StreamState::Streaming);
        }
        if let Err(e) = settings.validate() {
            return Ok(self.reject(e, false));
        }
        if let Err(e) = self.source.stop() {
            return self.fatal(e);
        }
        self.armed = false;
        let configured = match self.source.configure(&settings) {
            Ok(c) => c,
            Err(e @ DaqError::Configuration(_)) => return Ok(self.reject(e, true)),
            Err(e) => return self.fatal(e),
        };
        let info = match self.prepare(&settings, &configured) {
            Ok(info) => info,
            Err(e) => return self.fatal(e),
        };
        match self.source.start() {
            Ok(()) => {}
            Err(e @ DaqError::Configuration(_)) => return Ok(self.reject(e, true)),
            Err(e) => return self.fatal(e),
        }
        self.armed = true;
        info!(
            sample_rate = info.sample_rate,
            nsamples = info.nsamples,
            channel = info.channel,
            naverages = info.naverages_rt,
            "Streaming"
        );
        self.active = Some(settings);
        notify(&self.events, StreamEvent::Configured(info));
        Ok(StreamState::Streaming)
    }

    /// Size everything for the new settings and open a fresh session
    fn prepare(
        &mut self,
        settings: &AcquisitionSettings,
        configured: &Configured,
    ) -> Result<StreamInfo> {
        let nsamples = configured.nsamples;
        let same_length = self.context.as_ref().map_or(false, |ctx| ctx.nsamples == nsamples);
        if same_length {
            if let Some(ctx) = self.context.as_mut() {
                ctx.apply(configured, settings)?;
            }
        } else {
            // Let go of the old buffers before asking for new ones
            self.context = None;
            self.publisher = None;
            self.exchange.end_session();
            debug!(nsamples, "Building transform and buffers");
            self.context = Some(StreamContext::new(configured, settings)?);
        }

        let info = StreamInfo {
            sample_rate: configured.sample_rate,
            nsamples,
            channel: settings.displayed().number,
            naverages_rt: settings.naverages_rt,
            time_decimation: settings.time_decimation,
        };
        let capacity = ring_capacity(self.options.max_delay, info.trace_duration());
        let ring = match self.publisher.take() {
            Some(p)
                if p.ring().capacity() == capacity
                    && p.ring().nbins() == info.nbins()
                    && p.ring().ntds() == info.ntds() =>
            {
                p.ring().clone()
            }
            _ => {
                debug!(capacity, "Allocating slot ring");
                Arc::new(Ring::new(capacity, info.nbins(), info.ntds())?)
            }
        };
        self.publisher = Some(self.exchange.begin_session(info.clone(), ring)?);

        self.lag = LagMonitor::new(self.options.lag_notice_interval);
        self.poll_every = poll_cadence(
            self.options.poll_interval,
            info.trace_duration().saturating_mul(settings.naverages_rt),
        );
        self.since_poll = 0;
        Ok(info)
    }

    /// Refuse settings. Whatever was running before keeps running if we can manage it.
    fn reject(&mut self, err: DaqError, card_touched: bool) -> StreamState {
        error!(%err, "Rejected acquisition settings");
        notify(&self.events, StreamEvent::Rejected(err.to_string()));
        if !card_touched {
            return if self.armed {
                StreamState::Streaming
            } else {
                StreamState::Idle
            };
        }
        match self.active.take() {
            Some(previous) => {
                warn!("Restoring the previous acquisition settings");
                StreamState::Configuring(Box::new(previous))
            }
            None => StreamState::Idle,
        }
    }

    fn stream(&mut self) -> Result<StreamState> {
        loop {
            let (Some(ctx), Some(publisher)) = (self.context.as_mut(), self.publisher.as_ref())
            else {
                return Ok(StreamState::Idle);
            };
            let trace_duration = ctx.trace_duration();
            let outcome = match self.source.next_trace() {
                Ok(trace) => ctx.process(&trace, self.exchange.reference(), publisher),
                Err(e) => Err(e),
            };
            let outcome = match outcome {
                Ok(outcome) => outcome,
                Err(e) if e.aborts_acquisition() => return Ok(self.abort(e)),
                Err(e) => return self.fatal(e),
            };

            if let ReferenceProgress::Completed(n) = outcome.reference {
                info!(averages = n, "Reference measurement complete");
                notify(&self.events, StreamEvent::ReferenceCompleted(n));
            }
            let Some(averages) = outcome.window else {
                continue;
            };
            let covered = trace_duration.saturating_mul(averages);
            if let Some(lag) = self.lag.window_done(covered, Instant::now()) {
                warn!(
                    lag_s = lag.as_secs_f64(),
                    windows = self.lag.windows(),
                    "Processing is falling behind real time"
                );
            }
            self.since_poll += 1;
            if self.since_poll >= self.poll_every {
                self.since_poll = 0;
                if let Some(next) = self.poll_commands() {
                    return Ok(next);
                }
            }
        }
    }

    // Drain whatever is pending without blocking
    fn poll_commands(&mut self) -> Option<StreamState> {
        loop {
            match self.commands.try_recv() {
                Ok(cmd) => {
                    if let Some(next) = self.on_command(cmd) {
                        return Some(next);
                    }
                }
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    warn!("Control channel closed, stopping");
                    return Some(StreamState::Stopping);
                }
            }
        }
    }

    fn on_command(&mut self, cmd: Command) -> Option<StreamState> {
        match cmd {
            Command::Configure(settings) => {
                if let Some(ctx) = self.context.as_mut() {
                    ctx.display.discard();
                }
                Some(StreamState::Configuring(Box::new(settings)))
            }
            Command::SetDisplayAverages(0) => {
                warn!("Ignoring a display averaging count of 0");
                None
            }
            Command::SetDisplayAverages(n) => {
                if let Some(ctx) = self.context.as_mut() {
                    ctx.display.set_window(n);
                    let window = ctx.trace_duration().saturating_mul(n);
                    self.poll_every = poll_cadence(self.options.poll_interval, window);
                }
                if let Some(active) = self.active.as_mut() {
                    active.naverages_rt = n;
                }
                debug!(averages = n, "Display averaging changed");
                None
            }
            Command::Stop => Some(StreamState::Stopping),
        }
    }

    /// Give up on the current acquisition but keep the session around for the consumer
    fn abort(&mut self, err: DaqError) -> StreamState {
        let timed_out = matches!(err, DaqError::Timeout(_));
        if timed_out {
            warn!(%err, "No trace arrived, stopping the acquisition");
        } else {
            error!(%err, "Acquisition aborted");
        }
        if let Some(ctx) = self.context.as_mut() {
            ctx.display.discard();
        }
        if let Err(e) = self.source.stop() {
            warn!(%e, "Failed to stop the card");
        }
        self.armed = false;
        notify(
            &self.events,
            if timed_out {
                StreamEvent::TimedOut
            } else {
                StreamEvent::Rejected(err.to_string())
            },
        );
        StreamState::Idle
    }

    fn idle(&mut self) -> StreamState {
        loop {
            match self.commands.recv() {
                Ok(Command::Configure(settings)) => {
                    return StreamState::Configuring(Box::new(settings))
                }
                Ok(Command::Stop) | Err(_) => return StreamState::Stopping,
                Ok(cmd) => {
                    self.on_command(cmd);
                }
            }
        }
    }

    fn stopping(&mut self) -> StreamState {
        info!("Stopping acquisition");
        self.shutdown();
        notify(&self.events, StreamEvent::Stopped);
        StreamState::Stopped
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.source.stop() {
            warn!(%e, "Failed to stop the card");
        }
        if let Err(e) = self.source.close() {
            warn!(%e, "Failed to close the card");
        }
        self.armed = false;
        self.publisher = None;
        self.context = None;
        self.exchange.end_session();
    }

    fn fatal(&mut self, err: DaqError) -> Result<StreamState> {
        error!(%err, "Streaming failed");
        self.shutdown();
        Err(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        capture::{SimulatedCard, SimulatedSignal},
        exfil::{Reader, SlotData},
        settings::{ChannelSettings, Termination},
    };
    use crossbeam_channel::{unbounded, Receiver};
    use std::{
        f64::consts::TAU,
        sync::Mutex,
        thread::{self, JoinHandle},
    };

    const TONE_BIN: usize = 50;
    const AMPLITUDE: f64 = 0.5;

    /// Hands out a fixed number of sine traces, then times out
    struct ScriptedSource {
        traces_left: usize,
        nchannels: usize,
        scale: f64,
        nsamples: usize,
        buffer: Vec<i16>,
        running: bool,
        refuse_nsamples: Option<usize>,
        broken: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ScriptedSource {
        fn new(traces: usize) -> Self {
            Self {
                traces_left: traces,
                nchannels: 0,
                scale: 0.0,
                nsamples: 0,
                buffer: Vec::new(),
                running: false,
                refuse_nsamples: None,
                broken: false,
                calls: Arc::default(),
            }
        }
    }

    impl AcquisitionSource for ScriptedSource {
        fn configure(&mut self, settings: &AcquisitionSettings) -> Result<Configured> {
            self.calls.lock().unwrap().push("configure");
            if self.broken {
                return Err(DaqError::Disconnected);
            }
            if self.refuse_nsamples == Some(settings.nsamples) {
                return Err(DaqError::Configuration("refused".to_owned()));
            }
            self.nchannels = settings.channels.len();
            self.nsamples = settings.nsamples;
            self.scale = settings.displayed().scale();
            self.buffer = vec![0; self.nsamples * self.nchannels];
            Ok(Configured {
                sample_rate: settings.sample_rate,
                nsamples: settings.nsamples,
                scales: settings.scales(),
            })
        }

        fn start(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("start");
            self.running = true;
            Ok(())
        }

        fn next_trace(&mut self) -> Result<TraceView<'_>> {
            if !self.running || self.traces_left == 0 {
                return Err(DaqError::Timeout(Duration::ZERO));
            }
            self.traces_left -= 1;
            let n = self.nsamples;
            for i in 0..n {
                let v = AMPLITUDE * (TAU * (TONE_BIN * i) as f64 / n as f64).sin();
                let code = (v / self.scale).round() as i16;
                for c in 0..self.nchannels {
                    self.buffer[i * self.nchannels + c] = code;
                }
            }
            Ok(TraceView::new(&self.buffer, self.nchannels))
        }

        fn stop(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("stop");
            self.running = false;
            Ok(())
        }

        fn reset(&mut self) -> Result<()> {
            Ok(())
        }

        fn close(&mut self) -> Result<()> {
            self.calls.lock().unwrap().push("close");
            Ok(())
        }
    }

    fn settings(nsamples: usize) -> AcquisitionSettings {
        AcquisitionSettings {
            channels: vec![ChannelSettings::new(0, 1000, Termination::FiftyOhm)],
            sample_rate: nsamples as f64,
            nsamples,
            naverages_rt: 4,
            time_decimation: 16,
            ..Default::default()
        }
    }

    type Harness = (
        Arc<Exchange>,
        crossbeam_channel::Sender<Command>,
        Receiver<StreamEvent>,
        JoinHandle<Result<()>>,
    );

    fn spawn<S: AcquisitionSource + Send + 'static>(
        source: S,
        initial: AcquisitionSettings,
        pending: Vec<Command>,
    ) -> Harness {
        spawn_with(source, initial, pending, Duration::ZERO)
    }

    fn spawn_with<S: AcquisitionSource + Send + 'static>(
        source: S,
        initial: AcquisitionSettings,
        pending: Vec<Command>,
        poll_interval: Duration,
    ) -> Harness {
        let exchange = Exchange::new();
        let (cmd_tx, cmd_rx) = unbounded();
        for cmd in pending {
            cmd_tx.send(cmd).unwrap();
        }
        let (ev_tx, ev_rx) = unbounded();
        let streamer = Streamer::new(source, cmd_rx, exchange.clone())
            .with_events(ev_tx)
            .with_options(StreamOptions {
                poll_interval,
                // Room for every window of a test, readers start late
                max_delay: Duration::from_secs(10),
                ..Default::default()
            });
        let handle = thread::spawn(move || streamer.run(initial));
        (exchange, cmd_tx, ev_rx, handle)
    }

    fn next_event(events: &Receiver<StreamEvent>) -> StreamEvent {
        events.recv_timeout(Duration::from_secs(10)).unwrap()
    }

    fn peak_bin(spectrum: &[f64]) -> usize {
        spectrum
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .unwrap()
            .0
    }

    #[test]
    fn test_poll_cadence() {
        let half = Duration::from_millis(500);
        assert_eq!(poll_cadence(half, Duration::from_millis(100)), 5);
        assert_eq!(poll_cadence(half, Duration::from_millis(130)), 3);
        assert_eq!(poll_cadence(half, Duration::from_secs(2)), 1);
        assert_eq!(poll_cadence(Duration::ZERO, Duration::from_millis(10)), 1);
        assert_eq!(poll_cadence(half, Duration::ZERO), 1);
    }

    #[test]
    fn test_publishes_windows_until_timeout() {
        let source = ScriptedSource::new(8);
        let calls = source.calls.clone();
        let (exchange, tx, events, handle) = spawn(source, settings(1024), vec![]);

        let StreamEvent::Configured(info) = next_event(&events) else {
            panic!("expected Configured");
        };
        assert_eq!(info.nsamples, 1024);
        assert_eq!(next_event(&events), StreamEvent::TimedOut);

        let mut reader = Reader::new(exchange.clone());
        let mut frame = SlotData::default();
        for gen in 0..2 {
            assert!(reader.poll(&mut frame));
            assert_eq!(frame.generation, gen);
            assert_eq!(frame.averages, 4);
            assert_eq!(frame.spectrum.len(), 513);
            assert_eq!(frame.time_trace.len(), 64);
            assert_eq!(peak_bin(&frame.spectrum), TONE_BIN);
            // One-sided PSD of a sine: A^2 N / (2 fs), here fs = N
            let expected = AMPLITUDE * AMPLITUDE / 2.0;
            assert!((frame.spectrum[TONE_BIN] - expected).abs() / expected < 1e-3);
        }
        assert!(!reader.poll(&mut frame));
        // Time preview starts at the first sample of the sine
        assert!(frame.time_trace[0].abs() < 1e-3);

        tx.send(Command::Stop).unwrap();
        assert_eq!(next_event(&events), StreamEvent::Stopped);
        handle.join().unwrap().unwrap();
        assert!(exchange.session().is_none());
        assert!(!reader.poll(&mut frame));
        assert_eq!(calls.lock().unwrap().last(), Some(&"close"));
    }

    #[test]
    fn test_reconfigure_resizes_and_restarts_counters() {
        let source = ScriptedSource::new(12);
        let (exchange, tx, events, handle) =
            spawn(source, settings(1024), vec![Command::Configure(settings(2048))]);

        assert!(matches!(next_event(&events), StreamEvent::Configured(i) if i.nsamples == 1024));
        assert!(matches!(next_event(&events), StreamEvent::Configured(i) if i.nsamples == 2048));
        assert_eq!(next_event(&events), StreamEvent::TimedOut);

        let session = exchange.session().unwrap();
        assert_eq!(session.info().nsamples, 2048);
        // 4 traces went into the first session, the remaining 8 make two windows
        assert_eq!(session.write_count(), 2);
        assert_eq!(session.ring().nbins(), 1025);

        let mut reader = Reader::new(exchange.clone());
        let mut frame = SlotData::default();
        assert!(reader.poll(&mut frame));
        assert_eq!(frame.generation, 0);
        assert_eq!(frame.spectrum.len(), 1025);

        tx.send(Command::Stop).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_identical_settings_do_not_rearm() {
        let source = ScriptedSource::new(12);
        let calls = source.calls.clone();
        let (exchange, tx, events, handle) =
            spawn(source, settings(1024), vec![Command::Configure(settings(1024))]);

        assert!(matches!(next_event(&events), StreamEvent::Configured(_)));
        assert_eq!(next_event(&events), StreamEvent::TimedOut);
        // Same session all along
        assert_eq!(exchange.session().unwrap().write_count(), 3);
        let configures = calls.lock().unwrap().iter().filter(|c| **c == "configure").count();
        assert_eq!(configures, 1);

        tx.send(Command::Stop).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_invalid_settings_keep_streaming() {
        let mut bad = settings(1024);
        bad.nsamples = 1026;
        let source = ScriptedSource::new(8);
        let (exchange, tx, events, handle) =
            spawn(source, settings(1024), vec![Command::Configure(bad)]);

        assert!(matches!(next_event(&events), StreamEvent::Configured(_)));
        assert!(matches!(next_event(&events), StreamEvent::Rejected(_)));
        assert_eq!(next_event(&events), StreamEvent::TimedOut);
        let session = exchange.session().unwrap();
        assert_eq!(session.info().nsamples, 1024);
        assert_eq!(session.write_count(), 2);

        tx.send(Command::Stop).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_absurd_sample_rate_is_rejected() {
        let mut bad = settings(1024);
        bad.sample_rate = 1e-20;
        let source = ScriptedSource::new(8);
        let (exchange, tx, events, handle) =
            spawn(source, settings(1024), vec![Command::Configure(bad)]);

        assert!(matches!(next_event(&events), StreamEvent::Configured(_)));
        assert!(matches!(next_event(&events), StreamEvent::Rejected(_)));
        assert_eq!(next_event(&events), StreamEvent::TimedOut);
        assert_eq!(exchange.session().unwrap().write_count(), 2);

        tx.send(Command::Stop).unwrap();
        assert_eq!(next_event(&events), StreamEvent::Stopped);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_card_refusal_restores_previous_settings() {
        let mut source = ScriptedSource::new(12);
        source.refuse_nsamples = Some(4096);
        let (exchange, tx, events, handle) =
            spawn(source, settings(1024), vec![Command::Configure(settings(4096))]);

        assert!(matches!(next_event(&events), StreamEvent::Configured(i) if i.nsamples == 1024));
        assert!(matches!(next_event(&events), StreamEvent::Rejected(_)));
        assert!(matches!(next_event(&events), StreamEvent::Configured(i) if i.nsamples == 1024));
        assert_eq!(next_event(&events), StreamEvent::TimedOut);
        // Back in business with a fresh session for the remaining 8 traces
        assert_eq!(exchange.session().unwrap().write_count(), 2);

        tx.send(Command::Stop).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_rejected_initial_settings_go_idle() {
        let mut bad = settings(1024);
        bad.channels.clear();
        let source = ScriptedSource::new(8);
        let (exchange, tx, events, handle) = spawn(source, bad, vec![]);

        assert!(matches!(next_event(&events), StreamEvent::Rejected(_)));
        assert!(exchange.session().is_none());
        // Still listening
        tx.send(Command::Configure(settings(1024))).unwrap();
        assert!(matches!(next_event(&events), StreamEvent::Configured(_)));
        assert_eq!(next_event(&events), StreamEvent::TimedOut);
        tx.send(Command::Stop).unwrap();
        assert_eq!(next_event(&events), StreamEvent::Stopped);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_display_averages_change_between_windows() {
        let source = ScriptedSource::new(12);
        let (exchange, tx, events, handle) =
            spawn(source, settings(1024), vec![Command::SetDisplayAverages(2)]);

        assert!(matches!(next_event(&events), StreamEvent::Configured(_)));
        assert_eq!(next_event(&events), StreamEvent::TimedOut);
        let session = exchange.session().unwrap();
        // One window of 4, then four of 2
        assert_eq!(session.write_count(), 5);

        let mut reader = Reader::new(exchange.clone());
        let mut frame = SlotData::default();
        let mut last = None;
        while reader.poll(&mut frame) {
            last = Some((frame.generation, frame.averages));
        }
        assert_eq!(last, Some((4, 2)));

        tx.send(Command::Stop).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_commands_wait_for_the_poll_cadence() {
        // 1 s traces, 4 s windows, so a 12 s poll interval looks every third window
        let source = ScriptedSource::new(20);
        let (exchange, tx, events, handle) = spawn_with(
            source,
            settings(1024),
            vec![Command::SetDisplayAverages(2)],
            Duration::from_secs(12),
        );

        assert!(matches!(next_event(&events), StreamEvent::Configured(_)));
        assert_eq!(next_event(&events), StreamEvent::TimedOut);

        let mut reader = Reader::new(exchange.clone());
        let mut frame = SlotData::default();
        let mut averages = Vec::new();
        while reader.poll(&mut frame) {
            averages.push(frame.averages);
        }
        assert_eq!(averages, vec![4, 4, 4, 2, 2, 2, 2]);

        tx.send(Command::Stop).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_reference_completes_once() {
        let exchange = Exchange::new();
        exchange.reference().start(6);
        let (cmd_tx, cmd_rx) = unbounded();
        let (ev_tx, ev_rx) = unbounded();
        let streamer =
            Streamer::new(ScriptedSource::new(8), cmd_rx, exchange.clone()).with_events(ev_tx);
        let handle = thread::spawn(move || streamer.run(settings(1024)));

        assert!(matches!(next_event(&ev_rx), StreamEvent::Configured(_)));
        assert_eq!(next_event(&ev_rx), StreamEvent::ReferenceCompleted(6));
        assert_eq!(next_event(&ev_rx), StreamEvent::TimedOut);

        let reader = Reader::new(exchange.clone());
        assert_eq!(reader.reference_progress(), (6, 6));
        let mut psd = Vec::new();
        assert!(reader.read_reference(&mut psd));
        assert_eq!(peak_bin(&psd), TONE_BIN);
        let expected = AMPLITUDE * AMPLITUDE / 2.0;
        assert!((psd[TONE_BIN] - expected).abs() / expected < 1e-3);

        cmd_tx.send(Command::Stop).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_fatal_error_closes_the_card() {
        let mut source = ScriptedSource::new(8);
        source.broken = true;
        let calls = source.calls.clone();
        let (exchange, _tx, _events, handle) = spawn(source, settings(1024), vec![]);
        assert!(matches!(handle.join().unwrap(), Err(DaqError::Disconnected)));
        assert!(exchange.session().is_none());
        assert!(calls.lock().unwrap().contains(&"close"));
    }

    #[test]
    fn test_dropped_control_channel_stops() {
        let source = ScriptedSource::new(8);
        let (_exchange, tx, events, handle) = spawn(source, settings(1024), vec![]);
        assert!(matches!(next_event(&events), StreamEvent::Configured(_)));
        assert_eq!(next_event(&events), StreamEvent::TimedOut);
        drop(tx);
        assert_eq!(next_event(&events), StreamEvent::Stopped);
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn test_simulated_card_end_to_end() {
        let card = SimulatedCard::new(SimulatedSignal {
            tone_frequency: 100e3,
            tone_amplitude: 0.4,
            noise_rms: 0.01,
            ..Default::default()
        });
        let settings = AcquisitionSettings {
            channels: vec![ChannelSettings::new(1, 1000, Termination::FiftyOhm)],
            sample_rate: 4.096e6,
            nsamples: 4096,
            timeout: Duration::from_secs(1),
            naverages_rt: 10,
            time_decimation: 64,
            ..Default::default()
        };
        let (exchange, tx, events, handle) = spawn(card, settings, vec![]);
        let StreamEvent::Configured(info) = next_event(&events) else {
            panic!("expected Configured");
        };
        // 1 kHz bins
        assert_eq!(info.frequencies()[100], 100e3);

        let mut reader = Reader::new(exchange.clone());
        let mut frame = SlotData::default();
        let mut frames = 0;
        let deadline = Instant::now() + Duration::from_secs(10);
        while frames < 3 && Instant::now() < deadline {
            if reader.poll(&mut frame) {
                frames += 1;
                assert_eq!(peak_bin(&frame.spectrum), 100);
                assert_eq!(frame.time_trace.len(), 64);
                // 1 V full range
                assert!(frame.time_trace.iter().all(|v| v.abs() <= 1.0));
            } else {
                thread::sleep(Duration::from_millis(5));
            }
        }
        assert_eq!(frames, 3);

        tx.send(Command::Stop).unwrap();
        handle.join().unwrap().unwrap();
    }
}
