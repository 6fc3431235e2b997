use args::{convert_filter, Args};
use clap::Parser;
use crossbeam_channel::unbounded;
use spectrum_daq::{
    capture::SimulatedCard,
    exfil::{Exchange, Reader, SlotData},
    settings::Command,
    stream::{StreamEvent, Streamer},
};
use std::{error::Error, thread, time::Instant};
use tracing::{debug, error, info, warn};

mod args;

/// Strongest bin above DC
fn peak(spectrum: &[f64]) -> Option<(usize, f64)> {
    spectrum
        .iter()
        .copied()
        .enumerate()
        .skip(1)
        .max_by(|a, b| a.1.total_cmp(&b.1))
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let settings = args.settings();
    settings.validate()?;

    // Setup the producer
    let exchange = Exchange::new();
    let (cmd_tx, cmd_rx) = unbounded();
    let (event_tx, event_rx) = unbounded();
    let streamer = Streamer::new(SimulatedCard::new(args.signal()), cmd_rx, exchange.clone())
        .with_options(args.options())
        .with_events(event_tx);
    let producer = thread::Builder::new()
        .name("streaming".to_owned())
        .spawn(move || streamer.run(settings))?;

    // Ctrl-C asks the loop to stop
    let stop_tx = cmd_tx.clone();
    ctrlc::set_handler(move || {
        let _ = stop_tx.send(Command::Stop);
    })?;

    let mut reader = Reader::new(exchange);
    if args.reference > 0 {
        reader.start_reference(args.reference);
    }
    let mut frame = SlotData::default();
    let mut reference = Vec::new();
    let started = Instant::now();
    let mut stop_sent = false;

    'consumer: loop {
        for event in event_rx.try_iter() {
            match event {
                StreamEvent::Configured(info) => {
                    info!(
                        sample_rate = info.sample_rate,
                        nsamples = info.nsamples,
                        resolution_hz = info.sample_rate / info.nsamples as f64,
                        "Acquisition configured"
                    )
                }
                StreamEvent::Rejected(why) => warn!(%why, "Settings rejected"),
                StreamEvent::TimedOut => {
                    // Nothing else to try from here
                    let _ = cmd_tx.send(Command::Stop);
                }
                StreamEvent::ReferenceCompleted(averages) => {
                    let ready = reader.read_reference(&mut reference);
                    if let (true, Some(info)) = (ready, reader.info()) {
                        if let Some((bin, psd)) = peak(&reference) {
                            info!(
                                averages,
                                peak_hz = info.frequencies()[bin],
                                peak_psd = psd,
                                "Reference spectrum ready"
                            );
                        }
                    }
                }
                StreamEvent::Stopped => break 'consumer,
            }
        }

        // Only the newest spectrum is worth reporting
        let mut fresh = false;
        while reader.poll(&mut frame) {
            fresh = true;
        }
        if let (true, Some(info)) = (fresh, reader.info()) {
            if let Some((bin, psd)) = peak(&frame.spectrum) {
                info!(
                    generation = frame.generation,
                    averages = frame.averages,
                    peak_hz = info.frequencies()[bin],
                    peak_psd = psd,
                    "Spectrum"
                );
            }
            let (completed, target) = reader.reference_progress();
            if target > 0 && completed < target {
                debug!(completed, target, "Reference in progress");
            }
        }

        if let Some(duration) = args.duration {
            if !stop_sent && started.elapsed() >= duration {
                let _ = cmd_tx.send(Command::Stop);
                stop_sent = true;
            }
        }
        if producer.is_finished() {
            break;
        }
        thread::sleep(args.refresh);
    }

    match producer.join() {
        Ok(result) => result?,
        Err(_) => error!("Streaming thread panicked"),
    }
    info!(overflows = reader.overflows(), "Done");
    Ok(())
}
