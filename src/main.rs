mod args;

use anyhow::{anyhow, Context};
use args::{convert_filter, Args, FileFormat, Source};
use clap::Parser;
use crossbeam_channel::Receiver;
use iq_slurper::{
    config::{JsonFileStore, MemoryStore},
    device::{FileDevice, ToneDevice},
    Controller, Parameter, RateChange, SampleReader, SdrDevice,
};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

const REPORT_INTERVAL: Duration = Duration::from_secs(1);
const POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Default)]
struct Summary {
    batches: u64,
    samples: u64,
    sample_rate: f64,
}

// Stand-in for real DSP: average the power of everything that comes through
fn consume(reader: SampleReader, rates: Receiver<RateChange>, stop: Arc<AtomicBool>) -> Summary {
    let mut summary = Summary::default();
    let mut power = 0f64;
    let mut count = 0usize;
    let mut last_report = Instant::now();
    while !stop.load(Ordering::SeqCst) {
        for change in rates.try_iter() {
            info!(
                rate = change.sample_rate,
                bandwidth = change.bandwidth,
                "consumer switching sample rate"
            );
            summary.sample_rate = change.sample_rate;
        }
        let batch = match reader.recv_timeout(POLL) {
            Some(b) => b,
            None => continue,
        };
        power += batch.iter().map(|s| s.norm_sqr() as f64).sum::<f64>();
        count += batch.len();
        summary.batches += 1;
        summary.samples += batch.len() as u64;
        if last_report.elapsed() >= REPORT_INTERVAL && count > 0 {
            let mean = power / count as f64;
            debug!(seq = batch.seq(), "mean power {:.1} dBFS", 10.0 * mean.log10());
            power = 0.0;
            count = 0;
            last_report = Instant::now();
        }
    }
    summary
}

fn run<D: SdrDevice>(
    args: &Args,
    device: iq_slurper::Result<D>,
    stop: Arc<AtomicBool>,
) -> anyhow::Result<()> {
    let mut ctl = match &args.config {
        Some(path) => {
            let store = JsonFileStore::new(path);
            info!(path = %store.path().display(), "settings are saved across runs");
            Controller::new("iq", device, store)
        }
        None => Controller::new("iq", device, MemoryStore::default()),
    };

    // Command line settings win over whatever was saved
    if let Some(id) = args.decimation {
        ctl.reconfigure(Parameter::Decimation(id))?;
    }
    if let Some(hz) = args.bandwidth {
        ctl.reconfigure(Parameter::Bandwidth(hz))?;
    }
    if let Some(hz) = args.frequency {
        ctl.tune(hz)?;
    }

    let rates = ctl.rate_updates();
    let reader = ctl
        .take_reader()
        .context("sample reader was already taken")?;
    ctl.start().context("failed to start acquisition")?;

    let consumer_stop = Arc::new(AtomicBool::new(false));
    let consumer = {
        let stop = consumer_stop.clone();
        thread::Builder::new()
            .name("consumer".to_owned())
            .spawn(move || consume(reader, rates, stop))?
    };

    let started = Instant::now();
    let mut last_report = Instant::now();
    let mut pending_retune = args.retune;
    while !stop.load(Ordering::SeqCst) {
        let elapsed = started.elapsed().as_secs_f64();
        if args.duration.map_or(false, |d| elapsed >= d) {
            break;
        }
        if elapsed >= args.retune_after {
            if let Some(hz) = pending_retune.take() {
                info!(frequency = hz, "retuning");
                if let Err(e) = ctl.tune(hz) {
                    warn!(error = %e, "retune failed");
                }
            }
        }
        if last_report.elapsed() >= REPORT_INTERVAL {
            info!(stats = %ctl.stats(), "acquisition");
            last_report = Instant::now();
        }
        thread::sleep(POLL);
    }

    ctl.stop();
    consumer_stop.store(true, Ordering::SeqCst);
    let summary = consumer
        .join()
        .map_err(|_| anyhow!("consumer thread panicked"))?;
    info!(
        controller = ctl.name(),
        batches = summary.batches,
        samples = summary.samples,
        rate = summary.sample_rate,
        stats = %ctl.stats(),
        "done"
    );
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(convert_filter(args.verbose.log_level_filter()))
        .init();

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.store(true, Ordering::SeqCst))
            .context("failed to install Ctrl-C handler")?;
    }

    match args.source {
        Source::Tone => {
            let device = ToneDevice::new("tone-0001", args.tone);
            run(&args, Ok(device), stop)
        }
        Source::File => {
            let path = args
                .file
                .clone()
                .context("--file is required for file playback")?;
            match args.format {
                FileFormat::Ci8 => {
                    let device = FileDevice::<i8>::new(path, args.rate).repeat(!args.once);
                    run(&args, Ok(device), stop)
                }
                FileFormat::Ci16 => {
                    let device = FileDevice::<i16>::new(path, args.rate).repeat(!args.once);
                    run(&args, Ok(device), stop)
                }
                FileFormat::Cf32 => {
                    let device = FileDevice::<f32>::new(path, args.rate).repeat(!args.once);
                    run(&args, Ok(device), stop)
                }
            }
        }
    }
}
