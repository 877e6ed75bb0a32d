//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Source {
    /// Synthetic receiver emitting a single tone
    Tone,
    /// Replay of an IQ recording
    File,
}

/// Sample encoding of a recording
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileFormat {
    Ci8,
    Ci16,
    Cf32,
}

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// Where samples come from
    #[clap(short, long, value_enum, default_value_t = Source::Tone)]
    pub source: Source,
    /// Recording to replay when the source is a file
    #[clap(long, required_if_eq("source", "file"))]
    pub file: Option<PathBuf>,
    /// Encoding of the recording
    #[clap(long, value_enum, default_value_t = FileFormat::Ci16)]
    pub format: FileFormat,
    /// Sample rate of the recording (Hz)
    #[clap(long, default_value_t = 2.0e6)]
    pub rate: f64,
    /// Play the recording once instead of looping
    #[clap(long)]
    pub once: bool,
    /// Absolute frequency of the synthetic tone (Hz)
    #[clap(long, default_value_t = 100.1e6)]
    pub tone: f64,
    /// Center frequency (Hz), overrides the saved value
    #[clap(short, long)]
    pub frequency: Option<f64>,
    /// IF bandwidth (Hz), overrides the saved value
    #[clap(short, long)]
    pub bandwidth: Option<f64>,
    /// Decimation index, the output rate is 40 MS/s / 2^id
    #[clap(short, long, value_parser = clap::value_parser!(u8).range(0..=13))]
    pub decimation: Option<u8>,
    /// JSON file holding per-device settings, kept in memory if absent
    #[clap(short, long)]
    pub config: Option<PathBuf>,
    /// Seconds to run for, until Ctrl-C if absent
    #[clap(short = 't', long)]
    pub duration: Option<f64>,
    /// Frequency to retune to mid-run (Hz)
    #[clap(long)]
    pub retune: Option<f64>,
    /// Seconds after start to retune
    #[clap(long, default_value_t = 1.0)]
    pub retune_after: f64,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
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
