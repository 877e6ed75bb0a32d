//! The capability interface the acquisition core drives, plus the backends we ship.
//!
//! Vendor SDKs sit behind [`SdrDevice`]. Methods take `&self` because the
//! controller halts the stream from its own thread while the worker may be
//! blocked inside [`SdrDevice::read`]; implementations are expected to be
//! thread-safe the way the vendor C APIs are.

pub mod file;
pub mod tone;

#[cfg(test)]
pub(crate) mod fake;

use std::ops::RangeInclusive;

use crate::{
    complex::RawSample,
    config::Level,
    error::{ReadError, Result},
};

pub use file::FileDevice;
pub use tone::ToneDevice;

/// Which gain stage a [`SdrDevice::set_gain`] call addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainStage {
    /// IF / front-end amplifier
    Internal,
    /// External LNA
    External,
}

/// Parameter families, used to ask a device what it can change mid-stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Frequency,
    Port,
    Bandwidth,
    Decimation,
    ReferenceLevel,
    Attenuation,
    Gain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Idle,
    Running,
    Disconnected,
}

pub trait SdrDevice: Send + Sync + 'static {
    /// Native scalar encoding of the interleaved I/Q stream
    type Sample: RawSample;

    /// Identifier used to key persisted configuration
    fn serial(&self) -> String;

    /// Find and open the hardware
    fn open(&self) -> Result<()>;
    fn close(&self);
    fn is_open(&self) -> bool;

    fn set_port(&self, port: u8) -> Result<()>;
    /// Returns the frequency the hardware actually tuned to
    fn set_frequency(&self, hz: f64) -> Result<f64>;
    fn set_reference_level(&self, _dbm: f32) -> Result<()> {
        Ok(())
    }
    fn set_attenuation(&self, level: Level) -> Result<Level>;
    fn set_gain(&self, stage: GainStage, level: Level) -> Result<Level>;
    /// Configure decimation and IF bandwidth together. Returns the bandwidth
    /// the hardware settled on.
    fn set_bandwidth(&self, decimation_id: u8, hz: f64) -> Result<f64>;

    /// Bandwidths the hardware accepts at a given decimation
    fn bandwidth_range(&self, _decimation_id: u8) -> RangeInclusive<f64> {
        0.0..=f64::MAX
    }

    /// Whether a parameter can change without restarting the stream
    fn is_live(&self, kind: ParamKind) -> bool {
        kind == ParamKind::Frequency
    }

    fn start(&self) -> Result<()>;
    /// Halt the stream. Must make an in-flight [`SdrDevice::read`] return promptly.
    fn stop(&self);
    fn status(&self) -> DeviceStatus;

    /// Achieved output rate (Hz). Only meaningful after [`SdrDevice::start`].
    fn sample_rate(&self) -> f64;

    /// Block until `buf` (interleaved I/Q) is filled or the device timeout
    /// elapses. Returns how many complex samples were written.
    fn read(&self, buf: &mut [Self::Sample]) -> Result<usize, ReadError>;

    /// Samples the hardware dropped since the last call, zero when it cannot tell
    fn take_sample_loss(&self) -> u64 {
        0
    }

    /// Throw away IQ already buffered inside the device. Called from the
    /// reading thread, between reads.
    fn purge(&self) {}
}
