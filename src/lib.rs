//! Real-time IQ acquisition: a single worker pulls raw samples off an SDR,
//! normalizes them and hands them to a consumer through a double-buffered
//! channel, while a controller drives the device lifecycle around it.

pub mod capture;
pub mod channel;
pub mod complex;
pub mod config;
pub mod control;
pub mod device;
pub mod error;
pub mod monitoring;

/// Complex samples per batch handed to the consumer
pub const BATCH_SIZE: usize = 16384;

pub use channel::{Batch, SampleReader};
pub use config::{DeviceConfig, Level};
pub use control::{Controller, Parameter, RateChange, RunState};
pub use device::SdrDevice;
pub use error::{Error, Result};
