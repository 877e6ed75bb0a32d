//! Software device in the 16-bit integer family.
//!
//! Behaves like a swept-tuner receiver with a 40 MS/s front end and power-of-two
//! decimation: it emits a single complex tone at a fixed absolute frequency, so
//! retuning moves the tone in baseband. Reads are paced to the output rate and
//! a halt cuts them short, which makes it a faithful stand-in for hardware with
//! blocking reads.

use std::{
    f64::consts::TAU,
    ops::RangeInclusive,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info};

use super::{DeviceStatus, GainStage, SdrDevice};
use crate::{
    config::{self, Level, MAX_DECIMATION_ID, MIN_BANDWIDTH},
    error::{Error, ReadError, Result},
};

/// Longest a single read may block
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);
const MIN_FREQUENCY: f64 = 9.0e3;
const MAX_FREQUENCY: f64 = 6.4e9;
const ATTENUATION_STEP: u8 = 10;
const MAX_ATTENUATION: u8 = 30;
const GAIN_STEPS: [u8; 4] = [0, 5, 15, 20];

#[derive(Debug, Clone)]
struct Tuning {
    frequency: f64,
    decimation_id: u8,
    bandwidth: f64,
    port: u8,
    ref_level: f32,
    attenuation: Level,
    gain: Level,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            frequency: 100.0e6,
            decimation_id: 6,
            bandwidth: 500.0e3,
            port: 1,
            ref_level: -20.0,
            attenuation: Level::Auto,
            gain: Level::Auto,
        }
    }
}

pub struct ToneDevice {
    serial: String,
    /// Absolute frequency of the emitted tone (Hz)
    tone: f64,
    /// Peak amplitude in full-scale units
    amplitude: f64,
    open: AtomicBool,
    streaming: AtomicBool,
    tuning: Mutex<Tuning>,
    phase: Mutex<f64>,
    halt_tx: Sender<()>,
    halt_rx: Receiver<()>,
}

impl ToneDevice {
    pub fn new(serial: impl Into<String>, tone: f64) -> Self {
        let (halt_tx, halt_rx) = bounded(1);
        Self {
            serial: serial.into(),
            tone,
            amplitude: 0.5,
            open: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            tuning: Mutex::new(Tuning::default()),
            phase: Mutex::new(0.0),
            halt_tx,
            halt_rx,
        }
    }

    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude.clamp(0.0, 1.0);
        self
    }

    /// Where the tone currently lands relative to the tuned center (Hz)
    pub fn baseband_offset(&self) -> f64 {
        self.tone - self.tuning().frequency
    }

    fn tuning(&self) -> std::sync::MutexGuard<'_, Tuning> {
        self.tuning.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn require_open(&self, param: &'static str) -> Result<()> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Rejected {
                param,
                reason: "device is not open".to_owned(),
            })
        }
    }
}

impl SdrDevice for ToneDevice {
    type Sample = i16;

    fn serial(&self) -> String {
        self.serial.clone()
    }

    fn open(&self) -> Result<()> {
        if !self.open.swap(true, Ordering::SeqCst) {
            info!(serial = %self.serial, "tone device opened");
        }
        Ok(())
    }

    fn close(&self) {
        self.stop();
        if self.open.swap(false, Ordering::SeqCst) {
            info!(serial = %self.serial, "tone device closed");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn set_port(&self, port: u8) -> Result<()> {
        self.require_open("port")?;
        if !(1..=2).contains(&port) {
            return Err(Error::Rejected {
                param: "port",
                reason: format!("no input {port}"),
            });
        }
        self.tuning().port = port;
        Ok(())
    }

    fn set_frequency(&self, hz: f64) -> Result<f64> {
        self.require_open("frequency")?;
        let actual = hz.clamp(MIN_FREQUENCY, MAX_FREQUENCY);
        self.tuning().frequency = actual;
        debug!(frequency = actual, "tone device tuned");
        Ok(actual)
    }

    fn set_reference_level(&self, dbm: f32) -> Result<()> {
        self.require_open("reference level")?;
        self.tuning().ref_level = dbm.clamp(-130.0, 20.0);
        Ok(())
    }

    fn set_attenuation(&self, level: Level) -> Result<Level> {
        self.require_open("attenuation")?;
        let actual = match level {
            Level::Auto => Level::Auto,
            Level::Db(db) => {
                Level::Db((db / ATTENUATION_STEP * ATTENUATION_STEP).min(MAX_ATTENUATION))
            }
        };
        self.tuning().attenuation = actual;
        Ok(actual)
    }

    fn set_gain(&self, stage: GainStage, level: Level) -> Result<Level> {
        self.require_open("gain")?;
        match (stage, level) {
            (GainStage::External, Level::Auto) => Ok(Level::Auto),
            (GainStage::External, Level::Db(_)) => Err(Error::Rejected {
                param: "external gain",
                reason: "no external amplifier".to_owned(),
            }),
            (GainStage::Internal, Level::Auto) => {
                self.tuning().gain = Level::Auto;
                Ok(Level::Auto)
            }
            (GainStage::Internal, Level::Db(db)) => {
                let nearest = GAIN_STEPS
                    .iter()
                    .copied()
                    .min_by_key(|step| step.abs_diff(db))
                    .unwrap_or(0);
                self.tuning().gain = Level::Db(nearest);
                Ok(Level::Db(nearest))
            }
        }
    }

    fn set_bandwidth(&self, decimation_id: u8, hz: f64) -> Result<f64> {
        self.require_open("bandwidth")?;
        let id = decimation_id.min(MAX_DECIMATION_ID);
        let actual = config::clamp_bandwidth(id, hz);
        let mut tuning = self.tuning();
        tuning.decimation_id = id;
        tuning.bandwidth = actual;
        Ok(actual)
    }

    fn bandwidth_range(&self, decimation_id: u8) -> RangeInclusive<f64> {
        MIN_BANDWIDTH..=config::max_bandwidth(decimation_id)
    }

    fn start(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::StreamStart("device is not open".to_owned()));
        }
        // Discard a halt left over from the previous run
        while self.halt_rx.try_recv().is_ok() {}
        self.streaming.store(true, Ordering::SeqCst);
        let tuning = self.tuning().clone();
        info!(
            serial = %self.serial,
            frequency = tuning.frequency,
            rate = config::decimated_rate(tuning.decimation_id),
            bandwidth = tuning.bandwidth,
            "tone device streaming"
        );
        Ok(())
    }

    fn stop(&self) {
        if self.streaming.swap(false, Ordering::SeqCst) {
            let _ = self.halt_tx.try_send(());
            debug!(serial = %self.serial, "tone device halted");
        }
    }

    fn status(&self) -> DeviceStatus {
        match (self.is_open(), self.streaming.load(Ordering::SeqCst)) {
            (false, _) => DeviceStatus::Disconnected,
            (true, true) => DeviceStatus::Running,
            (true, false) => DeviceStatus::Idle,
        }
    }

    fn sample_rate(&self) -> f64 {
        config::decimated_rate(self.tuning().decimation_id)
    }

    // Nothing is buffered, so a purge just restarts the oscillator
    fn purge(&self) {
        *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = 0.0;
    }

    fn read(&self, buf: &mut [i16]) -> Result<usize, ReadError> {
        if !self.streaming.load(Ordering::SeqCst) {
            return Err(ReadError::NotStreaming);
        }
        let (rate, offset) = {
            let tuning = self.tuning();
            (
                config::decimated_rate(tuning.decimation_id),
                self.tone - tuning.frequency,
            )
        };
        // Slow tiers deliver whatever fits in one timeout
        let wanted = buf.len() / 2;
        let n = wanted.min((rate * READ_TIMEOUT.as_secs_f64()).max(1.0) as usize);
        match self
            .halt_rx
            .recv_timeout(Duration::from_secs_f64(n as f64 / rate))
        {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return Err(ReadError::NotStreaming),
        }
        if !self.streaming.load(Ordering::SeqCst) {
            return Err(ReadError::NotStreaming);
        }

        let step = TAU * offset / rate;
        let scale = self.amplitude * i16::MAX as f64;
        let mut phase = self.phase.lock().unwrap_or_else(PoisonError::into_inner);
        for pair in buf[..2 * n].chunks_exact_mut(2) {
            pair[0] = (scale * phase.cos()).round() as i16;
            pair[1] = (scale * phase.sin()).round() as i16;
            *phase = (*phase + step).rem_euclid(TAU);
        }
        Ok(n)
    }
}
