//! Replays an interleaved IQ recording as if it were live hardware.
//!
//! The scalar type picks the encoding: `i8` for CS8, `i16` for CS16 and `f32`
//! for CF32, all native-endian. Reads are throttled to the nominal sample rate
//! unless throttling is turned off.

use std::{
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    marker::PhantomData,
    mem,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use byte_slice_cast::AsMutByteSlice;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{info, warn};

use super::{DeviceStatus, GainStage, ParamKind, SdrDevice};
use crate::{
    complex::RawSample,
    config::Level,
    error::{Error, ReadError, Result},
};

pub struct FileDevice<T> {
    path: PathBuf,
    sample_rate: f64,
    repeat: bool,
    throttle: bool,
    frequency: Mutex<f64>,
    reader: Mutex<Option<BufReader<File>>>,
    streaming: AtomicBool,
    exhausted: AtomicBool,
    halt_tx: Sender<()>,
    halt_rx: Receiver<()>,
    _encoding: PhantomData<fn() -> T>,
}

impl<T: RawSample> FileDevice<T> {
    pub fn new(path: impl Into<PathBuf>, sample_rate: f64) -> Self {
        let (halt_tx, halt_rx) = bounded(1);
        Self {
            path: path.into(),
            sample_rate,
            repeat: true,
            throttle: true,
            frequency: Mutex::new(0.0),
            reader: Mutex::new(None),
            streaming: AtomicBool::new(false),
            exhausted: AtomicBool::new(false),
            halt_tx,
            halt_rx,
            _encoding: PhantomData,
        }
    }

    /// Rewind at end of file instead of going quiet
    pub fn repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    /// Pace reads to the nominal sample rate
    pub fn throttle(mut self, throttle: bool) -> Self {
        self.throttle = throttle;
        self
    }

    /// Frequency the recording is labelled with
    pub fn frequency(&self) -> f64 {
        *self.frequency.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fill(&self, reader: &mut BufReader<File>, bytes: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        let mut rewound = false;
        while filled < bytes.len() {
            match reader.read(&mut bytes[filled..]) {
                Ok(0) if self.repeat && !rewound => {
                    reader.seek(SeekFrom::Start(0))?;
                    rewound = true;
                }
                Ok(0) => break,
                Ok(k) => {
                    filled += k;
                    rewound = false;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl<T: RawSample> SdrDevice for FileDevice<T> {
    type Sample = T;

    fn serial(&self) -> String {
        format!("file:{}", self.path.display())
    }

    fn open(&self) -> Result<()> {
        let file = File::open(&self.path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => Error::NotFound(self.path.display().to_string()),
            _ => Error::Io(e),
        })?;
        *self.reader.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(BufReader::with_capacity(1024 * 1024, file));
        self.exhausted.store(false, Ordering::SeqCst);
        info!(path = %self.path.display(), rate = self.sample_rate, "recording opened");
        Ok(())
    }

    fn close(&self) {
        self.stop();
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn is_open(&self) -> bool {
        self.reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    fn set_port(&self, _port: u8) -> Result<()> {
        Ok(())
    }

    fn set_frequency(&self, hz: f64) -> Result<f64> {
        *self.frequency.lock().unwrap_or_else(PoisonError::into_inner) = hz;
        Ok(hz)
    }

    // A recording has no front end; every setting reads back as automatic
    fn set_attenuation(&self, _level: Level) -> Result<Level> {
        Ok(Level::Auto)
    }

    fn set_gain(&self, _stage: GainStage, _level: Level) -> Result<Level> {
        Ok(Level::Auto)
    }

    fn set_bandwidth(&self, _decimation_id: u8, hz: f64) -> Result<f64> {
        Ok(hz.min(self.sample_rate))
    }

    fn bandwidth_range(&self, _decimation_id: u8) -> std::ops::RangeInclusive<f64> {
        0.0..=self.sample_rate
    }

    fn is_live(&self, _kind: ParamKind) -> bool {
        true
    }

    fn start(&self) -> Result<()> {
        if !self.is_open() {
            return Err(Error::StreamStart("recording is not open".to_owned()));
        }
        while self.halt_rx.try_recv().is_ok() {}
        self.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        if self.streaming.swap(false, Ordering::SeqCst) {
            let _ = self.halt_tx.try_send(());
        }
    }

    fn status(&self) -> DeviceStatus {
        if !self.is_open() {
            DeviceStatus::Disconnected
        } else if self.streaming.load(Ordering::SeqCst) {
            DeviceStatus::Running
        } else {
            DeviceStatus::Idle
        }
    }

    fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    fn read(&self, buf: &mut [T]) -> Result<usize, ReadError> {
        if !self.streaming.load(Ordering::SeqCst) {
            return Err(ReadError::NotStreaming);
        }
        if self.throttle {
            let period = Duration::from_secs_f64((buf.len() / 2) as f64 / self.sample_rate);
            match self.halt_rx.recv_timeout(period) {
                Err(RecvTimeoutError::Timeout) => {}
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    return Err(ReadError::NotStreaming)
                }
            }
        }
        let mut guard = self.reader.lock().unwrap_or_else(PoisonError::into_inner);
        let reader = guard.as_mut().ok_or(ReadError::NotStreaming)?;
        let filled = self
            .fill(reader, buf.as_mut_byte_slice())
            .map_err(|e| ReadError::Transport(e.to_string()))?;
        let samples = filled / (2 * mem::size_of::<T>());
        if samples == 0 && !self.exhausted.swap(true, Ordering::SeqCst) {
            warn!(path = %self.path.display(), "end of recording");
        }
        Ok(samples)
    }
}
