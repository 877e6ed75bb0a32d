//! Scripted device for exercising the controller and worker in tests

use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Mutex, PoisonError,
    },
    time::Duration,
};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use super::{DeviceStatus, GainStage, ParamKind, SdrDevice};
use crate::{
    config::{self, Level, MIN_BANDWIDTH},
    error::{Error, ReadError, Result},
};

#[derive(Debug, Clone, Copy)]
pub(crate) enum ReadMode {
    /// Every read fills the buffer with this raw value after a short pause
    Data(i16),
    /// Reads never return data and only come back once the stream is halted
    BlockUntilStop,
}

pub(crate) struct FakeDevice {
    mode: ReadMode,
    fail_open: bool,
    fail_start: bool,
    overreport: bool,
    live: Vec<ParamKind>,
    transient_errors: AtomicU64,
    calls: Mutex<Vec<String>>,
    open: AtomicBool,
    streaming: AtomicBool,
    decimation: Mutex<u8>,
    halt_tx: Sender<()>,
    halt_rx: Receiver<()>,
    in_read: AtomicUsize,
    peak_in_read: AtomicUsize,
    reads: AtomicU64,
    pending_loss: AtomicU64,
    purges: AtomicU64,
}

impl FakeDevice {
    pub(crate) fn new(mode: ReadMode) -> Self {
        let (halt_tx, halt_rx) = bounded(1);
        Self {
            mode,
            fail_open: false,
            fail_start: false,
            overreport: false,
            live: vec![ParamKind::Frequency],
            transient_errors: AtomicU64::new(0),
            calls: Mutex::new(Vec::new()),
            open: AtomicBool::new(false),
            streaming: AtomicBool::new(false),
            decimation: Mutex::new(6),
            halt_tx,
            halt_rx,
            in_read: AtomicUsize::new(0),
            peak_in_read: AtomicUsize::new(0),
            reads: AtomicU64::new(0),
            pending_loss: AtomicU64::new(0),
            purges: AtomicU64::new(0),
        }
    }

    pub(crate) fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub(crate) fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub(crate) fn live(mut self, kinds: &[ParamKind]) -> Self {
        self.live = kinds.to_vec();
        self
    }

    /// Reads claim a few more samples than fit in the buffer
    pub(crate) fn overreport(mut self) -> Self {
        self.overreport = true;
        self
    }

    /// The next successful read reports this many dropped samples
    pub(crate) fn report_loss(&self, n: u64) {
        self.pending_loss.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn transient_errors(self, n: u64) -> Self {
        self.transient_errors.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) fn count(&self, prefix: &str) -> usize {
        self.calls().iter().filter(|c| c.starts_with(prefix)).count()
    }

    pub(crate) fn peak_concurrent_reads(&self) -> usize {
        self.peak_in_read.load(Ordering::SeqCst)
    }

    pub(crate) fn reads(&self) -> u64 {
        self.reads.load(Ordering::SeqCst)
    }

    // Not part of `calls`, a purge happens on the worker's schedule
    pub(crate) fn purges(&self) -> u64 {
        self.purges.load(Ordering::SeqCst)
    }

    fn log(&self, call: String) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    fn read_inner(&self, buf: &mut [i16]) -> Result<usize, ReadError> {
        if !self.streaming.load(Ordering::SeqCst) {
            return Err(ReadError::NotStreaming);
        }
        if self
            .transient_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(ReadError::Transport("injected".to_owned()));
        }
        match self.mode {
            ReadMode::BlockUntilStop => {
                let _ = self.halt_rx.recv();
                Err(ReadError::NotStreaming)
            }
            ReadMode::Data(value) => {
                match self.halt_rx.recv_timeout(Duration::from_millis(1)) {
                    Err(RecvTimeoutError::Timeout) => {}
                    _ => return Err(ReadError::NotStreaming),
                }
                buf.fill(value);
                if self.overreport {
                    Ok(buf.len() / 2 + 8)
                } else {
                    Ok(buf.len() / 2)
                }
            }
        }
    }
}

impl SdrDevice for FakeDevice {
    type Sample = i16;

    fn serial(&self) -> String {
        "fake-0001".to_owned()
    }

    fn open(&self) -> Result<()> {
        self.log("open".to_owned());
        if self.fail_open {
            return Err(Error::NotFound("fake-0001".to_owned()));
        }
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close(&self) {
        self.log("close".to_owned());
        self.open.store(false, Ordering::SeqCst);
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn set_port(&self, port: u8) -> Result<()> {
        self.log(format!("port={port}"));
        Ok(())
    }

    fn set_frequency(&self, hz: f64) -> Result<f64> {
        self.log(format!("frequency={hz}"));
        Ok(hz)
    }

    fn set_reference_level(&self, dbm: f32) -> Result<()> {
        self.log(format!("ref_level={dbm}"));
        Ok(())
    }

    fn set_attenuation(&self, level: Level) -> Result<Level> {
        self.log(format!("attenuation={level}"));
        Ok(level)
    }

    fn set_gain(&self, stage: GainStage, level: Level) -> Result<Level> {
        match stage {
            GainStage::Internal => self.log(format!("gain={level}")),
            GainStage::External => {
                self.log(format!("ext_gain={level}"));
                if level != Level::Auto {
                    return Err(Error::Rejected {
                        param: "external gain",
                        reason: "not fitted".to_owned(),
                    });
                }
            }
        }
        Ok(level)
    }

    fn set_bandwidth(&self, decimation_id: u8, hz: f64) -> Result<f64> {
        self.log(format!("bandwidth={hz}@{decimation_id}"));
        *self.decimation.lock().unwrap_or_else(PoisonError::into_inner) = decimation_id;
        Ok(config::clamp_bandwidth(decimation_id, hz))
    }

    fn bandwidth_range(&self, decimation_id: u8) -> std::ops::RangeInclusive<f64> {
        MIN_BANDWIDTH..=config::max_bandwidth(decimation_id)
    }

    fn is_live(&self, kind: ParamKind) -> bool {
        self.live.contains(&kind)
    }

    fn start(&self) -> Result<()> {
        self.log("start".to_owned());
        if self.fail_start {
            return Err(Error::StreamStart("scripted failure".to_owned()));
        }
        while self.halt_rx.try_recv().is_ok() {}
        self.streaming.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) {
        self.log("stop".to_owned());
        if self.streaming.swap(false, Ordering::SeqCst) {
            let _ = self.halt_tx.try_send(());
        }
    }

    fn status(&self) -> DeviceStatus {
        if self.streaming.load(Ordering::SeqCst) {
            DeviceStatus::Running
        } else {
            DeviceStatus::Idle
        }
    }

    fn sample_rate(&self) -> f64 {
        config::decimated_rate(*self.decimation.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn take_sample_loss(&self) -> u64 {
        self.pending_loss.swap(0, Ordering::SeqCst)
    }

    fn purge(&self) {
        self.purges.fetch_add(1, Ordering::SeqCst);
    }

    fn read(&self, buf: &mut [i16]) -> Result<usize, ReadError> {
        let now = self.in_read.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_read.fetch_max(now, Ordering::SeqCst);
        self.reads.fetch_add(1, Ordering::SeqCst);
        let result = self.read_inner(buf);
        self.in_read.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
