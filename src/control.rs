//! Lifecycle controller: owns the device, the channel and the worker thread,
//! and serializes start / stop / tune / reconfigure against the running worker.
//!
//! All control operations happen on the caller's thread and take `&mut self`,
//! so they are sequential by construction. The stop path always joins the
//! worker before the channel is reset, which is what keeps at most one worker
//! alive per controller.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
};

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{debug, error, info, warn};

use crate::{
    capture::run_worker,
    channel::{SampleChannel, SampleReader},
    config::{self, ConfigStore, DeviceConfig, Level, MAX_DECIMATION_ID},
    device::{GainStage, ParamKind, SdrDevice},
    error::{Error, Result},
    monitoring::{Monitor, Stats},
    BATCH_SIZE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Sent to subscribers whenever a (re)start settles on a sample rate
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateChange {
    /// Achieved output rate (Hz)
    pub sample_rate: f64,
    /// IF bandwidth the device settled on (Hz)
    pub bandwidth: f64,
}

/// A single setting change for [`Controller::reconfigure`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Parameter {
    Decimation(u8),
    Bandwidth(f64),
    ReferenceLevel(f32),
    Attenuation(Level),
    Gain(Level),
    ExternalGain(Level),
    Port(u8),
}

impl Parameter {
    fn kind(&self) -> ParamKind {
        match self {
            Parameter::Decimation(_) => ParamKind::Decimation,
            Parameter::Bandwidth(_) => ParamKind::Bandwidth,
            Parameter::ReferenceLevel(_) => ParamKind::ReferenceLevel,
            Parameter::Attenuation(_) => ParamKind::Attenuation,
            Parameter::Gain(_) | Parameter::ExternalGain(_) => ParamKind::Gain,
            Parameter::Port(_) => ParamKind::Port,
        }
    }
}

// Setters the device turned down, tagged with the setter's name
type Rejections = Vec<(&'static str, Error)>;

/// Log a rejected setter and carry on with whatever the device kept
fn accept<T>(result: Result<T>, what: &'static str, rejected: &mut Rejections) -> Option<T> {
    match result {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(error = %e, "could not apply {what}");
            rejected.push((what, e));
            None
        }
    }
}

pub struct Controller<D: SdrDevice> {
    name: String,
    device: Option<Arc<D>>,
    // Why the device is missing, reported by every start attempt
    unavailable: Option<String>,
    serial: String,
    store: Box<dyn ConfigStore>,
    config: DeviceConfig,
    state: RunState,
    sample_rate: f64,
    channel: SampleChannel,
    reader: Option<SampleReader>,
    run: Arc<AtomicBool>,
    purge: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    monitor: Arc<Monitor>,
    running_since: Option<DateTime<Utc>>,
    subscribers: Vec<Sender<RateChange>>,
}

impl<D: SdrDevice> Controller<D> {
    /// Take ownership of an initialized device (or the reason it failed to
    /// initialize) and restore its persisted settings.
    pub fn new(
        name: impl Into<String>,
        device: Result<D>,
        store: impl ConfigStore + 'static,
    ) -> Self {
        let name = name.into();
        let (device, unavailable) = match device {
            Ok(d) => (Some(Arc::new(d)), None),
            Err(e) => {
                error!(controller = %name, error = %e, "device capability failed to initialize");
                (None, Some(e.to_string()))
            }
        };
        let serial = device.as_ref().map(|d| d.serial()).unwrap_or_default();
        let mut config = match device.as_ref().map(|_| store.load(&serial)) {
            Some(Ok(Some(saved))) => {
                debug!(device = %serial, "restored saved configuration");
                saved
            }
            Some(Err(e)) => {
                warn!(device = %serial, error = %e, "could not load saved configuration, using defaults");
                DeviceConfig::default()
            }
            Some(Ok(None)) | None => DeviceConfig::default(),
        };
        config.sanitize();
        let (channel, reader) = SampleChannel::new(BATCH_SIZE);
        Self {
            name,
            device,
            unavailable,
            serial,
            store: Box::new(store),
            config,
            state: RunState::Stopped,
            sample_rate: 0.0,
            channel,
            reader: Some(reader),
            run: Arc::new(AtomicBool::new(false)),
            purge: Arc::new(AtomicBool::new(false)),
            worker: None,
            monitor: Arc::new(Monitor::default()),
            running_since: None,
            subscribers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Current settings snapshot
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Rate reported by the device at the last start (Hz), zero before the first
    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn device(&self) -> Option<&D> {
        self.device.as_deref()
    }

    /// Subscribe to rate notifications. Each call gets its own receiver.
    pub fn rate_updates(&mut self) -> Receiver<RateChange> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// The consuming half of the sample channel. There is only one.
    pub fn take_reader(&mut self) -> Option<SampleReader> {
        self.reader.take()
    }

    pub fn stats(&self) -> Stats {
        Stats {
            running_since: self.running_since,
            ..self.monitor.snapshot()
        }
    }

    /// Ask the worker to discard whatever IQ the device has buffered before
    /// its next read. Every start does this on its own.
    pub fn request_purge(&self) {
        self.purge.store(true, Ordering::SeqCst);
    }

    fn available(&self) -> Result<Arc<D>> {
        self.device.clone().ok_or_else(|| {
            Error::Unavailable(
                self.unavailable
                    .clone()
                    .unwrap_or_else(|| "no device".to_owned()),
            )
        })
    }

    fn persist(&self) {
        if self.device.is_none() {
            return;
        }
        if let Err(e) = self.store.save(&self.serial, &self.config) {
            warn!(device = %self.serial, error = %e, "could not save configuration");
        }
    }

    fn notify_rate(&mut self) {
        let change = RateChange {
            sample_rate: self.sample_rate,
            bandwidth: self.config.bandwidth,
        };
        info!(
            controller = %self.name,
            rate = change.sample_rate,
            bandwidth = change.bandwidth,
            "sample rate"
        );
        // Subscribers that hung up are forgotten
        self.subscribers.retain(|tx| tx.send(change).is_ok());
    }

    fn clamp_bandwidth(device: &D, cfg: &mut DeviceConfig) {
        let range = device.bandwidth_range(cfg.decimation_id);
        let clamped = num_traits::clamp(cfg.bandwidth, *range.start(), *range.end());
        if clamped != cfg.bandwidth {
            warn!(
                requested = cfg.bandwidth,
                clamped,
                decimation_id = cfg.decimation_id,
                "bandwidth out of range for decimation"
            );
            cfg.bandwidth = clamped;
        }
    }

    // Fixed order: port, frequency, reference level, attenuation, gain,
    // external gain, then decimation and bandwidth together. A rejected
    // setting falls back to its value in `fallback`.
    fn apply_all(&mut self, device: &D, fallback: &DeviceConfig) -> Rejections {
        let mut rejected = Rejections::new();
        let cfg = &mut self.config;
        if accept(device.set_port(cfg.port), "port", &mut rejected).is_none() {
            cfg.port = fallback.port;
        }
        cfg.frequency = accept(device.set_frequency(cfg.frequency), "frequency", &mut rejected)
            .unwrap_or(fallback.frequency);
        if accept(
            device.set_reference_level(cfg.ref_level),
            "reference level",
            &mut rejected,
        )
        .is_none()
        {
            cfg.ref_level = fallback.ref_level;
        }
        cfg.attenuation = accept(
            device.set_attenuation(cfg.attenuation),
            "attenuation",
            &mut rejected,
        )
        .unwrap_or(fallback.attenuation);
        cfg.gain = accept(
            device.set_gain(GainStage::Internal, cfg.gain),
            "gain",
            &mut rejected,
        )
        .unwrap_or(fallback.gain);
        cfg.ext_gain = accept(
            device.set_gain(GainStage::External, cfg.ext_gain),
            "external gain",
            &mut rejected,
        )
        .unwrap_or(fallback.ext_gain);
        match accept(
            device.set_bandwidth(cfg.decimation_id, cfg.bandwidth),
            "bandwidth",
            &mut rejected,
        ) {
            Some(hz) => cfg.bandwidth = hz,
            None => {
                cfg.decimation_id = fallback.decimation_id;
                cfg.bandwidth = fallback.bandwidth;
            }
        }
        rejected
    }

    /// Open and configure the device, start its stream and spawn the worker.
    /// A no-op while already starting or running.
    pub fn start(&mut self) -> Result<()> {
        self.start_inner(None).map(drop)
    }

    // `fallback` holds the settings the hardware had before a restart, which
    // is what a rejected setting reverts to. Without one the snapshot keeps
    // its own value.
    fn start_inner(&mut self, fallback: Option<DeviceConfig>) -> Result<Rejections> {
        if matches!(self.state, RunState::Starting | RunState::Running) {
            return Ok(Rejections::new());
        }
        let device = self.available()?;
        self.state = RunState::Starting;
        info!(controller = %self.name, device = %self.serial, "starting acquisition");

        if !device.is_open() {
            if let Err(e) = device.open() {
                error!(device = %self.serial, error = %e, "failed to open device");
                self.state = RunState::Stopped;
                return Err(e);
            }
        }

        let requested = self.config.clone();
        Self::clamp_bandwidth(&device, &mut self.config);
        let fallback = fallback.unwrap_or_else(|| self.config.clone());
        let rejected = self.apply_all(&device, &fallback);
        if self.config != requested {
            self.persist();
        }

        if let Err(e) = device.start() {
            error!(device = %self.serial, error = %e, "device stream failed to start");
            device.close();
            self.state = RunState::Stopped;
            return Err(e);
        }
        self.sample_rate = device.sample_rate();
        self.notify_rate();

        self.run.store(true, Ordering::SeqCst);
        // Anything the device buffered before this run is stale
        self.purge.store(true, Ordering::SeqCst);
        let writer = self.channel.writer();
        let (worker_device, run, purge, monitor) = (
            device.clone(),
            self.run.clone(),
            self.purge.clone(),
            self.monitor.clone(),
        );
        let spawned = thread::Builder::new()
            .name(format!("{}-acq", self.name))
            .spawn(move || run_worker(worker_device, writer, run, purge, monitor));
        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                error!(error = %e, "failed to spawn acquisition worker");
                self.run.store(false, Ordering::SeqCst);
                device.stop();
                self.state = RunState::Stopped;
                return Err(Error::Spawn(e));
            }
        }
        self.running_since = Some(Utc::now());
        self.state = RunState::Running;
        Ok(rejected)
    }

    /// Halt the stream and wait for the worker to exit. The device stays open
    /// so the next start is cheap.
    pub fn stop(&mut self) {
        if !matches!(self.state, RunState::Starting | RunState::Running) {
            return;
        }
        self.state = RunState::Stopping;
        debug!(controller = %self.name, "stopping acquisition");
        self.run.store(false, Ordering::SeqCst);
        // The halt wakes a blocked read, the channel stop wakes a blocked commit
        if let Some(device) = &self.device {
            device.stop();
        }
        self.channel.signal_stop();
        if let Some(handle) = self.worker.take() {
            if handle.join().is_err() {
                error!(controller = %self.name, "acquisition worker panicked");
            }
        }
        self.channel.reset_for_reuse();
        self.running_since = None;
        self.state = RunState::Stopped;
        info!(controller = %self.name, "acquisition stopped");
    }

    // Push the requested snapshot `next` to the device, live when it can take
    // the change mid-stream, otherwise through a full restart. `setter` names
    // the device call that carries the change. A live rejection leaves the
    // snapshot and the store untouched.
    fn update<F>(
        &mut self,
        kind: ParamKind,
        setter: &'static str,
        next: DeviceConfig,
        apply: F,
    ) -> Result<()>
    where
        F: FnOnce(&D, &mut DeviceConfig) -> Result<()>,
    {
        let result = match (self.state, self.device.clone()) {
            (RunState::Running, Some(device)) if device.is_live(kind) => {
                let mut applied = next;
                if let Err(e) = apply(&*device, &mut applied) {
                    warn!(controller = %self.name, error = %e, "setting change not applied");
                    return Err(e);
                }
                self.config = applied;
                if matches!(kind, ParamKind::Bandwidth | ParamKind::Decimation) {
                    self.sample_rate = device.sample_rate();
                    self.notify_rate();
                }
                Ok(())
            }
            (RunState::Running, Some(_)) => {
                debug!(controller = %self.name, "restarting stream to apply settings");
                self.stop();
                let previous = std::mem::replace(&mut self.config, next);
                // The restart reverts a rejected setting, report it all the same
                self.start_inner(Some(previous)).and_then(|rejected| {
                    match rejected.into_iter().find(|(what, _)| *what == setter) {
                        Some((_, e)) => Err(e),
                        None => Ok(()),
                    }
                })
            }
            _ => {
                self.config = next;
                Ok(())
            }
        };
        if let Err(e) = &result {
            warn!(controller = %self.name, error = %e, "setting change not applied");
        }
        self.persist();
        result
    }

    /// Retune the center frequency (Hz)
    pub fn tune(&mut self, hz: f64) -> Result<()> {
        if !hz.is_finite() || hz <= 0.0 {
            return Err(Error::Rejected {
                param: "frequency",
                reason: format!("{hz} Hz"),
            });
        }
        let next = DeviceConfig {
            frequency: hz,
            ..self.config.clone()
        };
        self.update(ParamKind::Frequency, "frequency", next, |device, cfg| {
            cfg.frequency = device.set_frequency(cfg.frequency)?;
            Ok(())
        })
    }

    /// Change one setting. Changes the device cannot take mid-stream restart it.
    /// A setting the device rejects is reported and the snapshot keeps the old value.
    pub fn reconfigure(&mut self, param: Parameter) -> Result<()> {
        let mut next = self.config.clone();
        let setter = match param {
            Parameter::Decimation(id) => {
                next.decimation_id = id.min(MAX_DECIMATION_ID);
                "bandwidth"
            }
            Parameter::Bandwidth(hz) if hz.is_nan() => {
                return Err(Error::Rejected {
                    param: "bandwidth",
                    reason: "not a number".to_owned(),
                })
            }
            Parameter::Bandwidth(hz) => {
                next.bandwidth = hz;
                "bandwidth"
            }
            Parameter::ReferenceLevel(dbm) => {
                next.ref_level = dbm;
                "reference level"
            }
            Parameter::Attenuation(level) => {
                next.attenuation = level;
                "attenuation"
            }
            Parameter::Gain(level) => {
                next.gain = level;
                "gain"
            }
            Parameter::ExternalGain(level) => {
                next.ext_gain = level;
                "external gain"
            }
            Parameter::Port(port) => {
                next.port = port;
                "port"
            }
        };
        if setter == "bandwidth" {
            match self.device.clone() {
                Some(device) => Self::clamp_bandwidth(&device, &mut next),
                None => {
                    next.bandwidth = config::clamp_bandwidth(next.decimation_id, next.bandwidth)
                }
            }
        }
        self.update(param.kind(), setter, next, move |device, cfg| {
            match param {
                Parameter::Decimation(_) | Parameter::Bandwidth(_) => {
                    cfg.bandwidth = device.set_bandwidth(cfg.decimation_id, cfg.bandwidth)?;
                }
                Parameter::ReferenceLevel(dbm) => device.set_reference_level(dbm)?,
                Parameter::Attenuation(level) => cfg.attenuation = device.set_attenuation(level)?,
                Parameter::Gain(level) => cfg.gain = device.set_gain(GainStage::Internal, level)?,
                Parameter::ExternalGain(level) => {
                    cfg.ext_gain = device.set_gain(GainStage::External, level)?
                }
                Parameter::Port(port) => device.set_port(port)?,
            }
            Ok(())
        })
    }
}

impl<D: SdrDevice> Drop for Controller<D> {
    fn drop(&mut self) {
        self.stop();
        if let Some(device) = &self.device {
            if device.is_open() {
                device.close();
            }
        }
    }
}
