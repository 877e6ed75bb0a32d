//! Device configuration snapshot, decimation tiers, and the persistence seam

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Rate before decimation (Hz)
pub const NATIVE_RATE: f64 = 40.0e6;
/// Largest decimation index; the factor is `2^id`
pub const MAX_DECIMATION_ID: u8 = 13;
/// No tier filters narrower than this (Hz)
pub const MIN_BANDWIDTH: f64 = 200.0;
/// Persisted bandwidths below this are treated as corrupt
const MIN_PERSISTED_BANDWIDTH: f64 = 1000.0;

// Widest usable IF bandwidth per decimation tier
const MAX_BANDWIDTH: [f64; MAX_DECIMATION_ID as usize + 1] = [
    27.0e6,  // x1    40 MS/s
    17.8e6,  // x2    20 MS/s
    8.0e6,   // x4    10 MS/s
    3.75e6,  // x8    5 MS/s
    2.0e6,   // x16   2.5 MS/s
    1.0e6,   // x32   1.25 MS/s
    500.0e3, // x64   625 kS/s
    250.0e3, // x128  312.5 kS/s
    140.0e3, // x256  156.25 kS/s
    65.0e3,  // x512  78.125 kS/s
    30.0e3,  // x1024 39.0625 kS/s
    15.0e3,  // x2048 19.53125 kS/s
    8.0e3,   // x4096 9.765625 kS/s
    4.0e3,   // x8192 4.8828125 kS/s
];

pub fn decimation_factor(id: u8) -> u32 {
    1 << id.min(MAX_DECIMATION_ID)
}

/// Output rate of a decimation tier (Hz)
pub fn decimated_rate(id: u8) -> f64 {
    NATIVE_RATE / decimation_factor(id) as f64
}

pub fn max_bandwidth(id: u8) -> f64 {
    MAX_BANDWIDTH[id.min(MAX_DECIMATION_ID) as usize]
}

/// Clamp a requested bandwidth into what a decimation tier supports
pub fn clamp_bandwidth(id: u8, hz: f64) -> f64 {
    num_traits::clamp(hz, MIN_BANDWIDTH, max_bandwidth(id))
}

/// Attenuation or gain setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Auto,
    Db(u8),
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Level::Auto => write!(f, "auto"),
            Level::Db(db) => write!(f, "{db} dB"),
        }
    }
}

/// Everything the controller applies to a device before a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Center frequency (Hz)
    pub frequency: f64,
    /// Input selector
    pub port: u8,
    /// IF bandwidth (Hz)
    pub bandwidth: f64,
    /// Index into the decimation tiers
    pub decimation_id: u8,
    /// Reference level (dBm)
    pub ref_level: f32,
    pub attenuation: Level,
    pub gain: Level,
    pub ext_gain: Level,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            frequency: 100.0e6,
            port: 1,
            bandwidth: 500.0e3,
            decimation_id: 6,
            ref_level: -20.0,
            attenuation: Level::Auto,
            gain: Level::Auto,
            ext_gain: Level::Auto,
        }
    }
}

impl DeviceConfig {
    /// Repair values that could only have come from a damaged store
    pub fn sanitize(&mut self) {
        if self.decimation_id > MAX_DECIMATION_ID {
            warn!(
                decimation_id = self.decimation_id,
                "decimation out of range, clamping to {MAX_DECIMATION_ID}"
            );
            self.decimation_id = MAX_DECIMATION_ID;
        }
        if self.bandwidth.is_nan() || self.bandwidth < MIN_PERSISTED_BANDWIDTH {
            warn!(bandwidth = self.bandwidth, "loaded bandwidth too small, using 500 kHz");
            self.bandwidth = 500.0e3;
        }
    }
}

/// Durable storage for configuration snapshots, keyed by device serial
pub trait ConfigStore: Send {
    fn load(&self, serial: &str) -> Result<Option<DeviceConfig>>;
    fn save(&self, serial: &str, config: &DeviceConfig) -> Result<()>;
}

impl<S: ConfigStore + Sync> ConfigStore for std::sync::Arc<S> {
    fn load(&self, serial: &str) -> Result<Option<DeviceConfig>> {
        (**self).load(serial)
    }

    fn save(&self, serial: &str, config: &DeviceConfig) -> Result<()> {
        (**self).save(serial, config)
    }
}

/// Keeps snapshots for the life of the process only
#[derive(Debug, Default)]
pub struct MemoryStore {
    configs: Mutex<HashMap<String, DeviceConfig>>,
}

impl ConfigStore for MemoryStore {
    fn load(&self, serial: &str) -> Result<Option<DeviceConfig>> {
        let configs = self.configs.lock().unwrap_or_else(|e| e.into_inner());
        Ok(configs.get(serial).cloned())
    }

    fn save(&self, serial: &str, config: &DeviceConfig) -> Result<()> {
        let mut configs = self.configs.lock().unwrap_or_else(|e| e.into_inner());
        configs.insert(serial.to_owned(), config.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct ConfigFile {
    /// Serial of the last device saved
    device: Option<String>,
    devices: HashMap<String, DeviceConfig>,
}

/// One JSON document holding a snapshot per device serial
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<ConfigFile> {
        match fs::read_to_string(&self.path) {
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Serial of the device that was saved most recently, if any
    pub fn last_device(&self) -> Result<Option<String>> {
        Ok(self.read()?.device)
    }
}

impl ConfigStore for JsonFileStore {
    fn load(&self, serial: &str) -> Result<Option<DeviceConfig>> {
        Ok(self.read()?.devices.remove(serial))
    }

    fn save(&self, serial: &str, config: &DeviceConfig) -> Result<()> {
        let mut file = self.read()?;
        file.device = Some(serial.to_owned());
        file.devices.insert(serial.to_owned(), config.clone());
        fs::write(&self.path, serde_json::to_string_pretty(&file)?)?;
        debug!(path = %self.path.display(), serial, "saved device configuration");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("iq_slurper-{}-{name}.json", std::process::id()))
    }

    #[test]
    fn test_decimation_tiers() {
        assert_eq!(decimation_factor(0), 1);
        assert_eq!(decimation_factor(6), 64);
        assert_eq!(decimated_rate(6), 625_000.0);
        assert_eq!(max_bandwidth(6), 500.0e3);
        // Out of range ids saturate at the last tier
        assert_eq!(decimation_factor(40), 8192);
        assert_eq!(max_bandwidth(40), 4.0e3);
    }

    #[test]
    fn test_clamp_bandwidth() {
        assert_eq!(clamp_bandwidth(6, 2.0e6), 500.0e3);
        assert_eq!(clamp_bandwidth(6, 10.0), MIN_BANDWIDTH);
        assert_eq!(clamp_bandwidth(6, 300.0e3), 300.0e3);
        assert_eq!(clamp_bandwidth(0, 30.0e6), 27.0e6);
    }

    #[test]
    fn test_sanitize() {
        let mut cfg = DeviceConfig {
            bandwidth: 12.0,
            decimation_id: 99,
            ..Default::default()
        };
        cfg.sanitize();
        assert_eq!(cfg.bandwidth, 500.0e3);
        assert_eq!(cfg.decimation_id, MAX_DECIMATION_ID);

        let mut nan = DeviceConfig {
            bandwidth: f64::NAN,
            ..Default::default()
        };
        nan.sanitize();
        assert_eq!(nan.bandwidth, 500.0e3);
    }

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::default();
        assert!(store.load("a").unwrap().is_none());
        let cfg = DeviceConfig {
            frequency: 433.92e6,
            ..Default::default()
        };
        store.save("a", &cfg).unwrap();
        assert_eq!(store.load("a").unwrap(), Some(cfg));
        assert!(store.load("b").unwrap().is_none());
    }

    #[test]
    fn test_json_store_round_trip() {
        let path = temp_path("round-trip");
        let _ = fs::remove_file(&path);
        let store = JsonFileStore::new(&path);
        assert_eq!(store.path(), path.as_path());
        assert!(store.load("1234").unwrap().is_none());

        let first = DeviceConfig {
            gain: Level::Db(15),
            ..Default::default()
        };
        let second = DeviceConfig {
            port: 2,
            attenuation: Level::Db(10),
            ..Default::default()
        };
        store.save("1234", &first).unwrap();
        store.save("5678", &second).unwrap();

        let reopened = JsonFileStore::new(&path);
        assert_eq!(reopened.load("1234").unwrap(), Some(first));
        assert_eq!(reopened.load("5678").unwrap(), Some(second));
        assert_eq!(reopened.last_device().unwrap().as_deref(), Some("5678"));
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_json_store_partial_document() {
        let path = temp_path("partial");
        fs::write(
            &path,
            r#"{ "devices": { "42": { "frequency": 7.1e6, "gain": { "db": 5 } } } }"#,
        )
        .unwrap();
        let cfg = JsonFileStore::new(&path).load("42").unwrap().unwrap();
        assert_eq!(cfg.frequency, 7.1e6);
        assert_eq!(cfg.gain, Level::Db(5));
        // Missing fields fall back to defaults
        assert_eq!(cfg.decimation_id, 6);
        fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_json_store_malformed() {
        let path = temp_path("malformed");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            JsonFileStore::new(&path).load("1"),
            Err(crate::error::Error::Json(_))
        ));
        fs::remove_file(&path).unwrap();
    }
}
