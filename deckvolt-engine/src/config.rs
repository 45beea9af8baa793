//! Engine bootstrap configuration
//!
//! Loaded from TOML; every key is optional and falls back to the defaults
//! below. The file is located by `deckvolt_common::config` (CLI argument,
//! `DECKVOLT_CONFIG`, user config dir, `/etc/deckvolt`).

use crate::error::{Error, Result};
use deckvolt_common::config::{load_toml, locate_config_file};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory for persisted state; resolved against CLI/env by the caller
    pub state_dir: Option<PathBuf>,
    /// Widen the voltage floor to -100 mV
    pub expert_mode: bool,
    pub core_count: usize,
    pub event_capacity: usize,
    pub controller: ControllerSettings,
    pub metrics: MetricsSettings,
    pub watchdog: WatchdogSettings,
    pub calibration: CalibrationSettings,
    pub blackbox: BlackBoxSettings,
    pub hardware: HardwareSettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: None,
            expert_mode: false,
            core_count: crate::limits::DEFAULT_CORE_COUNT,
            event_capacity: 256,
            controller: ControllerSettings::default(),
            metrics: MetricsSettings::default(),
            watchdog: WatchdogSettings::default(),
            calibration: CalibrationSettings::default(),
            blackbox: BlackBoxSettings::default(),
            hardware: HardwareSettings::default(),
        }
    }
}

impl EngineConfig {
    /// Load from the located config file, or defaults when there is none
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        match locate_config_file(cli_path) {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                let config: EngineConfig = load_toml(&path)?;
                config.check()?;
                Ok(config)
            }
            None => {
                info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Reject values the engine cannot run with
    pub fn check(&self) -> Result<()> {
        if self.core_count == 0 {
            return Err(Error::Config("core_count must be at least 1".to_string()));
        }
        if self.controller.load_interval_ms == 0 || self.controller.frequency_interval_ms == 0 {
            return Err(Error::Config("controller intervals must be non-zero".to_string()));
        }
        if self.watchdog.check_interval_ms == 0 || self.watchdog.missed_limit == 0 {
            return Err(Error::Config(
                "watchdog check_interval_ms and missed_limit must be non-zero".to_string(),
            ));
        }
        if self.blackbox.capacity == 0 {
            return Err(Error::Config("blackbox capacity must be non-zero".to_string()));
        }
        Ok(())
    }
}

/// Control loop cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerSettings {
    pub load_interval_ms: u64,
    pub frequency_interval_ms: u64,
    /// Bound on waiting for the loop task to exit during stop
    pub stop_timeout_ms: u64,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            load_interval_ms: 500,
            frequency_interval_ms: 100,
            stop_timeout_ms: 2000,
        }
    }
}

impl ControllerSettings {
    pub fn load_interval(&self) -> Duration {
        Duration::from_millis(self.load_interval_ms)
    }

    pub fn frequency_interval(&self) -> Duration {
        Duration::from_millis(self.frequency_interval_ms)
    }
}

/// Sampler behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub frequency_cache_ms: u64,
    /// Consecutive stale reads before a core is reported unavailable
    pub stale_limit: u32,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            frequency_cache_ms: 10,
            stale_limit: 3,
        }
    }
}

/// Watchdog and progressive recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchdogSettings {
    pub check_interval_ms: u64,
    /// Consecutive missed checks that enter Degraded
    pub missed_limit: u32,
    /// Offset added to every core on degradation
    pub recovery_delta_mv: i32,
    /// Stable heartbeat cycles before a reduced config is promoted
    pub hold_cycles: u32,
    /// Continuous stability required before a config becomes last-known-good
    pub lkg_dwell_secs: u64,
}

impl Default for WatchdogSettings {
    fn default() -> Self {
        Self {
            check_interval_ms: 1000,
            missed_limit: 3,
            recovery_delta_mv: 5,
            hold_cycles: 2,
            lkg_dwell_secs: 30,
        }
    }
}

impl WatchdogSettings {
    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }

    pub fn lkg_dwell(&self) -> Duration {
        Duration::from_secs(self.lkg_dwell_secs)
    }
}

/// Calibration safety settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    pub temperature_ceiling_c: f32,
    pub temperature_poll_ms: u64,
    /// Extra time a workload gets beyond its duration before it counts as hung
    pub hang_grace_secs: u64,
    /// Bound on cancellation, including restore
    pub cancel_timeout_ms: u64,
}

impl Default for CalibrationSettings {
    fn default() -> Self {
        Self {
            temperature_ceiling_c: 85.0,
            temperature_poll_ms: 500,
            hang_grace_secs: 30,
            cancel_timeout_ms: 2000,
        }
    }
}

impl CalibrationSettings {
    pub fn temperature_poll(&self) -> Duration {
        Duration::from_millis(self.temperature_poll_ms)
    }

    pub fn hang_grace(&self) -> Duration {
        Duration::from_secs(self.hang_grace_secs)
    }

    pub fn cancel_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_timeout_ms)
    }
}

/// BlackBox ring settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlackBoxSettings {
    /// Samples kept in memory (60 × 500 ms ≈ 30 s)
    pub capacity: usize,
    /// Recordings kept on disk
    pub max_recordings: usize,
}

impl Default for BlackBoxSettings {
    fn default() -> Self {
        Self {
            capacity: 60,
            max_recordings: 5,
        }
    }
}

/// Paths and commands for the Linux adapters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareSettings {
    pub proc_root: PathBuf,
    pub sysfs_root: PathBuf,
    pub temperature_path: PathBuf,
    pub fan_rpm_path: Option<PathBuf>,
    pub fan_pwm_path: Option<PathBuf>,
    /// argv with `{core}` and `{mv}` placeholders
    pub voltage_command: Vec<String>,
    pub stress_program: String,
    pub stress_workers: usize,
}

impl Default for HardwareSettings {
    fn default() -> Self {
        Self {
            proc_root: PathBuf::from("/proc"),
            sysfs_root: PathBuf::from("/sys"),
            temperature_path: PathBuf::from("/sys/class/thermal/thermal_zone0/temp"),
            fan_rpm_path: None,
            fan_pwm_path: None,
            voltage_command: Vec::new(),
            stress_program: "stress-ng".to_string(),
            stress_workers: 4,
        }
    }
}
