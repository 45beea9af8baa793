//! Persistent engine state
//!
//! **Purpose:** Crash-survivable storage for everything that must outlive
//! the process: the active config, last-known-good, calibration progress,
//! crash history, the risky-operation marker and BlackBox recordings.
//!
//! Every document is JSON wrapped in a `{version, saved_at, data}` envelope
//! and written atomically (temp file, fsync, rename, fsync directory), so a
//! crash leaves either the old or the new document, never a torn one.

use crate::calibration::binning::{BinningResult, BinningState};
use crate::calibration::wizard::WizardSession;
use crate::curve::{DynamicConfig, FrequencyCurve};
use crate::error::{Error, Result};
use crate::recovery::blackbox::BlackBoxRecording;
use chrono::{DateTime, Utc};
use deckvolt_common::time::file_stamp;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

/// Current on-disk format version
pub const STORE_FORMAT_VERSION: u32 = 1;

/// Crash records kept before the oldest is evicted
pub const CRASH_HISTORY_LIMIT: usize = 50;

const DYNAMIC_CONFIG: &str = "dynamic_config.json";
const LAST_KNOWN_GOOD: &str = "last_known_good.json";
const BINNING_STATE: &str = "binning_state.json";
const BINNING_RESULT: &str = "binning_result.json";
const CRASH_HISTORY: &str = "crash_history.json";
const RISKY_MARKER: &str = "risky_operation.json";
const WIZARD_SESSION: &str = "wizard_session.json";
const FREQUENCY_CURVES: &str = "frequency_curves.json";
const BLACKBOX_DIR: &str = "blackbox";

#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    version: u32,
    saved_at: DateTime<Utc>,
    data: T,
}

/// A config that ran without instability for the dwell period
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastKnownGood {
    pub config: DynamicConfig,
    pub timestamp: DateTime<Utc>,
    pub stable_duration_secs: u64,
}

/// One crash or rollback
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrashRecord {
    pub timestamp: DateTime<Utc>,
    pub crashed_values: Vec<i32>,
    pub restored_values: Vec<i32>,
    pub reason: String,
}

impl CrashRecord {
    pub fn new(reason: &str, crashed_values: Vec<i32>, restored_values: Vec<i32>) -> Self {
        Self {
            timestamp: Utc::now(),
            crashed_values,
            restored_values,
            reason: reason.to_string(),
        }
    }
}

/// Bounded crash log with lifetime counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrashHistory {
    pub records: Vec<CrashRecord>,
    pub total_count: u64,
    pub last_crash: Option<DateTime<Utc>>,
}

impl CrashHistory {
    /// Append, evicting the oldest record beyond the limit
    pub fn push(&mut self, record: CrashRecord) {
        self.total_count += 1;
        self.last_crash = Some(record.timestamp);
        self.records.push(record);
        if self.records.len() > CRASH_HISTORY_LIMIT {
            let excess = self.records.len() - CRASH_HISTORY_LIMIT;
            self.records.drain(..excess);
        }
    }
}

/// What was in flight when the marker was written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RiskyOperation {
    /// Dynamic control applying undervolts
    Controller,
    /// Binning test at `in_flight_mv` on every core
    Binning,
    /// Wizard probe on one core at one frequency
    Wizard { core_id: usize, frequency_mhz: u32 },
}

/// On-disk marker cleared on clean completion
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskyMarker {
    pub operation: RiskyOperation,
    pub in_flight_mv: Option<i32>,
    pub applied_mv: Vec<i32>,
    pub started_at: DateTime<Utc>,
}

impl RiskyMarker {
    pub fn new(operation: RiskyOperation, in_flight_mv: Option<i32>, applied_mv: Vec<i32>) -> Self {
        Self {
            operation,
            in_flight_mv,
            applied_mv,
            started_at: Utc::now(),
        }
    }
}

/// Write `bytes` to `path` atomically
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidState(format!("bad store path {}", path.display())))?;
    let tmp = path.with_file_name(format!(
        ".{}.{}.tmp",
        file_name,
        uuid::Uuid::new_v4().simple()
    ));

    let result = (|| -> Result<()> {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
        return result;
    }

    if let Some(parent) = path.parent() {
        // Directory fsync is unsupported on some filesystems
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// JSON document store rooted at one directory
pub struct StateStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl StateStore {
    /// Open (creating if needed) a store at `dir`
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(dir.join(BLACKBOX_DIR))?;
        info!("State store at {}", dir.display());
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn write_doc<T: Serialize>(&self, path: &Path, data: &T) -> Result<()> {
        let envelope = Envelope {
            version: STORE_FORMAT_VERSION,
            saved_at: Utc::now(),
            data,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;
        atomic_write(path, &bytes)?;
        debug!("Wrote {}", path.display());
        Ok(())
    }

    fn read_doc<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let value: serde_json::Value = serde_json::from_slice(&bytes)?;
        let data = migrate(value, path)?;
        Ok(Some(serde_json::from_value(data)?))
    }

    fn remove_doc(&self, path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn write<T: Serialize>(&self, name: &str, data: &T) -> Result<()> {
        let _guard = self.lock();
        self.write_doc(&self.dir.join(name), data)
    }

    fn read<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        self.read_doc(&self.dir.join(name))
    }

    // --- dynamic config --------------------------------------------------

    pub fn save_dynamic_config(&self, config: &DynamicConfig) -> Result<()> {
        self.write(DYNAMIC_CONFIG, config)
    }

    pub fn load_dynamic_config(&self) -> Result<Option<DynamicConfig>> {
        self.read(DYNAMIC_CONFIG)
    }

    // --- last known good -------------------------------------------------

    pub fn save_lkg(&self, lkg: &LastKnownGood) -> Result<()> {
        self.write(LAST_KNOWN_GOOD, lkg)
    }

    pub fn load_lkg(&self) -> Result<Option<LastKnownGood>> {
        self.read(LAST_KNOWN_GOOD)
    }

    // --- binning ---------------------------------------------------------

    pub fn save_binning_state(&self, state: &BinningState) -> Result<()> {
        self.write(BINNING_STATE, state)
    }

    pub fn load_binning_state(&self) -> Result<Option<BinningState>> {
        self.read(BINNING_STATE)
    }

    pub fn save_binning_result(&self, result: &BinningResult) -> Result<()> {
        self.write(BINNING_RESULT, result)
    }

    pub fn load_binning_result(&self) -> Result<Option<BinningResult>> {
        self.read(BINNING_RESULT)
    }

    // --- wizard ----------------------------------------------------------

    pub fn save_wizard_session(&self, session: &WizardSession) -> Result<()> {
        self.write(WIZARD_SESSION, session)
    }

    pub fn load_wizard_session(&self) -> Result<Option<WizardSession>> {
        self.read(WIZARD_SESSION)
    }

    pub fn save_curves(&self, curves: &BTreeMap<usize, FrequencyCurve>) -> Result<()> {
        self.write(FREQUENCY_CURVES, curves)
    }

    pub fn load_curves(&self) -> Result<BTreeMap<usize, FrequencyCurve>> {
        Ok(self.read(FREQUENCY_CURVES)?.unwrap_or_default())
    }

    // --- crash history ---------------------------------------------------

    pub fn load_crash_history(&self) -> Result<CrashHistory> {
        Ok(self.read(CRASH_HISTORY)?.unwrap_or_default())
    }

    /// Append one record (read-modify-write under the store lock)
    pub fn append_crash(&self, record: CrashRecord) -> Result<CrashHistory> {
        let _guard = self.lock();
        let path = self.dir.join(CRASH_HISTORY);
        let mut history: CrashHistory = self.read_doc(&path)?.unwrap_or_default();
        history.push(record);
        self.write_doc(&path, &history)?;
        Ok(history)
    }

    // --- risky-operation marker -----------------------------------------

    pub fn write_marker(&self, marker: &RiskyMarker) -> Result<()> {
        self.write(RISKY_MARKER, marker)
    }

    pub fn read_marker(&self) -> Result<Option<RiskyMarker>> {
        self.read(RISKY_MARKER)
    }

    pub fn clear_marker(&self) -> Result<()> {
        let _guard = self.lock();
        self.remove_doc(&self.dir.join(RISKY_MARKER))
    }

    // --- blackbox --------------------------------------------------------

    /// Persist a recording, keeping only the newest `keep` files
    pub fn save_recording(&self, recording: &BlackBoxRecording, keep: usize) -> Result<PathBuf> {
        let _guard = self.lock();
        let dir = self.dir.join(BLACKBOX_DIR);
        fs::create_dir_all(&dir)?;

        let stamp = file_stamp(recording.timestamp);
        let mut path = dir.join(format!("blackbox_{}.json", stamp));
        let mut suffix = 1;
        while path.exists() {
            path = dir.join(format!("blackbox_{}_{}.json", stamp, suffix));
            suffix += 1;
        }
        self.write_doc(&path, recording)?;

        let recordings = list_json(&dir)?;
        if recordings.len() > keep {
            for old in &recordings[..recordings.len() - keep] {
                if let Err(e) = fs::remove_file(old) {
                    warn!("Failed to evict {}: {}", old.display(), e);
                }
            }
        }
        Ok(path)
    }

    /// Recording files, oldest first
    pub fn list_recordings(&self) -> Result<Vec<PathBuf>> {
        list_json(&self.dir.join(BLACKBOX_DIR))
    }

    pub fn load_recording(&self, path: &Path) -> Result<BlackBoxRecording> {
        self.read_doc(path)?
            .ok_or_else(|| Error::NotFound(path.display().to_string()))
    }
}

fn list_json(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.extension().and_then(|e| e.to_str()) == Some("json")
                    && !p
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with('.'))
            })
            .collect(),
        Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    files.sort();
    Ok(files)
}

/// Bring a stored document up to the current format
///
/// Version 0 documents were written without an envelope. Documents from a
/// newer version are refused rather than misread.
fn migrate(value: serde_json::Value, path: &Path) -> Result<serde_json::Value> {
    let is_envelope = value.get("version").is_some() && value.get("data").is_some();
    if !is_envelope {
        debug!("Migrating unversioned document {}", path.display());
        return Ok(value);
    }

    let version = value
        .get("version")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::Config(format!("{}: bad version field", path.display())))?;
    if version > STORE_FORMAT_VERSION as u64 {
        return Err(Error::Config(format!(
            "{} was written by format version {} (supported: {})",
            path.display(),
            version,
            STORE_FORMAT_VERSION
        )));
    }

    match value {
        serde_json::Value::Object(mut map) => Ok(map.remove("data").unwrap_or_default()),
        other => Ok(other),
    }
}
