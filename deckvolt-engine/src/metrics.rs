//! Per-core metrics sampling
//!
//! **Purpose:** Turn raw counters into load percentage, current frequency
//! and temperature for the control loop.
//!
//! - Load comes from the delta of cumulative busy/idle counters between two
//!   samples; the first sample after a reset reports 0%.
//! - Frequency reads are cached briefly since sysfs reads are comparatively
//!   expensive and the control loop may ask several times per tick.
//! - A failed read returns the previous good value marked stale; after
//!   `stale_limit` consecutive stale reads on a core the caller gets
//!   `MetricsUnavailable`.

use crate::config::MetricsSettings;
use crate::error::{Error, HardwareError, Result};
use crate::hardware::{CpuTimes, FanReading, MetricsSource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;

/// One sample for one core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreMetrics {
    pub core_id: usize,
    pub load_pct: f32,
    pub frequency_mhz: u32,
    pub temperature_c: f32,
    pub timestamp: DateTime<Utc>,
    /// Previous good values re-used after a failed read
    pub stale: bool,
}

impl CoreMetrics {
    fn empty(core_id: usize) -> Self {
        Self {
            core_id,
            load_pct: 0.0,
            frequency_mhz: 0,
            temperature_c: 0.0,
            timestamp: Utc::now(),
            stale: false,
        }
    }
}

#[derive(Debug, Default)]
struct CoreTrack {
    baseline: Option<CpuTimes>,
    last_good: Option<CoreMetrics>,
    consecutive_stale: u32,
    frequency_cache: Option<(Instant, u32)>,
}

/// Load percentage between two counter snapshots
///
/// Zero elapsed ticks or a counter that went backwards report 0%.
pub fn load_between(previous: CpuTimes, current: CpuTimes) -> f32 {
    let (Some(busy), Some(total)) = (
        current.busy.checked_sub(previous.busy),
        current.total().checked_sub(previous.total()),
    ) else {
        return 0.0;
    };
    if total == 0 {
        return 0.0;
    }
    (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0) as f32
}

pub struct MetricsSampler {
    source: Arc<dyn MetricsSource>,
    frequency_ttl: Duration,
    stale_limit: u32,
    cores: Mutex<Vec<CoreTrack>>,
}

impl MetricsSampler {
    pub fn new(source: Arc<dyn MetricsSource>, core_count: usize, settings: &MetricsSettings) -> Self {
        Self {
            source,
            frequency_ttl: Duration::from_millis(settings.frequency_cache_ms),
            stale_limit: settings.stale_limit.max(1),
            cores: Mutex::new((0..core_count).map(|_| CoreTrack::default()).collect()),
        }
    }

    fn cores(&self) -> MutexGuard<'_, Vec<CoreTrack>> {
        self.cores.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Sample one core
    pub fn sample(&self, core_id: usize) -> Result<CoreMetrics> {
        let mut cores = self.cores();
        let track = cores
            .get_mut(core_id)
            .ok_or_else(|| Error::NotFound(format!("core {}", core_id)))?;

        match self.read(core_id, track) {
            Ok(metrics) => {
                track.consecutive_stale = 0;
                track.last_good = Some(metrics.clone());
                Ok(metrics)
            }
            Err(e) => {
                track.consecutive_stale += 1;
                warn!(
                    "Metrics read failed on core {} ({} consecutive): {}",
                    core_id, track.consecutive_stale, e
                );
                if track.consecutive_stale >= self.stale_limit {
                    return Err(Error::MetricsUnavailable { core_id });
                }
                let mut stale = track
                    .last_good
                    .clone()
                    .unwrap_or_else(|| CoreMetrics::empty(core_id));
                stale.stale = true;
                stale.timestamp = Utc::now();
                Ok(stale)
            }
        }
    }

    fn read(&self, core_id: usize, track: &mut CoreTrack) -> std::result::Result<CoreMetrics, HardwareError> {
        let times = self.source.cpu_times(core_id)?;
        let frequency_mhz = self.frequency(core_id, track)?;
        let temperature_c = self.source.temperature_c()?;

        let load_pct = match track.baseline {
            Some(previous) => load_between(previous, times),
            None => 0.0,
        };
        track.baseline = Some(times);

        Ok(CoreMetrics {
            core_id,
            load_pct,
            frequency_mhz,
            temperature_c,
            timestamp: Utc::now(),
            stale: false,
        })
    }

    fn frequency(&self, core_id: usize, track: &mut CoreTrack) -> std::result::Result<u32, HardwareError> {
        let now = Instant::now();
        if let Some((read_at, mhz)) = track.frequency_cache {
            if now.duration_since(read_at) < self.frequency_ttl {
                return Ok(mhz);
            }
        }
        let mhz = self.source.frequency_mhz(core_id)?;
        track.frequency_cache = Some((now, mhz));
        Ok(mhz)
    }

    /// Current package temperature, uncached
    pub fn temperature(&self) -> std::result::Result<f32, HardwareError> {
        self.source.temperature_c()
    }

    pub fn fan(&self) -> Option<FanReading> {
        self.source.fan()
    }

    /// Forget counter baselines and staleness, e.g. on controller restart
    pub fn reset(&self) {
        for track in self.cores().iter_mut() {
            *track = CoreTrack::default();
        }
    }

    pub fn core_count(&self) -> usize {
        self.cores().len()
    }
}
