//! Voltage curve model
//!
//! **Purpose:** Pure mapping from CPU load or CPU frequency to a voltage
//! offset. Nothing in this module touches hardware or panics; every input,
//! including NaN and out-of-range values, yields an offset.
//!
//! Rounding: interpolated values are rounded to the nearest millivolt with
//! ties going toward positive infinity, i.e. toward the less aggressive
//! offset.

use crate::calibration::wizard::WizardConfig;
use crate::limits::PlatformLimits;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Number of points returned for curve visualization (load 0..=100)
pub const CURVE_POINTS: usize = 101;

/// Most aggressive offset a frequency curve may carry
pub const FREQUENCY_CURVE_FLOOR_MV: i32 = -100;

/// Load curve parameters for one core
///
/// `min_mv` is applied at or below `threshold_pct` load; the offset then
/// ramps linearly to `max_mv` at 100% load.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub core_id: usize,
    pub min_mv: i32,
    pub max_mv: i32,
    pub threshold_pct: f32,
}

impl CoreConfig {
    pub fn new(core_id: usize, min_mv: i32, max_mv: i32, threshold_pct: f32) -> Self {
        Self {
            core_id,
            min_mv,
            max_mv,
            threshold_pct,
        }
    }

    /// Offset for `load_pct` under the plain threshold curve
    pub fn voltage_at(&self, load_pct: f32) -> i32 {
        load_voltage(self.min_mv, self.max_mv, self.threshold_pct, load_pct)
    }
}

/// How cores share configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Every core follows core 0's config
    #[default]
    Simple,
    /// Independent per-core configs
    Expert,
}

/// Which input drives the controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CurveSource {
    #[default]
    Load,
    Frequency,
}

/// Control strategy
///
/// Presets override each core's threshold and limit how fast the applied
/// offset may travel across the core's `min_mv..max_mv` span. `Manual`
/// uses the core's own threshold and applies targets directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Strategy {
    Conservative,
    Balanced,
    Aggressive,
    #[default]
    Manual,
}

impl Strategy {
    /// Threshold used for `core` under this strategy
    pub fn threshold_for(&self, core: &CoreConfig) -> f32 {
        match self {
            Strategy::Conservative => 20.0,
            Strategy::Balanced => 50.0,
            Strategy::Aggressive => 80.0,
            Strategy::Manual => core.threshold_pct,
        }
    }

    /// Time to sweep the full span, `None` when unlimited
    pub fn ramp_time(&self) -> Option<Duration> {
        match self {
            Strategy::Conservative => Some(Duration::from_millis(5000)),
            Strategy::Balanced => Some(Duration::from_millis(2000)),
            Strategy::Aggressive => Some(Duration::from_millis(500)),
            Strategy::Manual => None,
        }
    }

    /// Target offset for `core` at `load_pct`
    pub fn target(&self, core: &CoreConfig, load_pct: f32) -> i32 {
        load_voltage(core.min_mv, core.max_mv, self.threshold_for(core), load_pct)
    }

    /// Move from `current` toward `target`, bounded by the ramp rate
    ///
    /// With a ramp time the offset may move by at most
    /// `span * elapsed / ramp_time` (at least 1 mV per step).
    pub fn ramp(&self, core: &CoreConfig, current: i32, target: i32, elapsed: Duration) -> i32 {
        let Some(ramp_time) = self.ramp_time() else {
            return target;
        };
        let span = (core.max_mv - core.min_mv).unsigned_abs() as u128;
        if span == 0 || ramp_time.is_zero() {
            return target;
        }
        let max_step = (span * elapsed.as_millis()).div_ceil(ramp_time.as_millis()).max(1);
        let max_step = i32::try_from(max_step).unwrap_or(i32::MAX);

        let delta = target - current;
        if delta.abs() <= max_step {
            target
        } else {
            current + delta.signum() * max_step
        }
    }
}

/// Active dynamic-control configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicConfig {
    pub mode: Mode,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub source: CurveSource,
    pub cores: Vec<CoreConfig>,
    /// Load hysteresis band in percentage points
    #[serde(default = "default_hysteresis_pct")]
    pub hysteresis_pct: f32,
    /// Frequency hysteresis band in MHz
    #[serde(default = "default_hysteresis_mhz")]
    pub hysteresis_mhz: u32,
    pub version: u32,
}

fn default_hysteresis_pct() -> f32 {
    5.0
}

fn default_hysteresis_mhz() -> u32 {
    100
}

impl DynamicConfig {
    /// Safe defaults for a platform: -30/-15 mV at 50%, tightened to the platform floor
    pub fn defaults_for(limits: &PlatformLimits) -> Self {
        let min_mv = (-30).max(limits.min_voltage_mv);
        let max_mv = (-15).max(limits.min_voltage_mv);
        Self {
            mode: Mode::Simple,
            strategy: Strategy::Manual,
            source: CurveSource::Load,
            cores: (0..limits.core_count)
                .map(|id| CoreConfig::new(id, min_mv, max_mv, 50.0))
                .collect(),
            hysteresis_pct: default_hysteresis_pct(),
            hysteresis_mhz: default_hysteresis_mhz(),
            version: 1,
        }
    }

    /// All cores at 0 mV
    pub fn zeroed(core_count: usize) -> Self {
        Self {
            mode: Mode::Expert,
            strategy: Strategy::Manual,
            source: CurveSource::Load,
            cores: (0..core_count)
                .map(|id| CoreConfig::new(id, 0, 0, 50.0))
                .collect(),
            hysteresis_pct: default_hysteresis_pct(),
            hysteresis_mhz: default_hysteresis_mhz(),
            version: 1,
        }
    }

    /// Config in force for `core_id` at apply time
    ///
    /// Simple mode hands every core a copy of core 0's parameters.
    pub fn effective_core(&self, core_id: usize) -> Option<CoreConfig> {
        let source = match self.mode {
            Mode::Simple => self.cores.first(),
            Mode::Expert => self.cores.iter().find(|c| c.core_id == core_id),
        }?;
        Some(CoreConfig { core_id, ..*source })
    }

    /// Replace (or add) one core's config and bump the version
    pub fn set_core(&mut self, core: CoreConfig) {
        match self.cores.iter_mut().find(|c| c.core_id == core.core_id) {
            Some(slot) => *slot = core,
            None => {
                self.cores.push(core);
                self.cores.sort_by_key(|c| c.core_id);
            }
        }
        self.version = self.version.wrapping_add(1);
    }

    /// Shift every core's offsets toward 0 by `delta_mv`, never above 0
    pub fn relaxed_by(&self, delta_mv: i32) -> Self {
        let mut relaxed = self.clone();
        for core in relaxed.cores.iter_mut() {
            core.min_mv = (core.min_mv + delta_mv).min(0);
            core.max_mv = (core.max_mv + delta_mv).min(0);
        }
        relaxed.version = relaxed.version.wrapping_add(1);
        relaxed
    }

    /// Most aggressive offset per core, used when recording crashes
    pub fn floor_offsets(&self) -> Vec<i32> {
        self.cores.iter().map(|c| c.min_mv).collect()
    }
}

/// Point on a load curve, for visualization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub load_pct: u8,
    pub voltage_mv: i32,
}

/// Sample the effective load curve of `core_id` at every whole percent
pub fn curve_points(config: &DynamicConfig, core_id: usize) -> Option<Vec<CurvePoint>> {
    let core = config.effective_core(core_id)?;
    Some(
        (0..CURVE_POINTS as u8)
            .map(|load| CurvePoint {
                load_pct: load,
                voltage_mv: config.strategy.target(&core, load as f32),
            })
            .collect(),
    )
}

/// Integer division rounding to nearest, ties toward +infinity
///
/// `den` must be positive.
pub fn round_half_up_div(num: i64, den: i64) -> i64 {
    (2 * num + den).div_euclid(2 * den)
}

/// Threshold load curve
///
/// Returns `min_mv` for `load <= threshold`, then interpolates linearly to
/// `max_mv` at 100%. NaN load is treated as 0 and a non-finite threshold
/// as 0; both inputs are clamped to `[0, 100]`.
pub fn load_voltage(min_mv: i32, max_mv: i32, threshold_pct: f32, load_pct: f32) -> i32 {
    let load = if load_pct.is_nan() {
        0.0
    } else {
        load_pct.clamp(0.0, 100.0) as f64
    };
    let threshold = if threshold_pct.is_finite() {
        threshold_pct.clamp(0.0, 100.0) as f64
    } else {
        0.0
    };

    if load <= threshold || threshold >= 100.0 {
        return min_mv;
    }

    let fraction = (load - threshold) / (100.0 - threshold);
    let exact = min_mv as f64 + (max_mv - min_mv) as f64 * fraction;
    let rounded = (exact + 0.5).floor() as i32;

    let (lo, hi) = if min_mv <= max_mv {
        (min_mv, max_mv)
    } else {
        (max_mv, min_mv)
    };
    rounded.clamp(lo, hi)
}

/// Curve construction failures
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CurveError {
    #[error("duplicate frequency {0} MHz")]
    DuplicateFrequency(u32),

    #[error("voltage {voltage_mv} mV at {frequency_mhz} MHz outside [-100, 0]")]
    VoltageOutOfRange { frequency_mhz: u32, voltage_mv: i32 },
}

/// One calibrated operating point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyPoint {
    pub frequency_mhz: u32,
    pub voltage_mv: i32,
    pub stable: bool,
    pub test_duration_secs: u64,
    pub timestamp: DateTime<Utc>,
    /// Result of the post-run verification pass, if this point was sampled
    #[serde(default)]
    pub verified: Option<bool>,
}

impl FrequencyPoint {
    pub fn new(frequency_mhz: u32, voltage_mv: i32, stable: bool) -> Self {
        Self {
            frequency_mhz,
            voltage_mv,
            stable,
            test_duration_secs: 0,
            timestamp: Utc::now(),
            verified: None,
        }
    }
}

#[derive(Deserialize)]
struct RawFrequencyCurve {
    core_id: usize,
    points: Vec<FrequencyPoint>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    wizard_config: Option<WizardConfig>,
}

impl TryFrom<RawFrequencyCurve> for FrequencyCurve {
    type Error = CurveError;

    fn try_from(raw: RawFrequencyCurve) -> Result<Self, Self::Error> {
        let mut curve = FrequencyCurve::new(raw.core_id, raw.points, raw.wizard_config)?;
        curve.created_at = raw.created_at;
        Ok(curve)
    }
}

/// Frequency → voltage curve for one core
///
/// Points are kept sorted by frequency with no duplicates; malformed input
/// is rejected here so evaluation never has to check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawFrequencyCurve")]
pub struct FrequencyCurve {
    core_id: usize,
    points: Vec<FrequencyPoint>,
    created_at: DateTime<Utc>,
    wizard_config: Option<WizardConfig>,
}

impl FrequencyCurve {
    pub fn new(
        core_id: usize,
        mut points: Vec<FrequencyPoint>,
        wizard_config: Option<WizardConfig>,
    ) -> Result<Self, CurveError> {
        for point in &points {
            check_point_voltage(point)?;
        }
        points.sort_by_key(|p| p.frequency_mhz);
        if let Some(pair) = points
            .windows(2)
            .find(|w| w[0].frequency_mhz == w[1].frequency_mhz)
        {
            return Err(CurveError::DuplicateFrequency(pair[0].frequency_mhz));
        }
        Ok(Self {
            core_id,
            points,
            created_at: Utc::now(),
            wizard_config,
        })
    }

    pub fn empty(core_id: usize, wizard_config: Option<WizardConfig>) -> Self {
        Self {
            core_id,
            points: Vec::new(),
            created_at: Utc::now(),
            wizard_config,
        }
    }

    pub fn core_id(&self) -> usize {
        self.core_id
    }

    pub fn points(&self) -> &[FrequencyPoint] {
        &self.points
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn wizard_config(&self) -> Option<&WizardConfig> {
        self.wizard_config.as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn point_at(&self, frequency_mhz: u32) -> Option<&FrequencyPoint> {
        self.points
            .binary_search_by_key(&frequency_mhz, |p| p.frequency_mhz)
            .ok()
            .map(|idx| &self.points[idx])
    }

    /// Insert a point, replacing any existing point at the same frequency
    pub fn upsert(&mut self, point: FrequencyPoint) -> Result<(), CurveError> {
        check_point_voltage(&point)?;
        match self
            .points
            .binary_search_by_key(&point.frequency_mhz, |p| p.frequency_mhz)
        {
            Ok(idx) => self.points[idx] = point,
            Err(idx) => self.points.insert(idx, point),
        }
        Ok(())
    }

    /// Record a verification verdict against an existing point
    pub fn mark_verified(&mut self, frequency_mhz: u32, passed: bool) -> bool {
        match self
            .points
            .binary_search_by_key(&frequency_mhz, |p| p.frequency_mhz)
        {
            Ok(idx) => {
                self.points[idx].verified = Some(passed);
                true
            }
            Err(_) => false,
        }
    }

    /// Offset for `frequency_mhz`
    ///
    /// Below the first point returns the first voltage, above the last
    /// returns the last voltage, otherwise interpolates between the
    /// bracketing points. An empty curve yields 0 mV.
    pub fn voltage_at(&self, frequency_mhz: u32) -> i32 {
        let (first, last) = match (self.points.first(), self.points.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return 0,
        };
        if frequency_mhz <= first.frequency_mhz {
            return first.voltage_mv;
        }
        if frequency_mhz >= last.frequency_mhz {
            return last.voltage_mv;
        }

        let upper = self
            .points
            .partition_point(|p| p.frequency_mhz < frequency_mhz);
        let hi = &self.points[upper];
        if hi.frequency_mhz == frequency_mhz {
            return hi.voltage_mv;
        }
        let lo = &self.points[upper - 1];

        let span = (hi.frequency_mhz - lo.frequency_mhz) as i64;
        let offset = (frequency_mhz - lo.frequency_mhz) as i64;
        let num = lo.voltage_mv as i64 * span + (hi.voltage_mv - lo.voltage_mv) as i64 * offset;
        round_half_up_div(num, span) as i32
    }

    pub fn stable_points(&self) -> impl Iterator<Item = &FrequencyPoint> {
        self.points.iter().filter(|p| p.stable)
    }
}

fn check_point_voltage(point: &FrequencyPoint) -> Result<(), CurveError> {
    if point.voltage_mv < FREQUENCY_CURVE_FLOOR_MV || point.voltage_mv > 0 {
        return Err(CurveError::VoltageOutOfRange {
            frequency_mhz: point.frequency_mhz,
            voltage_mv: point.voltage_mv,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn curve(points: &[(u32, i32)]) -> FrequencyCurve {
        FrequencyCurve::new(
            0,
            points
                .iter()
                .map(|&(f, v)| FrequencyPoint::new(f, v, true))
                .collect(),
            None,
        )
        .unwrap()
    }

    #[test]
    fn test_load_curve_reference_values() {
        let core = CoreConfig::new(0, -30, -15, 50.0);
        assert_eq!(core.voltage_at(0.0), -30);
        assert_eq!(core.voltage_at(50.0), -30);
        assert_eq!(core.voltage_at(75.0), -22);
        assert_eq!(core.voltage_at(100.0), -15);
    }

    #[test]
    fn test_load_curve_is_continuous_at_threshold() {
        let core = CoreConfig::new(0, -40, -10, 30.0);
        assert_eq!(core.voltage_at(30.0), -40);
        assert_eq!(core.voltage_at(30.01), -40);
        let step = (core.voltage_at(31.0) - core.voltage_at(30.0)).abs();
        assert!(step <= 1, "jump of {} mV at threshold", step);
    }

    #[test]
    fn test_load_curve_monotone_and_bounded() {
        let core = CoreConfig::new(0, -35, -5, 40.0);
        let mut previous = core.voltage_at(0.0);
        for load in 0..=100 {
            let v = core.voltage_at(load as f32);
            assert!(v >= -35 && v <= -5);
            assert!(v >= previous);
            previous = v;
        }
    }

    #[test]
    fn test_load_curve_handles_bad_inputs() {
        let core = CoreConfig::new(0, -30, -15, 50.0);
        assert_eq!(core.voltage_at(f32::NAN), -30);
        assert_eq!(core.voltage_at(-20.0), -30);
        assert_eq!(core.voltage_at(250.0), -15);

        // Threshold at 100 never leaves min
        assert_eq!(load_voltage(-30, -15, 100.0, 100.0), -30);
        // Non-finite threshold ramps over the whole range
        assert_eq!(load_voltage(-30, -10, f32::NAN, 50.0), -20);
    }

    #[test]
    fn test_round_half_up_div_ties_toward_positive() {
        assert_eq!(round_half_up_div(-45, 2), -22);
        assert_eq!(round_half_up_div(45, 2), 23);
        assert_eq!(round_half_up_div(-7, 3), -2);
        assert_eq!(round_half_up_div(-8, 3), -3);
        assert_eq!(round_half_up_div(10, 5), 2);
    }

    #[test]
    fn test_frequency_curve_midpoint_and_extremes() {
        let c = curve(&[(1000, -20), (2000, -35)]);
        assert_eq!(c.voltage_at(1500), round_half_up_div(-55, 2) as i32);
        assert_eq!(c.voltage_at(1500), -27);
        assert_eq!(c.voltage_at(400), -20);
        assert_eq!(c.voltage_at(1000), -20);
        assert_eq!(c.voltage_at(2000), -35);
        assert_eq!(c.voltage_at(3500), -35);
    }

    #[test]
    fn test_frequency_curve_interpolates_between_bracketing_points() {
        let c = curve(&[(2000, -10), (1000, -30), (1500, -20)]);
        let freqs: Vec<u32> = c.points().iter().map(|p| p.frequency_mhz).collect();
        assert_eq!(freqs, vec![1000, 1500, 2000]);
        assert_eq!(c.voltage_at(1250), -25);
        assert_eq!(c.voltage_at(1750), -15);
        assert_eq!(c.voltage_at(1500), -20);
    }

    #[test]
    fn test_frequency_curve_rejects_malformed_points() {
        let dup = FrequencyCurve::new(
            0,
            vec![FrequencyPoint::new(1000, -10, true), FrequencyPoint::new(1000, -12, true)],
            None,
        );
        assert_eq!(dup.unwrap_err(), CurveError::DuplicateFrequency(1000));

        let low = FrequencyCurve::new(0, vec![FrequencyPoint::new(1000, -120, true)], None);
        assert!(matches!(low, Err(CurveError::VoltageOutOfRange { .. })));
    }

    #[test]
    fn test_frequency_curve_deserialize_validates() {
        let json = serde_json::json!({
            "core_id": 0,
            "created_at": "2025-01-01T00:00:00Z",
            "points": [
                {"frequency_mhz": 1000, "voltage_mv": 5, "stable": true,
                 "test_duration_secs": 30, "timestamp": "2025-01-01T00:00:00Z"}
            ]
        });
        assert!(serde_json::from_value::<FrequencyCurve>(json).is_err());
    }

    #[test]
    fn test_upsert_keeps_order_and_replaces() {
        let mut c = FrequencyCurve::empty(1, None);
        assert_eq!(c.voltage_at(1200), 0);
        c.upsert(FrequencyPoint::new(1600, -25, true)).unwrap();
        c.upsert(FrequencyPoint::new(800, -15, true)).unwrap();
        c.upsert(FrequencyPoint::new(1600, -22, true)).unwrap();
        assert_eq!(c.points().len(), 2);
        assert_eq!(c.points()[0].frequency_mhz, 800);
        assert_eq!(c.point_at(1600).map(|p| p.voltage_mv), Some(-22));
        assert!(c.mark_verified(800, false));
        assert_eq!(c.point_at(800).and_then(|p| p.verified), Some(false));
    }

    #[test]
    fn test_simple_mode_uses_core_zero() {
        let limits = PlatformLimits::for_model(crate::limits::PlatformModel::Lcd, false);
        let mut config = DynamicConfig::defaults_for(&limits);
        config.set_core(CoreConfig::new(0, -20, -10, 60.0));
        config.set_core(CoreConfig::new(2, -5, 0, 10.0));

        let effective = config.effective_core(2).unwrap();
        assert_eq!((effective.core_id, effective.min_mv, effective.threshold_pct), (2, -20, 60.0));

        config.mode = Mode::Expert;
        assert_eq!(config.effective_core(2).unwrap().min_mv, -5);
    }

    #[test]
    fn test_relaxed_by_clamps_at_zero() {
        let mut config = DynamicConfig::zeroed(2);
        config.cores[0] = CoreConfig::new(0, -30, -3, 50.0);
        config.cores[1] = CoreConfig::new(1, -12, -8, 50.0);
        let relaxed = config.relaxed_by(5);
        assert_eq!((relaxed.cores[0].min_mv, relaxed.cores[0].max_mv), (-25, 0));
        assert_eq!((relaxed.cores[1].min_mv, relaxed.cores[1].max_mv), (-7, -3));
    }

    #[test]
    fn test_curve_points_has_101_entries() {
        let limits = PlatformLimits::for_model(crate::limits::PlatformModel::Lcd, false);
        let config = DynamicConfig::defaults_for(&limits);
        let points = curve_points(&config, 0).unwrap();
        assert_eq!(points.len(), CURVE_POINTS);
        assert_eq!(points[75].voltage_mv, -22);
        assert!(curve_points(&DynamicConfig { cores: vec![], ..config }, 0).is_none());
    }

    #[test]
    fn test_strategy_presets_override_threshold() {
        let core = CoreConfig::new(0, -30, -10, 50.0);
        assert_eq!(Strategy::Manual.target(&core, 60.0), core.voltage_at(60.0));
        // Conservative leaves the floor early
        assert!(Strategy::Conservative.target(&core, 40.0) > -30);
        // Aggressive holds the floor longer
        assert_eq!(Strategy::Aggressive.target(&core, 75.0), -30);
    }

    #[test]
    fn test_strategy_ramp_limits_step() {
        let core = CoreConfig::new(0, -30, -10, 50.0);
        // Balanced: 20 mV span over 2000 ms -> 5 mV per 500 ms
        let next = Strategy::Balanced.ramp(&core, -30, -10, Duration::from_millis(500));
        assert_eq!(next, -25);
        let next = Strategy::Balanced.ramp(&core, -12, -10, Duration::from_millis(500));
        assert_eq!(next, -10);
        assert_eq!(Strategy::Manual.ramp(&core, -30, -10, Duration::from_millis(1)), -10);
    }
}
