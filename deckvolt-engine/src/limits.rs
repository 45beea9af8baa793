//! Platform limits and configuration validation
//!
//! **Purpose:** Bounds-check and clamp voltage configuration against the
//! hardware's safe range before anything reaches a core.
//!
//! Limits are resolved once at startup from the detected model and passed
//! explicitly into every validation call. Flipping expert mode produces a
//! new `PlatformLimits` value; nothing reads a global flag.

use crate::curve::{CoreConfig, DynamicConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// Floor when expert mode is enabled
pub const EXPERT_MIN_VOLTAGE_MV: i32 = -100;

/// Allowed load hysteresis band, in percentage points
pub const HYSTERESIS_RANGE_PCT: (f32, f32) = (1.0, 20.0);

/// Default number of cores on supported handhelds
pub const DEFAULT_CORE_COUNT: usize = 4;

/// Detected hardware model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlatformModel {
    /// LCD handheld, DMI product name "Jupiter"
    Lcd,
    /// OLED handheld, DMI product name "Galileo"
    Oled,
    Unknown,
}

impl PlatformModel {
    /// Map a DMI product name to a model
    pub fn from_product_name(name: &str) -> Self {
        match name.trim() {
            "Jupiter" => PlatformModel::Lcd,
            "Galileo" => PlatformModel::Oled,
            _ => PlatformModel::Unknown,
        }
    }

    /// Most aggressive offset considered safe without expert mode
    pub fn safe_limit_mv(&self) -> i32 {
        match self {
            PlatformModel::Lcd => -30,
            PlatformModel::Oled => -35,
            PlatformModel::Unknown => -25,
        }
    }
}

/// Hardware voltage bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformLimits {
    pub min_voltage_mv: i32,
    pub max_voltage_mv: i32,
    pub core_count: usize,
    pub model: PlatformModel,
    pub expert: bool,
}

impl PlatformLimits {
    pub fn for_model(model: PlatformModel, expert: bool) -> Self {
        Self {
            min_voltage_mv: if expert {
                EXPERT_MIN_VOLTAGE_MV
            } else {
                model.safe_limit_mv()
            },
            max_voltage_mv: 0,
            core_count: DEFAULT_CORE_COUNT,
            model,
            expert,
        }
    }

    pub fn with_core_count(mut self, core_count: usize) -> Self {
        self.core_count = core_count.max(1);
        self
    }

    /// Same model and core count with the expert toggle changed
    pub fn with_expert(&self, expert: bool) -> Self {
        Self::for_model(self.model, expert).with_core_count(self.core_count)
    }
}

/// Rule a configuration violated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationKind {
    MinGreaterThanMax,
    BelowPlatformMin,
    AboveZero,
    InvalidThreshold,
    InvalidCoreId,
    InvalidHysteresis,
    /// Calibration parameter outside its allowed range
    OutOfRange,
}

impl ValidationKind {
    fn describe(&self) -> &'static str {
        match self {
            ValidationKind::MinGreaterThanMax => "min above max",
            ValidationKind::BelowPlatformMin => "below platform minimum",
            ValidationKind::AboveZero => "above 0 mV",
            ValidationKind::InvalidThreshold => "threshold outside [0, 100]",
            ValidationKind::InvalidCoreId => "invalid core id",
            ValidationKind::InvalidHysteresis => "hysteresis outside [1, 20]",
            ValidationKind::OutOfRange => "outside allowed range",
        }
    }
}

/// One violated rule, with the measured value and the limit it broke
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationError {
    pub kind: ValidationKind,
    pub core_id: usize,
    pub field: String,
    pub value: f64,
    pub limit: f64,
}

impl ValidationError {
    pub fn new(kind: ValidationKind, core_id: usize, field: &str, value: f64, limit: f64) -> Self {
        Self {
            kind,
            core_id,
            field: field.to_string(),
            value,
            limit,
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "core {} {}={}: {} (limit {})",
            self.core_id,
            self.field,
            self.value,
            self.kind.describe(),
            self.limit
        )
    }
}

/// Outcome of a validation pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
}

impl ValidationResult {
    fn from_errors(errors: Vec<ValidationError>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }

    /// Convert to the engine error type, `Ok` when valid
    pub fn into_result(self) -> crate::Result<()> {
        if self.valid {
            Ok(())
        } else {
            Err(crate::Error::Validation(self.errors))
        }
    }
}

/// A field `clamp` had to change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClampedField {
    pub core_id: usize,
    pub field: String,
    pub from: f64,
    pub to: f64,
}

/// Check one core config; every rule is evaluated so all violations are reported
pub fn validate(config: &CoreConfig, limits: &PlatformLimits) -> ValidationResult {
    ValidationResult::from_errors(core_errors(config, limits))
}

fn core_errors(config: &CoreConfig, limits: &PlatformLimits) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let id = config.core_id;

    if config.core_id >= limits.core_count {
        errors.push(ValidationError::new(
            ValidationKind::InvalidCoreId,
            id,
            "core_id",
            id as f64,
            limits.core_count.saturating_sub(1) as f64,
        ));
    }

    if config.min_mv > config.max_mv {
        errors.push(ValidationError::new(
            ValidationKind::MinGreaterThanMax,
            id,
            "min_mv",
            config.min_mv as f64,
            config.max_mv as f64,
        ));
    }

    for (field, value) in [("min_mv", config.min_mv), ("max_mv", config.max_mv)] {
        if value < limits.min_voltage_mv {
            errors.push(ValidationError::new(
                ValidationKind::BelowPlatformMin,
                id,
                field,
                value as f64,
                limits.min_voltage_mv as f64,
            ));
        }
        if value > limits.max_voltage_mv {
            errors.push(ValidationError::new(
                ValidationKind::AboveZero,
                id,
                field,
                value as f64,
                limits.max_voltage_mv as f64,
            ));
        }
    }

    let threshold = config.threshold_pct;
    if !(0.0..=100.0).contains(&threshold) {
        // NaN fails the range check too
        errors.push(ValidationError::new(
            ValidationKind::InvalidThreshold,
            id,
            "threshold_pct",
            threshold as f64,
            if threshold < 0.0 { 0.0 } else { 100.0 },
        ));
    }

    errors
}

/// Check a whole dynamic config: every core, duplicate ids and the hysteresis band
pub fn validate_dynamic(config: &DynamicConfig, limits: &PlatformLimits) -> ValidationResult {
    let mut errors = Vec::new();

    if config.cores.is_empty() {
        errors.push(ValidationError::new(
            ValidationKind::InvalidCoreId,
            0,
            "cores",
            0.0,
            limits.core_count as f64,
        ));
    }

    let mut seen = HashSet::new();
    for core in &config.cores {
        if !seen.insert(core.core_id) {
            errors.push(ValidationError::new(
                ValidationKind::InvalidCoreId,
                core.core_id,
                "core_id",
                core.core_id as f64,
                core.core_id as f64,
            ));
        }
        errors.extend(core_errors(core, limits));
    }

    let (lo, hi) = HYSTERESIS_RANGE_PCT;
    if !(lo..=hi).contains(&config.hysteresis_pct) {
        errors.push(ValidationError::new(
            ValidationKind::InvalidHysteresis,
            0,
            "hysteresis_pct",
            config.hysteresis_pct as f64,
            if config.hysteresis_pct < lo { lo as f64 } else { hi as f64 },
        ));
    }

    ValidationResult::from_errors(errors)
}

/// Coerce out-of-range fields so the result validates
///
/// Returns the clamped config and every field that changed.
pub fn clamp(config: &CoreConfig, limits: &PlatformLimits) -> (CoreConfig, Vec<ClampedField>) {
    let mut out = *config;
    let mut changed = Vec::new();
    let mut note = |field: &str, from: f64, to: f64| {
        changed.push(ClampedField {
            core_id: config.core_id,
            field: field.to_string(),
            from,
            to,
        });
    };

    let max_id = limits.core_count.saturating_sub(1);
    if out.core_id > max_id {
        note("core_id", out.core_id as f64, max_id as f64);
        out.core_id = max_id;
    }

    let lo = limits.min_voltage_mv;
    let hi = limits.max_voltage_mv;
    let min_mv = out.min_mv.clamp(lo, hi);
    if min_mv != out.min_mv {
        note("min_mv", out.min_mv as f64, min_mv as f64);
        out.min_mv = min_mv;
    }
    let max_mv = out.max_mv.clamp(lo, hi);
    if max_mv != out.max_mv {
        note("max_mv", out.max_mv as f64, max_mv as f64);
        out.max_mv = max_mv;
    }
    if out.min_mv > out.max_mv {
        note("min_mv", out.min_mv as f64, out.max_mv as f64);
        note("max_mv", out.max_mv as f64, out.min_mv as f64);
        std::mem::swap(&mut out.min_mv, &mut out.max_mv);
    }

    let threshold = if out.threshold_pct.is_nan() {
        50.0
    } else {
        out.threshold_pct.clamp(0.0, 100.0)
    };
    if threshold.to_bits() != out.threshold_pct.to_bits() {
        note("threshold_pct", out.threshold_pct as f64, threshold as f64);
        out.threshold_pct = threshold;
    }

    (out, changed)
}

/// Clamp every core of a dynamic config
///
/// Cores whose id collides after clamping are dropped (first one wins).
pub fn clamp_dynamic(
    config: &DynamicConfig,
    limits: &PlatformLimits,
) -> (DynamicConfig, Vec<ClampedField>) {
    let mut out = config.clone();
    let mut changed = Vec::new();
    let mut seen = HashSet::new();
    out.cores.clear();

    for core in &config.cores {
        let (clamped, fields) = clamp(core, limits);
        changed.extend(fields);
        if seen.insert(clamped.core_id) {
            out.cores.push(clamped);
        } else {
            changed.push(ClampedField {
                core_id: core.core_id,
                field: "duplicate_core".to_string(),
                from: core.core_id as f64,
                to: clamped.core_id as f64,
            });
        }
    }
    if out.cores.is_empty() {
        out.cores.push(CoreConfig::new(0, 0, 0, 50.0));
        changed.push(ClampedField {
            core_id: 0,
            field: "cores".to_string(),
            from: 0.0,
            to: 1.0,
        });
    }
    out.cores.sort_by_key(|c| c.core_id);

    let (lo, hi) = HYSTERESIS_RANGE_PCT;
    let band = if config.hysteresis_pct.is_nan() {
        5.0
    } else {
        config.hysteresis_pct.clamp(lo, hi)
    };
    if band.to_bits() != config.hysteresis_pct.to_bits() {
        changed.push(ClampedField {
            core_id: 0,
            field: "hysteresis_pct".to_string(),
            from: config.hysteresis_pct as f64,
            to: band as f64,
        });
        out.hysteresis_pct = band;
    }

    (out, changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lcd() -> PlatformLimits {
        PlatformLimits::for_model(PlatformModel::Lcd, false)
    }

    #[test]
    fn test_model_detection() {
        assert_eq!(PlatformModel::from_product_name("Jupiter\n"), PlatformModel::Lcd);
        assert_eq!(PlatformModel::from_product_name("Galileo"), PlatformModel::Oled);
        assert_eq!(PlatformModel::from_product_name("ROG Ally"), PlatformModel::Unknown);
        assert_eq!(lcd().min_voltage_mv, -30);
        assert_eq!(PlatformLimits::for_model(PlatformModel::Oled, false).min_voltage_mv, -35);
        assert_eq!(PlatformLimits::for_model(PlatformModel::Unknown, false).min_voltage_mv, -25);
    }

    #[test]
    fn test_expert_mode_widens_floor() {
        let limits = lcd().with_core_count(8);
        let expert = limits.with_expert(true);
        assert_eq!(expert.min_voltage_mv, EXPERT_MIN_VOLTAGE_MV);
        assert_eq!(expert.core_count, 8);
        assert_eq!(expert.with_expert(false), limits);
    }

    #[test]
    fn test_valid_config_passes() {
        let result = validate(&CoreConfig::new(0, -30, -15, 50.0), &lcd());
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[test]
    fn test_all_violations_reported_together() {
        let config = CoreConfig::new(9, -10, -40, 150.0);
        let result = validate(&config, &lcd());
        assert!(!result.valid);

        let kinds: Vec<ValidationKind> = result.errors.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&ValidationKind::InvalidCoreId));
        assert!(kinds.contains(&ValidationKind::MinGreaterThanMax));
        assert!(kinds.contains(&ValidationKind::BelowPlatformMin));
        assert!(kinds.contains(&ValidationKind::InvalidThreshold));

        let below = result
            .errors
            .iter()
            .find(|e| e.kind == ValidationKind::BelowPlatformMin)
            .unwrap();
        assert_eq!(below.field, "max_mv");
        assert_eq!(below.value, -40.0);
        assert_eq!(below.limit, -30.0);
    }

    #[test]
    fn test_nan_threshold_and_positive_offset_rejected() {
        let result = validate(&CoreConfig::new(0, -5, 5, f32::NAN), &lcd());
        let kinds: Vec<ValidationKind> = result.errors.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ValidationKind::AboveZero, ValidationKind::InvalidThreshold]);
    }

    #[test]
    fn test_validate_rejects_iff_rule_broken() {
        let limits = lcd();
        for min in (-40..=5).step_by(5) {
            for max in (-40..=5).step_by(5) {
                for threshold in [-1.0f32, 0.0, 50.0, 100.0, 101.0] {
                    let config = CoreConfig::new(1, min, max, threshold);
                    let expected_invalid = min > max
                        || min < limits.min_voltage_mv
                        || max < limits.min_voltage_mv
                        || min > 0
                        || max > 0
                        || !(0.0..=100.0).contains(&threshold);
                    assert_eq!(!validate(&config, &limits).valid, expected_invalid);

                    let (clamped, _) = clamp(&config, &limits);
                    assert!(validate(&clamped, &limits).valid, "{:?} -> {:?}", config, clamped);
                }
            }
        }
    }

    #[test]
    fn test_clamp_reports_changed_fields() {
        let (clamped, fields) = clamp(&CoreConfig::new(7, -50, 3, f32::NAN), &lcd());
        assert_eq!(clamped, CoreConfig::new(3, -30, 0, 50.0));
        let names: Vec<&str> = fields.iter().map(|f| f.field.as_str()).collect();
        assert_eq!(names, vec!["core_id", "min_mv", "max_mv", "threshold_pct"]);

        let (_, untouched) = clamp(&CoreConfig::new(0, -20, -10, 40.0), &lcd());
        assert!(untouched.is_empty());
    }

    #[test]
    fn test_validate_dynamic_duplicates_and_hysteresis() {
        let limits = lcd();
        let mut config = DynamicConfig::defaults_for(&limits);
        assert!(validate_dynamic(&config, &limits).valid);

        config.cores[1].core_id = 0;
        config.hysteresis_pct = 0.0;
        let result = validate_dynamic(&config, &limits);
        let kinds: Vec<ValidationKind> = result.errors.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&ValidationKind::InvalidCoreId));
        assert!(kinds.contains(&ValidationKind::InvalidHysteresis));

        let (clamped, _) = clamp_dynamic(&config, &limits);
        assert!(validate_dynamic(&clamped, &limits).valid);
        assert_eq!(clamped.cores.len(), 3);
    }

    #[test]
    fn test_expert_config_clamps_back_under_normal_limits() {
        let expert = lcd().with_expert(true);
        let mut config = DynamicConfig::defaults_for(&expert);
        config.set_core(CoreConfig::new(0, -80, -40, 50.0));
        assert!(validate_dynamic(&config, &expert).valid);

        let normal = lcd();
        assert!(!validate_dynamic(&config, &normal).valid);
        let (clamped, changed) = clamp_dynamic(&config, &normal);
        assert!(validate_dynamic(&clamped, &normal).valid);
        assert_eq!(clamped.cores[0].min_mv, -30);
        assert!(!changed.is_empty());
    }
}
