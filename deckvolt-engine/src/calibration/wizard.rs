//! Frequency wizard
//!
//! **Purpose:** Build a per-core frequency → offset curve by locking each
//! core to a sequence of frequencies and searching for the most aggressive
//! stable offset at each one under a pulsating (Vdroop) load.
//!
//! **Per point:**
//! 1. Lock the governor to the frequency
//! 2. Step the core's offset down from `voltage_start` until failure or the floor
//! 3. Record last stable + `safety_margin` (never above 0 mV); a frequency with
//!    no stable value is recorded as unstable at 0 mV
//! 4. Persist the session so a later run resumes after the last finished point
//!
//! After all points, a random subset of stable points is re-tested and each
//! sampled point carries its pass/fail verdict.

use super::search::{step_search, SearchProgress, StepProbe, StepSearch, StepVerdict, StopReason};
use super::stability::Outcome;
use super::CalibrationContext;
use crate::curve::{FrequencyCurve, FrequencyPoint};
use crate::error::{Error, Result};
use crate::hardware::LoadPattern;
use crate::limits::{PlatformLimits, ValidationError, ValidationKind};
use crate::store::{RiskyMarker, RiskyOperation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckvolt_common::events::{CalibrationKind, VoltEvent};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Average tests per point used for time estimates
const ESTIMATED_TESTS_PER_POINT: u64 = 4;
const MAX_VERIFICATION_COUNT: usize = 20;

/// Voltage steps allowed per point before giving up
const MAX_STEPS_PER_POINT: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WizardPreset {
    Quick,
    Balanced,
    Thorough,
}

/// Wizard parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WizardConfig {
    pub freq_start: u32,
    pub freq_end: u32,
    pub freq_step: u32,
    pub test_duration_secs: u64,
    pub voltage_start: i32,
    pub voltage_step: i32,
    pub safety_margin: i32,
    pub cores: Vec<usize>,
    pub consecutive_fail_limit: u32,
    pub verification_count: usize,
    /// Vdroop burst and gap length
    pub pulse_ms: u64,
}

impl Default for WizardConfig {
    fn default() -> Self {
        Self::preset(WizardPreset::Balanced)
    }
}

fn range_error(field: &str, value: f64, limit: f64) -> ValidationError {
    ValidationError::new(ValidationKind::OutOfRange, 0, field, value, limit)
}

fn check_range(
    errors: &mut Vec<ValidationError>,
    field: &str,
    value: f64,
    (lo, hi): (f64, f64),
) {
    if value < lo {
        errors.push(range_error(field, value, lo));
    } else if value > hi {
        errors.push(range_error(field, value, hi));
    }
}

impl WizardConfig {
    pub fn preset(preset: WizardPreset) -> Self {
        let (freq_step, test_duration_secs) = match preset {
            WizardPreset::Quick => (200, 15),
            WizardPreset::Balanced => (100, 30),
            WizardPreset::Thorough => (50, 60),
        };
        Self {
            freq_start: 400,
            freq_end: 3500,
            freq_step,
            test_duration_secs,
            voltage_start: -30,
            voltage_step: 2,
            safety_margin: 5,
            cores: vec![0],
            consecutive_fail_limit: 3,
            verification_count: 5,
            pulse_ms: 100,
        }
    }

    /// Every violated range, reported together
    pub fn validate(&self, limits: &PlatformLimits) -> Result<()> {
        let mut errors = Vec::new();
        check_range(&mut errors, "freq_start", self.freq_start as f64, (400.0, 3500.0));
        if self.freq_end <= self.freq_start {
            errors.push(range_error(
                "freq_end",
                self.freq_end as f64,
                self.freq_start as f64,
            ));
        } else {
            check_range(&mut errors, "freq_end", self.freq_end as f64, (400.0, 3500.0));
        }
        check_range(&mut errors, "freq_step", self.freq_step as f64, (50.0, 500.0));
        check_range(
            &mut errors,
            "test_duration_secs",
            self.test_duration_secs as f64,
            (10.0, 120.0),
        );
        check_range(&mut errors, "voltage_start", self.voltage_start as f64, (-100.0, 0.0));
        check_range(&mut errors, "voltage_step", self.voltage_step as f64, (1.0, 10.0));
        check_range(&mut errors, "safety_margin", self.safety_margin as f64, (0.0, 20.0));
        check_range(
            &mut errors,
            "consecutive_fail_limit",
            self.consecutive_fail_limit as f64,
            (1.0, 10.0),
        );
        check_range(
            &mut errors,
            "verification_count",
            self.verification_count as f64,
            (0.0, MAX_VERIFICATION_COUNT as f64),
        );
        check_range(&mut errors, "pulse_ms", self.pulse_ms as f64, (10.0, 1000.0));

        if self.cores.is_empty() {
            errors.push(range_error("cores", 0.0, 1.0));
        }
        let mut seen = HashSet::new();
        for &core_id in &self.cores {
            if core_id >= limits.core_count || !seen.insert(core_id) {
                errors.push(ValidationError::new(
                    ValidationKind::InvalidCoreId,
                    core_id,
                    "cores",
                    core_id as f64,
                    limits.core_count.saturating_sub(1) as f64,
                ));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }

    /// Frequencies to test, ascending, `freq_end` inclusive when on-step
    pub fn frequencies(&self) -> Vec<u32> {
        let step = self.freq_step.max(1) as usize;
        (self.freq_start..=self.freq_end).step_by(step).collect()
    }

    pub fn total_points(&self) -> usize {
        self.frequencies().len() * self.cores.len()
    }

    pub fn test_duration(&self) -> Duration {
        Duration::from_secs(self.test_duration_secs)
    }

    pub fn pattern(&self) -> LoadPattern {
        LoadPattern::Pulsating {
            load_ms: self.pulse_ms,
            idle_ms: self.pulse_ms,
        }
    }

    /// Rough wall-clock estimate for the whole run
    pub fn estimated_duration(&self) -> Duration {
        let verifications = (self.verification_count as u64).saturating_mul(self.cores.len() as u64);
        let tests = (self.total_points() as u64)
            .saturating_mul(ESTIMATED_TESTS_PER_POINT)
            .saturating_add(verifications);
        Duration::from_secs(tests.saturating_mul(self.test_duration_secs))
    }
}

/// A probe that took the device down; never retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedProbe {
    pub core_id: usize,
    pub frequency_mhz: u32,
    pub voltage_mv: i32,
}

/// Persisted wizard run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WizardSession {
    pub session_id: Uuid,
    pub config: WizardConfig,
    pub curves: BTreeMap<usize, FrequencyCurve>,
    pub failed_probes: Vec<FailedProbe>,
    pub completed: bool,
    pub started_at: DateTime<Utc>,
}

impl WizardSession {
    fn new(session_id: Uuid, config: &WizardConfig, failed_probes: Vec<FailedProbe>) -> Self {
        Self {
            session_id,
            config: config.clone(),
            curves: config
                .cores
                .iter()
                .map(|&core| (core, FrequencyCurve::empty(core, Some(config.clone()))))
                .collect(),
            failed_probes,
            completed: false,
            started_at: Utc::now(),
        }
    }

    fn recorded_points(&self) -> usize {
        self.curves.values().map(|c| c.points().len()).sum()
    }
}

/// Live progress snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WizardProgress {
    pub running: bool,
    pub session_id: Option<Uuid>,
    pub current_core: Option<usize>,
    pub current_frequency: Option<u32>,
    pub current_voltage: Option<i32>,
    pub completed_points: usize,
    pub total_points: usize,
    pub progress_percent: f32,
    pub estimated_remaining_secs: u64,
    /// Set when the run ends
    pub outcome: Option<String>,
}

/// Shared progress cell updated by the run and read by callers
#[derive(Debug, Default)]
pub struct ProgressTracker {
    progress: Mutex<WizardProgress>,
    started: Mutex<Option<(Instant, usize)>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn progress(&self) -> MutexGuard<'_, WizardProgress> {
        self.progress.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn snapshot(&self) -> WizardProgress {
        self.progress().clone()
    }

    pub fn begin(&self, session_id: Uuid, total_points: usize, completed_points: usize) {
        *self.started.lock().unwrap_or_else(|e| e.into_inner()) =
            Some((Instant::now(), completed_points));
        let mut progress = self.progress();
        *progress = WizardProgress {
            running: true,
            session_id: Some(session_id),
            total_points,
            ..WizardProgress::default()
        };
        Self::set_completed(&mut progress, completed_points);
    }

    fn probing(&self, core_id: usize, frequency_mhz: u32, voltage_mv: i32) {
        let mut progress = self.progress();
        progress.current_core = Some(core_id);
        progress.current_frequency = Some(frequency_mhz);
        progress.current_voltage = Some(voltage_mv);
    }

    fn point_done(&self, completed_points: usize) {
        let started = *self.started.lock().unwrap_or_else(|e| e.into_inner());
        let mut progress = self.progress();
        Self::set_completed(&mut progress, completed_points);
        if let Some((at, baseline)) = started {
            let done_here = completed_points.saturating_sub(baseline) as u64;
            if done_here > 0 {
                let per_point = at.elapsed().as_secs() / done_here;
                let remaining = progress.total_points.saturating_sub(completed_points) as u64;
                progress.estimated_remaining_secs = per_point * remaining;
            }
        }
    }

    fn set_completed(progress: &mut WizardProgress, completed_points: usize) {
        progress.completed_points = completed_points;
        progress.progress_percent = if progress.total_points == 0 {
            100.0
        } else {
            completed_points as f32 * 100.0 / progress.total_points as f32
        };
    }

    pub fn finish(&self, outcome: &str) {
        let mut progress = self.progress();
        progress.running = false;
        progress.current_voltage = None;
        progress.estimated_remaining_secs = 0;
        progress.outcome = Some(outcome.to_string());
    }
}

/// How a wizard run ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum WizardOutcome {
    Completed,
    Cancelled,
    Aborted(String),
}

impl WizardOutcome {
    pub fn label(&self) -> String {
        match self {
            WizardOutcome::Completed => "completed".to_string(),
            WizardOutcome::Cancelled => "cancelled".to_string(),
            WizardOutcome::Aborted(reason) => format!("aborted: {}", reason),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WizardReport {
    pub session_id: Uuid,
    pub outcome: WizardOutcome,
    pub curves: BTreeMap<usize, FrequencyCurve>,
    pub verification_failures: usize,
}

struct WizardProbe<'a> {
    ctx: &'a CalibrationContext,
    config: &'a WizardConfig,
    cancel: &'a CancellationToken,
    progress: &'a ProgressTracker,
    session_id: Uuid,
    core_id: usize,
    frequency_mhz: u32,
    crashed: Vec<i32>,
    completed: usize,
    total: usize,
}

#[async_trait]
impl StepProbe for WizardProbe<'_> {
    async fn before_test(&mut self, progress: &SearchProgress) -> Result<()> {
        write_point_marker(
            self.ctx,
            self.core_id,
            self.frequency_mhz,
            progress.current_mv,
        )
        .await?;
        self.progress
            .probing(self.core_id, self.frequency_mhz, progress.current_mv);
        self.ctx.events.emit_lossy(VoltEvent::CalibrationProgress {
            kind: CalibrationKind::Wizard,
            session_id: self.session_id,
            core_id: self.core_id,
            frequency_mhz: Some(self.frequency_mhz),
            voltage_mv: progress.current_mv,
            completed: self.completed,
            total: self.total,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn test(&mut self, offset_mv: i32) -> Result<StepVerdict> {
        let outcome = probe_once(
            self.ctx,
            self.config,
            self.cancel,
            self.core_id,
            offset_mv,
        )
        .await?;
        Ok(match outcome {
            Outcome::Stable => StepVerdict::Stable,
            Outcome::Unstable | Outcome::TimedOut => StepVerdict::Unstable,
            Outcome::TemperatureAbort => StepVerdict::Abort("temperature ceiling exceeded".into()),
            Outcome::Interrupted => StepVerdict::Cancelled,
        })
    }

    fn known_failure(&self, offset_mv: i32) -> bool {
        self.crashed.contains(&offset_mv)
    }
}

/// Marker for one point test: current offsets with `core_id` at the tested value
async fn write_point_marker(
    ctx: &CalibrationContext,
    core_id: usize,
    frequency_mhz: u32,
    offset_mv: i32,
) -> Result<()> {
    let mut applied = ctx.writer.applied().await;
    if let Some(slot) = applied.get_mut(core_id) {
        *slot = offset_mv;
    }
    ctx.store.write_marker(&RiskyMarker::new(
        RiskyOperation::Wizard {
            core_id,
            frequency_mhz,
        },
        Some(offset_mv),
        applied,
    ))
}

/// Apply `offset_mv` to one core, run one test, put the core back to 0 mV
/// when the test did not pass
async fn probe_once(
    ctx: &CalibrationContext,
    config: &WizardConfig,
    cancel: &CancellationToken,
    core_id: usize,
    offset_mv: i32,
) -> Result<Outcome> {
    if let Err(e) = ctx.writer.apply(core_id, offset_mv).await {
        if let Err(reset) = ctx.writer.reset_all().await {
            error!("Wizard: reset after failed write also failed: {}", reset);
        }
        if let Err(clear) = ctx.store.clear_marker() {
            warn!("Wizard: failed to clear risky-operation marker: {}", clear);
        }
        return Err(e.into());
    }
    let outcome = ctx
        .runner
        .run(
            config.pattern(),
            config.test_duration(),
            ctx.settings.temperature_ceiling_c,
            cancel,
        )
        .await;
    ctx.store.clear_marker()?;
    if outcome != Outcome::Stable {
        ctx.writer.apply(core_id, 0).await?;
    }
    Ok(outcome)
}

fn curve_error(e: crate::curve::CurveError) -> Error {
    Error::InvalidState(e.to_string())
}

/// Run (or resume) a wizard session
///
/// Cancellation and safety aborts end the run early; every finished point
/// is kept in the session and in the stored curves.
pub async fn run_wizard(
    ctx: &CalibrationContext,
    config: &WizardConfig,
    cancel: &CancellationToken,
    session_id: Uuid,
    progress: &ProgressTracker,
) -> Result<WizardReport> {
    config.validate(&ctx.limits)?;

    let previous = ctx.store.load_wizard_session()?;
    let mut session = match previous {
        Some(session) if !session.completed && session.config == *config => {
            info!(
                "Resuming wizard session {} with {} recorded points",
                session.session_id,
                session.recorded_points()
            );
            session
        }
        Some(old) => WizardSession::new(session_id, config, old.failed_probes),
        None => WizardSession::new(session_id, config, Vec::new()),
    };
    let session_id = session.session_id;
    ctx.store.save_wizard_session(&session)?;

    let frequencies = config.frequencies();
    let total = config.total_points();
    let mut completed = session.recorded_points();
    progress.begin(session_id, total, completed);
    info!(
        "Wizard {}: {} points on cores {:?}, ~{} s",
        session_id,
        total,
        config.cores,
        config.estimated_duration().as_secs()
    );

    // Pre-run offsets are restored by the caller
    ctx.writer.reset_all().await?;
    let start_mv = config.voltage_start.max(ctx.limits.min_voltage_mv);

    let mut outcome = WizardOutcome::Completed;
    'cores: for &core_id in &config.cores {
        for &frequency_mhz in &frequencies {
            let done = session
                .curves
                .get(&core_id)
                .is_some_and(|c| c.point_at(frequency_mhz).is_some());
            if done {
                continue;
            }
            if cancel.is_cancelled() {
                outcome = WizardOutcome::Cancelled;
                break 'cores;
            }

            ctx.governor.lock_frequency(core_id, frequency_mhz)?;
            let crashed = session
                .failed_probes
                .iter()
                .filter(|p| p.core_id == core_id && p.frequency_mhz == frequency_mhz)
                .map(|p| p.voltage_mv)
                .collect();
            let mut probe = WizardProbe {
                ctx,
                config,
                cancel,
                progress,
                session_id,
                core_id,
                frequency_mhz,
                crashed,
                completed,
                total,
            };
            let params = StepSearch {
                start_mv,
                step_mv: config.voltage_step,
                floor_mv: ctx.limits.min_voltage_mv,
                max_iterations: MAX_STEPS_PER_POINT,
                consecutive_fail_limit: config.consecutive_fail_limit,
            };
            let searched = step_search(&params, &mut probe, cancel).await?;
            ctx.writer.apply(core_id, 0).await?;

            match searched.stop {
                StopReason::Cancelled => {
                    outcome = WizardOutcome::Cancelled;
                    break 'cores;
                }
                StopReason::SafetyAbort(reason) => {
                    outcome = WizardOutcome::Aborted(reason);
                    break 'cores;
                }
                _ => {}
            }

            let mut point = match searched.last_stable {
                Some(stable) => {
                    FrequencyPoint::new(frequency_mhz, (stable + config.safety_margin).min(0), true)
                }
                None => {
                    warn!(
                        "Core {} unstable at {} MHz for every tested offset",
                        core_id, frequency_mhz
                    );
                    FrequencyPoint::new(frequency_mhz, 0, false)
                }
            };
            point.test_duration_secs = config.test_duration_secs;
            info!(
                "Core {} @ {} MHz: {} mV (stable: {})",
                core_id, frequency_mhz, point.voltage_mv, point.stable
            );

            session
                .curves
                .entry(core_id)
                .or_insert_with(|| FrequencyCurve::empty(core_id, Some(config.clone())))
                .upsert(point)
                .map_err(curve_error)?;
            ctx.store.save_wizard_session(&session)?;
            completed += 1;
            progress.point_done(completed);
        }
    }

    let mut verification_failures = 0;
    if outcome == WizardOutcome::Completed {
        let (failures, verify_outcome) =
            verify(ctx, config, cancel, progress, &mut session).await?;
        verification_failures = failures;
        outcome = verify_outcome;
    }

    session.completed = outcome == WizardOutcome::Completed;
    ctx.store.save_wizard_session(&session)?;

    let mut stored = ctx.store.load_curves()?;
    for (core_id, curve) in &session.curves {
        if !curve.is_empty() {
            stored.insert(*core_id, curve.clone());
        }
    }
    ctx.store.save_curves(&stored)?;

    progress.finish(&outcome.label());
    info!("Wizard {} finished: {}", session_id, outcome.label());
    Ok(WizardReport {
        session_id,
        outcome,
        curves: session.curves,
        verification_failures,
    })
}

/// Re-test a random subset of each core's stable points
async fn verify(
    ctx: &CalibrationContext,
    config: &WizardConfig,
    cancel: &CancellationToken,
    progress: &ProgressTracker,
    session: &mut WizardSession,
) -> Result<(usize, WizardOutcome)> {
    let mut failures = 0;
    for &core_id in &config.cores {
        let picks: Vec<(u32, i32)> = {
            let Some(curve) = session.curves.get(&core_id) else {
                continue;
            };
            let stable: Vec<(u32, i32)> = curve
                .stable_points()
                .map(|p| (p.frequency_mhz, p.voltage_mv))
                .collect();
            let mut rng = rand::thread_rng();
            stable
                .choose_multiple(&mut rng, config.verification_count)
                .copied()
                .collect()
        };
        info!("Verifying {} points on core {}", picks.len(), core_id);

        for (frequency_mhz, voltage_mv) in picks {
            if cancel.is_cancelled() {
                return Ok((failures, WizardOutcome::Cancelled));
            }
            ctx.governor.lock_frequency(core_id, frequency_mhz)?;
            write_point_marker(ctx, core_id, frequency_mhz, voltage_mv).await?;
            progress.probing(core_id, frequency_mhz, voltage_mv);

            let outcome = probe_once(ctx, config, cancel, core_id, voltage_mv).await?;
            ctx.writer.apply(core_id, 0).await?;
            match outcome {
                Outcome::Interrupted => return Ok((failures, WizardOutcome::Cancelled)),
                Outcome::TemperatureAbort => {
                    return Ok((
                        failures,
                        WizardOutcome::Aborted("temperature ceiling exceeded".into()),
                    ))
                }
                _ => {}
            }
            let passed = outcome == Outcome::Stable;
            if !passed {
                failures += 1;
                warn!(
                    "Verification failed on core {} @ {} MHz ({} mV)",
                    core_id, frequency_mhz, voltage_mv
                );
            }
            if let Some(curve) = session.curves.get_mut(&core_id) {
                curve.mark_verified(frequency_mhz, passed);
            }
            ctx.store.save_wizard_session(session)?;
        }
    }
    Ok((failures, WizardOutcome::Completed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::tests::context;
    use crate::limits::PlatformModel;

    fn small() -> WizardConfig {
        WizardConfig {
            freq_start: 1000,
            freq_end: 1200,
            freq_step: 100,
            test_duration_secs: 10,
            voltage_start: -10,
            voltage_step: 5,
            safety_margin: 5,
            verification_count: 2,
            ..WizardConfig::default()
        }
    }

    fn limits() -> PlatformLimits {
        PlatformLimits::for_model(PlatformModel::Lcd, false)
    }

    #[test]
    fn test_presets() {
        let quick = WizardConfig::preset(WizardPreset::Quick);
        assert_eq!((quick.freq_step, quick.test_duration_secs), (200, 15));
        let thorough = WizardConfig::preset(WizardPreset::Thorough);
        assert_eq!((thorough.freq_step, thorough.test_duration_secs), (50, 60));
        assert_eq!(WizardConfig::default().freq_step, 100);
        assert!(WizardConfig::default().validate(&limits()).is_ok());
    }

    #[test]
    fn test_validation_reports_every_range() {
        let bad = WizardConfig {
            freq_start: 300,
            freq_end: 200,
            freq_step: 20,
            test_duration_secs: 5,
            voltage_start: 10,
            voltage_step: 0,
            safety_margin: 30,
            cores: vec![0, 0, 9],
            verification_count: 21,
            ..WizardConfig::default()
        };
        match bad.validate(&limits()) {
            Err(Error::Validation(errors)) => {
                let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
                for field in [
                    "freq_start",
                    "freq_end",
                    "freq_step",
                    "test_duration_secs",
                    "voltage_start",
                    "voltage_step",
                    "safety_margin",
                    "verification_count",
                ] {
                    assert!(fields.contains(&field), "missing {}", field);
                }
                assert_eq!(fields.iter().filter(|f| **f == "cores").count(), 2);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[test]
    fn test_frequencies_and_estimate() {
        let config = small();
        assert_eq!(config.frequencies(), vec![1000, 1100, 1200]);
        assert_eq!(config.total_points(), 3);
        // 3 points × 4 tests + 2 verifications, 10 s each
        assert_eq!(config.estimated_duration(), Duration::from_secs(140));
    }

    #[test]
    fn test_oversized_verification_count() {
        let config = WizardConfig {
            verification_count: usize::MAX,
            cores: vec![0, 1, 2, 3],
            ..WizardConfig::default()
        };
        assert!(matches!(config.validate(&limits()), Err(Error::Validation(_))));
        assert_eq!(config.estimated_duration(), Duration::from_secs(u64::MAX));

        let config = WizardConfig {
            verification_count: MAX_VERIFICATION_COUNT,
            ..WizardConfig::default()
        };
        assert!(config.validate(&limits()).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_builds_curve_with_margin() {
        let (_dir, sim, ctx) = context();
        sim.set_frequency_floor(1000, -25);
        sim.set_frequency_floor(1100, -20);
        sim.set_frequency_floor(1200, -15);
        let progress = ProgressTracker::new();

        let report = run_wizard(&ctx, &small(), &CancellationToken::new(), Uuid::new_v4(), &progress)
            .await
            .unwrap();
        assert_eq!(report.outcome, WizardOutcome::Completed);

        let curve = &report.curves[&0];
        let voltages: Vec<i32> = curve.points().iter().map(|p| p.voltage_mv).collect();
        assert_eq!(voltages, vec![-20, -15, -10]);
        assert!(curve.points().iter().all(|p| p.stable));
        assert_eq!(curve.points().iter().filter(|p| p.verified.is_some()).count(), 2);
        assert_eq!(report.verification_failures, 0);

        let snapshot = progress.snapshot();
        assert!(!snapshot.running);
        assert_eq!(snapshot.completed_points, 3);
        assert_eq!(snapshot.progress_percent, 100.0);

        assert_eq!(ctx.store.load_curves().unwrap()[&0], *curve);
        assert!(ctx.store.load_wizard_session().unwrap().unwrap().completed);
        assert!(ctx.store.read_marker().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unstable_frequency_recorded_at_zero() {
        let (_dir, sim, ctx) = context();
        sim.set_frequency_floor(1000, -25);
        sim.set_frequency_floor(1100, 0);
        sim.set_frequency_floor(1200, -25);
        let mut config = small();
        config.voltage_start = -20;

        let report = run_wizard(&ctx, &config, &CancellationToken::new(), Uuid::new_v4(), &ProgressTracker::new())
            .await
            .unwrap();
        let point = report.curves[&0].point_at(1100).unwrap().clone();
        assert!(!point.stable);
        assert_eq!(point.voltage_mv, 0);
        assert_eq!(report.curves[&0].points().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_unfinished_session() {
        let (_dir, sim, ctx) = context();
        let config = small();
        let mut session = WizardSession::new(Uuid::new_v4(), &config, Vec::new());
        session
            .curves
            .get_mut(&0)
            .unwrap()
            .upsert(FrequencyPoint::new(1000, -12, true))
            .unwrap();
        ctx.store.save_wizard_session(&session).unwrap();

        let mut config = config;
        config.verification_count = 0;
        // Config differs from the stored one, so this is a fresh run
        let report = run_wizard(&ctx, &config, &CancellationToken::new(), Uuid::new_v4(), &ProgressTracker::new())
            .await
            .unwrap();
        assert_ne!(report.session_id, session.session_id);
        assert_ne!(report.curves[&0].point_at(1000).unwrap().voltage_mv, -12);

        let mut session = WizardSession::new(Uuid::new_v4(), &config, Vec::new());
        session
            .curves
            .get_mut(&0)
            .unwrap()
            .upsert(FrequencyPoint::new(1000, -12, true))
            .unwrap();
        ctx.store.save_wizard_session(&session).unwrap();
        let runs_before = sim.workload_runs().len();

        let report = run_wizard(&ctx, &config, &CancellationToken::new(), Uuid::new_v4(), &ProgressTracker::new())
            .await
            .unwrap();
        assert_eq!(report.session_id, session.session_id);
        assert_eq!(report.curves[&0].point_at(1000).unwrap().voltage_mv, -12);
        // 1100 and 1200 MHz each test -10, -15, -20 and fail at -25
        assert_eq!(sim.workload_runs().len() - runs_before, 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_temperature_abort_keeps_finished_points() {
        let (_dir, sim, ctx) = context();
        let cancel = CancellationToken::new();
        let mut config = small();
        config.voltage_start = -20;

        // First point takes two 10 s tests (-20 stable, -25 unstable)
        let hot = sim.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(35)).await;
            hot.set_stress_temperature(Some(95.0));
        });

        let report = run_wizard(&ctx, &config, &cancel, Uuid::new_v4(), &ProgressTracker::new())
            .await
            .unwrap();
        assert!(matches!(report.outcome, WizardOutcome::Aborted(_)));
        assert_eq!(report.curves[&0].points().len(), 1);
        assert_eq!(sim.applied(), vec![0, 0, 0, 0]);
        assert_eq!(ctx.store.load_curves().unwrap()[&0].points().len(), 1);
        assert!(!ctx.store.load_wizard_session().unwrap().unwrap().completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_holds_offset_under_test() {
        let (_dir, _sim, ctx) = context();
        let cancel = CancellationToken::new();
        let mut config = small();
        config.cores = vec![1];
        config.voltage_start = -20;

        let mid_test = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            let marker = ctx.store.read_marker().unwrap();
            cancel.cancel();
            marker
        };
        let progress = ProgressTracker::new();
        let (report, marker) = tokio::join!(
            run_wizard(&ctx, &config, &cancel, Uuid::new_v4(), &progress),
            mid_test
        );

        let marker = marker.unwrap();
        assert_eq!(
            marker.operation,
            RiskyOperation::Wizard {
                core_id: 1,
                frequency_mhz: 1000
            }
        );
        assert_eq!(marker.in_flight_mv, Some(-20));
        assert_eq!(marker.applied_mv, vec![0, -20, 0, 0]);
        assert_eq!(report.unwrap().outcome, WizardOutcome::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_probe_skipped() {
        let (_dir, sim, ctx) = context();
        sim.set_stability_floor(-100);
        let mut config = small();
        config.freq_end = 1050;
        config.verification_count = 0;
        config.voltage_start = -20;

        let mut session = WizardSession::new(Uuid::new_v4(), &config, Vec::new());
        session.failed_probes.push(FailedProbe {
            core_id: 0,
            frequency_mhz: 1000,
            voltage_mv: -25,
        });
        ctx.store.save_wizard_session(&session).unwrap();

        let report = run_wizard(&ctx, &config, &CancellationToken::new(), Uuid::new_v4(), &ProgressTracker::new())
            .await
            .unwrap();
        // -20 stable, -25 known crash: stop with -20 + 5
        assert_eq!(report.curves[&0].point_at(1000).unwrap().voltage_mv, -15);
        assert_eq!(sim.workload_runs().len(), 1);
    }
}
