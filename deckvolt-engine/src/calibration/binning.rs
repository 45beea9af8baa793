//! Silicon binning
//!
//! **Purpose:** Find the most aggressive single offset every core tolerates
//! under sustained load, and recommend a value with a safety margin.
//!
//! Progress is persisted before every test so a crash mid-test can be
//! attributed to the value under test at next boot.

use super::search::{step_search, SearchProgress, StepProbe, StepSearch, StepVerdict, StopReason};
use super::stability::Outcome;
use super::CalibrationContext;
use crate::error::{Error, Result};
use crate::hardware::LoadPattern;
use crate::limits::{PlatformLimits, ValidationError, ValidationKind};
use crate::store::{RiskyMarker, RiskyOperation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckvolt_common::events::{CalibrationKind, VoltEvent};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Margin added to the most aggressive stable value
pub const BINNING_SAFETY_MARGIN_MV: i32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BinningConfig {
    pub start_value: i32,
    pub step_size: i32,
    pub test_duration_secs: u64,
    pub max_iterations: u32,
    pub consecutive_fail_limit: u32,
}

impl Default for BinningConfig {
    fn default() -> Self {
        Self {
            start_value: -10,
            step_size: 5,
            test_duration_secs: 60,
            max_iterations: 20,
            consecutive_fail_limit: 3,
        }
    }
}

fn range_error(field: &str, value: f64, limit: f64) -> ValidationError {
    ValidationError::new(ValidationKind::OutOfRange, 0, field, value, limit)
}

impl BinningConfig {
    /// Every violated range, reported together
    pub fn validate(&self, limits: &PlatformLimits) -> Result<()> {
        let mut errors = Vec::new();
        if self.start_value > 0 {
            errors.push(range_error("start_value", self.start_value as f64, 0.0));
        }
        if self.start_value < limits.min_voltage_mv {
            errors.push(range_error(
                "start_value",
                self.start_value as f64,
                limits.min_voltage_mv as f64,
            ));
        }
        if !(1..=20).contains(&self.step_size) {
            errors.push(range_error("step_size", self.step_size as f64, 20.0));
        }
        if !(1..=3600).contains(&self.test_duration_secs) {
            errors.push(range_error(
                "test_duration_secs",
                self.test_duration_secs as f64,
                3600.0,
            ));
        }
        if self.max_iterations == 0 {
            errors.push(range_error("max_iterations", 0.0, 1.0));
        }
        if self.consecutive_fail_limit == 0 {
            errors.push(range_error("consecutive_fail_limit", 0.0, 1.0));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(errors))
        }
    }

    pub fn test_duration(&self) -> Duration {
        Duration::from_secs(self.test_duration_secs)
    }
}

/// Crash-survivable binning progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinningState {
    pub active: bool,
    pub current_value: i32,
    pub last_stable: Option<i32>,
    pub iteration: u32,
    /// Values that failed a test during this run
    pub failed_values: Vec<i32>,
    /// Values that took the device down; never retested
    #[serde(default)]
    pub crashed_values: Vec<i32>,
    pub timestamp: DateTime<Utc>,
}

impl Default for BinningState {
    fn default() -> Self {
        Self {
            active: false,
            current_value: 0,
            last_stable: None,
            iteration: 0,
            failed_values: Vec::new(),
            crashed_values: Vec::new(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BinningResult {
    pub max_stable: Option<i32>,
    pub recommended: Option<i32>,
    pub iterations: u32,
    pub aborted: bool,
    pub duration_secs: f64,
    pub stop_reason: StopReason,
    pub timestamp: DateTime<Utc>,
}

struct BinningProbe<'a> {
    ctx: &'a CalibrationContext,
    config: &'a BinningConfig,
    cancel: &'a CancellationToken,
    session_id: Uuid,
    state: BinningState,
}

#[async_trait]
impl StepProbe for BinningProbe<'_> {
    async fn before_test(&mut self, progress: &SearchProgress) -> Result<()> {
        self.state.active = true;
        self.state.current_value = progress.current_mv;
        self.state.last_stable = progress.last_stable;
        self.state.iteration = progress.iteration;
        self.state.failed_values = progress.failed_values.clone();
        self.state.timestamp = Utc::now();
        self.ctx.store.save_binning_state(&self.state)?;

        // Marker carries the offsets about to be on every core
        let in_flight = vec![progress.current_mv; self.ctx.writer.core_count()];
        self.ctx.store.write_marker(&RiskyMarker::new(
            RiskyOperation::Binning,
            Some(progress.current_mv),
            in_flight,
        ))?;

        self.ctx.events.emit_lossy(VoltEvent::CalibrationProgress {
            kind: CalibrationKind::Binning,
            session_id: self.session_id,
            core_id: 0,
            frequency_mhz: None,
            voltage_mv: progress.current_mv,
            completed: progress.iteration.saturating_sub(1) as usize,
            total: self.config.max_iterations as usize,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    async fn test(&mut self, offset_mv: i32) -> Result<StepVerdict> {
        info!("Binning: testing {} mV on all cores", offset_mv);
        let offsets = vec![offset_mv; self.ctx.writer.core_count()];
        if let Err(e) = self.ctx.writer.apply_all(&offsets).await {
            if let Err(reset) = self.ctx.writer.reset_all().await {
                error!("Binning: reset after failed write also failed: {}", reset);
            }
            if let Err(clear) = self.ctx.store.clear_marker() {
                warn!("Binning: failed to clear risky-operation marker: {}", clear);
            }
            return Err(e.into());
        }

        let outcome = self
            .ctx
            .runner
            .run(
                LoadPattern::Constant,
                self.config.test_duration(),
                self.ctx.settings.temperature_ceiling_c,
                self.cancel,
            )
            .await;
        self.ctx.store.clear_marker()?;

        Ok(match outcome {
            Outcome::Stable => StepVerdict::Stable,
            Outcome::Unstable | Outcome::TimedOut => {
                warn!("Binning: {} mV {}", offset_mv, outcome);
                self.ctx.writer.reset_all().await?;
                StepVerdict::Unstable
            }
            Outcome::TemperatureAbort => StepVerdict::Abort("temperature ceiling exceeded".into()),
            Outcome::Interrupted => StepVerdict::Cancelled,
        })
    }

    fn known_failure(&self, offset_mv: i32) -> bool {
        self.state.crashed_values.contains(&offset_mv)
    }
}

/// Run a binning session to completion, cancellation or abort
///
/// Cancellation and safety aborts return a result with `aborted = true`;
/// the last stable value found so far is kept.
pub async fn run_binning(
    ctx: &CalibrationContext,
    config: &BinningConfig,
    cancel: &CancellationToken,
    session_id: Uuid,
) -> Result<BinningResult> {
    config.validate(&ctx.limits)?;
    let previous = ctx.store.load_binning_state()?.unwrap_or_default();
    let started = Instant::now();
    info!(
        "Binning started: {} mV step {} mV, {} s per test",
        config.start_value, config.step_size, config.test_duration_secs
    );

    let mut probe = BinningProbe {
        ctx,
        config,
        cancel,
        session_id,
        state: BinningState {
            active: true,
            current_value: config.start_value,
            crashed_values: previous.crashed_values,
            ..BinningState::default()
        },
    };
    let params = StepSearch {
        start_mv: config.start_value,
        step_mv: config.step_size,
        floor_mv: ctx.limits.min_voltage_mv,
        max_iterations: config.max_iterations,
        consecutive_fail_limit: config.consecutive_fail_limit,
    };

    let searched = step_search(&params, &mut probe, cancel).await;
    let mut state = probe.state;
    state.active = false;
    state.timestamp = Utc::now();

    let outcome = match searched {
        Ok(outcome) => outcome,
        Err(e) => {
            ctx.store.save_binning_state(&state)?;
            return Err(e);
        }
    };
    state.last_stable = outcome.last_stable;
    state.failed_values = outcome.failed_values.clone();
    state.iteration = outcome.iterations;
    ctx.store.save_binning_state(&state)?;

    let result = BinningResult {
        max_stable: outcome.last_stable,
        recommended: outcome
            .last_stable
            .map(|v| (v + BINNING_SAFETY_MARGIN_MV).min(0)),
        iterations: outcome.iterations,
        aborted: !outcome.stop.is_completion(),
        duration_secs: started.elapsed().as_secs_f64(),
        stop_reason: outcome.stop,
        timestamp: Utc::now(),
    };
    ctx.store.save_binning_result(&result)?;
    info!(
        "Binning finished: max stable {:?}, recommended {:?} ({:?})",
        result.max_stable, result.recommended, result.stop_reason
    );
    Ok(result)
}
