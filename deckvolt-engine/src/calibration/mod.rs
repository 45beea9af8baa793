//! Calibration
//!
//! **Purpose:** Discover how far each core can be undervolted: binning finds
//! one global value, the frequency wizard builds per-core frequency curves.
//!
//! Shared rules for every run:
//! - Only one calibration at a time ([`CalibrationGuard`])
//! - State is persisted and the risky-operation marker written before each test
//! - Cancellation is observed between tests and inside a running test
//! - The pre-run governor and voltage state is always restored afterwards

pub mod binning;
pub mod search;
pub mod stability;
pub mod wizard;

use crate::config::CalibrationSettings;
use crate::controller::DynamicController;
use crate::curve::DynamicConfig;
use crate::error::{Error, Result};
use crate::hardware::linux::FALLBACK_GOVERNOR;
use crate::hardware::{GovernorControl, VoltageWriter};
use crate::limits::PlatformLimits;
use crate::store::StateStore;
use deckvolt_common::events::{CalibrationKind, EventBus};
use stability::StabilityTestRunner;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

/// Process-wide single calibration slot
#[derive(Debug, Default)]
pub struct CalibrationGuard {
    slot: Mutex<Option<CalibrationKind>>,
}

impl CalibrationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<CalibrationKind>> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the slot or fail fast with `AlreadyRunning`
    pub fn try_acquire(self: &Arc<Self>, kind: CalibrationKind) -> Result<CalibrationPermit> {
        let mut slot = self.slot();
        if let Some(current) = *slot {
            return Err(Error::AlreadyRunning(format!(
                "{:?} calibration in progress",
                current
            )));
        }
        *slot = Some(kind);
        Ok(CalibrationPermit {
            guard: Arc::clone(self),
            kind,
        })
    }

    pub fn current(&self) -> Option<CalibrationKind> {
        *self.slot()
    }

    pub fn is_busy(&self) -> bool {
        self.current().is_some()
    }
}

/// Releases the slot on drop
#[derive(Debug)]
pub struct CalibrationPermit {
    guard: Arc<CalibrationGuard>,
    kind: CalibrationKind,
}

impl CalibrationPermit {
    pub fn kind(&self) -> CalibrationKind {
        self.kind
    }
}

impl Drop for CalibrationPermit {
    fn drop(&mut self) {
        *self.guard.slot() = None;
    }
}

/// Everything a calibration run touches
#[derive(Clone)]
pub struct CalibrationContext {
    pub store: Arc<StateStore>,
    pub writer: Arc<VoltageWriter>,
    pub runner: Arc<StabilityTestRunner>,
    pub governor: Arc<dyn GovernorControl>,
    pub events: Arc<EventBus>,
    pub limits: PlatformLimits,
    pub settings: CalibrationSettings,
}

/// Governor and voltage state captured before a run
#[derive(Debug, Clone)]
pub struct PreRunSnapshot {
    pub governors: Vec<String>,
    pub offsets: Vec<i32>,
    /// Config the controller was running, restarted on restore
    pub controller_config: Option<DynamicConfig>,
}

impl PreRunSnapshot {
    /// Record current state and stop the controller
    pub async fn capture(ctx: &CalibrationContext, controller: &DynamicController) -> Self {
        let governors = (0..ctx.writer.core_count())
            .map(|core_id| {
                ctx.governor.governor(core_id).unwrap_or_else(|e| {
                    warn!(
                        "Could not read governor of core {} ({}), will restore {}",
                        core_id, e, FALLBACK_GOVERNOR
                    );
                    FALLBACK_GOVERNOR.to_string()
                })
            })
            .collect();
        let offsets = ctx.writer.applied().await;
        let controller_config = controller.active_config().await;
        if controller_config.is_some() {
            info!("Stopping dynamic controller for calibration");
            controller.stop().await;
        }
        Self {
            governors,
            offsets,
            controller_config,
        }
    }

    /// Drop the pending controller restart; restore leaves every core at 0 mV
    pub fn cancel_controller_restart(&mut self) {
        if self.controller_config.take().is_some() {
            info!("Controller was stopped during calibration, not restarting it");
        }
        self.offsets = vec![0; self.offsets.len()];
    }

    /// Put governors and voltage back
    ///
    /// Attempts every step and returns the first failure.
    pub async fn restore(
        &self,
        ctx: &CalibrationContext,
        controller: &DynamicController,
    ) -> Result<()> {
        let mut first_err: Option<Error> = None;
        for (core_id, governor) in self.governors.iter().enumerate() {
            if let Err(e) = ctx.governor.restore(core_id, governor) {
                warn!("Failed to restore governor on core {}: {}", core_id, e);
                first_err.get_or_insert(e.into());
            }
        }

        match &self.controller_config {
            Some(config) => {
                if let Err(e) = controller.start(config.clone(), ctx.limits.clone()).await {
                    warn!("Failed to restart dynamic controller: {}", e);
                    first_err.get_or_insert(e);
                    reset_after_failed_restore(ctx).await;
                }
            }
            None => {
                if let Err(e) = ctx.writer.apply_all(&self.offsets).await {
                    warn!("Failed to restore pre-run offsets: {}", e);
                    first_err.get_or_insert(e.into());
                    reset_after_failed_restore(ctx).await;
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn reset_after_failed_restore(ctx: &CalibrationContext) {
    if let Err(e) = ctx.writer.reset_all().await {
        error!("Reset to 0 mV after failed restore also failed: {}", e);
    }
}
