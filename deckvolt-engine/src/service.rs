//! Engine facade
//!
//! **Purpose:** The one entry point collaborators (plugin shell, RPC layer,
//! daemon) use. Owns every component, wires them together at startup and
//! coordinates the controller, calibration runs and recovery.
//!
//! **Startup sequence:**
//! 1. Open the state store
//! 2. Boot-crash detection (restores last-known-good if the previous session died)
//! 3. Load and re-validate the stored dynamic config and frequency curves
//! 4. Spawn the watchdog
//!
//! Calibration runs go through [`CalibrationGuard`]; while one is active the
//! controller is stopped and cannot be started.

use crate::calibration::binning::{run_binning, BinningConfig, BinningResult, BinningState};
use crate::calibration::search::StopReason;
use crate::calibration::stability::StabilityTestRunner;
use crate::calibration::wizard::{run_wizard, ProgressTracker, WizardConfig, WizardProgress};
use crate::calibration::{CalibrationContext, CalibrationGuard, CalibrationPermit, PreRunSnapshot};
use crate::config::EngineConfig;
use crate::controller::{curve_for, ControllerStatus, DynamicController, StartReport, StopReport};
use crate::curve::{curve_points, CoreConfig, CurvePoint, CurveSource, DynamicConfig, FrequencyCurve};
use crate::error::{Error, Result};
use crate::hardware::{GovernorControl, Hardware, VoltageWriter};
use crate::limits::{
    clamp_dynamic, validate, validate_dynamic, ClampedField, PlatformLimits, ValidationError,
    ValidationKind,
};
use crate::metrics::{CoreMetrics, MetricsSampler};
use crate::recovery::blackbox::BlackBox;
use crate::recovery::watchdog::Heartbeat;
use crate::recovery::{BootRecovery, RecoveryManager};
use crate::store::{CrashHistory, LastKnownGood, StateStore};
use chrono::Utc;
use deckvolt_common::events::{CalibrationKind, EventBus, RecoveryPhase, VoltEvent};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Returned by [`Engine::start_wizard`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WizardStart {
    pub session_id: Uuid,
    pub estimated_duration: Duration,
}

struct CalibrationTask {
    kind: CalibrationKind,
    session_id: Uuid,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

enum CalibrationJob {
    Binning(BinningConfig),
    Wizard(WizardConfig),
}

/// Everything a spawned calibration task owns
struct CalibrationRun {
    ctx: CalibrationContext,
    controller: Arc<DynamicController>,
    recovery: Arc<RecoveryManager>,
    config: Arc<RwLock<DynamicConfig>>,
    progress: Arc<ProgressTracker>,
    session_id: Uuid,
    cancel: CancellationToken,
    /// Set by `Engine::stop` while the run holds the slot
    stop_requested: Arc<AtomicBool>,
}

fn binning_label(result: &BinningResult) -> String {
    match &result.stop_reason {
        _ if !result.aborted => "completed".to_string(),
        StopReason::Cancelled => "cancelled".to_string(),
        StopReason::SafetyAbort(reason) => format!("aborted: {}", reason),
        other => format!("aborted: {:?}", other),
    }
}

impl CalibrationRun {
    /// Capture → supervise → run → restore → report
    async fn execute(self, job: CalibrationJob, permit: CalibrationPermit) {
        let kind = permit.kind();
        let mut snapshot = PreRunSnapshot::capture(&self.ctx, &self.controller).await;
        self.recovery.arm_calibration(self.cancel.clone()).await;

        let result = match &job {
            CalibrationJob::Binning(config) => {
                run_binning(&self.ctx, config, &self.cancel, self.session_id)
                    .await
                    .map(|r| binning_label(&r))
            }
            CalibrationJob::Wizard(config) => {
                run_wizard(&self.ctx, config, &self.cancel, self.session_id, &self.progress)
                    .await
                    .map(|r| r.outcome.label())
            }
        };
        let outcome = match result {
            Ok(label) => label,
            Err(e) => {
                error!("{:?} calibration failed: {}", kind, e);
                if let Err(reset) = self.ctx.writer.reset_all().await {
                    error!("Reset after calibration failure failed: {}", reset);
                }
                if let Err(clear) = self.ctx.store.clear_marker() {
                    warn!("Failed to clear risky-operation marker: {}", clear);
                }
                let label = format!("failed: {}", e);
                if matches!(job, CalibrationJob::Wizard(_)) {
                    self.progress.finish(&label);
                }
                label
            }
        };

        self.recovery.disarm().await;
        if self.stop_requested.swap(false, Ordering::SeqCst) {
            snapshot.cancel_controller_restart();
        }
        if let Err(e) = snapshot.restore(&self.ctx, &self.controller).await {
            warn!("Pre-run state not fully restored: {}", e);
        }
        if let Some(active) = self.controller.active_config().await {
            // Edits made while calibrating were only persisted
            let current = self.config.read().await.clone();
            let config = if current != active {
                match self.controller.apply_config(&current).await {
                    Ok(()) => current,
                    Err(e) => {
                        warn!("Could not apply config edited during calibration: {}", e);
                        active
                    }
                }
            } else {
                active
            };
            if self.controller.is_running().await {
                self.recovery.arm_controller(config, Instant::now()).await;
            }
        }
        drop(permit);

        info!("{:?} calibration {} finished: {}", kind, self.session_id, outcome);
        self.ctx.events.emit_lossy(VoltEvent::CalibrationFinished {
            kind,
            session_id: self.session_id,
            outcome,
            timestamp: Utc::now(),
        });
    }
}

/// DeckVolt engine
pub struct Engine {
    settings: EngineConfig,
    store: Arc<StateStore>,
    writer: Arc<VoltageWriter>,
    sampler: Arc<MetricsSampler>,
    events: Arc<EventBus>,
    controller: Arc<DynamicController>,
    recovery: Arc<RecoveryManager>,
    runner: Arc<StabilityTestRunner>,
    governor: Arc<dyn GovernorControl>,
    guard: Arc<CalibrationGuard>,
    limits: RwLock<PlatformLimits>,
    config: Arc<RwLock<DynamicConfig>>,
    calibration: Mutex<Option<CalibrationTask>>,
    stop_requested: Arc<AtomicBool>,
    wizard_progress: Arc<ProgressTracker>,
    boot: Option<BootRecovery>,
    shutdown: CancellationToken,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build and start the engine on `hardware` with state under `state_dir`
    pub async fn open(
        settings: EngineConfig,
        hardware: Hardware,
        limits: PlatformLimits,
        state_dir: &Path,
    ) -> Result<Self> {
        let store = Arc::new(StateStore::open(state_dir)?);
        let core_count = limits.core_count;
        let events = Arc::new(EventBus::new(settings.event_capacity));
        let writer = Arc::new(VoltageWriter::new(hardware.voltage.clone(), core_count));
        let sampler = Arc::new(MetricsSampler::new(
            hardware.metrics.clone(),
            core_count,
            &settings.metrics,
        ));
        let heartbeat = Arc::new(Heartbeat::new());
        let blackbox = Arc::new(BlackBox::new(settings.blackbox.capacity));

        let controller = Arc::new(DynamicController::new(
            writer.clone(),
            sampler.clone(),
            events.clone(),
            heartbeat.clone(),
            blackbox.clone(),
            store.clone(),
            settings.controller.clone(),
        ));
        let recovery = Arc::new(RecoveryManager::new(
            store.clone(),
            writer.clone(),
            blackbox,
            events.clone(),
            heartbeat.clone(),
            controller.clone(),
            settings.watchdog.clone(),
            settings.blackbox.max_recordings,
        ));
        let runner = Arc::new(StabilityTestRunner::new(
            hardware.workload.clone(),
            sampler.clone(),
            writer.clone(),
            heartbeat,
            settings.calibration.temperature_poll(),
            settings.calibration.hang_grace(),
        ));

        let boot = recovery.boot_recovery().await?;
        if let Some(boot) = &boot {
            warn!(
                "Recovered from crash during {:?}, restored offsets {:?}",
                boot.operation, boot.record.restored_values
            );
        }

        let config = match store.load_dynamic_config()? {
            Some(stored) if validate_dynamic(&stored, &limits).valid => stored,
            Some(stored) => {
                let (clamped, changed) = clamp_dynamic(&stored, &limits);
                warn!(
                    "Stored config exceeds platform limits, clamped {} fields",
                    changed.len()
                );
                store.save_dynamic_config(&clamped)?;
                clamped
            }
            None => DynamicConfig::defaults_for(&limits),
        };
        controller.set_curves(store.load_curves()?).await;

        let shutdown = CancellationToken::new();
        let watchdog = recovery.spawn_watchdog(shutdown.child_token());
        info!(
            "Engine ready: {:?} platform, {} cores, floor {} mV",
            limits.model, core_count, limits.min_voltage_mv
        );

        Ok(Self {
            settings,
            store,
            writer,
            sampler,
            events,
            controller,
            recovery,
            runner,
            governor: hardware.governor,
            guard: Arc::new(CalibrationGuard::new()),
            limits: RwLock::new(limits),
            config: Arc::new(RwLock::new(config)),
            calibration: Mutex::new(None),
            stop_requested: Arc::new(AtomicBool::new(false)),
            wizard_progress: Arc::new(ProgressTracker::new()),
            boot,
            shutdown,
            watchdog: Mutex::new(Some(watchdog)),
        })
    }

    /// What boot-crash detection found at startup
    pub fn boot_recovery(&self) -> Option<&BootRecovery> {
        self.boot.as_ref()
    }

    pub async fn limits(&self) -> PlatformLimits {
        *self.limits.read().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VoltEvent> {
        self.events.subscribe()
    }

    // --- dynamic control -------------------------------------------------

    pub async fn get_config(&self) -> DynamicConfig {
        self.config.read().await.clone()
    }

    /// Replace one core's config; rejected configs change nothing
    pub async fn set_core_config(&self, core: CoreConfig) -> Result<DynamicConfig> {
        let limits = self.limits().await;
        validate(&core, &limits).into_result()?;

        let mut config = self.config.write().await;
        let mut next = config.clone();
        next.set_core(core);
        validate_dynamic(&next, &limits).into_result()?;

        if self.controller.is_running().await {
            self.controller.apply_config(&next).await?;
            self.recovery.config_changed(next.clone(), Instant::now()).await;
        }
        self.store.save_dynamic_config(&next)?;
        *config = next.clone();
        Ok(next)
    }

    /// The effective load curve of `core_id`, one point per whole percent
    pub async fn get_curve_points(&self, core_id: usize) -> Result<Vec<CurvePoint>> {
        if core_id >= self.limits().await.core_count {
            return Err(Error::NotFound(format!("core {}", core_id)));
        }
        curve_points(&*self.config.read().await, core_id)
            .ok_or_else(|| Error::NotFound(format!("no config for core {}", core_id)))
    }

    /// Start dynamic control with `config` and make it the stored config
    pub async fn start(&self, config: DynamicConfig) -> Result<StartReport> {
        if let Some(kind) = self.guard.current() {
            return Err(Error::InvalidState(format!(
                "{:?} calibration in progress",
                kind
            )));
        }
        let limits = self.limits().await;
        let mut current = self.config.write().await;
        let report = self.controller.start(config.clone(), limits).await?;
        if let Err(e) = self.store.save_dynamic_config(&config) {
            warn!("Controller started but config was not persisted: {}", e);
        }
        *current = config.clone();
        self.recovery.arm_controller(config, Instant::now()).await;
        Ok(report)
    }

    /// Start dynamic control with the stored config
    pub async fn start_stored(&self) -> Result<StartReport> {
        let config = self.get_config().await;
        self.start(config).await
    }

    /// Stop dynamic control and reset every core to 0 mV (idempotent)
    ///
    /// During a calibration the controller is already paused; the run then
    /// ends with the controller stopped instead of restarting it.
    pub async fn stop(&self) -> StopReport {
        if self.guard.is_busy() {
            self.stop_requested.store(true, Ordering::SeqCst);
        } else {
            self.recovery.disarm().await;
        }
        self.controller.stop().await
    }

    pub async fn controller_status(&self) -> ControllerStatus {
        self.controller.status().await
    }

    /// Latest metrics for `core_id`
    ///
    /// While the controller runs this is its most recent sample, so the
    /// control loop's load deltas are not disturbed.
    pub async fn get_metrics(&self, core_id: usize) -> Result<CoreMetrics> {
        if core_id >= self.writer.core_count() {
            return Err(Error::NotFound(format!("core {}", core_id)));
        }
        if self.controller.is_running().await {
            if let Some(metrics) = self.controller.last_metrics(core_id).await {
                return Ok(metrics);
            }
        }
        self.sampler.sample(core_id)
    }

    async fn restart_controller(&self, config: DynamicConfig, limits: PlatformLimits) -> Result<()> {
        self.recovery.disarm().await;
        self.controller.stop().await;
        self.controller.start(config.clone(), limits).await?;
        self.recovery.arm_controller(config, Instant::now()).await;
        Ok(())
    }

    // --- limits ----------------------------------------------------------

    /// Toggle expert mode and clamp stored configs into the new limits
    ///
    /// A running controller is restarted under the new limits. Returns the
    /// fields that had to be clamped.
    pub async fn set_expert_mode(&self, expert: bool) -> Result<Vec<ClampedField>> {
        if let Some(kind) = self.guard.current() {
            return Err(Error::AlreadyRunning(format!(
                "{:?} calibration in progress",
                kind
            )));
        }
        let mut limits = self.limits.write().await;
        let next_limits = limits.with_expert(expert);
        let mut config = self.config.write().await;

        let (clamped, changed) = if validate_dynamic(&config, &next_limits).valid {
            (config.clone(), Vec::new())
        } else {
            clamp_dynamic(&config, &next_limits)
        };
        if let Some(lkg) = self.store.load_lkg()? {
            if !validate_dynamic(&lkg.config, &next_limits).valid {
                let (lkg_config, _) = clamp_dynamic(&lkg.config, &next_limits);
                info!("Clamped last-known-good into the new limits");
                self.store.save_lkg(&LastKnownGood {
                    config: lkg_config,
                    ..lkg
                })?;
            }
        }
        if !changed.is_empty() {
            warn!(
                "Expert mode {}: clamped {} fields",
                if expert { "on" } else { "off" },
                changed.len()
            );
            self.store.save_dynamic_config(&clamped)?;
            *config = clamped;
        }
        *limits = next_limits;
        info!(
            "Expert mode {}, voltage floor now {} mV",
            if expert { "enabled" } else { "disabled" },
            next_limits.min_voltage_mv
        );

        if self.controller.is_running().await {
            self.restart_controller(config.clone(), next_limits).await?;
        }
        Ok(changed)
    }

    // --- frequency curves ------------------------------------------------

    /// Curve for `core_id`; a running wizard's partial curve takes precedence
    pub async fn get_curve(&self, core_id: usize) -> Result<FrequencyCurve> {
        let session_curve = || -> Result<Option<FrequencyCurve>> {
            Ok(self
                .store
                .load_wizard_session()?
                .and_then(|mut session| session.curves.remove(&core_id))
                .filter(|curve| !curve.is_empty()))
        };
        if self.guard.current() == Some(CalibrationKind::Wizard) {
            if let Some(curve) = session_curve()? {
                return Ok(curve);
            }
        }
        if let Some(curve) = self.store.load_curves()?.remove(&core_id) {
            return Ok(curve);
        }
        session_curve()?.ok_or_else(|| Error::NotFound(format!("no curve for core {}", core_id)))
    }

    /// Store curves (merged with existing ones) and hand them to the controller
    pub async fn apply_curve(&self, curves: BTreeMap<usize, FrequencyCurve>) -> Result<()> {
        let limits = self.limits().await;
        let mut errors = Vec::new();
        for (&core_id, curve) in &curves {
            if core_id >= limits.core_count || curve.core_id() != core_id {
                errors.push(ValidationError::new(
                    ValidationKind::InvalidCoreId,
                    core_id,
                    "core_id",
                    curve.core_id() as f64,
                    limits.core_count.saturating_sub(1) as f64,
                ));
            }
            if let Some(point) = curve
                .points()
                .iter()
                .find(|p| p.voltage_mv < limits.min_voltage_mv)
            {
                errors.push(ValidationError::new(
                    ValidationKind::BelowPlatformMin,
                    core_id,
                    "voltage_mv",
                    point.voltage_mv as f64,
                    limits.min_voltage_mv as f64,
                ));
            }
        }
        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }

        let mut stored = self.store.load_curves()?;
        stored.extend(curves);
        self.store.save_curves(&stored)?;
        self.controller.set_curves(stored).await;
        info!("Frequency curves applied");

        if let Some(active) = self.controller.active_config().await {
            if active.source == CurveSource::Frequency {
                self.controller.apply_config(&active).await?;
            }
        }
        Ok(())
    }

    pub async fn enable_frequency_mode(&self) -> Result<DynamicConfig> {
        self.switch_source(CurveSource::Frequency).await
    }

    pub async fn disable_frequency_mode(&self) -> Result<DynamicConfig> {
        self.switch_source(CurveSource::Load).await
    }

    async fn switch_source(&self, source: CurveSource) -> Result<DynamicConfig> {
        let limits = self.limits().await;
        let mut config = self.config.write().await;
        if config.source == source {
            return Ok(config.clone());
        }
        let mut next = config.clone();
        next.source = source;
        next.version = next.version.wrapping_add(1);

        if source == CurveSource::Frequency {
            let curves = self.store.load_curves()?;
            if let Some(core_id) =
                (0..limits.core_count).find(|&id| curve_for(&curves, &next, id).is_none())
            {
                return Err(Error::InvalidState(format!(
                    "no calibrated curve for core {}; run the wizard first",
                    core_id
                )));
            }
            self.controller.set_curves(curves).await;
        }

        if self.controller.is_running().await {
            self.restart_controller(next.clone(), limits).await?;
        }
        self.store.save_dynamic_config(&next)?;
        *config = next.clone();
        info!("Controller input switched to {:?}", source);
        Ok(next)
    }

    // --- calibration -----------------------------------------------------

    fn calibration_context(&self, limits: PlatformLimits) -> CalibrationContext {
        CalibrationContext {
            store: self.store.clone(),
            writer: self.writer.clone(),
            runner: self.runner.clone(),
            governor: self.governor.clone(),
            events: self.events.clone(),
            limits,
            settings: self.settings.calibration.clone(),
        }
    }

    async fn spawn_calibration(
        &self,
        permit: CalibrationPermit,
        session_id: Uuid,
        job: CalibrationJob,
        limits: PlatformLimits,
    ) {
        let kind = permit.kind();
        let cancel = self.shutdown.child_token();
        self.stop_requested.store(false, Ordering::SeqCst);
        let run = CalibrationRun {
            ctx: self.calibration_context(limits),
            controller: self.controller.clone(),
            recovery: self.recovery.clone(),
            config: self.config.clone(),
            progress: self.wizard_progress.clone(),
            session_id,
            cancel: cancel.clone(),
            stop_requested: self.stop_requested.clone(),
        };
        let handle = tokio::spawn(run.execute(job, permit));
        *self.calibration.lock().await = Some(CalibrationTask {
            kind,
            session_id,
            cancel,
            handle,
        });
    }

    /// Start (or resume) the frequency wizard in the background
    pub async fn start_wizard(&self, config: WizardConfig) -> Result<WizardStart> {
        let limits = self.limits().await;
        config.validate(&limits)?;
        let permit = self.guard.try_acquire(CalibrationKind::Wizard)?;

        let session_id = match self.store.load_wizard_session()? {
            Some(session) if !session.completed && session.config == config => session.session_id,
            _ => Uuid::new_v4(),
        };
        let estimated_duration = config.estimated_duration();
        self.wizard_progress
            .begin(session_id, config.total_points(), 0);
        info!("Starting wizard session {}", session_id);

        self.spawn_calibration(permit, session_id, CalibrationJob::Wizard(config), limits)
            .await;
        Ok(WizardStart {
            session_id,
            estimated_duration,
        })
    }

    pub fn get_progress(&self) -> WizardProgress {
        self.wizard_progress.snapshot()
    }

    /// Start binning in the background; returns the session id
    pub async fn start_binning(&self, config: BinningConfig) -> Result<Uuid> {
        let limits = self.limits().await;
        config.validate(&limits)?;
        let permit = self.guard.try_acquire(CalibrationKind::Binning)?;
        let session_id = Uuid::new_v4();
        info!("Starting binning session {}", session_id);
        self.spawn_calibration(permit, session_id, CalibrationJob::Binning(config), limits)
            .await;
        Ok(session_id)
    }

    /// Cancel whichever calibration is running (no-op when none is)
    ///
    /// Returns once the run has restored the pre-run state, or after
    /// `cancel_timeout`, in which case the run is aborted and every core
    /// reset to 0 mV.
    pub async fn cancel(&self) -> Result<()> {
        let task = self.calibration.lock().await.take();
        match task {
            Some(task) => self.join_cancelled(task).await,
            None => Ok(()),
        }
    }

    /// Cancel a running binning session
    pub async fn stop_binning(&self) -> Result<()> {
        let mut slot = self.calibration.lock().await;
        if slot.as_ref().is_some_and(|t| t.kind == CalibrationKind::Wizard) {
            return Err(Error::InvalidState(
                "the running calibration is the wizard".to_string(),
            ));
        }
        let task = slot.take();
        drop(slot);
        match task {
            Some(task) => self.join_cancelled(task).await,
            None => Ok(()),
        }
    }

    async fn join_cancelled(&self, task: CalibrationTask) -> Result<()> {
        if task.handle.is_finished() {
            return Ok(());
        }
        info!("Cancelling {:?} calibration {}", task.kind, task.session_id);
        task.cancel.cancel();

        let abort = task.handle.abort_handle();
        let timeout = self.settings.calibration.cancel_timeout();
        match tokio::time::timeout(timeout, task.handle).await {
            Ok(_) => Ok(()),
            Err(_) => {
                error!(
                    "Calibration did not stop within {:?}, aborting and resetting to 0 mV",
                    timeout
                );
                abort.abort();
                if let Err(e) = self.writer.reset_all().await {
                    error!("Reset after aborted calibration failed: {}", e);
                }
                if let Err(e) = self.store.clear_marker() {
                    warn!("Failed to clear risky-operation marker: {}", e);
                }
                Err(Error::SafetyAbort(format!(
                    "calibration did not stop within {:?}",
                    timeout
                )))
            }
        }
    }

    pub fn calibration_running(&self) -> Option<CalibrationKind> {
        self.guard.current()
    }

    pub fn get_binning_status(&self) -> Result<BinningState> {
        Ok(self.store.load_binning_state()?.unwrap_or_default())
    }

    pub fn last_binning_result(&self) -> Result<Option<BinningResult>> {
        self.store.load_binning_result()
    }

    // --- recovery --------------------------------------------------------

    pub async fn recovery_state(&self) -> RecoveryPhase {
        self.recovery.phase().await
    }

    pub fn crash_history(&self) -> Result<CrashHistory> {
        self.recovery.crash_history()
    }

    pub fn last_known_good(&self) -> Result<Option<LastKnownGood>> {
        self.recovery.last_known_good()
    }

    /// Report instability observed outside the engine (e.g. by the user)
    pub async fn report_instability(&self, reason: &str) {
        self.recovery.report_instability(reason, Instant::now()).await;
    }

    /// Cancel calibration, stop the controller (0 mV) and the watchdog
    pub async fn shutdown(&self) {
        info!("Shutting down engine");
        if let Err(e) = self.cancel().await {
            warn!("Calibration shutdown: {}", e);
        }
        self.recovery.disarm().await;
        self.controller.stop().await;
        self.shutdown.cancel();
        if let Some(handle) = self.watchdog.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Watchdog task ended abnormally: {}", e);
            }
        }
        info!("Engine stopped");
    }
}
