//! Dynamic voltage controller
//!
//! **Purpose:** Continuously re-target each core's offset from its current
//! load (or frequency) along the configured curve.
//!
//! Per tick, per core: sample → curve target → hysteresis gate → strategy
//! ramp → platform clamp → serialized write. Each tick also records a
//! BlackBox sample and beats the watchdog heartbeat.
//!
//! Lifecycle: `Stopped → Starting → Running → Stopping → Stopped`, with
//! `Running → Error` on any hardware failure (all cores reset to 0 mV first).

pub mod hysteresis;

use crate::config::ControllerSettings;
use crate::curve::{CurveSource, DynamicConfig, FrequencyCurve, Mode};
use crate::error::{Error, Result};
use crate::hardware::VoltageWriter;
use crate::limits::{validate_dynamic, PlatformLimits};
use crate::metrics::{CoreMetrics, MetricsSampler};
use crate::recovery::blackbox::{BlackBox, BlackBoxSample};
use crate::recovery::watchdog::Heartbeat;
use crate::recovery::RecoveryTarget;
use crate::store::{RiskyMarker, RiskyOperation, StateStore};
use async_trait::async_trait;
use chrono::Utc;
use deckvolt_common::events::{ControllerPhase, EventBus, VoltEvent};
use hysteresis::HysteresisGate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Snapshot of controller state for callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    pub phase: ControllerPhase,
    pub last_error: Option<String>,
    pub cores_configured: usize,
    pub ticks: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartReport {
    pub active: bool,
    pub cores_configured: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopReport {
    pub active: bool,
}

#[derive(Debug, Clone)]
struct Active {
    config: DynamicConfig,
    limits: PlatformLimits,
}

#[derive(Debug)]
struct CoreLoop {
    gate: HysteresisGate,
    target: i32,
    last_tick: Option<Instant>,
}

impl CoreLoop {
    fn new(band: f64) -> Self {
        Self {
            gate: HysteresisGate::new(band),
            target: 0,
            last_tick: None,
        }
    }
}

struct LoopTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    writer: Arc<VoltageWriter>,
    sampler: Arc<MetricsSampler>,
    events: Arc<EventBus>,
    heartbeat: Arc<Heartbeat>,
    blackbox: Arc<BlackBox>,
    store: Arc<StateStore>,
    settings: ControllerSettings,
    status: RwLock<ControllerStatus>,
    active: RwLock<Option<Active>>,
    curves: RwLock<BTreeMap<usize, FrequencyCurve>>,
    cores: Mutex<Vec<CoreLoop>>,
    last_metrics: RwLock<Vec<Option<CoreMetrics>>>,
}

pub struct DynamicController {
    shared: Arc<Shared>,
    task: Mutex<Option<LoopTask>>,
}

fn band_for(config: &DynamicConfig) -> f64 {
    match config.source {
        CurveSource::Load => config.hysteresis_pct as f64,
        CurveSource::Frequency => config.hysteresis_mhz as f64,
    }
}

/// Curve used for `core_id`; Simple mode falls back to core 0's curve
pub(crate) fn curve_for<'a>(
    curves: &'a BTreeMap<usize, FrequencyCurve>,
    config: &DynamicConfig,
    core_id: usize,
) -> Option<&'a FrequencyCurve> {
    curves
        .get(&core_id)
        .or_else(|| match config.mode {
            Mode::Simple => curves.get(&0),
            Mode::Expert => None,
        })
        .filter(|curve| curve.stable_points().next().is_some())
}

impl DynamicController {
    pub fn new(
        writer: Arc<VoltageWriter>,
        sampler: Arc<MetricsSampler>,
        events: Arc<EventBus>,
        heartbeat: Arc<Heartbeat>,
        blackbox: Arc<BlackBox>,
        store: Arc<StateStore>,
        settings: ControllerSettings,
    ) -> Self {
        let core_count = writer.core_count();
        let shared = Shared {
            writer,
            sampler,
            events,
            heartbeat,
            blackbox,
            store,
            settings,
            status: RwLock::new(ControllerStatus {
                phase: ControllerPhase::Stopped,
                last_error: None,
                cores_configured: 0,
                ticks: 0,
            }),
            active: RwLock::new(None),
            curves: RwLock::new(BTreeMap::new()),
            cores: Mutex::new(Vec::new()),
            last_metrics: RwLock::new(vec![None; core_count]),
        };
        Self {
            shared: Arc::new(shared),
            task: Mutex::new(None),
        }
    }

    pub async fn status(&self) -> ControllerStatus {
        self.shared.status.read().await.clone()
    }

    pub async fn phase(&self) -> ControllerPhase {
        self.shared.status.read().await.phase
    }

    pub async fn is_running(&self) -> bool {
        self.phase().await == ControllerPhase::Running
    }

    /// Config in force while running
    pub async fn active_config(&self) -> Option<DynamicConfig> {
        if !self.is_running().await {
            return None;
        }
        self.shared.active.read().await.as_ref().map(|a| a.config.clone())
    }

    /// Most recent sample the loop took for `core_id`
    pub async fn last_metrics(&self, core_id: usize) -> Option<CoreMetrics> {
        self.shared
            .last_metrics
            .read()
            .await
            .get(core_id)
            .cloned()
            .flatten()
    }

    /// Frequency curves used in frequency mode
    pub async fn set_curves(&self, curves: BTreeMap<usize, FrequencyCurve>) {
        *self.shared.curves.write().await = curves;
    }

    /// Validate, take the first sample and spawn the control loop
    pub async fn start(&self, config: DynamicConfig, limits: PlatformLimits) -> Result<StartReport> {
        let mut task = self.task.lock().await;
        let phase = self.phase().await;
        if matches!(phase, ControllerPhase::Running | ControllerPhase::Starting) {
            return Err(Error::InvalidState(format!("controller is {}", phase)));
        }

        validate_dynamic(&config, &limits).into_result()?;
        if config.source == CurveSource::Frequency {
            let curves = self.shared.curves.read().await;
            for core_id in 0..limits.core_count {
                if curve_for(&curves, &config, core_id).is_none() {
                    return Err(Error::InvalidState(format!(
                        "frequency mode needs a calibrated curve for core {}",
                        core_id
                    )));
                }
            }
        }

        let core_count = self.shared.writer.core_count().min(limits.core_count);
        self.shared.set_phase(ControllerPhase::Starting, None).await;

        let applied = self.shared.writer.applied().await;
        if let Err(e) = self
            .shared
            .store
            .write_marker(&RiskyMarker::new(RiskyOperation::Controller, None, applied))
        {
            self.shared.set_phase(ControllerPhase::Stopped, None).await;
            return Err(e);
        }

        self.shared.sampler.reset();
        let band = band_for(&config);
        *self.shared.cores.lock().await = (0..core_count).map(|_| CoreLoop::new(band)).collect();
        let period = match config.source {
            CurveSource::Load => self.shared.settings.load_interval(),
            CurveSource::Frequency => self.shared.settings.frequency_interval(),
        };
        *self.shared.active.write().await = Some(Active { config, limits });
        {
            let mut status = self.shared.status.write().await;
            status.cores_configured = core_count;
            status.ticks = 0;
        }

        if let Err(e) = self.shared.tick().await {
            self.shared.fault(&e).await;
            return Err(e);
        }

        self.shared.set_phase(ControllerPhase::Running, None).await;
        info!(
            "Dynamic controller running on {} cores every {:?}",
            core_count, period
        );

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&self.shared).run(period, cancel.clone()));
        *task = Some(LoopTask { cancel, handle });

        Ok(StartReport {
            active: true,
            cores_configured: core_count,
        })
    }

    /// Cancel the loop, reset all cores to 0 mV and clear the marker
    ///
    /// Idempotent; also moves an errored controller back to Stopped.
    pub async fn stop(&self) -> StopReport {
        let mut task = self.task.lock().await;
        let running = task.take();
        if running.is_none() && self.phase().await == ControllerPhase::Stopped {
            return StopReport { active: false };
        }

        self.shared.set_phase(ControllerPhase::Stopping, None).await;

        if let Some(LoopTask { cancel, handle }) = running {
            cancel.cancel();
            let abort = handle.abort_handle();
            let timeout = Duration::from_millis(self.shared.settings.stop_timeout_ms);
            if tokio::time::timeout(timeout, handle).await.is_err() {
                warn!("Control loop did not exit within {:?}, aborting", timeout);
                abort.abort();
            }
        }

        if let Err(e) = self.shared.writer.reset_all().await {
            error!("Failed to reset cores on stop: {}", e);
        }
        if let Err(e) = self.shared.store.clear_marker() {
            warn!("Failed to clear risky-operation marker: {}", e);
        }
        *self.shared.active.write().await = None;
        self.shared.set_phase(ControllerPhase::Stopped, None).await;
        info!("Dynamic controller stopped");
        StopReport { active: false }
    }

    /// Swap the running config and re-apply at the last observed inputs
    pub async fn apply_config(&self, config: &DynamicConfig) -> Result<()> {
        if !self.is_running().await {
            return Err(Error::InvalidState("controller is not running".to_string()));
        }
        let limits = match self.shared.active.read().await.as_ref() {
            Some(active) => active.limits.clone(),
            None => return Err(Error::InvalidState("controller has no config".to_string())),
        };
        validate_dynamic(config, &limits).into_result()?;

        let curves = self.shared.curves.read().await;
        let mut cores = self.shared.cores.lock().await;
        let band = band_for(config);
        for core in cores.iter_mut() {
            core.gate.reset();
            core.gate.set_band(band);
            core.last_tick = None;
        }
        *self.shared.active.write().await = Some(Active {
            config: config.clone(),
            limits,
        });

        if let Err(e) = self.shared.reapply(&mut cores, &curves).await {
            drop(cores);
            drop(curves);
            self.shared.fault(&e).await;
            return Err(e);
        }
        info!("Applied config version {}", config.version);
        Ok(())
    }
}

#[async_trait]
impl RecoveryTarget for DynamicController {
    async fn active_config(&self) -> Option<DynamicConfig> {
        DynamicController::active_config(self).await
    }

    async fn apply_config(&self, config: &DynamicConfig) -> Result<()> {
        DynamicController::apply_config(self, config).await
    }
}

impl Shared {
    async fn run(self: Arc<Self>, period: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // First tick fires immediately and the initial sample already ran
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        self.fault(&e).await;
                        break;
                    }
                }
            }
        }
        debug!("Control loop exited");
    }

    async fn set_phase(&self, phase: ControllerPhase, last_error: Option<String>) {
        let mut status = self.status.write().await;
        let old = status.phase;
        status.phase = phase;
        if last_error.is_some() || phase == ControllerPhase::Starting {
            status.last_error = last_error;
        }
        drop(status);
        if old != phase {
            self.events.emit_lossy(VoltEvent::ControllerStateChanged {
                old_state: old,
                new_state: phase,
                timestamp: Utc::now(),
            });
        }
    }

    /// Reset to 0 mV and park in Error; no retry
    async fn fault(&self, err: &Error) {
        error!("Controller fault, resetting all cores to 0 mV: {}", err);
        if let Err(e) = self.writer.reset_all().await {
            error!("Reset after fault also failed: {}", e);
        }
        let core_id = match err {
            Error::Hardware(hw) => hw.core_id(),
            Error::MetricsUnavailable { core_id } => Some(*core_id),
            _ => None,
        };
        self.events.emit_lossy(VoltEvent::HardwareFault {
            core_id,
            message: err.to_string(),
            timestamp: Utc::now(),
        });
        if let Err(e) = self.store.clear_marker() {
            warn!("Failed to clear risky-operation marker: {}", e);
        }
        self.set_phase(ControllerPhase::Error, Some(err.to_string()))
            .await;
    }

    async fn tick(&self) -> Result<()> {
        let Some(active) = self.active.read().await.clone() else {
            return Ok(());
        };
        let curves = self.curves.read().await;
        let mut cores = self.cores.lock().await;
        let now = Instant::now();
        let mut samples = Vec::with_capacity(cores.len());
        let mut wrote = false;

        for (core_id, state) in cores.iter_mut().enumerate() {
            let metrics = self.sampler.sample(core_id)?;
            let Some(core) = active.config.effective_core(core_id) else {
                continue;
            };

            let input = match active.config.source {
                CurveSource::Load => metrics.load_pct as f64,
                CurveSource::Frequency => metrics.frequency_mhz as f64,
            };
            if state.gate.should_apply(input) {
                state.target = self.target_for(&active, &curves, core_id, &metrics);
            }

            let current = self.writer.applied_on(core_id).await.unwrap_or(0);
            let next = match (active.config.source, state.last_tick) {
                (CurveSource::Load, Some(prev)) => {
                    active
                        .config
                        .strategy
                        .ramp(&core, current, state.target, now.duration_since(prev))
                }
                _ => state.target,
            };
            let next = next.clamp(active.limits.min_voltage_mv, 0);

            if next != current || state.last_tick.is_none() {
                self.writer.apply(core_id, next).await?;
                wrote = true;
                self.events.emit_lossy(VoltEvent::VoltageApplied {
                    core_id,
                    offset_mv: next,
                    timestamp: Utc::now(),
                });
            }
            state.last_tick = Some(now);

            self.events.emit_lossy(VoltEvent::CoreSampled {
                core_id,
                load_pct: metrics.load_pct,
                frequency_mhz: metrics.frequency_mhz,
                temperature_c: metrics.temperature_c,
                applied_mv: next,
                stale: metrics.stale,
                timestamp: metrics.timestamp,
            });
            samples.push(metrics);
        }
        drop(cores);
        drop(curves);

        if wrote {
            self.refresh_marker().await;
        }
        self.record_tick(samples).await;
        self.heartbeat.beat();
        Ok(())
    }

    /// Write each core's target at its last sampled input, ignoring ramp and gate
    ///
    /// Callers hold `curves` before `cores`, the same order as `tick`.
    async fn reapply(
        &self,
        cores: &mut [CoreLoop],
        curves: &BTreeMap<usize, FrequencyCurve>,
    ) -> Result<()> {
        let Some(active) = self.active.read().await.clone() else {
            return Ok(());
        };
        let last = self.last_metrics.read().await.clone();

        for (core_id, state) in cores.iter_mut().enumerate() {
            let Some(Some(metrics)) = last.get(core_id) else {
                continue;
            };
            let input = match active.config.source {
                CurveSource::Load => metrics.load_pct as f64,
                CurveSource::Frequency => metrics.frequency_mhz as f64,
            };
            state.gate.should_apply(input);
            state.target = self.target_for(&active, curves, core_id, metrics);
            let value = state.target.clamp(active.limits.min_voltage_mv, 0);
            self.writer.apply(core_id, value).await?;
            state.last_tick = Some(Instant::now());
            self.events.emit_lossy(VoltEvent::VoltageApplied {
                core_id,
                offset_mv: value,
                timestamp: Utc::now(),
            });
        }
        self.refresh_marker().await;
        Ok(())
    }

    /// Keep the marker's offsets equal to what is on the hardware
    async fn refresh_marker(&self) {
        let applied = self.writer.applied().await;
        let marker = RiskyMarker::new(RiskyOperation::Controller, None, applied);
        if let Err(e) = self.store.write_marker(&marker) {
            warn!("Failed to update risky-operation marker: {}", e);
        }
    }

    fn target_for(
        &self,
        active: &Active,
        curves: &BTreeMap<usize, FrequencyCurve>,
        core_id: usize,
        metrics: &CoreMetrics,
    ) -> i32 {
        let Some(core) = active.config.effective_core(core_id) else {
            return 0;
        };
        match active.config.source {
            CurveSource::Load => active.config.strategy.target(&core, metrics.load_pct),
            CurveSource::Frequency => match curve_for(curves, &active.config, core_id) {
                Some(curve) => curve.voltage_at(metrics.frequency_mhz),
                None => active.config.strategy.target(&core, metrics.load_pct),
            },
        }
    }

    async fn record_tick(&self, samples: Vec<CoreMetrics>) {
        let applied = self.writer.applied().await;
        let mut voltage_mv = [0i32; 4];
        for (slot, mv) in voltage_mv.iter_mut().zip(applied.iter()) {
            *slot = *mv;
        }
        let load_percent = if samples.is_empty() {
            0.0
        } else {
            samples.iter().map(|m| m.load_pct).sum::<f32>() / samples.len() as f32
        };
        let temperature_c = samples.first().map(|m| m.temperature_c).unwrap_or(0.0);
        let fan = self.sampler.fan().unwrap_or_default();
        self.blackbox.record(BlackBoxSample {
            timestamp: Utc::now(),
            temperature_c,
            load_percent,
            voltage_mv,
            fan_rpm: fan.rpm,
            fan_pwm: fan.pwm,
        });

        {
            let mut last = self.last_metrics.write().await;
            for metrics in samples {
                if let Some(slot) = last.get_mut(metrics.core_id) {
                    *slot = Some(metrics);
                }
            }
        }
        self.status.write().await.ticks += 1;
    }
}
