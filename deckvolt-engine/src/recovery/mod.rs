//! Crash recovery
//!
//! **Purpose:** Keep the device out of unstable voltage states across
//! hangs, crashes and reboots.
//!
//! State machine: `Normal → Degraded → Recovering → {Normal | RollingBack → Normal}`
//!
//! - The watchdog task checks the controller heartbeat on its own interval;
//!   `missed_limit` consecutive misses enter Degraded.
//! - Degraded relaxes every core by `recovery_delta_mv` and holds the
//!   reduced config for `hold_cycles` checks. A clean hold promotes it to
//!   last-known-good; any instability during the hold rolls back to the
//!   config that was last-known-good before degradation.
//! - A config is saved as last-known-good only after `lkg_dwell` of
//!   continuous stability.
//! - At startup an uncleared risky-operation marker means the previous
//!   session died mid-operation; last-known-good is restored and the crash
//!   recorded.

pub mod blackbox;
pub mod watchdog;

use crate::calibration::wizard::FailedProbe;
use crate::config::WatchdogSettings;
use crate::curve::DynamicConfig;
use crate::error::Result;
use crate::hardware::VoltageWriter;
use crate::store::{CrashHistory, CrashRecord, LastKnownGood, RiskyOperation, StateStore};
use async_trait::async_trait;
use blackbox::BlackBox;
use chrono::Utc;
use deckvolt_common::events::{EventBus, RecoveryPhase, VoltEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use watchdog::{Heartbeat, Watchdog, WatchdogVerdict};

/// Whatever owns the active dynamic config (the controller)
#[async_trait]
pub trait RecoveryTarget: Send + Sync {
    async fn active_config(&self) -> Option<DynamicConfig>;
    async fn apply_config(&self, config: &DynamicConfig) -> Result<()>;
}

/// Tracks how long the current config has been continuously stable
#[derive(Debug)]
pub struct LkgTracker {
    dwell: Duration,
    candidate: Option<DynamicConfig>,
    since: Option<Instant>,
    written: bool,
}

impl LkgTracker {
    pub fn new(dwell: Duration) -> Self {
        Self {
            dwell,
            candidate: None,
            since: None,
            written: false,
        }
    }

    /// Start timing a new config
    pub fn track(&mut self, config: DynamicConfig, now: Instant) {
        self.candidate = Some(config);
        self.since = Some(now);
        self.written = false;
    }

    /// Track a config that is already last-known-good
    pub fn track_saved(&mut self, config: DynamicConfig, now: Instant) {
        self.track(config, now);
        self.written = true;
    }

    /// Instability restarts the dwell timer
    pub fn instability(&mut self, now: Instant) {
        if self.candidate.is_some() {
            self.since = Some(now);
            self.written = false;
        }
    }

    pub fn clear(&mut self) {
        self.candidate = None;
        self.since = None;
        self.written = false;
    }

    /// A record to save once the dwell has elapsed, at most once per dwell
    pub fn observe(&mut self, now: Instant) -> Option<LastKnownGood> {
        if self.written {
            return None;
        }
        let (config, since) = (self.candidate.as_ref()?, self.since?);
        let stable_for = now.saturating_duration_since(since);
        if stable_for < self.dwell {
            return None;
        }
        self.written = true;
        Some(LastKnownGood {
            config: config.clone(),
            timestamp: Utc::now(),
            stable_duration_secs: stable_for.as_secs(),
        })
    }
}

/// What the watchdog is currently supervising
#[derive(Debug, Clone)]
enum Supervision {
    Idle,
    Controller,
    /// Missed beats reset voltages and cancel the run
    Calibration(CancellationToken),
}

#[derive(Debug)]
struct Hold {
    reduced: DynamicConfig,
    fallback: DynamicConfig,
    stable_cycles: u32,
}

struct RecoveryInner {
    phase: RecoveryPhase,
    supervision: Supervision,
    watchdog: Watchdog,
    lkg: LkgTracker,
    hold: Option<Hold>,
    /// Rolled back and no beat has arrived since
    rollback_pending_beat: bool,
}

/// Result of boot-time crash detection
#[derive(Debug, Clone)]
pub struct BootRecovery {
    pub record: CrashRecord,
    pub restored_config: DynamicConfig,
    pub operation: RiskyOperation,
}

pub struct RecoveryManager {
    store: Arc<StateStore>,
    writer: Arc<VoltageWriter>,
    blackbox: Arc<BlackBox>,
    events: Arc<EventBus>,
    heartbeat: Arc<Heartbeat>,
    target: Arc<dyn RecoveryTarget>,
    settings: WatchdogSettings,
    blackbox_keep: usize,
    inner: Mutex<RecoveryInner>,
}

impl RecoveryManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateStore>,
        writer: Arc<VoltageWriter>,
        blackbox: Arc<BlackBox>,
        events: Arc<EventBus>,
        heartbeat: Arc<Heartbeat>,
        target: Arc<dyn RecoveryTarget>,
        settings: WatchdogSettings,
        blackbox_keep: usize,
    ) -> Self {
        let inner = RecoveryInner {
            phase: RecoveryPhase::Normal,
            supervision: Supervision::Idle,
            watchdog: Watchdog::new(settings.missed_limit),
            lkg: LkgTracker::new(settings.lkg_dwell()),
            hold: None,
            rollback_pending_beat: false,
        };
        Self {
            store,
            writer,
            blackbox,
            events,
            heartbeat,
            target,
            settings,
            blackbox_keep,
            inner: Mutex::new(inner),
        }
    }

    pub async fn phase(&self) -> RecoveryPhase {
        self.inner.lock().await.phase
    }

    pub fn crash_history(&self) -> Result<CrashHistory> {
        self.store.load_crash_history()
    }

    pub fn last_known_good(&self) -> Result<Option<LastKnownGood>> {
        self.store.load_lkg()
    }

    /// Supervise a freshly started controller running `config`
    pub async fn arm_controller(&self, config: DynamicConfig, now: Instant) {
        let mut inner = self.inner.lock().await;
        inner.supervision = Supervision::Controller;
        inner.watchdog.resync(&self.heartbeat);
        inner.hold = None;
        inner.rollback_pending_beat = false;
        let already_saved = matches!(self.store.load_lkg(), Ok(Some(ref lkg)) if lkg.config == config);
        if already_saved {
            inner.lkg.track_saved(config, now);
        } else {
            inner.lkg.track(config, now);
        }
        self.set_phase(&mut inner, RecoveryPhase::Normal, "controller armed");
    }

    /// The running controller switched configs
    pub async fn config_changed(&self, config: DynamicConfig, now: Instant) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.supervision, Supervision::Controller) {
            inner.lkg.track(config, now);
        }
    }

    /// Supervise a calibration run; missed beats cancel `cancel`
    pub async fn arm_calibration(&self, cancel: CancellationToken) {
        let mut inner = self.inner.lock().await;
        inner.supervision = Supervision::Calibration(cancel);
        inner.watchdog.resync(&self.heartbeat);
        inner.hold = None;
        inner.lkg.clear();
    }

    pub async fn disarm(&self) {
        let mut inner = self.inner.lock().await;
        inner.supervision = Supervision::Idle;
        inner.hold = None;
        inner.lkg.clear();
        if inner.phase != RecoveryPhase::Normal {
            self.set_phase(&mut inner, RecoveryPhase::Normal, "disarmed");
        }
    }

    /// Run one watchdog check
    pub async fn evaluate(&self, now: Instant) {
        let mut inner = self.inner.lock().await;
        let verdict = inner.watchdog.check(&self.heartbeat);

        match inner.supervision.clone() {
            Supervision::Idle => {}
            Supervision::Calibration(cancel) => {
                if verdict == WatchdogVerdict::Tripped {
                    error!("Calibration heartbeat lost, resetting voltages and cancelling run");
                    self.emergency_reset(&mut inner, "calibration_watchdog").await;
                    cancel.cancel();
                }
            }
            Supervision::Controller => match verdict {
                WatchdogVerdict::Fresh => {
                    inner.rollback_pending_beat = false;
                    self.on_stable_cycle(&mut inner, now).await;
                }
                WatchdogVerdict::Missed(count) => {
                    warn!("Controller heartbeat missed ({} consecutive)", count);
                    inner.lkg.instability(now);
                    if inner.hold.is_some() {
                        self.rollback(&mut inner, "missed heartbeat during recovery hold", now)
                            .await;
                    }
                }
                WatchdogVerdict::Tripped => {
                    inner.lkg.instability(now);
                    if inner.hold.is_some() {
                        self.rollback(&mut inner, "missed heartbeat during recovery hold", now)
                            .await;
                    } else if inner.rollback_pending_beat {
                        error!("Controller still silent after rollback, resetting to 0 mV");
                        self.emergency_reset(&mut inner, "watchdog_safe_reset").await;
                        inner.supervision = Supervision::Idle;
                    } else {
                        self.degrade(&mut inner, now).await;
                    }
                }
            },
        }
    }

    /// External instability signal (failed test, fault report, user report)
    pub async fn report_instability(&self, reason: &str, now: Instant) {
        let mut inner = self.inner.lock().await;
        if !matches!(inner.supervision, Supervision::Controller) {
            return;
        }
        warn!("Instability reported: {}", reason);
        inner.lkg.instability(now);
        self.persist_blackbox(reason);
        if inner.hold.is_some() {
            self.rollback(&mut inner, reason, now).await;
        }
    }

    /// Spawn the watchdog loop; it runs until `shutdown` is cancelled
    pub fn spawn_watchdog(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        let period = self.settings.check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => manager.evaluate(Instant::now()).await,
                }
            }
            info!("Watchdog stopped");
        })
    }

    /// Detect a crash from the previous session and restore last-known-good
    pub async fn boot_recovery(&self) -> Result<Option<BootRecovery>> {
        let Some(marker) = self.store.read_marker()? else {
            return Ok(None);
        };
        warn!(
            "Risky-operation marker found ({:?} started {}), previous session crashed",
            marker.operation, marker.started_at
        );

        let core_count = self.writer.core_count();
        let restored_config = match self.store.load_lkg()? {
            Some(lkg) => lkg.config,
            None => DynamicConfig::zeroed(core_count),
        };

        // Static restore at the safe end of each core's curve
        let offsets: Vec<i32> = (0..core_count)
            .map(|core| {
                restored_config
                    .effective_core(core)
                    .map(|c| c.max_mv.min(0))
                    .unwrap_or(0)
            })
            .collect();
        if let Err(e) = self.writer.apply_all(&offsets).await {
            error!("Failed to restore last-known-good offsets: {}", e);
            if let Err(reset) = self.writer.reset_all().await {
                error!("Reset to 0 mV after failed restore also failed: {}", reset);
            }
        }
        self.store.save_dynamic_config(&restored_config)?;

        match (&marker.operation, marker.in_flight_mv) {
            (RiskyOperation::Binning, Some(value)) => {
                let mut state = self.store.load_binning_state()?.unwrap_or_default();
                if !state.failed_values.contains(&value) {
                    state.failed_values.push(value);
                }
                if !state.crashed_values.contains(&value) {
                    state.crashed_values.push(value);
                }
                state.active = false;
                state.timestamp = Utc::now();
                self.store.save_binning_state(&state)?;
                info!("Marked binning value {} mV as failed", value);
            }
            (
                RiskyOperation::Wizard {
                    core_id,
                    frequency_mhz,
                },
                Some(value),
            ) => {
                if let Some(mut session) = self.store.load_wizard_session()? {
                    session.failed_probes.push(FailedProbe {
                        core_id: *core_id,
                        frequency_mhz: *frequency_mhz,
                        voltage_mv: value,
                    });
                    self.store.save_wizard_session(&session)?;
                    info!(
                        "Marked wizard probe core {} @ {} MHz / {} mV as failed",
                        core_id, frequency_mhz, value
                    );
                }
            }
            _ => {}
        }

        let restored_values = self.writer.applied().await;
        let record = CrashRecord::new("boot_recovery", marker.applied_mv.clone(), restored_values);
        self.store.append_crash(record.clone())?;
        self.store.clear_marker()?;
        self.emit_crash(&record);

        Ok(Some(BootRecovery {
            record,
            restored_config,
            operation: marker.operation,
        }))
    }

    fn set_phase(&self, inner: &mut RecoveryInner, phase: RecoveryPhase, reason: &str) {
        if inner.phase == phase {
            return;
        }
        info!("Recovery {:?} -> {:?} ({})", inner.phase, phase, reason);
        self.events.emit_lossy(VoltEvent::RecoveryStateChanged {
            old_state: inner.phase,
            new_state: phase,
            reason: reason.to_string(),
            timestamp: Utc::now(),
        });
        inner.phase = phase;
    }

    async fn on_stable_cycle(&self, inner: &mut RecoveryInner, now: Instant) {
        let hold_cycles = self.settings.hold_cycles;
        let promote = match inner.hold.as_mut() {
            Some(hold) => {
                hold.stable_cycles += 1;
                hold.stable_cycles >= hold_cycles
            }
            None => {
                if let Some(lkg) = inner.lkg.observe(now) {
                    self.save_lkg(&lkg);
                }
                return;
            }
        };

        if promote {
            if let Some(hold) = inner.hold.take() {
                let lkg = LastKnownGood {
                    config: hold.reduced.clone(),
                    timestamp: Utc::now(),
                    stable_duration_secs: (self.settings.check_interval() * hold_cycles).as_secs(),
                };
                self.save_lkg(&lkg);
                inner.lkg.track_saved(hold.reduced, now);
                inner.watchdog.resync(&self.heartbeat);
                self.set_phase(inner, RecoveryPhase::Normal, "reduced config held stable");
            }
        }
    }

    async fn degrade(&self, inner: &mut RecoveryInner, now: Instant) {
        self.set_phase(inner, RecoveryPhase::Degraded, "missed heartbeats");
        self.persist_blackbox("watchdog_timeout");

        let Some(current) = self.target.active_config().await else {
            warn!("No active config to relax, disarming");
            inner.supervision = Supervision::Idle;
            self.set_phase(inner, RecoveryPhase::Normal, "controller inactive");
            return;
        };
        let fallback = match self.store.load_lkg() {
            Ok(Some(lkg)) => lkg.config,
            Ok(None) => DynamicConfig::zeroed(self.writer.core_count()),
            Err(e) => {
                error!("Failed to read last-known-good: {}", e);
                DynamicConfig::zeroed(self.writer.core_count())
            }
        };
        let reduced = current.relaxed_by(self.settings.recovery_delta_mv);

        let crashed = self.writer.applied().await;
        if let Err(e) = self.target.apply_config(&reduced).await {
            error!("Failed to apply relaxed config: {}", e);
            inner.hold = Some(Hold {
                reduced,
                fallback,
                stable_cycles: 0,
            });
            self.rollback(inner, "relaxed config could not be applied", now)
                .await;
            return;
        }
        let restored = self.writer.applied().await;
        self.record_crash(CrashRecord::new("watchdog_timeout", crashed, restored));

        info!(
            "Relaxed every core by {} mV, holding for {} cycles",
            self.settings.recovery_delta_mv, self.settings.hold_cycles
        );
        inner.lkg.track(reduced.clone(), now);
        inner.hold = Some(Hold {
            reduced,
            fallback,
            stable_cycles: 0,
        });
        inner.watchdog.resync(&self.heartbeat);
        self.set_phase(inner, RecoveryPhase::Recovering, "holding relaxed config");
    }

    async fn rollback(&self, inner: &mut RecoveryInner, reason: &str, now: Instant) {
        let Some(hold) = inner.hold.take() else {
            return;
        };
        self.set_phase(inner, RecoveryPhase::RollingBack, reason);
        self.persist_blackbox("rollback");

        let crashed = self.writer.applied().await;
        if let Err(e) = self.target.apply_config(&hold.fallback).await {
            error!("Rollback apply failed, resetting to 0 mV: {}", e);
            if let Err(reset) = self.writer.reset_all().await {
                error!("Reset after failed rollback also failed: {}", reset);
            }
        }
        let restored = self.writer.applied().await;
        self.record_crash(CrashRecord::new("rollback", crashed, restored));

        inner.lkg.track_saved(hold.fallback, now);
        inner.watchdog.resync(&self.heartbeat);
        inner.rollback_pending_beat = true;
        self.set_phase(inner, RecoveryPhase::Normal, "rolled back to last-known-good");
    }

    async fn emergency_reset(&self, inner: &mut RecoveryInner, reason: &str) {
        self.persist_blackbox(reason);
        let crashed = self.writer.applied().await;
        if let Err(e) = self.writer.reset_all().await {
            error!("Emergency reset failed: {}", e);
        }
        let restored = self.writer.applied().await;
        self.record_crash(CrashRecord::new(reason, crashed, restored));
        inner.hold = None;
        inner.lkg.clear();
    }

    fn save_lkg(&self, lkg: &LastKnownGood) {
        match self.store.save_lkg(lkg) {
            Ok(()) => {
                info!(
                    "Saved last-known-good after {} s of stability",
                    lkg.stable_duration_secs
                );
                self.events.emit_lossy(VoltEvent::LastKnownGoodSaved {
                    offsets_mv: lkg.config.floor_offsets(),
                    stable_secs: lkg.stable_duration_secs,
                    timestamp: Utc::now(),
                });
            }
            Err(e) => error!("Failed to save last-known-good: {}", e),
        }
    }

    fn record_crash(&self, record: CrashRecord) {
        if let Err(e) = self.store.append_crash(record.clone()) {
            error!("Failed to append crash record: {}", e);
        }
        self.emit_crash(&record);
    }

    fn emit_crash(&self, record: &CrashRecord) {
        self.events.emit_lossy(VoltEvent::CrashRecorded {
            reason: record.reason.clone(),
            crashed_mv: record.crashed_values.clone(),
            restored_mv: record.restored_values.clone(),
            timestamp: record.timestamp,
        });
    }

    fn persist_blackbox(&self, reason: &str) {
        match self.blackbox.persist(&self.store, reason, self.blackbox_keep) {
            Ok(_) => self.events.emit_lossy(VoltEvent::BlackBoxSaved {
                reason: reason.to_string(),
                samples: self.blackbox.len(),
                timestamp: Utc::now(),
            }),
            Err(e) => error!("Failed to persist BlackBox ({}): {}", reason, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curve::CoreConfig;
    use crate::hardware::sim::SimulatedHardware;
    use crate::store::RiskyMarker;
    use tempfile::TempDir;

    /// Records configs handed over by the recovery manager
    struct FakeTarget {
        writer: Arc<VoltageWriter>,
        active: std::sync::Mutex<Option<DynamicConfig>>,
        applied: std::sync::Mutex<Vec<DynamicConfig>>,
    }

    #[async_trait]
    impl RecoveryTarget for FakeTarget {
        async fn active_config(&self) -> Option<DynamicConfig> {
            self.active.lock().unwrap().clone()
        }

        async fn apply_config(&self, config: &DynamicConfig) -> Result<()> {
            let offsets: Vec<i32> = config.cores.iter().map(|c| c.min_mv).collect();
            self.writer.apply_all(&offsets).await?;
            *self.active.lock().unwrap() = Some(config.clone());
            self.applied.lock().unwrap().push(config.clone());
            Ok(())
        }
    }

    struct Fixture {
        _dir: TempDir,
        sim: Arc<SimulatedHardware>,
        store: Arc<StateStore>,
        writer: Arc<VoltageWriter>,
        heartbeat: Arc<Heartbeat>,
        target: Arc<FakeTarget>,
        manager: RecoveryManager,
    }

    fn settings() -> WatchdogSettings {
        WatchdogSettings {
            check_interval_ms: 1000,
            missed_limit: 1,
            recovery_delta_mv: 5,
            hold_cycles: 2,
            lkg_dwell_secs: 30,
        }
    }

    fn fixture(settings: WatchdogSettings) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).unwrap());
        let sim = Arc::new(SimulatedHardware::new(4));
        let writer = Arc::new(VoltageWriter::new(sim.clone(), 4));
        let heartbeat = Arc::new(Heartbeat::new());
        let target = Arc::new(FakeTarget {
            writer: writer.clone(),
            active: std::sync::Mutex::new(None),
            applied: std::sync::Mutex::new(Vec::new()),
        });
        let manager = RecoveryManager::new(
            store.clone(),
            writer.clone(),
            Arc::new(BlackBox::new(60)),
            Arc::new(EventBus::new(64)),
            heartbeat.clone(),
            target.clone(),
            settings,
            5,
        );
        Fixture {
            _dir: dir,
            sim,
            store,
            writer,
            heartbeat,
            target,
            manager,
        }
    }

    fn config(offsets: [i32; 4]) -> DynamicConfig {
        let mut config = DynamicConfig::zeroed(4);
        for (core, mv) in offsets.iter().enumerate() {
            config.cores[core] = CoreConfig::new(core, *mv, (*mv + 10).min(0), 50.0);
        }
        config
    }

    async fn run_config(f: &Fixture, config: &DynamicConfig, now: Instant) {
        f.target.apply_config(config).await.unwrap();
        f.manager.arm_controller(config.clone(), now).await;
    }

    #[test]
    fn test_lkg_requires_full_dwell() {
        let start = Instant::now();
        let mut tracker = LkgTracker::new(Duration::from_secs(30));
        tracker.track(config([-20; 4]), start);

        assert!(tracker.observe(start + Duration::from_secs(29)).is_none());
        tracker.instability(start + Duration::from_secs(29));
        assert!(tracker.observe(start + Duration::from_secs(30)).is_none());
        assert!(tracker.observe(start + Duration::from_secs(58)).is_none());

        let lkg = tracker.observe(start + Duration::from_secs(59)).unwrap();
        assert_eq!(lkg.stable_duration_secs, 30);
        // Written once per dwell
        assert!(tracker.observe(start + Duration::from_secs(90)).is_none());
    }

    #[tokio::test]
    async fn test_lkg_written_after_30s_of_beats() {
        let f = fixture(settings());
        let start = Instant::now();
        let cfg = config([-20; 4]);
        run_config(&f, &cfg, start).await;

        for second in 1..=29 {
            f.heartbeat.beat();
            f.manager.evaluate(start + Duration::from_secs(second)).await;
        }
        assert!(f.store.load_lkg().unwrap().is_none());

        f.heartbeat.beat();
        f.manager.evaluate(start + Duration::from_secs(30)).await;
        assert_eq!(f.store.load_lkg().unwrap().map(|l| l.config), Some(cfg));
    }

    #[tokio::test]
    async fn test_instability_at_29s_prevents_lkg() {
        let f = fixture(settings());
        let start = Instant::now();
        run_config(&f, &config([-20; 4]), start).await;

        for second in 1..=28 {
            f.heartbeat.beat();
            f.manager.evaluate(start + Duration::from_secs(second)).await;
        }
        f.manager
            .report_instability("test failure", start + Duration::from_secs(29))
            .await;
        for second in 30..=45 {
            f.heartbeat.beat();
            f.manager.evaluate(start + Duration::from_secs(second)).await;
        }
        assert!(f.store.load_lkg().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missed_heartbeat_relaxes_every_core_by_delta() {
        let f = fixture(settings());
        let start = Instant::now();
        run_config(&f, &config([-30, -20, -12, -3]), start).await;

        f.manager.evaluate(start + Duration::from_secs(1)).await;
        assert_eq!(f.manager.phase().await, RecoveryPhase::Recovering);

        let relaxed = f.target.active_config().await.unwrap();
        let mins: Vec<i32> = relaxed.cores.iter().map(|c| c.min_mv).collect();
        assert_eq!(mins, vec![-25, -15, -7, 0]);
        assert_eq!(f.writer.applied().await, vec![-25, -15, -7, 0]);
    }

    #[tokio::test]
    async fn test_two_stable_cycles_promote_reduced_config() {
        let f = fixture(settings());
        let start = Instant::now();
        run_config(&f, &config([-30; 4]), start).await;
        f.manager.evaluate(start + Duration::from_secs(1)).await;

        f.heartbeat.beat();
        f.manager.evaluate(start + Duration::from_secs(2)).await;
        assert_eq!(f.manager.phase().await, RecoveryPhase::Recovering);
        assert!(f.store.load_lkg().unwrap().is_none());

        f.heartbeat.beat();
        f.manager.evaluate(start + Duration::from_secs(3)).await;
        assert_eq!(f.manager.phase().await, RecoveryPhase::Normal);
        let lkg = f.store.load_lkg().unwrap().unwrap();
        assert_eq!(lkg.config.cores[0].min_mv, -25);
    }

    #[tokio::test]
    async fn test_instability_during_hold_rolls_back_exactly() {
        let f = fixture(settings());
        let start = Instant::now();
        let good = config([-15, -15, -10, -10]);
        f.store
            .save_lkg(&LastKnownGood {
                config: good.clone(),
                timestamp: Utc::now(),
                stable_duration_secs: 60,
            })
            .unwrap();

        run_config(&f, &config([-30; 4]), start).await;
        f.manager.evaluate(start + Duration::from_secs(1)).await;
        f.heartbeat.beat();
        f.manager.evaluate(start + Duration::from_secs(2)).await;

        f.manager
            .report_instability("crash during hold", start + Duration::from_secs(3))
            .await;
        assert_eq!(f.manager.phase().await, RecoveryPhase::Normal);
        assert_eq!(f.target.active_config().await, Some(good.clone()));
        assert_eq!(f.store.load_lkg().unwrap().unwrap().config, good);

        let reasons: Vec<String> = f
            .store
            .load_crash_history()
            .unwrap()
            .records
            .into_iter()
            .map(|r| r.reason)
            .collect();
        assert_eq!(reasons, vec!["watchdog_timeout", "rollback"]);
    }

    #[tokio::test]
    async fn test_silence_after_rollback_resets_to_zero() {
        let f = fixture(settings());
        let start = Instant::now();
        run_config(&f, &config([-30; 4]), start).await;

        // Trip, then miss during hold -> rollback, then miss again
        f.manager.evaluate(start + Duration::from_secs(1)).await;
        f.manager.evaluate(start + Duration::from_secs(2)).await;
        f.manager.evaluate(start + Duration::from_secs(3)).await;
        assert_eq!(f.writer.applied().await, vec![0, 0, 0, 0]);
        f.manager.evaluate(start + Duration::from_secs(4)).await;
        let history = f.store.load_crash_history().unwrap();
        assert_eq!(
            history.records.last().map(|r| r.reason.as_str()),
            Some("watchdog_safe_reset")
        );
    }

    #[tokio::test]
    async fn test_calibration_supervision_cancels_run() {
        let f = fixture(settings());
        let cancel = CancellationToken::new();
        f.writer.apply_all(&[-20, -20, -20, -20]).await.unwrap();
        f.manager.arm_calibration(cancel.clone()).await;

        f.heartbeat.beat();
        f.manager.evaluate(Instant::now()).await;
        assert!(!cancel.is_cancelled());

        f.manager.evaluate(Instant::now()).await;
        assert!(cancel.is_cancelled());
        assert_eq!(f.writer.applied().await, vec![0, 0, 0, 0]);
    }

    #[tokio::test]
    async fn test_idle_manager_ignores_missed_beats() {
        let f = fixture(settings());
        f.manager.evaluate(Instant::now()).await;
        f.manager.evaluate(Instant::now()).await;
        assert_eq!(f.manager.phase().await, RecoveryPhase::Normal);
        assert!(f.target.applied.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_boot_recovery_restores_lkg_and_records_crash() {
        let f = fixture(settings());
        let good = config([-20; 4]);
        f.store
            .save_lkg(&LastKnownGood {
                config: good.clone(),
                timestamp: Utc::now(),
                stable_duration_secs: 45,
            })
            .unwrap();
        f.store
            .write_marker(&RiskyMarker::new(
                RiskyOperation::Binning,
                Some(-35),
                vec![-35, -35, -35, -35],
            ))
            .unwrap();

        let recovery = f.manager.boot_recovery().await.unwrap().unwrap();
        assert_eq!(recovery.record.reason, "boot_recovery");
        assert_eq!(recovery.restored_config, good);
        assert_eq!(f.writer.applied().await, vec![-10, -10, -10, -10]);
        assert!(f.store.read_marker().unwrap().is_none());
        assert_eq!(f.store.load_dynamic_config().unwrap(), Some(good));

        let state = f.store.load_binning_state().unwrap().unwrap();
        assert_eq!(state.failed_values, vec![-35]);
        assert_eq!(state.crashed_values, vec![-35]);
        assert!(!state.active);

        // Marker consumed; second boot is clean
        assert!(f.manager.boot_recovery().await.unwrap().is_none());
        assert_eq!(f.store.load_crash_history().unwrap().total_count, 1);
    }

    #[tokio::test]
    async fn test_boot_recovery_survives_failed_writes() {
        let f = fixture(settings());
        f.store
            .write_marker(&RiskyMarker::new(
                RiskyOperation::Controller,
                None,
                vec![-30; 4],
            ))
            .unwrap();
        f.sim.fail_writes(true);

        let recovery = f.manager.boot_recovery().await.unwrap().unwrap();
        assert_eq!(recovery.record.crashed_values, vec![-30; 4]);
        assert_eq!(recovery.record.restored_values, vec![0; 4]);
        assert!(f.store.read_marker().unwrap().is_none());
        assert_eq!(f.store.load_crash_history().unwrap().total_count, 1);
    }
}
