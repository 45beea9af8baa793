//! Simulated handheld
//!
//! Deterministic stand-in for every hardware capability. Used by the test
//! suite and by the daemon's `--simulate` flag.
//!
//! Stability model: a stress run is stable when every core's applied
//! offset is at or above the floor for the core's locked frequency
//! (`stability_floor_mv` unless overridden per frequency). Scripted
//! outcomes, if queued, take precedence.

use super::{
    CpuTimes, FanReading, GovernorControl, LoadPattern, MetricsSource, StressWorkload,
    VoltageSink, WorkloadReport,
};
use crate::error::HardwareError;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Ticks added to each core's counters per `cpu_times` read
const TICKS_PER_READ: u64 = 1000;

/// How the workload behaves when run
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkloadMode {
    /// Sleep for the requested duration, then report
    Normal,
    /// Never return
    Hang,
    /// Fail to start
    Error,
}

#[derive(Debug)]
struct SimState {
    applied: Vec<i32>,
    write_log: Vec<(usize, i32)>,
    fail_writes: bool,
    fail_write_core: Option<usize>,
    permission_denied: bool,

    loads: Vec<f32>,
    counters: Vec<CpuTimes>,
    frequencies: Vec<u32>,
    frequency_reads: usize,
    temperature_c: f32,
    stress_temperature_c: Option<f32>,
    failing_reads: HashSet<usize>,
    fan: Option<FanReading>,

    governors: Vec<String>,
    locked: Vec<Option<u32>>,

    stability_floor_mv: i32,
    frequency_floors: BTreeMap<u32, i32>,
    scripted: VecDeque<bool>,
    workload_mode: WorkloadMode,
    stress_running: bool,
    workload_runs: Vec<(LoadPattern, Vec<i32>)>,
}

/// Simulated device with `core_count` cores
#[derive(Debug)]
pub struct SimulatedHardware {
    state: Mutex<SimState>,
}

impl SimulatedHardware {
    pub fn new(core_count: usize) -> Self {
        Self {
            state: Mutex::new(SimState {
                applied: vec![0; core_count],
                write_log: Vec::new(),
                fail_writes: false,
                fail_write_core: None,
                permission_denied: false,
                loads: vec![0.0; core_count],
                counters: vec![CpuTimes::default(); core_count],
                frequencies: vec![1600; core_count],
                frequency_reads: 0,
                temperature_c: 55.0,
                stress_temperature_c: None,
                failing_reads: HashSet::new(),
                fan: Some(FanReading { rpm: 2400, pwm: 96 }),
                governors: vec!["schedutil".to_string(); core_count],
                locked: vec![None; core_count],
                stability_floor_mv: -20,
                frequency_floors: BTreeMap::new(),
                scripted: VecDeque::new(),
                workload_mode: WorkloadMode::Normal,
                stress_running: false,
                workload_runs: Vec::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- voltage -------------------------------------------------------

    pub fn applied(&self) -> Vec<i32> {
        self.state().applied.clone()
    }

    pub fn write_log(&self) -> Vec<(usize, i32)> {
        self.state().write_log.clone()
    }

    pub fn clear_write_log(&self) {
        self.state().write_log.clear();
    }

    pub fn fail_writes(&self, fail: bool) {
        self.state().fail_writes = fail;
    }

    pub fn fail_writes_on(&self, core_id: Option<usize>) {
        self.state().fail_write_core = core_id;
    }

    pub fn deny_permission(&self, denied: bool) {
        self.state().permission_denied = denied;
    }

    // --- metrics -------------------------------------------------------

    pub fn set_load(&self, core_id: usize, load_pct: f32) {
        if let Some(slot) = self.state().loads.get_mut(core_id) {
            *slot = load_pct;
        }
    }

    pub fn set_all_loads(&self, load_pct: f32) {
        for slot in self.state().loads.iter_mut() {
            *slot = load_pct;
        }
    }

    pub fn set_frequency(&self, core_id: usize, mhz: u32) {
        if let Some(slot) = self.state().frequencies.get_mut(core_id) {
            *slot = mhz;
        }
    }

    pub fn frequency_reads(&self) -> usize {
        self.state().frequency_reads
    }

    pub fn set_temperature(&self, celsius: f32) {
        self.state().temperature_c = celsius;
    }

    /// Temperature reported while a stress workload is running
    pub fn set_stress_temperature(&self, celsius: Option<f32>) {
        self.state().stress_temperature_c = celsius;
    }

    pub fn fail_reads(&self, core_id: usize, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing_reads.insert(core_id);
        } else {
            state.failing_reads.remove(&core_id);
        }
    }

    // --- governor ------------------------------------------------------

    pub fn governors(&self) -> Vec<String> {
        self.state().governors.clone()
    }

    pub fn set_governor(&self, core_id: usize, governor: &str) {
        if let Some(slot) = self.state().governors.get_mut(core_id) {
            *slot = governor.to_string();
        }
    }

    pub fn locked_frequency(&self, core_id: usize) -> Option<u32> {
        self.state().locked.get(core_id).copied().flatten()
    }

    // --- workload ------------------------------------------------------

    pub fn set_stability_floor(&self, floor_mv: i32) {
        self.state().stability_floor_mv = floor_mv;
    }

    pub fn set_frequency_floor(&self, frequency_mhz: u32, floor_mv: i32) {
        self.state().frequency_floors.insert(frequency_mhz, floor_mv);
    }

    /// Queue explicit outcomes (`true` = stable) consumed one per run
    pub fn script_outcomes(&self, outcomes: &[bool]) {
        self.state().scripted.extend(outcomes.iter().copied());
    }

    pub fn set_workload_mode(&self, mode: WorkloadMode) {
        self.state().workload_mode = mode;
    }

    pub fn is_stressing(&self) -> bool {
        self.state().stress_running
    }

    /// Every run so far with the offsets applied when it started
    pub fn workload_runs(&self) -> Vec<(LoadPattern, Vec<i32>)> {
        self.state().workload_runs.clone()
    }

    fn judge(state: &mut SimState) -> bool {
        if let Some(outcome) = state.scripted.pop_front() {
            return outcome;
        }
        state.applied.iter().enumerate().all(|(core_id, &offset)| {
            let floor = state
                .locked
                .get(core_id)
                .copied()
                .flatten()
                .and_then(|mhz| state.frequency_floors.get(&mhz).copied())
                .unwrap_or(state.stability_floor_mv);
            offset >= floor
        })
    }
}

impl VoltageSink for SimulatedHardware {
    fn apply(&self, core_id: usize, offset_mv: i32) -> Result<(), HardwareError> {
        let mut state = self.state();
        if state.permission_denied {
            return Err(HardwareError::Permission("simulated EACCES".to_string()));
        }
        if state.fail_writes || state.fail_write_core == Some(core_id) {
            return Err(HardwareError::Write {
                core_id,
                message: "simulated write failure".to_string(),
            });
        }
        let slot = state.applied.get_mut(core_id).ok_or_else(|| HardwareError::Write {
            core_id,
            message: "no such core".to_string(),
        })?;
        *slot = offset_mv;
        state.write_log.push((core_id, offset_mv));
        Ok(())
    }
}

impl MetricsSource for SimulatedHardware {
    fn cpu_times(&self, core_id: usize) -> Result<CpuTimes, HardwareError> {
        let mut state = self.state();
        if state.failing_reads.contains(&core_id) {
            return Err(HardwareError::Read {
                core_id,
                message: "simulated read failure".to_string(),
            });
        }
        let load = state
            .loads
            .get(core_id)
            .copied()
            .ok_or_else(|| HardwareError::Read {
                core_id,
                message: "no such core".to_string(),
            })?
            .clamp(0.0, 100.0);
        let busy = (TICKS_PER_READ as f32 * load / 100.0).round() as u64;
        let counters = &mut state.counters[core_id];
        counters.busy += busy;
        counters.idle += TICKS_PER_READ - busy;
        Ok(*counters)
    }

    fn frequency_mhz(&self, core_id: usize) -> Result<u32, HardwareError> {
        let mut state = self.state();
        if state.failing_reads.contains(&core_id) {
            return Err(HardwareError::Read {
                core_id,
                message: "simulated read failure".to_string(),
            });
        }
        state.frequency_reads += 1;
        let locked = state.locked.get(core_id).copied().flatten();
        let current = state.frequencies.get(core_id).copied();
        locked.or(current).ok_or_else(|| HardwareError::Read {
            core_id,
            message: "no such core".to_string(),
        })
    }

    fn temperature_c(&self) -> Result<f32, HardwareError> {
        let state = self.state();
        match (state.stress_running, state.stress_temperature_c) {
            (true, Some(hot)) => Ok(hot),
            _ => Ok(state.temperature_c),
        }
    }

    fn fan(&self) -> Option<FanReading> {
        self.state().fan
    }
}

impl GovernorControl for SimulatedHardware {
    fn governor(&self, core_id: usize) -> Result<String, HardwareError> {
        self.state()
            .governors
            .get(core_id)
            .cloned()
            .ok_or_else(|| HardwareError::Governor {
                core_id,
                message: "no such core".to_string(),
            })
    }

    fn lock_frequency(&self, core_id: usize, frequency_mhz: u32) -> Result<(), HardwareError> {
        let mut state = self.state();
        if core_id >= state.locked.len() {
            return Err(HardwareError::Governor {
                core_id,
                message: "no such core".to_string(),
            });
        }
        state.governors[core_id] = "userspace".to_string();
        state.locked[core_id] = Some(frequency_mhz);
        Ok(())
    }

    fn restore(&self, core_id: usize, governor: &str) -> Result<(), HardwareError> {
        let mut state = self.state();
        if core_id >= state.locked.len() {
            return Err(HardwareError::Governor {
                core_id,
                message: "no such core".to_string(),
            });
        }
        state.governors[core_id] = governor.to_string();
        state.locked[core_id] = None;
        Ok(())
    }
}

/// Clears the running flag even when the run future is dropped mid-sleep
struct StressGuard<'a>(&'a SimulatedHardware);

impl Drop for StressGuard<'_> {
    fn drop(&mut self) {
        self.0.state().stress_running = false;
    }
}

#[async_trait]
impl StressWorkload for SimulatedHardware {
    async fn run(
        &self,
        pattern: LoadPattern,
        duration: Duration,
    ) -> Result<WorkloadReport, HardwareError> {
        let mode = {
            let mut state = self.state();
            let snapshot = state.applied.clone();
            state.workload_runs.push((pattern, snapshot));
            state.workload_mode
        };

        match mode {
            WorkloadMode::Error => {
                return Err(HardwareError::Workload("simulated spawn failure".to_string()))
            }
            WorkloadMode::Hang => {
                let _guard = StressGuard(self);
                self.state().stress_running = true;
                std::future::pending::<()>().await;
            }
            WorkloadMode::Normal => {}
        }

        let _guard = StressGuard(self);
        self.state().stress_running = true;
        tokio::time::sleep(duration).await;

        let mut state = self.state();
        let stable = Self::judge(&mut state);
        Ok(WorkloadReport {
            errors_detected: !stable,
            detail: if stable {
                "simulated run passed".to_string()
            } else {
                "simulated verification errors".to_string()
            },
        })
    }
}
