//! Hardware boundary
//!
//! **Purpose:** The engine never writes voltages or reads counters itself.
//! It talks to the device through the traits below; `linux` provides the
//! procfs/sysfs/command adapters and `sim` a deterministic simulator.
//!
//! Voltage writes go through [`VoltageWriter`], which serializes writes per
//! core and remembers the last applied offset.

pub mod linux;
pub mod sim;

use crate::config::HardwareSettings;
use crate::error::HardwareError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Applies a per-core voltage offset
pub trait VoltageSink: Send + Sync {
    fn apply(&self, core_id: usize, offset_mv: i32) -> Result<(), HardwareError>;
}

/// Cumulative CPU time counters for one core
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuTimes {
    pub busy: u64,
    pub idle: u64,
}

impl CpuTimes {
    pub fn total(&self) -> u64 {
        self.busy + self.idle
    }
}

/// Fan speed and duty, when the platform exposes them
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanReading {
    pub rpm: u32,
    pub pwm: u8,
}

/// Raw CPU counter access
pub trait MetricsSource: Send + Sync {
    fn cpu_times(&self, core_id: usize) -> Result<CpuTimes, HardwareError>;
    fn frequency_mhz(&self, core_id: usize) -> Result<u32, HardwareError>;
    fn temperature_c(&self) -> Result<f32, HardwareError>;

    fn fan(&self) -> Option<FanReading> {
        None
    }
}

/// cpufreq governor control used to pin a core during calibration
pub trait GovernorControl: Send + Sync {
    fn governor(&self, core_id: usize) -> Result<String, HardwareError>;
    fn lock_frequency(&self, core_id: usize, frequency_mhz: u32) -> Result<(), HardwareError>;
    fn restore(&self, core_id: usize, governor: &str) -> Result<(), HardwareError>;
}

/// Shape of the stress load
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadPattern {
    /// Sustained full load
    Constant,
    /// Alternating bursts and idle gaps to provoke voltage droop
    Pulsating { load_ms: u64, idle_ms: u64 },
}

impl LoadPattern {
    /// 100 ms on, 100 ms off
    pub fn vdroop() -> Self {
        LoadPattern::Pulsating {
            load_ms: 100,
            idle_ms: 100,
        }
    }
}

/// What a workload reported after running to completion
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadReport {
    pub errors_detected: bool,
    pub detail: String,
}

/// External stress workload
///
/// Implementations must stop their work when the returned future is dropped.
#[async_trait]
pub trait StressWorkload: Send + Sync {
    async fn run(
        &self,
        pattern: LoadPattern,
        duration: Duration,
    ) -> Result<WorkloadReport, HardwareError>;
}

/// Bundle of hardware capabilities handed to the engine
#[derive(Clone)]
pub struct Hardware {
    pub voltage: Arc<dyn VoltageSink>,
    pub metrics: Arc<dyn MetricsSource>,
    pub governor: Arc<dyn GovernorControl>,
    pub workload: Arc<dyn StressWorkload>,
}

impl Hardware {
    /// Route every capability to one simulator
    pub fn simulated(sim: Arc<sim::SimulatedHardware>) -> Self {
        Self {
            voltage: sim.clone(),
            metrics: sim.clone(),
            governor: sim.clone(),
            workload: sim,
        }
    }

    pub fn linux(settings: &HardwareSettings) -> Self {
        Self {
            voltage: Arc::new(linux::CommandVoltageSink::new(settings.voltage_command.clone())),
            metrics: Arc::new(linux::SysfsMetrics::new(settings)),
            governor: Arc::new(linux::SysfsGovernor::new(settings)),
            workload: Arc::new(linux::StressNg::new(settings)),
        }
    }
}

/// Serialized per-core voltage writes
///
/// One lock per core: writes to the same core never interleave, writes to
/// different cores proceed independently.
pub struct VoltageWriter {
    sink: Arc<dyn VoltageSink>,
    cores: Vec<Mutex<i32>>,
}

impl VoltageWriter {
    pub fn new(sink: Arc<dyn VoltageSink>, core_count: usize) -> Self {
        Self {
            sink,
            cores: (0..core_count).map(|_| Mutex::new(0)).collect(),
        }
    }

    pub fn core_count(&self) -> usize {
        self.cores.len()
    }

    /// Write `offset_mv` to `core_id`
    pub async fn apply(&self, core_id: usize, offset_mv: i32) -> Result<(), HardwareError> {
        let slot = self.cores.get(core_id).ok_or_else(|| HardwareError::Write {
            core_id,
            message: format!("no such core (have {})", self.cores.len()),
        })?;
        let mut applied = slot.lock().await;
        self.sink.apply(core_id, offset_mv)?;
        if *applied != offset_mv {
            debug!("core {} offset {} -> {} mV", core_id, *applied, offset_mv);
        }
        *applied = offset_mv;
        Ok(())
    }

    /// Write a full set of offsets, stopping at the first failure
    pub async fn apply_all(&self, offsets: &[i32]) -> Result<(), HardwareError> {
        for (core_id, &offset) in offsets.iter().enumerate().take(self.cores.len()) {
            self.apply(core_id, offset).await?;
        }
        Ok(())
    }

    /// Reset every core to 0 mV
    ///
    /// Attempts every core even after a failure and returns the first error.
    pub async fn reset_all(&self) -> Result<(), HardwareError> {
        let mut first_err = None;
        for core_id in 0..self.cores.len() {
            if let Err(e) = self.apply(core_id, 0).await {
                warn!("Failed to reset core {} to 0 mV: {}", core_id, e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Last offset successfully written to each core
    pub async fn applied(&self) -> Vec<i32> {
        let mut out = Vec::with_capacity(self.cores.len());
        for slot in &self.cores {
            out.push(*slot.lock().await);
        }
        out
    }

    pub async fn applied_on(&self, core_id: usize) -> Option<i32> {
        match self.cores.get(core_id) {
            Some(slot) => Some(*slot.lock().await),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::sim::SimulatedHardware;
    use super::*;

    #[tokio::test]
    async fn test_writer_tracks_applied_offsets() {
        let sim = Arc::new(SimulatedHardware::new(4));
        let writer = VoltageWriter::new(sim.clone(), 4);

        writer.apply(1, -20).await.unwrap();
        writer.apply_all(&[-5, -10]).await.unwrap();
        assert_eq!(writer.applied().await, vec![-5, -10, 0, 0]);
        assert_eq!(sim.applied(), vec![-5, -10, 0, 0]);

        assert!(writer.apply(9, -5).await.is_err());
        assert_eq!(writer.applied_on(9).await, None);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_value() {
        let sim = Arc::new(SimulatedHardware::new(2));
        let writer = VoltageWriter::new(sim.clone(), 2);
        writer.apply(0, -15).await.unwrap();

        sim.fail_writes(true);
        let err = writer.apply(0, -25).await.unwrap_err();
        assert!(matches!(err, HardwareError::Write { core_id: 0, .. }));
        assert_eq!(writer.applied_on(0).await, Some(-15));
    }

    #[tokio::test]
    async fn test_reset_all_attempts_every_core() {
        let sim = Arc::new(SimulatedHardware::new(3));
        let writer = VoltageWriter::new(sim.clone(), 3);
        writer.apply_all(&[-10, -10, -10]).await.unwrap();

        sim.fail_writes_on(Some(1));
        assert!(writer.reset_all().await.is_err());
        assert_eq!(writer.applied().await, vec![0, -10, 0]);
    }

    #[tokio::test]
    async fn test_concurrent_writes_to_one_core_serialize() {
        let sim = Arc::new(SimulatedHardware::new(1));
        let writer = Arc::new(VoltageWriter::new(sim.clone(), 1));

        let mut handles = Vec::new();
        for offset in [-5, -10, -15, -20] {
            let writer = writer.clone();
            handles.push(tokio::spawn(async move { writer.apply(0, offset).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let last = writer.applied_on(0).await.unwrap();
        assert_eq!(sim.applied()[0], last);
        assert_eq!(sim.write_log().len(), 4);
    }
}
