//! Stability test execution
//!
//! **Purpose:** Run one stress workload at the currently applied offsets and
//! classify the result, while watching temperature and cancellation.
//!
//! **Classification:**
//! - Stable: workload finished and reported no errors
//! - Unstable: workload reported errors or failed to run
//! - TimedOut: workload exceeded its duration plus the hang grace period
//! - TemperatureAbort: package temperature crossed the ceiling mid-run
//! - Interrupted: cancelled mid-run (not a failure)

use crate::hardware::{LoadPattern, StressWorkload, VoltageWriter};
use crate::metrics::MetricsSampler;
use crate::recovery::watchdog::Heartbeat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// Result of one stability test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Stable,
    Unstable,
    TimedOut,
    TemperatureAbort,
    Interrupted,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Outcome::Stable => "stable",
            Outcome::Unstable => "unstable",
            Outcome::TimedOut => "timed_out",
            Outcome::TemperatureAbort => "temperature_abort",
            Outcome::Interrupted => "interrupted",
        };
        f.write_str(name)
    }
}

pub struct StabilityTestRunner {
    workload: Arc<dyn StressWorkload>,
    sampler: Arc<MetricsSampler>,
    writer: Arc<VoltageWriter>,
    heartbeat: Arc<Heartbeat>,
    poll: Duration,
    hang_grace: Duration,
}

impl StabilityTestRunner {
    pub fn new(
        workload: Arc<dyn StressWorkload>,
        sampler: Arc<MetricsSampler>,
        writer: Arc<VoltageWriter>,
        heartbeat: Arc<Heartbeat>,
        poll: Duration,
        hang_grace: Duration,
    ) -> Self {
        Self {
            workload,
            sampler,
            writer,
            heartbeat,
            poll: poll.max(Duration::from_millis(1)),
            hang_grace,
        }
    }

    /// Run `pattern` for `duration` and classify the result
    ///
    /// Above `temperature_ceiling_c` every core is reset to 0 mV before
    /// returning. Dropping the workload future stops the workload.
    pub async fn run(
        &self,
        pattern: LoadPattern,
        duration: Duration,
        temperature_ceiling_c: f32,
        cancel: &CancellationToken,
    ) -> Outcome {
        let work = tokio::time::timeout(
            duration + self.hang_grace,
            self.workload.run(pattern, duration),
        );
        tokio::pin!(work);

        let mut poll = tokio::time::interval(self.poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Stability test interrupted");
                    return Outcome::Interrupted;
                }
                result = &mut work => {
                    return match result {
                        Err(_) => {
                            warn!(
                                "Workload exceeded {:?} (+{:?} grace), killed",
                                duration, self.hang_grace
                            );
                            Outcome::TimedOut
                        }
                        Ok(Err(e)) => {
                            warn!("Workload failed: {}", e);
                            Outcome::Unstable
                        }
                        Ok(Ok(report)) if report.errors_detected => {
                            debug!("Workload reported errors: {}", report.detail);
                            Outcome::Unstable
                        }
                        Ok(Ok(_)) => Outcome::Stable,
                    };
                }
                _ = poll.tick() => {
                    self.heartbeat.beat();
                    match self.sampler.temperature() {
                        Ok(celsius) if celsius > temperature_ceiling_c => {
                            error!(
                                "Temperature {:.1}°C above {:.1}°C ceiling, resetting to 0 mV",
                                celsius, temperature_ceiling_c
                            );
                            if let Err(e) = self.writer.reset_all().await {
                                error!("Reset after temperature abort failed: {}", e);
                            }
                            return Outcome::TemperatureAbort;
                        }
                        Ok(_) => {}
                        Err(e) => warn!("Temperature read failed during test: {}", e),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MetricsSettings;
    use crate::hardware::sim::{SimulatedHardware, WorkloadMode};
    use tokio::time::Instant;

    fn runner(sim: &Arc<SimulatedHardware>) -> (StabilityTestRunner, Arc<VoltageWriter>, Arc<Heartbeat>) {
        let writer = Arc::new(VoltageWriter::new(sim.clone(), 4));
        let heartbeat = Arc::new(Heartbeat::new());
        let runner = StabilityTestRunner::new(
            sim.clone(),
            Arc::new(MetricsSampler::new(sim.clone(), 4, &MetricsSettings::default())),
            writer.clone(),
            heartbeat.clone(),
            Duration::from_millis(500),
            Duration::from_secs(30),
        );
        (runner, writer, heartbeat)
    }

    #[tokio::test(start_paused = true)]
    async fn test_classifies_by_applied_floor() {
        let sim = Arc::new(SimulatedHardware::new(4));
        sim.set_stability_floor(-20);
        let (runner, writer, heartbeat) = runner(&sim);
        let cancel = CancellationToken::new();

        writer.apply_all(&[-20; 4]).await.unwrap();
        let outcome = runner
            .run(LoadPattern::Constant, Duration::from_secs(10), 85.0, &cancel)
            .await;
        assert_eq!(outcome, Outcome::Stable);
        assert!(heartbeat.beats() >= 10);

        writer.apply_all(&[-25; 4]).await.unwrap();
        let outcome = runner
            .run(LoadPattern::Constant, Duration::from_secs(10), 85.0, &cancel)
            .await;
        assert_eq!(outcome, Outcome::Unstable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_workload_times_out() {
        let sim = Arc::new(SimulatedHardware::new(4));
        sim.set_workload_mode(WorkloadMode::Hang);
        let (runner, _, _) = runner(&sim);

        let started = Instant::now();
        let outcome = runner
            .run(LoadPattern::Constant, Duration::from_secs(10), 85.0, &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::TimedOut);
        assert_eq!(started.elapsed(), Duration::from_secs(40));
        assert!(!sim.is_stressing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_workload_error_is_unstable() {
        let sim = Arc::new(SimulatedHardware::new(4));
        sim.set_workload_mode(WorkloadMode::Error);
        let (runner, _, _) = runner(&sim);
        let outcome = runner
            .run(LoadPattern::vdroop(), Duration::from_secs(10), 85.0, &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::Unstable);
    }

    #[tokio::test(start_paused = true)]
    async fn test_temperature_abort_resets_voltage() {
        let sim = Arc::new(SimulatedHardware::new(4));
        sim.set_stress_temperature(Some(90.0));
        let (runner, writer, _) = runner(&sim);
        writer.apply_all(&[-15; 4]).await.unwrap();

        let outcome = runner
            .run(LoadPattern::Constant, Duration::from_secs(60), 85.0, &CancellationToken::new())
            .await;
        assert_eq!(outcome, Outcome::TemperatureAbort);
        assert_eq!(sim.applied(), vec![0, 0, 0, 0]);
        assert!(!sim.is_stressing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_within_poll() {
        let sim = Arc::new(SimulatedHardware::new(4));
        let (runner, _, _) = runner(&sim);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let outcome = runner
            .run(LoadPattern::Constant, Duration::from_secs(60), 85.0, &cancel)
            .await;
        assert_eq!(outcome, Outcome::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(!sim.is_stressing());
    }
}
