//! Stepwise voltage search
//!
//! **Purpose:** The one search primitive shared by binning and the
//! frequency wizard: walk an offset down from a start value until the
//! device stops being stable.
//!
//! **Algorithm:**
//! 1. Test `start_mv`
//! 2. Stable: record it, step down by `step_mv`; if that value already
//!    failed during this search, stop with the stable value as the answer
//! 3. Unstable after a success: stop, the last stable value is the answer
//! 4. Unstable before any success: back off one step toward 0 and retry,
//!    at most `consecutive_fail_limit` times in a row
//! 5. Stop below `floor_mv`, above 0 mV, at `max_iterations`, on
//!    cancellation, or on a safety abort

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Search parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSearch {
    pub start_mv: i32,
    pub step_mv: i32,
    /// Most aggressive value that may be tested
    pub floor_mv: i32,
    pub max_iterations: u32,
    pub consecutive_fail_limit: u32,
}

/// Result of testing one value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepVerdict {
    Stable,
    Unstable,
    /// Safety condition (temperature) ended the whole search
    Abort(String),
    Cancelled,
}

/// Why a search ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StopReason {
    FirstFailure,
    Floor,
    MaxIterations,
    ConsecutiveFailures,
    Cancelled,
    SafetyAbort(String),
}

impl StopReason {
    /// Ended by the search itself rather than an outside event
    pub fn is_completion(&self) -> bool {
        matches!(
            self,
            StopReason::FirstFailure
                | StopReason::Floor
                | StopReason::MaxIterations
                | StopReason::ConsecutiveFailures
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchOutcome {
    pub last_stable: Option<i32>,
    pub iterations: u32,
    pub failed_values: Vec<i32>,
    pub stop: StopReason,
}

/// Search position handed to the probe before each test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchProgress {
    pub current_mv: i32,
    pub iteration: u32,
    pub last_stable: Option<i32>,
    pub failed_values: Vec<i32>,
}

/// Runs one stability test for the search
#[async_trait]
pub trait StepProbe: Send {
    /// Called before each real test; persist state here
    async fn before_test(&mut self, progress: &SearchProgress) -> Result<()>;

    async fn test(&mut self, offset_mv: i32) -> Result<StepVerdict>;

    /// Values known to crash the device count as failures without testing
    fn known_failure(&self, _offset_mv: i32) -> bool {
        false
    }
}

pub async fn step_search<P: StepProbe + ?Sized>(
    params: &StepSearch,
    probe: &mut P,
    cancel: &CancellationToken,
) -> Result<SearchOutcome> {
    let step = params.step_mv.max(1);
    let mut value = params.start_mv;
    let mut iterations = 0u32;
    let mut last_stable = None;
    let mut failed_values = Vec::new();
    let mut consecutive_failures = 0u32;

    let stop = loop {
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }
        if value < params.floor_mv {
            break StopReason::Floor;
        }
        if value > 0 {
            break StopReason::ConsecutiveFailures;
        }
        if iterations >= params.max_iterations {
            break StopReason::MaxIterations;
        }
        iterations += 1;

        let verdict = if probe.known_failure(value) {
            info!("Skipping {} mV, previously crashed the device", value);
            StepVerdict::Unstable
        } else {
            let progress = SearchProgress {
                current_mv: value,
                iteration: iterations,
                last_stable,
                failed_values: failed_values.clone(),
            };
            probe.before_test(&progress).await?;
            probe.test(value).await?
        };
        debug!("Step {} at {} mV: {:?}", iterations, value, verdict);

        match verdict {
            StepVerdict::Stable => {
                last_stable = Some(value);
                consecutive_failures = 0;
                value -= step;
                // The next value down already failed in this search
                if failed_values.contains(&value) {
                    break StopReason::FirstFailure;
                }
            }
            StepVerdict::Unstable => {
                failed_values.push(value);
                consecutive_failures += 1;
                if last_stable.is_some() {
                    break StopReason::FirstFailure;
                }
                if consecutive_failures >= params.consecutive_fail_limit {
                    break StopReason::ConsecutiveFailures;
                }
                value += step;
            }
            StepVerdict::Abort(reason) => break StopReason::SafetyAbort(reason),
            StepVerdict::Cancelled => break StopReason::Cancelled,
        }
    };

    Ok(SearchOutcome {
        last_stable,
        iterations,
        failed_values,
        stop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays scripted verdicts and records what was tested
    #[derive(Default)]
    struct ScriptedProbe {
        verdicts: VecDeque<StepVerdict>,
        tested: Vec<i32>,
        before: Vec<SearchProgress>,
        crashed: Vec<i32>,
    }

    impl ScriptedProbe {
        fn new(verdicts: &[StepVerdict]) -> Self {
            Self {
                verdicts: verdicts.iter().cloned().collect(),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl StepProbe for ScriptedProbe {
        async fn before_test(&mut self, progress: &SearchProgress) -> Result<()> {
            self.before.push(progress.clone());
            Ok(())
        }

        async fn test(&mut self, offset_mv: i32) -> Result<StepVerdict> {
            self.tested.push(offset_mv);
            Ok(self.verdicts.pop_front().unwrap_or(StepVerdict::Unstable))
        }

        fn known_failure(&self, offset_mv: i32) -> bool {
            self.crashed.contains(&offset_mv)
        }
    }

    fn params() -> StepSearch {
        StepSearch {
            start_mv: -10,
            step_mv: 5,
            floor_mv: -100,
            max_iterations: 20,
            consecutive_fail_limit: 3,
        }
    }

    use StepVerdict::{Stable, Unstable};

    #[tokio::test]
    async fn test_stops_at_first_failure_after_success() {
        let mut probe = ScriptedProbe::new(&[Stable, Stable, Stable, Unstable]);
        let outcome = step_search(&params(), &mut probe, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(probe.tested, vec![-10, -15, -20, -25]);
        assert_eq!(outcome.last_stable, Some(-20));
        assert_eq!(outcome.iterations, 4);
        assert_eq!(outcome.failed_values, vec![-25]);
        assert_eq!(outcome.stop, StopReason::FirstFailure);
    }

    #[tokio::test]
    async fn test_backs_off_when_start_fails() {
        let mut probe = ScriptedProbe::new(&[Unstable, Stable, Stable]);
        let outcome = step_search(&params(), &mut probe, &CancellationToken::new())
            .await
            .unwrap();

        // -10 already failed, so the search ends at -5 without retesting it
        assert_eq!(probe.tested, vec![-10, -5]);
        assert_eq!(outcome.last_stable, Some(-5));
        assert_eq!(outcome.failed_values, vec![-10]);
        assert_eq!(outcome.iterations, 2);
        assert_eq!(outcome.stop, StopReason::FirstFailure);
    }

    #[tokio::test]
    async fn test_gives_up_after_consecutive_failures() {
        let mut probe = ScriptedProbe::new(&[]);
        let mut p = params();
        p.start_mv = -20;
        let outcome = step_search(&p, &mut probe, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(probe.tested, vec![-20, -15, -10]);
        assert_eq!(outcome.last_stable, None);
        assert_eq!(outcome.stop, StopReason::ConsecutiveFailures);
    }

    #[tokio::test]
    async fn test_never_backs_off_above_zero() {
        let mut probe = ScriptedProbe::new(&[]);
        let mut p = params();
        p.start_mv = -5;
        let outcome = step_search(&p, &mut probe, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(probe.tested, vec![-5, 0]);
        assert_eq!(outcome.stop, StopReason::ConsecutiveFailures);
    }

    #[tokio::test]
    async fn test_floor_and_max_iterations() {
        let mut probe = ScriptedProbe::new(&vec![Stable; 10]);
        let mut p = params();
        p.floor_mv = -25;
        let outcome = step_search(&p, &mut probe, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(probe.tested, vec![-10, -15, -20, -25]);
        assert_eq!(outcome.last_stable, Some(-25));
        assert_eq!(outcome.stop, StopReason::Floor);

        let mut probe = ScriptedProbe::new(&vec![Stable; 10]);
        let mut p = params();
        p.max_iterations = 2;
        let outcome = step_search(&p, &mut probe, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.last_stable, Some(-15));
        assert_eq!(outcome.stop, StopReason::MaxIterations);
    }

    #[tokio::test]
    async fn test_known_failures_skip_testing() {
        let mut probe = ScriptedProbe::new(&[Stable, Stable]);
        probe.crashed = vec![-20];
        let outcome = step_search(&params(), &mut probe, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(probe.tested, vec![-10, -15]);
        assert_eq!(probe.before.len(), 2);
        assert_eq!(outcome.last_stable, Some(-15));
        assert_eq!(outcome.failed_values, vec![-20]);
        assert_eq!(outcome.iterations, 3);
    }

    #[tokio::test]
    async fn test_abort_and_cancel() {
        let mut probe = ScriptedProbe::new(&[Stable, StepVerdict::Abort("temperature".into())]);
        let outcome = step_search(&params(), &mut probe, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.last_stable, Some(-10));
        assert_eq!(outcome.stop, StopReason::SafetyAbort("temperature".into()));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut probe = ScriptedProbe::new(&[Stable]);
        let outcome = step_search(&params(), &mut probe, &cancel).await.unwrap();
        assert!(probe.tested.is_empty());
        assert_eq!(outcome.stop, StopReason::Cancelled);
    }

    #[tokio::test]
    async fn test_progress_reports_search_position() {
        let mut probe = ScriptedProbe::new(&[Stable, Unstable]);
        step_search(&params(), &mut probe, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(probe.before[1].current_mv, -15);
        assert_eq!(probe.before[1].iteration, 2);
        assert_eq!(probe.before[1].last_stable, Some(-10));
    }
}
