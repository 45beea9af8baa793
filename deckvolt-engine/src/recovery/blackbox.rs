//! BlackBox flight recorder
//!
//! A fixed ring of recent control-loop samples, continuously overwritten.
//! On a crash or instability the ring is snapshotted to the store so the
//! last ~30 seconds before the event can be inspected later.

use crate::error::Result;
use crate::store::StateStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::info;

/// One ring entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackBoxSample {
    pub timestamp: DateTime<Utc>,
    pub temperature_c: f32,
    pub load_percent: f32,
    pub voltage_mv: [i32; 4],
    pub fan_rpm: u32,
    pub fan_pwm: u8,
}

/// Persisted snapshot of the ring
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlackBoxRecording {
    pub timestamp: DateTime<Utc>,
    pub reason: String,
    pub duration_sec: f64,
    pub samples: Vec<BlackBoxSample>,
}

pub struct BlackBox {
    capacity: usize,
    ring: Mutex<VecDeque<BlackBoxSample>>,
}

impl BlackBox {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn ring(&self) -> MutexGuard<'_, VecDeque<BlackBoxSample>> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, sample: BlackBoxSample) {
        let mut ring = self.ring();
        if ring.len() == self.capacity {
            ring.pop_front();
        }
        ring.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.ring().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring().is_empty()
    }

    /// Copy the ring, oldest sample first
    pub fn snapshot(&self, reason: &str) -> BlackBoxRecording {
        let samples: Vec<BlackBoxSample> = self.ring().iter().cloned().collect();
        let duration_sec = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) => {
                (last.timestamp - first.timestamp).num_milliseconds() as f64 / 1000.0
            }
            _ => 0.0,
        };
        BlackBoxRecording {
            timestamp: Utc::now(),
            reason: reason.to_string(),
            duration_sec,
            samples,
        }
    }

    /// Snapshot and write to the store, keeping the newest `keep` recordings
    pub fn persist(&self, store: &StateStore, reason: &str, keep: usize) -> Result<PathBuf> {
        let recording = self.snapshot(reason);
        let path = store.save_recording(&recording, keep)?;
        info!(
            "BlackBox saved {} samples ({}) to {}",
            recording.samples.len(),
            reason,
            path.display()
        );
        Ok(path)
    }
}
