//! Event types for the DeckVolt event system
//!
//! Provides shared event definitions and the EventBus used by the engine
//! to publish controller, calibration and recovery activity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Lifecycle of the dynamic controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Hardware fault; cores were reset to 0 mV
    Error,
}

impl std::fmt::Display for ControllerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControllerPhase::Stopped => "stopped",
            ControllerPhase::Starting => "starting",
            ControllerPhase::Running => "running",
            ControllerPhase::Stopping => "stopping",
            ControllerPhase::Error => "error",
        };
        f.write_str(name)
    }
}

/// Recovery state machine phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPhase {
    Normal,
    Degraded,
    Recovering,
    RollingBack,
}

/// Which calibration routine an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalibrationKind {
    Binning,
    Wizard,
}

/// DeckVolt event types
///
/// Events are broadcast via EventBus and serialize with a `type` tag so a
/// transport layer can forward them unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum VoltEvent {
    /// Controller moved to a new lifecycle phase
    ControllerStateChanged {
        old_state: ControllerPhase,
        new_state: ControllerPhase,
        timestamp: DateTime<Utc>,
    },

    /// One control-loop sample for one core
    ///
    /// High frequency; emitted lossy.
    CoreSampled {
        core_id: usize,
        load_pct: f32,
        frequency_mhz: u32,
        temperature_c: f32,
        /// Offset currently applied to the core
        applied_mv: i32,
        stale: bool,
        timestamp: DateTime<Utc>,
    },

    /// A new offset was written to a core
    VoltageApplied {
        core_id: usize,
        offset_mv: i32,
        timestamp: DateTime<Utc>,
    },

    /// Driver-boundary failure; all cores were reset to 0 mV
    HardwareFault {
        core_id: Option<usize>,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// Calibration progress tick
    CalibrationProgress {
        kind: CalibrationKind,
        session_id: Uuid,
        core_id: usize,
        frequency_mhz: Option<u32>,
        voltage_mv: i32,
        completed: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },

    /// Calibration run ended (completed, cancelled or aborted)
    CalibrationFinished {
        kind: CalibrationKind,
        session_id: Uuid,
        outcome: String,
        timestamp: DateTime<Utc>,
    },

    /// Recovery state machine moved
    RecoveryStateChanged {
        old_state: RecoveryPhase,
        new_state: RecoveryPhase,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// A configuration was promoted to last-known-good
    LastKnownGoodSaved {
        offsets_mv: Vec<i32>,
        stable_secs: u64,
        timestamp: DateTime<Utc>,
    },

    /// A crash record was appended to history
    CrashRecorded {
        reason: String,
        crashed_mv: Vec<i32>,
        restored_mv: Vec<i32>,
        timestamp: DateTime<Utc>,
    },

    /// BlackBox ring snapshotted to storage
    BlackBoxSaved {
        reason: String,
        samples: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Central event distribution bus
///
/// Wraps a tokio broadcast channel. Every subscriber receives every event
/// emitted after it subscribed; slow subscribers lag and lose the oldest
/// events.
pub struct EventBus {
    tx: broadcast::Sender<VoltEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    ///
    /// # Examples
    ///
    /// ```
    /// use deckvolt_common::events::EventBus;
    ///
    /// let event_bus = EventBus::new(256);
    /// assert_eq!(event_bus.capacity(), 256);
    /// ```
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<VoltEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists,
    /// `Err` if nobody is listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(&self, event: VoltEvent) -> Result<usize, broadcast::error::SendError<VoltEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: VoltEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
