// File: console/power_tracker/src/lib.rs

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

pub mod config;
pub mod error;
pub mod source;
pub mod tracker;

pub use config::{PollStrategy, TrackerConfig};
pub use error::{Result, TrackerError};
pub use source::StatusSource;
pub use tracker::PowerOperationTracker;


// Message shown in place of real progress when a status lookup fails
pub const POLL_FAILURE_MESSAGE: &str = "Failed to track operation status";

// Power actions a VM accepts

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    PowerOn,
    PowerOff,
    Suspend,
    Reset,
    Reboot,
    Shutdown,
    // Missing or not one of the above in a backend reply
    #[default]
    #[serde(other)]
    Unrecognized,
}

impl PowerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerAction::PowerOn => "power_on",
            PowerAction::PowerOff => "power_off",
            PowerAction::Suspend => "suspend",
            PowerAction::Reset => "reset",
            PowerAction::Reboot => "reboot",
            PowerAction::Shutdown => "shutdown",
            PowerAction::Unrecognized => "unrecognized",
        }
    }
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// VM power state as reported by the backend

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VmPowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
    PartiallyPoweredOff,
    PartiallySuspended,
    Resolved,
    Deployed,
    Unresolved,
    Unknown,
    #[serde(other)]
    Unrecognized,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    // completed and failed are the only statuses with no further transitions
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub id: String,
    pub status: TaskStatus,
    #[serde(rename = "type")]
    pub task_type: String,
}

// Operation descriptor returned by the status lookup. Only status, task and
// timestamp are guaranteed; the tracker fills in vm and action itself.

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PowerOperation {
    #[serde(default)]
    pub vm_id: String,
    #[serde(default)]
    pub action: PowerAction,
    pub status: VmPowerState,
    #[serde(default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub task: TaskDescriptor,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub vm_id: String,
    pub operation_id: String,
}

impl OperationKey {
    pub fn new(vm_id: impl Into<String>, operation_id: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
            operation_id: operation_id.into(),
        }
    }
    
    pub fn matches(&self, vm_id: &str, operation_id: Option<&str>) -> bool {
        self.vm_id == vm_id && operation_id.map_or(true, |op| self.operation_id == op)
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.vm_id, self.operation_id)
    }
}

// In-flight registration
#[derive(Clone, Debug)]
pub struct TrackedOperation {
    pub vm_id: String,
    pub operation_id: String,
    pub action: PowerAction,
    pub start_time: Instant,
}

impl TrackedOperation {
    pub fn key(&self) -> OperationKey {
        OperationKey::new(self.vm_id.clone(), self.operation_id.clone())
    }
    
    pub fn elapsed_ms(&self, now: Instant) -> u64 {
        now.saturating_duration_since(self.start_time).as_millis() as u64
    }
}

// Latest known state of one tracked operation, rebuilt every poll cycle

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationSnapshot {
    #[serde(flatten)]
    pub operation: PowerOperation,
    pub operation_id: String,
    pub is_tracking: bool,
    #[serde(rename = "elapsed")]
    pub elapsed_ms: u64,
}

impl OperationSnapshot {
    pub fn tracked(mut operation: PowerOperation, tracked: &TrackedOperation, now: Instant) -> Self {
        // The registration owns the key, whatever the backend echoes back
        operation.vm_id = tracked.vm_id.clone();
        if operation.action == PowerAction::Unrecognized {
            operation.action = tracked.action;
        }

        Self {
            operation,
            operation_id: tracked.operation_id.clone(),
            is_tracking: true,
            elapsed_ms: tracked.elapsed_ms(now),
        }
    }
    
    // Synthesized when the status lookup itself fails. Terminal, so it
    // is evicted like a real failure.
    pub fn unresolved(tracked: &TrackedOperation, now: Instant) -> Self {
        Self {
            operation: PowerOperation {
                vm_id: tracked.vm_id.clone(),
                action: tracked.action,
                status: VmPowerState::Unresolved,
                message: POLL_FAILURE_MESSAGE.to_string(),
                timestamp: Utc::now(),
                task: TaskDescriptor {
                    id: tracked.operation_id.clone(),
                    status: TaskStatus::Failed,
                    task_type: tracked.action.as_str().to_string(),
                },
            },
            operation_id: tracked.operation_id.clone(),
            is_tracking: false,
            elapsed_ms: tracked.elapsed_ms(now),
        }
    }
    
    pub fn key(&self) -> OperationKey {
        OperationKey::new(self.operation.vm_id.clone(), self.operation_id.clone())
    }
    
    pub fn is_terminal(&self) -> bool {
        self.operation.task.status.is_terminal()
    }
    
    // A failed poll and a failed operation both end up with a failed task;
    // only synthesized snapshots are not tracking.
    pub fn is_poll_failure(&self) -> bool {
        !self.is_tracking
    }
}
