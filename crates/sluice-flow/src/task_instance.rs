//! Task instances: one execution of a task within a DAG instance.
//!
//! The task state machine:
//!
//! ```text
//!                  ┌──────────► retrying ──► init (re-entry)
//!                  │
//! init ──► running ──► ending ──► success
//!   │         │           │
//!   │         └───────────┴────► failed | canceled
//!   │
//!   └──► skipped | blocked        (pre-check outcomes)
//!
//! blocked ──continue──► continue (init-equivalent re-entry)
//! ```
//!
//! Reaching `success` requires the action's `run` to have returned Ok.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use sluice_core::{DagInstanceId, TaskInstanceId};

use crate::dag::{CheckAction, PreChecks, Task};
use crate::dag_instance::DagInstance;
use crate::error::{Error, Result};

/// Status of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskInstanceStatus {
    /// Created, waiting for its dependencies and a worker slot.
    Init,
    /// Canceled by a user command (or failed after its token was canceled).
    Canceled,
    /// The action's `run` is executing.
    Running,
    /// `run` returned; the after-hook has not completed yet.
    Ending,
    /// The action failed or panicked.
    Failed,
    /// A retry command re-entered the task; it will pass back through `init`.
    Retrying,
    /// Completed successfully.
    Success,
    /// A pre-check blocked the task.
    Blocked,
    /// A pre-check skipped the task; descendants may still run.
    Skipped,
    /// A continue command re-entered a blocked task. Equivalent to `init` for
    /// executability and pre-check handling.
    Continue,
}

impl TaskInstanceStatus {
    /// Returns true if the status may enter the executor's run loop.
    #[must_use]
    pub const fn is_runnable_entry(&self) -> bool {
        matches!(
            self,
            Self::Init | Self::Retrying | Self::Ending | Self::Continue
        )
    }

    /// Returns true if children of a node in this status may execute.
    #[must_use]
    pub const fn allows_child_execution(&self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }

    /// Returns true if this is a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Canceled | Self::Skipped
        )
    }

    /// Returns true if the transition from self to target is valid.
    #[must_use]
    pub const fn can_transition_to(&self, target: Self) -> bool {
        match self {
            Self::Init | Self::Continue => matches!(
                target,
                Self::Running | Self::Failed | Self::Canceled | Self::Skipped | Self::Blocked
            ),
            Self::Running => matches!(target, Self::Ending | Self::Failed | Self::Canceled),
            Self::Ending => matches!(target, Self::Success | Self::Failed | Self::Canceled),
            Self::Retrying => matches!(target, Self::Init | Self::Failed | Self::Canceled),
            Self::Failed | Self::Canceled => matches!(target, Self::Retrying),
            Self::Blocked => matches!(target, Self::Continue),
            Self::Success => false,
            Self::Skipped => false,
        }
    }

    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Canceled => "canceled",
            Self::Running => "running",
            Self::Ending => "ending",
            Self::Failed => "failed",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Blocked => "blocked",
            Self::Skipped => "skipped",
            Self::Continue => "continue",
        }
    }
}

impl fmt::Display for TaskInstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// One timestamped trace line recorded by an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceInfo {
    /// Seconds since the Unix epoch.
    pub time: i64,
    /// The message.
    pub message: String,
}

impl TraceInfo {
    /// Creates a trace stamped with the current time.
    #[must_use]
    pub fn now(message: impl Into<String>) -> Self {
        Self {
            time: Utc::now().timestamp(),
            message: message.into(),
        }
    }
}

/// One execution of a task within a DAG instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskInstance {
    /// Engine-minted identifier; empty until persisted.
    #[serde(default = "empty_task_ins_id")]
    pub id: TaskInstanceId,
    /// The template task this instance executes; unique within the DAG
    /// instance.
    pub task_id: String,
    /// The owning DAG instance.
    pub dag_ins_id: DagInstanceId,
    /// Display name copied from the template.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Template task ids this instance depends on.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depend_on: Vec<String>,
    /// Registry name of the action to execute.
    pub action_name: String,
    /// Effective timeout in seconds (engine default already applied).
    #[serde(default)]
    pub timeout_secs: u64,
    /// Rendered action parameters.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    /// Append-only trace log.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub traces: Vec<TraceInfo>,
    /// Current status.
    pub status: TaskInstanceStatus,
    /// Human-readable reason for the current status.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Pre-checks copied from the template.
    #[serde(default, skip_serializing_if = "PreChecks::is_empty")]
    pub pre_checks: PreChecks,
    /// Bumped by the store on every write.
    #[serde(default = "Utc::now")]
    pub updated_at: chrono::DateTime<Utc>,
}

fn empty_task_ins_id() -> TaskInstanceId {
    TaskInstanceId::new("")
}

impl TaskInstance {
    /// Materializes an instance from a template task, in `init` status.
    #[must_use]
    pub fn from_task(dag_ins_id: DagInstanceId, task: &Task) -> Self {
        Self {
            id: empty_task_ins_id(),
            task_id: task.id.clone(),
            dag_ins_id,
            name: task.name.clone(),
            depend_on: task.depend_on.clone(),
            action_name: task.action_name.clone(),
            timeout_secs: task.timeout_secs,
            params: task.params.clone(),
            traces: Vec::new(),
            status: TaskInstanceStatus::Init,
            reason: String::new(),
            pre_checks: task.pre_checks.clone(),
            updated_at: Utc::now(),
        }
    }

    /// Applies a status transition locally, validating legality.
    ///
    /// Persistence is the caller's concern; the executor patches the store
    /// after every transition.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidStateTransition`] for illegal transitions.
    pub fn set_status(&mut self, status: TaskInstanceStatus) -> Result<()> {
        if !self.status.can_transition_to(status) {
            return Err(Error::InvalidStateTransition {
                from: self.status.as_label().to_string(),
                to: status.as_label().to_string(),
            });
        }
        self.status = status;
        Ok(())
    }

    /// Evaluates pre-checks against the DAG instance, in insertion order.
    ///
    /// On the first matching check the task status becomes `skipped` or
    /// `blocked` and `Some(act)` is returned; the task must not be executed.
    /// `None` means no check fired.
    pub fn do_pre_check(&mut self, dag_ins: &DagInstance) -> Option<CheckAction> {
        for check in self.pre_checks.values() {
            if check.is_met(dag_ins) {
                self.status = check.act.task_status();
                return Some(check.act);
            }
        }
        None
    }
}
