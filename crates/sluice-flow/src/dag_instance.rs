//! DAG instances: one execution of a DAG template.
//!
//! A [`DagInstance`] owns the per-execution variables, the mutable
//! [`ShareData`] map visible to all of its task actions, the pending
//! [`Command`] slot, and the instance status the scheduling pipeline drives:
//!
//! ```text
//! init ──dispatch──► scheduled ──parse──► running ──rollup──► success | failed | blocked
//! ```
//!
//! Terminal states are absorbing unless a retry/continue command re-enters
//! through `running`. `failed` is frozen: [`DagInstance::can_modify_status`]
//! returns false and cascades cannot move it; only a retry command escapes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use sluice_core::{DagId, DagInstanceId, TaskInstanceId};

use crate::error::Result;

/// What caused a DAG instance to be submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Submitted by a user or API call.
    Manually,
    /// Submitted by an external cron trigger.
    Cron,
}

/// Status of a DAG instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DagInstanceStatus {
    /// Freshly submitted, waiting for the dispatcher to bind a worker.
    Init,
    /// Bound to a worker, waiting for its parser to materialize tasks.
    Scheduled,
    /// Tasks are materialized and executing.
    Running,
    /// A pre-check blocked a task; resumable with a `continue` command.
    Blocked,
    /// A task failed or was canceled. Frozen until a `retry` command.
    Failed,
    /// Every leaf path ended in success or skipped.
    Success,
}

impl DagInstanceStatus {
    /// Returns a lowercase label suitable for metrics and logs.
    #[must_use]
    pub const fn as_label(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Success => "success",
        }
    }
}

impl fmt::Display for DagInstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_label())
    }
}

/// The value of one instance variable, frozen at submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DagInstanceVar {
    /// The resolved value.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
}

/// Instance variables keyed by name.
pub type DagInstanceVars = BTreeMap<String, DagInstanceVar>;

/// A user command pending against a DAG instance.
///
/// Commands are written to the store and consumed by the parser of the worker
/// that owns the instance; the slot is cleared once handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    /// The command kind.
    pub name: CommandName,
    /// Task instances the command targets.
    pub target_task_ins_ids: Vec<TaskInstanceId>,
}

/// Command kinds the parser understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandName {
    /// Re-enter failed/canceled tasks through `retrying`.
    Retry,
    /// Cancel in-flight tasks cooperatively.
    Cancel,
    /// Re-enter blocked tasks through `continue`.
    Continue,
}

/// Persists share-data snapshots when entries change.
///
/// The executor installs a store-backed sink before handing an instance to an
/// action; [`ShareData::set`] invokes it while holding the write gate and
/// rolls the entry back if persistence fails.
#[async_trait]
pub trait ShareDataSink: Send + Sync {
    /// Persists the full snapshot.
    async fn persist(&self, snapshot: &BTreeMap<String, String>) -> Result<()>;
}

/// Mutable string map shared by all tasks of one DAG instance.
///
/// Reads and writes are thread-safe. Writers are fully serialized by an async
/// write gate so the persist hook observes entries in write order; a failed
/// persist rolls the in-memory entry back. Clones share the underlying map,
/// matching the one-instance-many-handles access pattern of the executor and
/// parser.
#[derive(Debug, Clone, Default)]
pub struct ShareData {
    dict: Arc<Mutex<BTreeMap<String, String>>>,
    write_gate: Arc<tokio::sync::Mutex<()>>,
    sink: Arc<RwLock<Option<Arc<dyn ShareDataSink>>>>,
}

impl fmt::Debug for dyn ShareDataSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShareDataSink")
    }
}

impl ShareData {
    /// Creates share data pre-populated with the given entries.
    #[must_use]
    pub fn from_map(dict: BTreeMap<String, String>) -> Self {
        Self {
            dict: Arc::new(Mutex::new(dict)),
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
            sink: Arc::new(RwLock::new(None)),
        }
    }

    /// Reads a value. Thread-safe.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.dict
            .lock()
            .ok()
            .and_then(|dict| dict.get(key).cloned())
    }

    /// Writes a value and persists the snapshot through the installed sink.
    ///
    /// The write gate serializes concurrent writers. On persist failure the
    /// entry is rolled back to its previous value and the error is logged;
    /// the caller keeps running with the pre-write state.
    pub async fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        let _gate = self.write_gate.lock().await;

        let (previous, snapshot) = {
            let Ok(mut dict) = self.dict.lock() else {
                return;
            };
            let previous = dict.insert(key.clone(), value.clone());
            (previous, dict.clone())
        };

        let sink = self
            .sink
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().cloned());
        let Some(sink) = sink else {
            return;
        };

        if let Err(err) = sink.persist(&snapshot).await {
            if let Ok(mut dict) = self.dict.lock() {
                match previous {
                    Some(prev) => {
                        dict.insert(key.clone(), prev);
                    }
                    None => {
                        dict.remove(&key);
                    }
                }
            }
            tracing::error!(%err, key, value, "save share data failed");
        }
    }

    /// Installs the persist sink. Called by the executor at task init.
    pub fn install_sink(&self, sink: Arc<dyn ShareDataSink>) {
        if let Ok(mut guard) = self.sink.write() {
            *guard = Some(sink);
        }
    }

    /// Returns a point-in-time copy of all entries.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.dict.lock().map(|dict| dict.clone()).unwrap_or_default()
    }
}

impl Serialize for ShareData {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let snapshot = self.snapshot();
        let mut map = serializer.serialize_map(Some(snapshot.len()))?;
        for (k, v) in &snapshot {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ShareData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct MapVisitor;

        impl<'de> Visitor<'de> for MapVisitor {
            type Value = ShareData;

            fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                formatter.write_str("a string-to-string map")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut dict = BTreeMap::new();
                while let Some((key, value)) = access.next_entry::<String, String>()? {
                    dict.insert(key, value);
                }
                Ok(ShareData::from_map(dict))
            }
        }

        deserializer.deserialize_map(MapVisitor)
    }
}

/// Hook invoked just before a DAG-instance lifecycle transition.
pub type DagInstanceHookFn = Arc<dyn Fn(&DagInstance) + Send + Sync>;

/// Lifecycle hooks installed once at boot, before any component starts.
#[derive(Clone, Default)]
pub struct DagInstanceLifecycleHook {
    /// Runs before the instance enters `running`.
    pub before_run: Option<DagInstanceHookFn>,
    /// Runs before the instance enters `success`.
    pub before_success: Option<DagInstanceHookFn>,
    /// Runs before the instance enters `failed`.
    pub before_fail: Option<DagInstanceHookFn>,
    /// Runs before the instance enters `blocked`.
    pub before_block: Option<DagInstanceHookFn>,
    /// Runs before a retry command is attached.
    pub before_retry: Option<DagInstanceHookFn>,
}

impl fmt::Debug for DagInstanceLifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DagInstanceLifecycleHook")
            .field("before_run", &self.before_run.is_some())
            .field("before_success", &self.before_success.is_some())
            .field("before_fail", &self.before_fail.is_some())
            .field("before_block", &self.before_block.is_some())
            .field("before_retry", &self.before_retry.is_some())
            .finish()
    }
}

static LIFECYCLE_HOOK: RwLock<Option<DagInstanceLifecycleHook>> = RwLock::new(None);

/// Installs lifecycle hooks.
///
/// Must be called before the engine starts; components begin transitioning
/// instances immediately after boot, and changes made later may miss events.
pub fn set_lifecycle_hook(hook: DagInstanceLifecycleHook) {
    if let Ok(mut guard) = LIFECYCLE_HOOK.write() {
        *guard = Some(hook);
    }
}

fn run_hook(select: impl Fn(&DagInstanceLifecycleHook) -> Option<DagInstanceHookFn>, ins: &DagInstance) {
    let hook = LIFECYCLE_HOOK
        .read()
        .ok()
        .and_then(|guard| guard.as_ref().and_then(&select));
    if let Some(hook) = hook {
        (*hook)(ins);
    }
}

/// One execution of a DAG template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DagInstance {
    /// Engine-minted identifier; empty until persisted.
    #[serde(default = "empty_dag_ins_id")]
    pub id: DagInstanceId,
    /// The template this instance executes.
    pub dag_id: DagId,
    /// What caused the submission.
    pub trigger: Trigger,
    /// Key of the worker that owns this instance; empty while `init`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub worker: String,
    /// Variables frozen at submission.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: DagInstanceVars,
    /// Mutable data shared by all task actions, persisted on every write.
    #[serde(default)]
    pub share_data: ShareData,
    /// Current status.
    pub status: DagInstanceStatus,
    /// Human-readable reason for the current status.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Pending user command, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Command>,
    /// User-attached labels, filterable through the store.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,
    /// Bumped by the store on every write.
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn empty_dag_ins_id() -> DagInstanceId {
    DagInstanceId::new("")
}

impl DagInstance {
    /// Creates a fresh instance in `init` status.
    #[must_use]
    pub fn new(
        dag_id: DagId,
        trigger: Trigger,
        vars: DagInstanceVars,
        share_data: ShareData,
    ) -> Self {
        Self {
            id: empty_dag_ins_id(),
            dag_id,
            trigger,
            worker: String::new(),
            vars,
            share_data,
            status: DagInstanceStatus::Init,
            reason: String::new(),
            cmd: None,
            tags: BTreeMap::new(),
            updated_at: Utc::now(),
        }
    }

    /// Attaches tags to the instance.
    #[must_use]
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.tags = tags;
        self
    }

    /// Returns the value of a variable.
    #[must_use]
    pub fn var_value(&self, name: &str) -> Option<String> {
        self.vars.get(name).map(|v| v.value.clone())
    }

    /// Visits every variable until the callback returns true.
    pub fn iterate_vars(&self, mut f: impl FnMut(&str, &str) -> bool) {
        for (name, var) in &self.vars {
            if f(name, &var.value) {
                break;
            }
        }
    }

    /// Indicates whether cascades may still move the status.
    ///
    /// A `failed` instance is frozen; pending commands still execute (retry is
    /// how one escapes `failed`).
    #[must_use]
    pub fn can_modify_status(&self) -> bool {
        self.status != DagInstanceStatus::Failed
    }

    /// Enters `running`, clearing the reason.
    pub fn run(&mut self) {
        run_hook(|h| h.before_run.clone(), self);
        self.status = DagInstanceStatus::Running;
        self.reason = String::new();
    }

    /// Enters `success`, clearing the reason.
    pub fn success(&mut self) {
        run_hook(|h| h.before_success.clone(), self);
        self.status = DagInstanceStatus::Success;
        self.reason = String::new();
    }

    /// Enters `failed` with a reason.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
        run_hook(|h| h.before_fail.clone(), self);
        self.status = DagInstanceStatus::Failed;
    }

    /// Enters `blocked` with a reason.
    pub fn block(&mut self, reason: impl Into<String>) {
        self.reason = reason.into();
        run_hook(|h| h.before_block.clone(), self);
        self.status = DagInstanceStatus::Blocked;
    }

    /// Attaches a retry command targeting the given task instances.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::InvalidCommand`] when another command is
    /// still pending.
    pub fn retry(&mut self, task_ins_ids: Vec<TaskInstanceId>) -> Result<()> {
        self.ensure_no_pending_cmd()?;
        run_hook(|h| h.before_retry.clone(), self);
        self.cmd = Some(Command {
            name: CommandName::Retry,
            target_task_ins_ids: task_ins_ids,
        });
        Ok(())
    }

    /// Attaches a cancel command targeting the given task instances.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::InvalidCommand`] when the instance is
    /// not running or another command is still pending.
    pub fn cancel(&mut self, task_ins_ids: Vec<TaskInstanceId>) -> Result<()> {
        if self.status != DagInstanceStatus::Running {
            return Err(crate::error::Error::InvalidCommand {
                message: "you can only cancel a running dag instance".to_string(),
            });
        }
        self.ensure_no_pending_cmd()?;
        self.cmd = Some(Command {
            name: CommandName::Cancel,
            target_task_ins_ids: task_ins_ids,
        });
        Ok(())
    }

    /// Attaches a continue command targeting the given task instances.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::Error::InvalidCommand`] when another command is
    /// still pending.
    pub fn continue_tasks(&mut self, task_ins_ids: Vec<TaskInstanceId>) -> Result<()> {
        self.ensure_no_pending_cmd()?;
        self.cmd = Some(Command {
            name: CommandName::Continue,
            target_task_ins_ids: task_ins_ids,
        });
        Ok(())
    }

    fn ensure_no_pending_cmd(&self) -> Result<()> {
        if self.cmd.is_some() {
            return Err(crate::error::Error::InvalidCommand {
                message: "dag instance has an incomplete command".to_string(),
            });
        }
        Ok(())
    }
}
