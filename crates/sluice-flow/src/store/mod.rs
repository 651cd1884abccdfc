//! Pluggable persistence for workflow state.
//!
//! The [`Store`] trait defines the durability layer the scheduling pipeline
//! consumes: CRUD and batch operations on DAGs, DAG instances, and task
//! instances, plus field-selective patches. Any backend meeting the contract
//! suffices; [`memory::MemoryStore`] ships for tests and single-node use.
//!
//! ## Patch semantics
//!
//! [`Store::patch_dag_ins`] and [`Store::patch_task_ins`] are field-selective:
//! only set fields are written, plus every field named in `must_patch_fields`
//! even when unset. The must-patch list is how the parser clears `cmd` and
//! `reason`. `updated_at` bumps on every write.
//!
//! ## Events
//!
//! `patch_dag_ins` publishes [`crate::events::FlowEvent::DagInstancePatched`];
//! `update_dag_ins` publishes
//! [`crate::events::FlowEvent::DagInstanceUpdated`].

pub mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use sluice_core::{DagId, DagInstanceId, TaskInstanceId};

use crate::dag::Dag;
use crate::dag_instance::{Command, DagInstance, DagInstanceStatus};
use crate::error::Result;
use crate::task_instance::{TaskInstance, TaskInstanceStatus, TraceInfo};

/// Filter for listing DAG instances.
#[derive(Debug, Clone, Default)]
pub struct ListDagInstanceInput {
    /// Only instances owned by this worker.
    pub worker: Option<String>,
    /// Only instances of this DAG.
    pub dag_id: Option<DagId>,
    /// Only instances last written at or before this instant.
    pub updated_end: Option<DateTime<Utc>>,
    /// Only instances in one of these statuses; empty means any.
    pub status: Vec<DagInstanceStatus>,
    /// Only instances with a pending command.
    pub has_cmd: bool,
    /// Only instances carrying all of these tags.
    pub tags: BTreeMap<String, String>,
    /// Bound on the result size; `None` means unbounded.
    pub limit: Option<usize>,
}

/// Filter for listing task instances.
#[derive(Debug, Clone, Default)]
pub struct ListTaskInstanceInput {
    /// Only these instances.
    pub ids: Vec<TaskInstanceId>,
    /// Only instances of this DAG instance.
    pub dag_ins_id: Option<DagInstanceId>,
    /// Only instances in one of these statuses; empty means any.
    pub status: Vec<TaskInstanceStatus>,
    /// Only running instances whose timeout has elapsed.
    ///
    /// Matches `status = running AND updated_at + timeout_secs <= now - 5s`.
    /// The 5-second slack avoids racing the executor's own deadline.
    pub expired: bool,
    /// Backend hint: restrict the columns fetched. Backends may ignore it.
    pub select_fields: Vec<String>,
}

/// DAG-instance fields addressable in a patch's must-patch list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DagInsField {
    /// The owning worker key.
    Worker,
    /// The status.
    Status,
    /// The status reason.
    Reason,
    /// The pending command slot.
    Cmd,
    /// The share-data map.
    ShareData,
}

/// Field-selective update of a DAG instance.
///
/// Unset fields are left untouched unless named in the accompanying
/// must-patch list, in which case they are written as cleared.
#[derive(Debug, Clone, Default)]
pub struct DagInstancePatch {
    /// The instance to patch.
    pub id: DagInstanceId,
    /// New owning worker.
    pub worker: Option<String>,
    /// New status.
    pub status: Option<DagInstanceStatus>,
    /// New reason.
    pub reason: Option<String>,
    /// New pending command.
    pub cmd: Option<Command>,
    /// New share-data snapshot.
    pub share_data: Option<BTreeMap<String, String>>,
}

impl DagInstancePatch {
    /// Creates an empty patch for the given instance.
    #[must_use]
    pub fn new(id: DagInstanceId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: DagInstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Sets the share-data snapshot.
    #[must_use]
    pub fn with_share_data(mut self, share_data: BTreeMap<String, String>) -> Self {
        self.share_data = Some(share_data);
        self
    }
}

/// Task-instance fields addressable in a patch's must-patch list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskInsField {
    /// The status.
    Status,
    /// The status reason.
    Reason,
    /// The trace log.
    Traces,
}

/// Field-selective update of a task instance.
#[derive(Debug, Clone, Default)]
pub struct TaskInstancePatch {
    /// The instance to patch.
    pub id: TaskInstanceId,
    /// New status.
    pub status: Option<TaskInstanceStatus>,
    /// New reason.
    pub reason: Option<String>,
    /// Full replacement trace log.
    pub traces: Option<Vec<TraceInfo>>,
}

impl TaskInstancePatch {
    /// Creates an empty patch for the given instance.
    #[must_use]
    pub fn new(id: TaskInstanceId) -> Self {
        Self {
            id,
            ..Self::default()
        }
    }

    /// Sets the status.
    #[must_use]
    pub fn with_status(mut self, status: TaskInstanceStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Sets the reason.
    #[must_use]
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Sets the trace log.
    #[must_use]
    pub fn with_traces(mut self, traces: Vec<TraceInfo>) -> Self {
        self.traces = Some(traces);
        self
    }
}

/// Durable storage for workflow state.
///
/// ## Thread Safety
///
/// All methods are `Send + Sync`; every component of one worker shares one
/// store handle.
#[async_trait]
pub trait Store: Send + Sync {
    /// Creates a DAG template.
    ///
    /// # Errors
    ///
    /// - [`crate::error::Error::DataConflicted`] when the id already exists
    /// - graph validation errors when the tasks do not form a valid DAG
    async fn create_dag(&self, dag: &Dag) -> Result<()>;

    /// Replaces a DAG template.
    async fn update_dag(&self, dag: &Dag) -> Result<()>;

    /// Fetches a DAG template.
    async fn get_dag(&self, dag_id: &DagId) -> Result<Dag>;

    /// Persists a fresh DAG instance, minting its id when empty.
    async fn create_dag_ins(&self, dag_ins: &mut DagInstance) -> Result<()>;

    /// Fetches a DAG instance.
    async fn get_dag_instance(&self, dag_ins_id: &DagInstanceId) -> Result<DagInstance>;

    /// Lists DAG instances matching the filter, in creation order.
    async fn list_dag_instance(&self, input: &ListDagInstanceInput) -> Result<Vec<DagInstance>>;

    /// Applies a field-selective patch.
    ///
    /// Fields named in `must_patch_fields` are written even when unset in the
    /// patch (clearing them). Publishes `DagInstancePatched`.
    async fn patch_dag_ins(
        &self,
        patch: DagInstancePatch,
        must_patch_fields: &[DagInsField],
    ) -> Result<()>;

    /// Replaces a DAG instance wholesale. Publishes `DagInstanceUpdated`.
    async fn update_dag_ins(&self, dag_ins: &DagInstance) -> Result<()>;

    /// Best-effort concurrent batch update; per-item errors are aggregated
    /// into [`crate::error::Error::Batch`].
    async fn batch_update_dag_ins(&self, dag_ins: &[DagInstance]) -> Result<()>;

    /// Persists fresh task instances, minting ids where empty.
    async fn batch_create_task_ins(&self, task_ins: &mut [TaskInstance]) -> Result<()>;

    /// Fetches a task instance.
    async fn get_task_ins(&self, task_ins_id: &TaskInstanceId) -> Result<TaskInstance>;

    /// Lists task instances matching the filter, in creation order.
    async fn list_task_instance(&self, input: &ListTaskInstanceInput) -> Result<Vec<TaskInstance>>;

    /// Applies a field-selective patch.
    async fn patch_task_ins(
        &self,
        patch: TaskInstancePatch,
        must_patch_fields: &[TaskInsField],
    ) -> Result<()>;

    /// Replaces a task instance wholesale.
    async fn update_task_ins(&self, task_ins: &TaskInstance) -> Result<()>;

    /// Best-effort batch update; per-item errors are aggregated.
    async fn batch_update_task_ins(&self, task_ins: &[TaskInstance]) -> Result<()>;

    /// Encodes a share-data snapshot into the backend's opaque blob format.
    fn marshal(&self, share_data: &BTreeMap<String, String>) -> Result<Vec<u8>>;

    /// Decodes a share-data snapshot from the backend's opaque blob format.
    fn unmarshal(&self, bytes: &[u8]) -> Result<BTreeMap<String, String>>;

    /// Releases backend resources.
    async fn close(&self);
}
