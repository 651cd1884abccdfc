//! Execution context handed to actions.
//!
//! An [`ExecuteContext`] scopes one task attempt. It exposes:
//!
//! - a cancellation token carrying both the per-task deadline and `cancel`
//!   commands (cancellation is cooperative),
//! - the DAG instance's share-data operator,
//! - the trace log, persisted immediately or buffered until the next status
//!   transition,
//! - the instance variables, and an in-memory value map for passing data
//!   between an action's hooks.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;

use sluice_core::TaskInstanceId;

use crate::dag_instance::{DagInstance, DagInstanceVars, ShareData};
use crate::store::{Store, TaskInstancePatch};
use crate::task_instance::TraceInfo;

/// When a trace line is persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TracePersist {
    /// Patch the store on every trace. The default.
    #[default]
    Immediately,
    /// Buffer until the next status transition. Cheaper, but buffered lines
    /// are lost if the worker crashes mid-action.
    AfterAction,
}

/// Context scoping one task attempt.
#[derive(Clone)]
pub struct ExecuteContext {
    task_ins_id: TaskInstanceId,
    cancellation: CancellationToken,
    share_data: ShareData,
    vars: DagInstanceVars,
    store: Arc<dyn Store>,
    /// Full trace log, including lines persisted earlier in this attempt.
    traces: Arc<Mutex<Vec<TraceInfo>>>,
    /// Lines waiting for the next status transition.
    buffered: Arc<Mutex<Vec<TraceInfo>>>,
    /// In-memory only; lost on crash.
    values: Arc<Mutex<HashMap<String, serde_json::Value>>>,
}

impl std::fmt::Debug for ExecuteContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteContext")
            .field("task_ins_id", &self.task_ins_id)
            .finish_non_exhaustive()
    }
}

impl ExecuteContext {
    /// Builds a context for one task attempt.
    #[must_use]
    pub fn new(
        dag_ins: &DagInstance,
        task_ins_id: TaskInstanceId,
        existing_traces: Vec<TraceInfo>,
        cancellation: CancellationToken,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            task_ins_id,
            cancellation,
            share_data: dag_ins.share_data.clone(),
            vars: dag_ins.vars.clone(),
            store,
            traces: Arc::new(Mutex::new(existing_traces)),
            buffered: Arc::new(Mutex::new(Vec::new())),
            values: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The cancellation token for this attempt.
    ///
    /// Cancelled when the per-task deadline elapses or a `cancel` command
    /// targets the task. Actions should observe it in long-running work.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// The DAG instance's share-data operator. Writes persist through the
    /// store.
    #[must_use]
    pub fn share_data(&self) -> &ShareData {
        &self.share_data
    }

    /// Returns the value of an instance variable.
    #[must_use]
    pub fn get_var(&self, name: &str) -> Option<String> {
        self.vars.get(name).map(|v| v.value.clone())
    }

    /// Visits every instance variable until the callback returns true.
    pub fn iterate_vars(&self, mut f: impl FnMut(&str, &str) -> bool) {
        for (name, var) in &self.vars {
            if f(name, &var.value) {
                break;
            }
        }
    }

    /// Attaches an in-memory value, shared between this attempt's hooks.
    pub fn with_value(&self, key: impl Into<String>, value: serde_json::Value) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.into(), value);
        }
    }

    /// Reads an in-memory value attached earlier in this attempt.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<serde_json::Value> {
        self.values.lock().ok().and_then(|v| v.get(key).cloned())
    }

    /// Records a trace line, persisting immediately.
    pub async fn trace(&self, message: impl Into<String>) {
        self.trace_with(message, TracePersist::Immediately).await;
    }

    /// Records a trace line with an explicit persist priority.
    pub async fn trace_with(&self, message: impl Into<String>, persist: TracePersist) {
        let line = TraceInfo::now(message);

        match persist {
            TracePersist::AfterAction => {
                if let Ok(mut buffered) = self.buffered.lock() {
                    buffered.push(line);
                }
            }
            TracePersist::Immediately => {
                let snapshot = {
                    let Ok(mut traces) = self.traces.lock() else {
                        return;
                    };
                    traces.push(line);
                    traces.clone()
                };

                let patch =
                    TaskInstancePatch::new(self.task_ins_id.clone()).with_traces(snapshot.clone());
                if let Err(err) = self.store.patch_task_ins(patch, &[]).await {
                    tracing::error!(%err, traces = snapshot.len(), "save trace failed");
                }
            }
        }
    }

    /// Drains buffered lines into the main log and returns the full log.
    ///
    /// Called by the executor at every status transition so buffered traces
    /// ride along with the status patch.
    #[must_use]
    pub fn flush_traces(&self) -> Vec<TraceInfo> {
        let drained: Vec<TraceInfo> = self
            .buffered
            .lock()
            .map(|mut buffered| buffered.drain(..).collect())
            .unwrap_or_default();

        self.traces
            .lock()
            .map(|mut traces| {
                traces.extend(drained);
                traces.clone()
            })
            .unwrap_or_default()
    }
}
