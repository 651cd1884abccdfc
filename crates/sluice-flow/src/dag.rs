//! DAG templates: the user-authored workflow definitions.
//!
//! A [`Dag`] is a named, ordered collection of [`Task`]s with declared
//! dependencies. Templates are immutable from the engine's point of view once
//! created; submitting one mints a fresh
//! [`DagInstance`](crate::dag_instance::DagInstance) that the scheduling
//! pipeline drives to completion.

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use sluice_core::DagId;

use crate::dag_instance::{
    DagInstance, DagInstanceVar, DagInstanceVars, ShareData, Trigger,
};
use crate::error::{Error, Result};
use crate::task_instance::TaskInstanceStatus;

/// Lifecycle status of a DAG template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DagStatus {
    /// The DAG accepts new submissions.
    #[default]
    Normal,
    /// The DAG is stopped; submissions are rejected.
    Stopped,
}

/// A declared template variable with an optional default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DagVar {
    /// Human-readable description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub desc: String,
    /// Value used when the submission does not override the variable.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub default_value: String,
}

/// Template variables keyed by name.
pub type DagVars = BTreeMap<String, DagVar>;

/// A DAG template.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dag {
    /// Unique identifier, user supplied.
    #[serde(default = "empty_dag_id")]
    pub id: DagId,
    /// Display name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub desc: String,
    /// Cron expression. The engine stores but never interprets it; triggers
    /// are supplied externally.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cron: String,
    /// Declared variables.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub vars: DagVars,
    /// Lifecycle status.
    #[serde(default)]
    pub status: DagStatus,
    /// Ordered task list.
    #[serde(default)]
    pub tasks: Vec<Task>,
}

// An absent id is filled in later (e.g. from the YAML file stem).
fn empty_dag_id() -> DagId {
    DagId::new("")
}

impl Dag {
    /// Creates an empty DAG in `Normal` status with the given id.
    #[must_use]
    pub fn new(id: impl Into<DagId>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            desc: String::new(),
            cron: String::new(),
            vars: DagVars::new(),
            status: DagStatus::Normal,
            tasks: Vec::new(),
        }
    }

    /// Appends a task to the template.
    #[must_use]
    pub fn with_task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// Declares a variable with a default value.
    #[must_use]
    pub fn with_var(mut self, name: impl Into<String>, default_value: impl Into<String>) -> Self {
        self.vars.insert(
            name.into(),
            DagVar {
                desc: String::new(),
                default_value: default_value.into(),
            },
        );
        self
    }

    /// Builds a new DAG instance from this template.
    ///
    /// Variables resolve submission overrides over template defaults. The
    /// instance starts in `init`; the caller still has to persist it through
    /// the store for the dispatcher to pick it up.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidCommand`] when the DAG is stopped.
    pub fn run(
        &self,
        trigger: Trigger,
        spec_vars: &BTreeMap<String, String>,
    ) -> Result<DagInstance> {
        if self.status != DagStatus::Normal {
            return Err(Error::InvalidCommand {
                message: "you cannot run a stopped dag".to_string(),
            });
        }

        let mut vars = DagInstanceVars::new();
        for (key, var) in &self.vars {
            let value = spec_vars
                .get(key)
                .filter(|v| !v.is_empty())
                .cloned()
                .unwrap_or_else(|| var.default_value.clone());
            vars.insert(key.clone(), DagInstanceVar { value });
        }

        Ok(DagInstance::new(
            self.id.clone(),
            trigger,
            vars,
            ShareData::default(),
        ))
    }
}

/// A task template within a DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// Identifier, unique within the DAG.
    pub id: String,
    /// Display name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    /// Ids of sibling tasks that must complete first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depend_on: Vec<String>,
    /// Registry name of the action this task executes.
    pub action_name: String,
    /// Per-task timeout in seconds; 0 means the engine default applies.
    #[serde(default)]
    pub timeout_secs: u64,
    /// Action parameters. String leaves may contain `{{.vars.X.Value}}` /
    /// `{{.shareData.Y}}` placeholders, rendered at materialization against
    /// the instance.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    /// Declarative gates evaluated before the task runs, in insertion order.
    #[serde(default, rename = "preCheck", skip_serializing_if = "IndexMap::is_empty")]
    pub pre_checks: PreChecks,
}

impl Task {
    /// Creates a task mapping to the given action.
    #[must_use]
    pub fn new(id: impl Into<String>, action_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            depend_on: Vec::new(),
            action_name: action_name.into(),
            timeout_secs: 0,
            params: Map::new(),
            pre_checks: PreChecks::new(),
        }
    }

    /// Declares dependencies on sibling task ids.
    #[must_use]
    pub fn with_depends(mut self, depend_on: Vec<String>) -> Self {
        self.depend_on = depend_on;
        self
    }

    /// Sets the action parameters.
    #[must_use]
    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    /// Sets the per-task timeout.
    #[must_use]
    pub const fn with_timeout_secs(mut self, timeout_secs: u64) -> Self {
        self.timeout_secs = timeout_secs;
        self
    }

    /// Attaches a pre-check under the given name.
    #[must_use]
    pub fn with_pre_check(mut self, name: impl Into<String>, check: Check) -> Self {
        self.pre_checks.insert(name.into(), check);
        self
    }
}

/// Pre-checks keyed by name.
///
/// Insertion order is preserved and is the evaluation order; callers must
/// declare checks in the order they want them tried.
pub type PreChecks = IndexMap<String, Check>;

/// What a matched pre-check does to its task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckAction {
    /// Mark the task skipped; descendants may still run.
    Skip,
    /// Mark the task blocked; the DAG instance rolls up to blocked until a
    /// `continue` command arrives.
    Block,
}

impl CheckAction {
    /// Returns the task status a matched check assigns.
    #[must_use]
    pub const fn task_status(self) -> TaskInstanceStatus {
        match self {
            Self::Skip => TaskInstanceStatus::Skipped,
            Self::Block => TaskInstanceStatus::Blocked,
        }
    }
}

/// A declarative gate: all conditions must hold for the act to fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Check {
    /// Conditions, all of which must match.
    pub conditions: Vec<TaskCondition>,
    /// What happens when they do.
    pub act: CheckAction,
}

impl Check {
    /// Returns true if every condition matches against the DAG instance.
    #[must_use]
    pub fn is_met(&self, dag_ins: &DagInstance) -> bool {
        !self.conditions.is_empty() && self.conditions.iter().all(|c| c.is_met(dag_ins))
    }
}

/// Where a condition reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionSource {
    /// The DAG instance's variables.
    Vars,
    /// The DAG instance's share-data map.
    ShareData,
}

/// Membership operator for a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConditionOp {
    /// The value must be one of `values`.
    In,
    /// The value must not be one of `values`.
    NotIn,
}

/// One condition of a pre-check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskCondition {
    /// Value source.
    pub source: ConditionSource,
    /// Key to look up.
    pub key: String,
    /// Candidate values.
    pub values: Vec<String>,
    /// Membership operator.
    pub op: ConditionOp,
}

impl TaskCondition {
    /// Returns true if the condition matches against the DAG instance.
    ///
    /// A missing key never matches, regardless of operator.
    #[must_use]
    pub fn is_met(&self, dag_ins: &DagInstance) -> bool {
        let value = match self.source {
            ConditionSource::Vars => dag_ins.var_value(&self.key),
            ConditionSource::ShareData => dag_ins.share_data.get(&self.key),
        };

        let Some(value) = value else {
            return false;
        };

        match self.op {
            ConditionOp::In => self.values.contains(&value),
            ConditionOp::NotIn => !self.values.contains(&value),
        }
    }
}
