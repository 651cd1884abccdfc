//! Commander: the user-facing control surface.
//!
//! Submits DAG instances and attaches retry / cancel / continue commands to
//! running ones. Commands are persisted onto the DAG instance and consumed by
//! the parser of the owning worker; by default the call returns as soon as
//! the command is written. Sync mode polls until the command slot clears.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sluice_core::{DagId, DagInstanceId, TaskInstanceId};

use crate::dag_instance::{DagInstance, Trigger};
use crate::error::{Error, Result};
use crate::keeper::Keeper;
use crate::store::{DagInstancePatch, ListTaskInstanceInput, Store};
use crate::task_instance::TaskInstanceStatus;

/// Options controlling how a command call behaves.
#[derive(Debug, Clone)]
pub struct CommandOption {
    /// Wait until the parser consumed the command before returning.
    ///
    /// Command handling is usually fast, so async mode suffices; sync mode is
    /// for callers that need the command observed before proceeding.
    pub sync: bool,
    /// Sync mode: how long to wait for consumption.
    pub sync_timeout: Duration,
    /// Sync mode: polling interval.
    pub sync_interval: Duration,
}

impl Default for CommandOption {
    fn default() -> Self {
        Self {
            sync: false,
            sync_timeout: Duration::from_secs(5),
            sync_interval: Duration::from_millis(500),
        }
    }
}

impl CommandOption {
    /// Enables sync mode.
    #[must_use]
    pub const fn sync(mut self) -> Self {
        self.sync = true;
        self
    }

    /// Sets the sync wait deadline.
    #[must_use]
    pub const fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Sets the sync polling interval.
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }
}

/// User-facing command surface.
pub struct Commander {
    store: Arc<dyn Store>,
    keeper: Arc<dyn Keeper>,
}

impl Commander {
    /// Creates a commander over the given store and keeper.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, keeper: Arc<dyn Keeper>) -> Self {
        Self { store, keeper }
    }

    /// Submits a DAG for execution with the given variable overrides.
    ///
    /// The returned instance is in `init`; the dispatcher will place it on
    /// the next tick.
    ///
    /// # Errors
    ///
    /// Fails when the DAG does not exist or is stopped.
    pub async fn run_dag(
        &self,
        dag_id: &DagId,
        spec_vars: &BTreeMap<String, String>,
    ) -> Result<DagInstance> {
        self.run_dag_with_tags(dag_id, spec_vars, BTreeMap::new())
            .await
    }

    /// Submits a DAG with tags attached to the instance.
    ///
    /// # Errors
    ///
    /// Fails when the DAG does not exist or is stopped.
    pub async fn run_dag_with_tags(
        &self,
        dag_id: &DagId,
        spec_vars: &BTreeMap<String, String>,
        tags: BTreeMap<String, String>,
    ) -> Result<DagInstance> {
        let dag = self.store.get_dag(dag_id).await?;
        let mut dag_ins = dag.run(Trigger::Manually, spec_vars)?.with_tags(tags);
        self.store.create_dag_ins(&mut dag_ins).await?;
        Ok(dag_ins)
    }

    /// Retries every failed or canceled task of a DAG instance.
    ///
    /// # Errors
    ///
    /// Fails when no task of the instance is failed or canceled.
    pub async fn retry_dag_ins(
        &self,
        dag_ins_id: &DagInstanceId,
        option: CommandOption,
    ) -> Result<()> {
        let task_ids = self
            .task_ids_by_status(
                dag_ins_id,
                &[TaskInstanceStatus::Failed, TaskInstanceStatus::Canceled],
            )
            .await?;
        if task_ids.is_empty() {
            return Err(Error::InvalidCommand {
                message: "no failed or canceled task instance".to_string(),
            });
        }
        self.retry_tasks(&task_ids, option).await
    }

    /// Retries specific failed or canceled task instances.
    ///
    /// When the owning worker is dead, the instance is handed to the first
    /// alive worker so the command does not wait on a corpse.
    ///
    /// # Errors
    ///
    /// Fails when the ids span several DAG instances or any id is unknown.
    pub async fn retry_tasks(
        &self,
        task_ins_ids: &[TaskInstanceId],
        option: CommandOption,
    ) -> Result<()> {
        self.execute_command(task_ins_ids, option, |dag_ins, worker_alive, nodes| {
            if !worker_alive {
                let Some(node) = nodes.first() else {
                    return Err(Error::NoAliveNodes);
                };
                dag_ins.worker.clone_from(node);
            }
            dag_ins.retry(task_ins_ids.to_vec())
        })
        .await
    }

    /// Cancels every in-flight task of a DAG instance.
    ///
    /// # Errors
    ///
    /// Fails when no task of the instance is in-flight.
    pub async fn cancel_dag_ins(
        &self,
        dag_ins_id: &DagInstanceId,
        option: CommandOption,
    ) -> Result<()> {
        let task_ids = self
            .task_ids_by_status(
                dag_ins_id,
                &[
                    TaskInstanceStatus::Init,
                    TaskInstanceStatus::Running,
                    TaskInstanceStatus::Ending,
                    TaskInstanceStatus::Retrying,
                ],
            )
            .await?;
        if task_ids.is_empty() {
            return Err(Error::InvalidCommand {
                message: "no task instance".to_string(),
            });
        }
        self.cancel_tasks(&task_ids, option).await
    }

    /// Cancels specific in-flight task instances.
    ///
    /// # Errors
    ///
    /// Fails when the owning worker is not alive: only the owner can deliver
    /// a cooperative cancel.
    pub async fn cancel_tasks(
        &self,
        task_ins_ids: &[TaskInstanceId],
        option: CommandOption,
    ) -> Result<()> {
        self.execute_command(task_ins_ids, option, |dag_ins, worker_alive, _nodes| {
            if !worker_alive {
                return Err(Error::InvalidCommand {
                    message: "worker is not healthy, you can not cancel it".to_string(),
                });
            }
            dag_ins.cancel(task_ins_ids.to_vec())
        })
        .await
    }

    /// Continues every blocked task of a DAG instance.
    ///
    /// # Errors
    ///
    /// Fails when no task of the instance is blocked.
    pub async fn continue_dag_ins(
        &self,
        dag_ins_id: &DagInstanceId,
        option: CommandOption,
    ) -> Result<()> {
        let task_ids = self
            .task_ids_by_status(dag_ins_id, &[TaskInstanceStatus::Blocked])
            .await?;
        if task_ids.is_empty() {
            return Err(Error::InvalidCommand {
                message: "no blocked task instance".to_string(),
            });
        }
        self.continue_tasks(&task_ids, option).await
    }

    /// Continues specific blocked task instances.
    ///
    /// # Errors
    ///
    /// Fails when the ids span several DAG instances or any id is unknown.
    pub async fn continue_tasks(
        &self,
        task_ins_ids: &[TaskInstanceId],
        option: CommandOption,
    ) -> Result<()> {
        self.execute_command(task_ins_ids, option, |dag_ins, worker_alive, nodes| {
            if !worker_alive {
                let Some(node) = nodes.first() else {
                    return Err(Error::NoAliveNodes);
                };
                dag_ins.worker.clone_from(node);
            }
            dag_ins.continue_tasks(task_ins_ids.to_vec())
        })
        .await
    }

    async fn task_ids_by_status(
        &self,
        dag_ins_id: &DagInstanceId,
        status: &[TaskInstanceStatus],
    ) -> Result<Vec<TaskInstanceId>> {
        let tasks = self
            .store
            .list_task_instance(&ListTaskInstanceInput {
                dag_ins_id: Some(dag_ins_id.clone()),
                status: status.to_vec(),
                ..ListTaskInstanceInput::default()
            })
            .await?;
        Ok(tasks.into_iter().map(|t| t.id).collect())
    }

    /// Shared command plumbing: resolve the targeted tasks to one DAG
    /// instance, apply the mutation, persist worker + command, optionally
    /// wait for consumption.
    async fn execute_command(
        &self,
        task_ins_ids: &[TaskInstanceId],
        option: CommandOption,
        perform: impl FnOnce(&mut DagInstance, bool, &[String]) -> Result<()>,
    ) -> Result<()> {
        if task_ins_ids.is_empty() {
            return Err(Error::InvalidCommand {
                message: "here is no any task by given task ids".to_string(),
            });
        }

        let tasks = self
            .store
            .list_task_instance(&ListTaskInstanceInput {
                ids: task_ins_ids.to_vec(),
                ..ListTaskInstanceInput::default()
            })
            .await?;

        if tasks.len() != task_ins_ids.len() {
            let missing: Vec<String> = task_ins_ids
                .iter()
                .filter(|id| tasks.iter().all(|t| &t.id != *id))
                .map(ToString::to_string)
                .collect();
            return Err(Error::DataNotFound {
                resource: "task_instance",
                id: missing.join(", "),
            });
        }

        let dag_ins_id = tasks[0].dag_ins_id.clone();
        if let Some(stranger) = tasks.iter().find(|t| t.dag_ins_id != dag_ins_id) {
            return Err(Error::InvalidCommand {
                message: format!(
                    "task instance[{}] is from a different dag instance",
                    stranger.id
                ),
            });
        }

        let mut dag_ins = self.store.get_dag_instance(&dag_ins_id).await?;
        let worker_alive = self.keeper.is_alive(&dag_ins.worker).await?;
        let nodes = if worker_alive {
            Vec::new()
        } else {
            self.keeper.alive_nodes().await?
        };

        perform(&mut dag_ins, worker_alive, &nodes)?;

        let mut patch = DagInstancePatch::new(dag_ins.id.clone());
        patch.worker = Some(dag_ins.worker.clone());
        patch.cmd.clone_from(&dag_ins.cmd);
        self.store.patch_dag_ins(patch, &[]).await?;

        if option.sync {
            return self.ensure_cmd_executed(&dag_ins_id, &option).await;
        }
        Ok(())
    }

    /// Polls until the command slot clears or the deadline elapses.
    async fn ensure_cmd_executed(
        &self,
        dag_ins_id: &DagInstanceId,
        option: &CommandOption,
    ) -> Result<()> {
        let deadline = tokio::time::Instant::now() + option.sync_timeout;
        loop {
            tokio::time::sleep(option.sync_interval).await;
            let dag_ins = self.store.get_dag_instance(dag_ins_id).await?;
            if dag_ins.cmd.is_none() {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(Error::CommandWatchTimeout);
            }
        }
    }
}

impl std::fmt::Debug for Commander {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Commander").finish_non_exhaustive()
    }
}
