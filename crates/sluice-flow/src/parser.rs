//! Parser: the per-worker scheduler.
//!
//! Each worker runs one parser with three concurrent activities:
//!
//! 1. **Scheduled watcher** (1 Hz): picks up DAG instances the dispatcher
//!    bound to this worker, materializes their missing task instances (with
//!    rendered params and defaulted timeouts), moves them to `running`, and
//!    initializes their task trees.
//! 2. **Command watcher** (1 Hz): interprets pending retry / cancel /
//!    continue commands and clears the command slot.
//! 3. **Shard workers**: N workers, each owning a bounded channel. Task
//!    completion reports are routed by `hash(dag_ins_id) % N`, so all events
//!    of one DAG instance serialize onto one worker, which is what lets the
//!    task trees live in a map without per-tree locks. A full channel spills
//!    into a detached send task so producers never deadlock.
//!
//! On boot the parser re-initializes every `running` instance assigned to
//! this worker, rebuilding trees lost with the previous process.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sluice_core::{DagInstanceId, TaskInstanceId};

use crate::dag_instance::{CommandName, DagInstance, DagInstanceStatus};
use crate::error::{Error, Result};
use crate::events::{EventBus, FlowEvent};
use crate::executor::{Executor, REASON_PARENT_CANCEL, REASON_SUCCESS_AFTER_CANCELED};
use crate::keeper::Keeper;
use crate::metrics::FlowMetrics;
use crate::render::render_params;
use crate::store::{
    DagInsField, DagInstancePatch, ListDagInstanceInput, ListTaskInstanceInput, Store,
    TaskInstancePatch,
};
use crate::task_instance::{TaskInstance, TaskInstanceStatus};
use crate::tasktree::{TaskTree, TreeStatus};

/// Shard channel capacity.
const SHARD_CHANNEL_CAPACITY: usize = 50;

/// Watcher cadence.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Per-worker scheduler.
pub struct Parser {
    store: Arc<dyn Store>,
    keeper: Arc<dyn Keeper>,
    bus: EventBus,
    metrics: FlowMetrics,
    executor: OnceLock<Arc<Executor>>,
    /// Default applied to tasks whose template declares no timeout.
    task_timeout: Duration,
    worker_count: usize,
    senders: RwLock<Vec<mpsc::Sender<TaskInstance>>>,
    receivers: Mutex<Vec<mpsc::Receiver<TaskInstance>>>,
    task_trees: DashMap<DagInstanceId, TaskTree>,
    closed: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Parser {
    /// Creates a parser. Call [`Parser::start`] to begin watching.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        keeper: Arc<dyn Keeper>,
        bus: EventBus,
        worker_count: usize,
        task_timeout: Duration,
    ) -> Arc<Self> {
        let worker_count = worker_count.max(1);
        let mut senders = Vec::with_capacity(worker_count);
        let mut receivers = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::channel(SHARD_CHANNEL_CAPACITY);
            senders.push(tx);
            receivers.push(rx);
        }

        Arc::new(Self {
            store,
            keeper,
            bus,
            metrics: FlowMetrics::new(),
            executor: OnceLock::new(),
            task_timeout,
            worker_count,
            senders: RwLock::new(senders),
            receivers: Mutex::new(receivers),
            task_trees: DashMap::new(),
            closed: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Wires the executor. Must happen before [`Parser::start`].
    pub fn set_executor(&self, executor: Arc<Executor>) {
        let _ = self.executor.set(executor);
    }

    fn executor(&self) -> Result<&Arc<Executor>> {
        self.executor
            .get()
            .ok_or_else(|| Error::storage("parser has no executor wired"))
    }

    /// Starts the watchers and shard workers, then recovers running
    /// instances already assigned to this worker.
    pub async fn start(self: &Arc<Self>) {
        let mut handles = Vec::new();

        for watcher in [WatcherKind::Scheduled, WatcherKind::Command] {
            let parser = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(TICK_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = parser.closed.cancelled() => break,
                        _ = ticker.tick() => match watcher {
                            WatcherKind::Scheduled => parser.watch_scheduled_tick().await,
                            WatcherKind::Command => {
                                if let Err(err) = parser.watch_dag_ins_cmd().await {
                                    tracing::error!(
                                        module = "parser",
                                        %err,
                                        "watch dag command failed"
                                    );
                                }
                            }
                        },
                    }
                }
            }));
        }

        let receivers = self
            .receivers
            .lock()
            .map(|mut guard| guard.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();
        for mut receiver in receivers {
            let parser = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                while let Some(task_ins) = receiver.recv().await {
                    if let Err(err) = parser.execute_next(&task_ins).await {
                        tracing::error!(module = "parser", %err, "worker do failed");
                    }
                }
            }));
        }

        if let Ok(mut guard) = self.handles.lock() {
            *guard = handles;
        }

        if let Err(err) = self.initial_running_dag_ins().await {
            tracing::error!(module = "parser", %err, "parser init dags failed");
        }
    }

    /// Routes a task completion report to its DAG instance's shard worker.
    ///
    /// Try-send first; a full shard spills into a detached task so the
    /// producer (an executor worker) never deadlocks against the shard it is
    /// itself being reported from.
    pub fn entry_task_ins(&self, task_ins: TaskInstance) {
        if self.closed.is_cancelled() {
            tracing::info!("parser has already closed, task report dropped");
            return;
        }

        let shard = self.shard_of(&task_ins.dag_ins_id);
        let sender = self
            .senders
            .read()
            .ok()
            .and_then(|senders| senders.get(shard).cloned());
        let Some(sender) = sender else {
            tracing::info!("parser shards are gone, task report dropped");
            return;
        };

        match sender.try_send(task_ins) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(task_ins)) => {
                let sender = sender.clone();
                tokio::spawn(async move {
                    if sender.send(task_ins).await.is_err() {
                        tracing::info!("parser shard closed, task report dropped");
                    }
                });
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::info!("parser shard closed, task report dropped");
            }
        }
    }

    fn shard_of(&self, dag_ins_id: &DagInstanceId) -> usize {
        let mut hasher = DefaultHasher::new();
        dag_ins_id.hash(&mut hasher);
        (hasher.finish() as usize) % self.worker_count
    }

    async fn watch_scheduled_tick(&self) {
        let start = std::time::Instant::now();
        let result = self.watch_scheduled_dag_ins().await;
        let elapsed = start.elapsed();

        self.metrics
            .observe_parse_tick(elapsed.as_secs_f64(), result.is_ok());

        let error = result
            .as_ref()
            .err()
            .map(|err| format!("watch scheduled dag ins failed: {err}"));
        if let Some(message) = &error {
            tracing::error!(module = "parser", err = %message, "parser watcher failed");
        }

        self.bus.publish(FlowEvent::ParseScheduleDagInsCompleted {
            elapsed_ms: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            error,
        });
    }

    async fn watch_scheduled_dag_ins(&self) -> Result<()> {
        let dag_ins = self
            .store
            .list_dag_instance(&ListDagInstanceInput {
                worker: Some(self.keeper.worker_key().to_string()),
                status: vec![DagInstanceStatus::Scheduled],
                ..ListDagInstanceInput::default()
            })
            .await?;

        for ins in dag_ins {
            let running = self.parse_scheduled_dag_ins(ins).await?;
            self.initial_dag_ins(running).await;
        }
        Ok(())
    }

    /// Materializes missing task instances and moves the instance to
    /// `running`.
    async fn parse_scheduled_dag_ins(&self, mut dag_ins: DagInstance) -> Result<DagInstance> {
        let dag = self.store.get_dag(&dag_ins.dag_id).await?;
        let existing = self
            .store
            .list_task_instance(&ListTaskInstanceInput {
                dag_ins_id: Some(dag_ins.id.clone()),
                ..ListTaskInstanceInput::default()
            })
            .await?;

        if dag.tasks.len() != existing.len() {
            let mut missing = Vec::new();
            for task in &dag.tasks {
                if existing.iter().any(|ins| ins.task_id == task.id) {
                    continue;
                }

                let mut task = task.clone();
                if task.timeout_secs == 0 {
                    task.timeout_secs = self.task_timeout.as_secs();
                }

                let mut ins = TaskInstance::from_task(dag_ins.id.clone(), &task);
                match render_params(&task.params, &dag_ins) {
                    Ok(params) => ins.params = params,
                    Err(err) => {
                        // An unresolvable placeholder fails the task, not the
                        // watcher; the rollup surfaces it on the instance.
                        ins.status = TaskInstanceStatus::Failed;
                        ins.reason = err.to_string();
                    }
                }
                missing.push(ins);
            }
            self.store.batch_create_task_ins(&mut missing).await?;
        }

        dag_ins.run();
        self.store
            .patch_dag_ins(
                DagInstancePatch::new(dag_ins.id.clone()).with_status(dag_ins.status),
                &[DagInsField::Reason],
            )
            .await?;
        Ok(dag_ins)
    }

    /// Builds (or rebuilds) the task tree of a DAG instance and pushes its
    /// executable tasks.
    ///
    /// With no executable tasks the rollup is computed instead, writing a
    /// terminal status (honoring the frozen-failed rule) and dropping the
    /// tree. Errors are logged, not returned: a broken instance must not
    /// stall the watcher loop.
    pub async fn initial_dag_ins(&self, dag_ins: DagInstance) {
        let tasks = match self
            .store
            .list_task_instance(&ListTaskInstanceInput {
                dag_ins_id: Some(dag_ins.id.clone()),
                ..ListTaskInstanceInput::default()
            })
            .await
        {
            Ok(tasks) => tasks,
            Err(err) => {
                tracing::error!(dag_ins_id = %dag_ins.id, %err, "list task instance failed");
                return;
            }
        };
        if tasks.is_empty() {
            return;
        }

        let dag_ins_id = dag_ins.id.clone();
        let tree = match TaskTree::build(dag_ins, &tasks) {
            Ok(tree) => tree,
            Err(err) => {
                tracing::error!(dag_ins_id = %dag_ins_id, %err, "build task tree failed");
                return;
            }
        };

        let executable = tree.executable_task_ids();
        if executable.is_empty() {
            if !tree.dag_ins.can_modify_status() {
                return;
            }
            let (status, source) = tree.compute_status();
            let mut dag_ins = tree.dag_ins;
            let source = source.map(|id| id.to_string()).unwrap_or_default();
            match status {
                TreeStatus::Success => dag_ins.success(),
                TreeStatus::Blocked => {
                    dag_ins.block(format!("initial blocked because task ins[{source}]"));
                }
                TreeStatus::Failed => {
                    dag_ins.fail(format!("initial failed because task ins[{source}]"));
                }
                TreeStatus::Running => {
                    tracing::warn!(
                        dag_ins_id = %dag_ins.id,
                        "initial a dag which has no executable tasks"
                    );
                    return;
                }
            }

            let mut patch =
                DagInstancePatch::new(dag_ins.id.clone()).with_status(dag_ins.status);
            if !dag_ins.reason.is_empty() {
                patch = patch.with_reason(dag_ins.reason.clone());
            }
            if let Err(err) = self.store.patch_dag_ins(patch, &[]).await {
                tracing::error!(dag_ins_id = %dag_ins.id, %err, "patch dag instance failed");
            }
            return;
        }

        let dag_ins = tree.dag_ins.clone();
        self.task_trees.insert(dag_ins_id, tree);

        let Ok(executor) = self.executor() else {
            tracing::error!("parser has no executor wired, initial push dropped");
            return;
        };
        for task in tasks {
            if executable.contains(&task.id) {
                executor.push(&dag_ins, task).await;
            }
        }
    }

    /// Advances a DAG instance after one of its tasks reports.
    async fn execute_next(&self, task_ins: &TaskInstance) -> Result<()> {
        // Decide under the shard-owned tree; all awaits happen after the
        // tree entry is released.
        enum Step {
            Rollup(Box<DagInstance>),
            Cascade {
                ids: Vec<TaskInstanceId>,
                dag_ins: Box<DagInstance>,
                settled: bool,
            },
            Push(Vec<TaskInstanceId>, Box<DagInstance>),
            Nothing,
        }

        let step = {
            let mut tree =
                self.task_trees
                    .get_mut(&task_ins.dag_ins_id)
                    .ok_or_else(|| Error::TaskTreeMissing {
                        dag_ins_id: task_ins.dag_ins_id.clone(),
                    })?;

            let ids = tree.next_task_ids(task_ins)?;
            if ids.is_empty() {
                let (status, source) = tree.compute_status();
                let source = source.map(|id| id.to_string()).unwrap_or_default();
                match status {
                    TreeStatus::Running => Step::Nothing,
                    TreeStatus::Failed => {
                        tree.dag_ins.fail(format!("task[{source}] failed"));
                        Step::Rollup(Box::new(tree.dag_ins.clone()))
                    }
                    TreeStatus::Blocked => {
                        tree.dag_ins.block(format!("task[{source}] blocked"));
                        Step::Rollup(Box::new(tree.dag_ins.clone()))
                    }
                    TreeStatus::Success => {
                        tree.dag_ins.success();
                        Step::Rollup(Box::new(tree.dag_ins.clone()))
                    }
                }
            } else if task_ins.reason == REASON_SUCCESS_AFTER_CANCELED {
                tree.mark_canceled(&ids);
                let settled = tree.compute_status().0 != TreeStatus::Running;
                Step::Cascade {
                    ids,
                    dag_ins: Box::new(tree.dag_ins.clone()),
                    settled,
                }
            } else {
                Step::Push(ids, Box::new(tree.dag_ins.clone()))
            }
        };

        match step {
            Step::Nothing => Ok(()),
            Step::Rollup(dag_ins) => {
                // The tree is complete; drop it before persisting.
                self.task_trees.remove(&task_ins.dag_ins_id);
                let mut patch =
                    DagInstancePatch::new(dag_ins.id.clone()).with_status(dag_ins.status);
                if !dag_ins.reason.is_empty() {
                    patch = patch.with_reason(dag_ins.reason.clone());
                }
                self.store.patch_dag_ins(patch, &[]).await
            }
            Step::Cascade {
                ids,
                dag_ins,
                settled,
            } => self.cancel_child_tasks(&ids, *dag_ins, settled).await,
            Step::Push(ids, dag_ins) => self.push_tasks(&dag_ins, &ids).await,
        }
    }

    /// Propagates a parent's cancellation to its would-be children.
    async fn cancel_child_tasks(
        &self,
        ids: &[TaskInstanceId],
        mut dag_ins: DagInstance,
        settled: bool,
    ) -> Result<()> {
        for id in ids {
            self.store
                .patch_task_ins(
                    TaskInstancePatch::new(id.clone())
                        .with_status(TaskInstanceStatus::Canceled)
                        .with_reason(REASON_PARENT_CANCEL),
                    &[],
                )
                .await?;
        }

        if settled {
            self.task_trees.remove(&dag_ins.id);
        }

        if !dag_ins.can_modify_status() {
            return Ok(());
        }
        let joined = ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",");
        dag_ins.fail(format!("task instance[{joined}] canceled"));
        self.store
            .patch_dag_ins(
                DagInstancePatch::new(dag_ins.id.clone())
                    .with_status(dag_ins.status)
                    .with_reason(dag_ins.reason.clone()),
                &[],
            )
            .await
    }

    async fn push_tasks(
        &self,
        dag_ins: &DagInstance,
        ids: &[TaskInstanceId],
    ) -> Result<()> {
        let tasks = self
            .store
            .list_task_instance(&ListTaskInstanceInput {
                ids: ids.to_vec(),
                ..ListTaskInstanceInput::default()
            })
            .await?;

        let executor = self.executor()?;
        for task in tasks {
            executor.push(dag_ins, task).await;
        }
        Ok(())
    }

    async fn watch_dag_ins_cmd(&self) -> Result<()> {
        let dag_ins = self
            .store
            .list_dag_instance(&ListDagInstanceInput {
                worker: Some(self.keeper.worker_key().to_string()),
                has_cmd: true,
                ..ListDagInstanceInput::default()
            })
            .await?;

        for ins in dag_ins {
            self.parse_cmd(ins).await?;
        }
        Ok(())
    }

    /// Interprets one pending command, then clears the command slot (and the
    /// reason) with a forced patch.
    async fn parse_cmd(&self, mut dag_ins: DagInstance) -> Result<()> {
        let Some(cmd) = dag_ins.cmd.clone() else {
            return Ok(());
        };

        match cmd.name {
            CommandName::Retry => {
                self.re_enter_tasks(
                    &mut dag_ins,
                    &cmd.target_task_ins_ids,
                    &[TaskInstanceStatus::Failed, TaskInstanceStatus::Canceled],
                    TaskInstanceStatus::Retrying,
                )
                .await?;
            }
            CommandName::Cancel => {
                self.executor()?.cancel_task_ins(&cmd.target_task_ins_ids);
            }
            CommandName::Continue => {
                self.re_enter_tasks(
                    &mut dag_ins,
                    &cmd.target_task_ins_ids,
                    &[TaskInstanceStatus::Blocked],
                    TaskInstanceStatus::Continue,
                )
                .await?;
            }
        }

        dag_ins.cmd = None;
        self.store
            .patch_dag_ins(
                DagInstancePatch::new(dag_ins.id.clone()).with_status(dag_ins.status),
                &[DagInsField::Cmd, DagInsField::Reason],
            )
            .await
    }

    /// Re-enters targeted tasks through a transient state, then
    /// re-initializes the instance when anything changed.
    async fn re_enter_tasks(
        &self,
        dag_ins: &mut DagInstance,
        target_ids: &[TaskInstanceId],
        from: &[TaskInstanceStatus],
        to: TaskInstanceStatus,
    ) -> Result<()> {
        let tasks = self
            .store
            .list_task_instance(&ListTaskInstanceInput {
                dag_ins_id: Some(dag_ins.id.clone()),
                ids: target_ids.to_vec(),
                status: from.to_vec(),
                ..ListTaskInstanceInput::default()
            })
            .await?;

        let mut changed = false;
        for mut task in tasks {
            if !from.contains(&task.status) {
                continue;
            }
            task.set_status(to)?;
            task.reason = String::new();
            self.store.update_task_ins(&task).await?;
            changed = true;
        }

        dag_ins.run();
        if changed {
            self.initial_dag_ins(dag_ins.clone()).await;
        }
        Ok(())
    }

    /// Boot recovery: rebuild trees for running instances owned by this
    /// worker.
    async fn initial_running_dag_ins(&self) -> Result<()> {
        let dag_ins = self
            .store
            .list_dag_instance(&ListDagInstanceInput {
                worker: Some(self.keeper.worker_key().to_string()),
                status: vec![DagInstanceStatus::Running],
                ..ListDagInstanceInput::default()
            })
            .await?;

        for ins in dag_ins {
            self.initial_dag_ins(ins).await;
        }
        Ok(())
    }

    /// Returns how many task trees are currently held. Test support.
    #[must_use]
    pub fn active_tree_count(&self) -> usize {
        self.task_trees.len()
    }

    /// Shutdown: stop the watchers, close the shards, join everything.
    pub async fn close(&self) {
        self.closed.cancel();
        if let Ok(mut senders) = self.senders.write() {
            senders.clear();
        }

        let handles = self
            .handles
            .lock()
            .map(|mut guard| guard.drain(..).collect::<Vec<_>>())
            .unwrap_or_default();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for Parser {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Parser")
            .field("worker_count", &self.worker_count)
            .field("active_trees", &self.task_trees.len())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy)]
enum WatcherKind {
    Scheduled,
    Command,
}
