//! Executor: runs task actions on a bounded worker pool.
//!
//! Every pushed task first passes its pre-checks (a match persists `skipped`
//! or `blocked` and reports straight back to the parser). Runnable tasks go
//! through a capacity-1 init queue (serializing cancel-map registration so
//! the map has a single writer) and then onto the worker queue, where N
//! workers drive the per-task state machine:
//!
//! ```text
//! init ─ run_before ─► running ─ run ─► ending ─ run_after ─► success
//! retrying ─ retry_before ─► init (re-queued through the parser)
//! ```
//!
//! Each transition persists through the store. Cancellation is cooperative: a
//! `cancel` command (or the per-task deadline) cancels the task's token and
//! removes its cancel-map entry; what the action returns afterwards decides
//! between `canceled` and `success` with the success-after-canceled marker.
//! Panics are recovered into task failures; the worker never crashes.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use sluice_core::{DagInstanceId, TaskInstanceId};

use crate::action::ActionRegistry;
use crate::context::ExecuteContext;
use crate::dag_instance::{DagInstance, ShareDataSink};
use crate::error::{Error, Result};
use crate::events::{EventBus, FlowEvent};
use crate::metrics::FlowMetrics;
use crate::parser::Parser;
use crate::store::{DagInstancePatch, Store, TaskInstancePatch};
use crate::task_instance::{TaskInstance, TaskInstanceStatus};

/// Reason marking a task that returned success after its cancel was issued.
/// The parser treats it as a signal to cascade cancellation to descendants.
pub const REASON_SUCCESS_AFTER_CANCELED: &str = "success after canceled";

/// Reason stamped onto descendants canceled because their parent carried the
/// success-after-canceled marker.
pub const REASON_PARENT_CANCEL: &str = "parent success but already be canceled";

/// A task waiting for init (cancel-map registration).
struct InitPayload {
    dag_ins: DagInstance,
    task_ins: TaskInstance,
}

/// A task ready to run.
struct WorkItem {
    task_ins: TaskInstance,
    ctx: ExecuteContext,
}

/// Persists share-data snapshots onto the owning DAG instance.
struct StoreShareDataSink {
    store: Arc<dyn Store>,
    dag_ins_id: DagInstanceId,
}

#[async_trait]
impl ShareDataSink for StoreShareDataSink {
    async fn persist(&self, snapshot: &BTreeMap<String, String>) -> Result<()> {
        self.store
            .patch_dag_ins(
                DagInstancePatch::new(self.dag_ins_id.clone())
                    .with_share_data(snapshot.clone()),
                &[],
            )
            .await
    }
}

/// Task executor with a bounded worker pool.
pub struct Executor {
    store: Arc<dyn Store>,
    bus: EventBus,
    actions: Arc<ActionRegistry>,
    metrics: FlowMetrics,
    default_timeout: Duration,
    worker_count: usize,
    cancel_map: DashMap<TaskInstanceId, CancellationToken>,
    parser: OnceLock<Arc<Parser>>,
    init_tx: Mutex<Option<mpsc::Sender<InitPayload>>>,
    init_rx: Mutex<Option<mpsc::Receiver<InitPayload>>>,
    work_tx: Mutex<Option<mpsc::Sender<WorkItem>>>,
    work_rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>,
    closed: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Executor {
    /// Creates an executor. Call [`Executor::start`] to spin up the pool.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        bus: EventBus,
        actions: Arc<ActionRegistry>,
        default_timeout: Duration,
        worker_count: usize,
    ) -> Arc<Self> {
        // Capacity 1: init is deliberately serialized.
        let (init_tx, init_rx) = mpsc::channel(1);
        let (work_tx, work_rx) = mpsc::channel(worker_count.max(1));

        Arc::new(Self {
            store,
            bus,
            actions,
            metrics: FlowMetrics::new(),
            default_timeout,
            worker_count: worker_count.max(1),
            cancel_map: DashMap::new(),
            parser: OnceLock::new(),
            init_tx: Mutex::new(Some(init_tx)),
            init_rx: Mutex::new(Some(init_rx)),
            work_tx: Mutex::new(Some(work_tx)),
            work_rx: Arc::new(tokio::sync::Mutex::new(work_rx)),
            closed: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Wires the parser completion callback. Must happen before
    /// [`Executor::start`].
    pub fn set_parser(&self, parser: Arc<Parser>) {
        let _ = self.parser.set(parser);
    }

    fn parser(&self) -> Option<&Arc<Parser>> {
        self.parser.get()
    }

    /// Starts the init pump and the worker pool.
    pub fn start(self: &Arc<Self>) {
        let mut handles = Vec::new();

        if let Some(mut init_rx) = self.init_rx.lock().ok().and_then(|mut g| g.take()) {
            let executor = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                while let Some(payload) = init_rx.recv().await {
                    executor.init_worker_task(payload).await;
                }
            }));
        }

        for _ in 0..self.worker_count {
            let executor = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                loop {
                    let item = {
                        let mut rx = executor.work_rx.lock().await;
                        rx.recv().await
                    };
                    let Some(item) = item else { break };
                    executor.worker_do(item).await;
                }
            }));
        }

        if let Ok(mut guard) = self.handles.lock() {
            *guard = handles;
        }
    }

    /// Accepts a task for execution.
    ///
    /// Pre-checks run first, in insertion order; a match persists the gate status
    /// and reports back to the parser without enqueueing. A task re-entering
    /// via `continue` already had its gate overridden by the user, so its
    /// pre-checks are not re-evaluated.
    pub async fn push(&self, dag_ins: &DagInstance, mut task_ins: TaskInstance) {
        if task_ins.status != TaskInstanceStatus::Continue {
            if let Some(act) = task_ins.do_pre_check(dag_ins) {
                let patch = TaskInstancePatch::new(task_ins.id.clone())
                    .with_status(task_ins.status);
                if let Err(err) = self.store.patch_task_ins(patch, &[]).await {
                    tracing::error!(task_ins_id = %task_ins.id, %err, "patch task failed");
                    return;
                }
                tracing::debug!(
                    task_ins_id = %task_ins.id,
                    act = ?act,
                    "pre-check matched, task will not execute"
                );
                self.entry_parser(task_ins);
                return;
            }
        }

        if self.closed.is_cancelled() {
            tracing::info!("executor has already closed, task will not execute");
            return;
        }

        let sender = self.init_tx.lock().ok().and_then(|g| g.clone());
        let Some(sender) = sender else {
            tracing::info!("executor has already closed, task will not execute");
            return;
        };
        let payload = InitPayload {
            dag_ins: dag_ins.clone(),
            task_ins,
        };
        if sender.send(payload).await.is_err() {
            tracing::info!("executor init queue closed, task dropped");
        }
    }

    /// Registers the cancel token and execution context, then queues the task.
    async fn init_worker_task(&self, payload: InitPayload) {
        let InitPayload { dag_ins, task_ins } = payload;

        if self.cancel_map.contains_key(&task_ins.id) {
            tracing::warn!(
                task_ins_id = %task_ins.id,
                status = %task_ins.status,
                "task instance is already running"
            );
            return;
        }

        let timeout = if task_ins.timeout_secs == 0 {
            self.default_timeout
        } else {
            Duration::from_secs(task_ins.timeout_secs)
        };

        dag_ins.share_data.install_sink(Arc::new(StoreShareDataSink {
            store: Arc::clone(&self.store),
            dag_ins_id: dag_ins.id.clone(),
        }));

        let token = CancellationToken::new();
        // Deadline task: cancel the token once the timeout elapses. The
        // action is never aborted forcibly, so a late success still surfaces.
        {
            let token = token.clone();
            tokio::spawn(async move {
                tokio::select! {
                    () = token.cancelled() => {}
                    () = tokio::time::sleep(timeout) => token.cancel(),
                }
            });
        }

        let ctx = ExecuteContext::new(
            &dag_ins,
            task_ins.id.clone(),
            task_ins.traces.clone(),
            token.clone(),
            Arc::clone(&self.store),
        );
        self.cancel_map.insert(task_ins.id.clone(), token);

        let sender = self.work_tx.lock().ok().and_then(|g| g.clone());
        if let Some(sender) = sender {
            if sender.send(WorkItem { task_ins, ctx }).await.is_err() {
                tracing::info!("executor worker queue closed, task dropped");
            }
        }
    }

    /// Cancels tasks cooperatively: removes their cancel-map entries and
    /// fires their tokens. The action decides when to stop.
    pub fn cancel_task_ins(&self, task_ins_ids: &[TaskInstanceId]) {
        for id in task_ins_ids {
            if let Some((_, token)) = self.cancel_map.remove(id) {
                token.cancel();
            }
        }
    }

    async fn worker_do(&self, item: WorkItem) {
        let WorkItem { mut task_ins, ctx } = item;

        if !task_ins.status.is_runnable_entry() {
            tracing::warn!(
                task_ins_id = %task_ins.id,
                status = %task_ins.status,
                "task instance is not executable"
            );
            return;
        }

        self.metrics.record_task_begun();
        self.bus.publish(FlowEvent::TaskBegin {
            task_ins: Box::new(task_ins.clone()),
        });

        let run = std::panic::AssertUnwindSafe(self.run_action(&mut task_ins, &ctx))
            .catch_unwind()
            .await;
        let outcome = match run {
            Ok(outcome) => outcome,
            Err(panic) => Err(Error::ActionFailed {
                message: format!(
                    "get panic when running action: {}, err: {}",
                    task_ins.action_name,
                    panic_message(panic.as_ref())
                ),
            }),
        };

        self.handle_task_error(&mut task_ins, &ctx, outcome.err()).await;

        // Fire the token so the deadline task retires immediately.
        if let Some((_, token)) = self.cancel_map.remove(&task_ins.id) {
            token.cancel();
        }
        self.metrics
            .record_task_completed(task_ins.status.as_label());
        self.entry_parser(task_ins.clone());
        self.bus.publish(FlowEvent::TaskCompleted {
            task_ins: Box::new(task_ins),
        });
    }

    /// Drives the state machine for one queued entry. One call may advance
    /// through several states.
    async fn run_action(&self, task_ins: &mut TaskInstance, ctx: &ExecuteContext) -> Result<()> {
        let action =
            self.actions
                .get(&task_ins.action_name)
                .ok_or_else(|| Error::ActionNotFound {
                    name: task_ins.action_name.clone(),
                })?;

        let params = if task_ins.params.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::Value::Object(task_ins.params.clone())
        };

        if matches!(
            task_ins.status,
            TaskInstanceStatus::Init | TaskInstanceStatus::Continue
        ) {
            action
                .run_before(ctx, &params)
                .await
                .map_err(|err| Error::ActionFailed {
                    message: format!("run before failed: {err}"),
                })?;
            self.set_status(task_ins, ctx, TaskInstanceStatus::Running)
                .await?;

            action.run(ctx, &params).await.map_err(|err| Error::ActionFailed {
                message: format!("run failed: {err}"),
            })?;
            self.set_status(task_ins, ctx, TaskInstanceStatus::Ending)
                .await?;
        }

        if task_ins.status == TaskInstanceStatus::Ending {
            action
                .run_after(ctx, &params)
                .await
                .map_err(|err| Error::ActionFailed {
                    message: format!("run after failed: {err}"),
                })?;
            self.set_status(task_ins, ctx, TaskInstanceStatus::Success)
                .await?;
        }

        if task_ins.status == TaskInstanceStatus::Retrying {
            action
                .retry_before(ctx, &params)
                .await
                .map_err(|err| Error::ActionFailed {
                    message: format!("run retryBefore failed: {err}"),
                })?;
            // Back to init; the parser re-queues it for the next pass.
            self.set_status(task_ins, ctx, TaskInstanceStatus::Init)
                .await?;
        }

        Ok(())
    }

    /// Applies and persists a status transition, flushing buffered traces.
    async fn set_status(
        &self,
        task_ins: &mut TaskInstance,
        ctx: &ExecuteContext,
        status: TaskInstanceStatus,
    ) -> Result<()> {
        task_ins.set_status(status)?;
        task_ins.traces = ctx.flush_traces();

        let mut patch = TaskInstancePatch::new(task_ins.id.clone()).with_status(status);
        if !task_ins.reason.is_empty() {
            patch = patch.with_reason(task_ins.reason.clone());
        }
        if !task_ins.traces.is_empty() {
            patch = patch.with_traces(task_ins.traces.clone());
        }
        self.store.patch_task_ins(patch, &[]).await?;
        self.metrics.record_task_transition(status.as_label());
        Ok(())
    }

    /// Decides the final status from the run outcome and the cancel map.
    ///
    /// - error + still registered: `failed`
    /// - error + deregistered (canceled meanwhile): `canceled`
    /// - success + deregistered: keep `success`, stamp the
    ///   success-after-canceled marker so the parser cascades cancellation
    async fn handle_task_error(
        &self,
        task_ins: &mut TaskInstance,
        ctx: &ExecuteContext,
        err: Option<Error>,
    ) {
        let still_registered = self.cancel_map.contains_key(&task_ins.id);

        if let Some(err) = err {
            task_ins.reason = err.to_string();
            let status = if still_registered {
                TaskInstanceStatus::Failed
            } else {
                TaskInstanceStatus::Canceled
            };
            if let Err(set_err) = self.set_status(task_ins, ctx, status).await {
                tracing::error!(task_ins_id = %task_ins.id, err = %set_err, "set status failed");
            }
            return;
        }

        if still_registered {
            return;
        }

        task_ins.reason = REASON_SUCCESS_AFTER_CANCELED.to_string();
        let patch = TaskInstancePatch::new(task_ins.id.clone())
            .with_reason(REASON_SUCCESS_AFTER_CANCELED);
        if let Err(err) = self.store.patch_task_ins(patch, &[]).await {
            tracing::error!(
                task_ins_id = %task_ins.id,
                %err,
                "tag canceled task instance failed"
            );
        }
    }

    fn entry_parser(&self, task_ins: TaskInstance) {
        if let Some(parser) = self.parser() {
            parser.entry_task_ins(task_ins);
        } else {
            tracing::error!("executor has no parser wired, task report dropped");
        }
    }

    /// Shutdown: flag closed, drain the init queue, then drain the workers.
    pub async fn close(&self) {
        self.closed.cancel();

        if let Ok(mut guard) = self.init_tx.lock() {
            guard.take();
        }
        if let Ok(mut guard) = self.work_tx.lock() {
            guard.take();
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

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("worker_count", &self.worker_count)
            .field("in_flight", &self.cancel_map.len())
            .finish_non_exhaustive()
    }
}

/// Extracts a printable message from a panic payload.
fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
