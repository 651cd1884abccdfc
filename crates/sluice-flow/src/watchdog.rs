//! Watchdog: leader-only recovery loops.
//!
//! Two 1 Hz loops rescue state no healthy worker will touch on its own:
//!
//! - **Expired tasks**: running task instances whose timeout elapsed (the
//!   owning worker may be dead, so no cancel is issued; the instance and
//!   task are force-failed in the store).
//! - **Left-behind instances**: `scheduled` DAG instances whose owning worker
//!   never parsed them within `dag_schedule_timeout`; reverting them to
//!   `init` makes the dispatcher place them again.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dag_instance::DagInstanceStatus;
use crate::error::Result;
use crate::metrics::FlowMetrics;
use crate::store::{
    DagInstancePatch, ListDagInstanceInput, ListTaskInstanceInput, Store, TaskInstancePatch,
};
use crate::task_instance::TaskInstanceStatus;

/// Reason stamped onto tasks the watchdog force-fails.
pub const REASON_FORCE_FAILED: &str =
    "force failed by watch dog because it execute too long";

/// Tick cadence.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Leader-only watchdog.
pub struct Watchdog {
    store: Arc<dyn Store>,
    dag_schedule_timeout: chrono::Duration,
    metrics: FlowMetrics,
    cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Watchdog {
    /// Creates a watchdog. Call [`Watchdog::start`] to begin ticking.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, dag_schedule_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            store,
            dag_schedule_timeout: chrono::Duration::from_std(dag_schedule_timeout)
                .unwrap_or_else(|_| chrono::Duration::seconds(15)),
            metrics: FlowMetrics::new(),
            cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
        })
    }

    /// Starts both recovery loops.
    pub fn start(self: &Arc<Self>) {
        let mut handles = Vec::new();
        for loop_kind in [LoopKind::ExpiredTasks, LoopKind::LeftBehind] {
            let watchdog = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(TICK_INTERVAL);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = watchdog.cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            let result = match loop_kind {
                                LoopKind::ExpiredTasks => watchdog.handle_expired_task_ins().await,
                                LoopKind::LeftBehind => watchdog.handle_left_behind_dag_ins().await,
                            };
                            if let Err(err) = result {
                                tracing::error!(module = "watchdog", %err, "here are some errors");
                            }
                        }
                    }
                }
            }));
        }
        if let Ok(mut guard) = self.handles.lock() {
            *guard = handles;
        }
    }

    /// Force-fails running tasks whose timeout elapsed, along with their DAG
    /// instances.
    ///
    /// # Errors
    ///
    /// Returns the first store error; the loop logs it and retries next tick.
    pub async fn handle_expired_task_ins(&self) -> Result<()> {
        let task_ins = self
            .store
            .list_task_instance(&ListTaskInstanceInput {
                status: vec![TaskInstanceStatus::Running],
                expired: true,
                ..ListTaskInstanceInput::default()
            })
            .await?;
        if task_ins.is_empty() {
            return Ok(());
        }

        for ins in &task_ins {
            self.store
                .patch_dag_ins(
                    DagInstancePatch::new(ins.dag_ins_id.clone())
                        .with_status(DagInstanceStatus::Failed),
                    &[],
                )
                .await?;

            self.store
                .patch_task_ins(
                    TaskInstancePatch::new(ins.id.clone())
                        .with_status(TaskInstanceStatus::Failed)
                        .with_reason(REASON_FORCE_FAILED),
                    &[],
                )
                .await?;
        }

        self.metrics
            .record_watchdog_rescue("expired_task", task_ins.len() as u64);
        Ok(())
    }

    /// Reverts `scheduled` DAG instances stuck past the schedule timeout back
    /// to `init` for re-dispatch.
    ///
    /// # Errors
    ///
    /// Returns the first store error; the loop logs it and retries next tick.
    pub async fn handle_left_behind_dag_ins(&self) -> Result<()> {
        let mut dag_ins = self
            .store
            .list_dag_instance(&ListDagInstanceInput {
                status: vec![DagInstanceStatus::Scheduled],
                updated_end: Some(Utc::now() - self.dag_schedule_timeout),
                ..ListDagInstanceInput::default()
            })
            .await?;
        if dag_ins.is_empty() {
            return Ok(());
        }

        for ins in &mut dag_ins {
            ins.status = DagInstanceStatus::Init;
        }
        self.store.batch_update_dag_ins(&dag_ins).await?;

        self.metrics
            .record_watchdog_rescue("left_behind", dag_ins.len() as u64);
        Ok(())
    }

    /// Stops both loops and waits for in-flight ticks.
    pub async fn close(&self) {
        self.cancel.cancel();
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

impl std::fmt::Debug for Watchdog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Watchdog").finish_non_exhaustive()
    }
}

#[derive(Clone, Copy)]
enum LoopKind {
    ExpiredTasks,
    LeftBehind,
}
