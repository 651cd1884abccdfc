//! Dispatcher: binds fresh DAG instances to workers.
//!
//! Leader-only. The dispatcher is the single writer of the `init →
//! scheduled` transition across the whole cluster, guaranteed by the leader
//! lease. Its 1 Hz tick claims up to [`DISPATCH_BATCH_LIMIT`] `init`
//! instances and assigns them round-robin over the alive workers.
//!
//! Round-robin needs no load feedback: dispatch cost is amortized by the
//! parser, workers are interchangeable, and load-aware placement would
//! require a second round-trip with its own failure modes.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dag_instance::DagInstanceStatus;
use crate::error::{Error, Result};
use crate::events::{EventBus, FlowEvent};
use crate::keeper::Keeper;
use crate::metrics::FlowMetrics;
use crate::store::{ListDagInstanceInput, Store};

/// Upper bound on instances claimed per tick.
const DISPATCH_BATCH_LIMIT: usize = 1000;

/// Tick cadence.
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Leader-only dispatcher.
pub struct Dispatcher {
    store: Arc<dyn Store>,
    keeper: Arc<dyn Keeper>,
    bus: EventBus,
    metrics: FlowMetrics,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dispatcher {
    /// Creates a dispatcher. Call [`Dispatcher::start`] to begin ticking.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, keeper: Arc<dyn Keeper>, bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            store,
            keeper,
            bus,
            metrics: FlowMetrics::new(),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        })
    }

    /// Starts the 1 Hz dispatch loop.
    pub fn start(self: &Arc<Self>) {
        let dispatcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = dispatcher.cancel.cancelled() => break,
                    _ = ticker.tick() => dispatcher.tick().await,
                }
            }
        });
        if let Ok(mut guard) = self.handle.lock() {
            *guard = Some(handle);
        }
    }

    async fn tick(&self) {
        let start = std::time::Instant::now();
        let result = self.dispatch().await;
        let elapsed = start.elapsed();

        self.metrics
            .observe_dispatch_tick(elapsed.as_secs_f64(), result.is_ok());

        let error = result
            .as_ref()
            .err()
            .map(|err| format!("dispatch failed: {err}"));
        if let Some(message) = &error {
            tracing::error!(module = "dispatch", err = %message, "dispatch failed");
        }

        self.bus.publish(FlowEvent::DispatchInitDagInsCompleted {
            elapsed_ms: i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX),
            error,
        });
    }

    /// One dispatch round: claim `init` instances and bind them round-robin
    /// over the alive workers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAliveNodes`] when the keeper reports no live
    /// workers; the loop logs and retries next tick, mutating nothing.
    pub async fn dispatch(&self) -> Result<()> {
        let mut dag_ins = self
            .store
            .list_dag_instance(&ListDagInstanceInput {
                status: vec![DagInstanceStatus::Init],
                limit: Some(DISPATCH_BATCH_LIMIT),
                ..ListDagInstanceInput::default()
            })
            .await?;
        if dag_ins.is_empty() {
            return Ok(());
        }

        let nodes = self.keeper.alive_nodes().await?;
        if nodes.is_empty() {
            return Err(Error::NoAliveNodes);
        }

        for (i, ins) in dag_ins.iter_mut().enumerate() {
            ins.status = DagInstanceStatus::Scheduled;
            ins.worker.clone_from(&nodes[i % nodes.len()]);
        }

        self.store.batch_update_dag_ins(&dag_ins).await
    }

    /// Stops the loop and waits for the in-flight tick.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().ok().and_then(|mut guard| guard.take());
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher").finish_non_exhaustive()
    }
}
