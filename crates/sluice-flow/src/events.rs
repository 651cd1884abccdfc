//! In-process event broker.
//!
//! Scheduling components publish [`FlowEvent`]s to an [`EventBus`]; interested
//! parties subscribe and receive every event published after their
//! subscription. Delivery is local and at-least-once: the bus never blocks a
//! publisher, and a slow subscriber that overflows the channel observes a lag
//! error rather than stalling the pipeline.
//!
//! The engine's leadership handler subscribes before the keeper starts, so no
//! leader flip can be missed.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::dag_instance::DagInstance;
use crate::store::{DagInsField, DagInstancePatch};
use crate::task_instance::TaskInstance;

/// Default broadcast channel capacity.
const DEFAULT_CAPACITY: usize = 1000;

/// Topics events are addressed by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Topic {
    /// Leadership changed on this worker.
    LeaderChanged,
    /// A DAG instance was fully updated.
    DagInstanceUpdated,
    /// A DAG instance was field-selectively patched.
    DagInstancePatched,
    /// The executor began a task.
    TaskBegin,
    /// The executor completed a task (any outcome).
    TaskCompleted,
    /// One dispatcher tick finished.
    DispatchInitDagInsCompleted,
    /// One parser scheduled-watcher tick finished.
    ParseScheduleDagInsCompleted,
}

/// Events published by the scheduling pipeline.
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// Leadership changed on this worker.
    LeaderChanged {
        /// True when this worker became leader.
        is_leader: bool,
        /// The worker's key.
        worker_key: String,
    },
    /// A DAG instance was fully updated.
    DagInstanceUpdated {
        /// The updated instance.
        payload: Box<DagInstance>,
    },
    /// A DAG instance was field-selectively patched.
    DagInstancePatched {
        /// The applied patch.
        payload: Box<DagInstancePatch>,
        /// Fields written even when unset.
        must_patch_fields: Vec<DagInsField>,
    },
    /// The executor began a task.
    TaskBegin {
        /// The task about to run.
        task_ins: Box<TaskInstance>,
    },
    /// The executor completed a task (any outcome).
    TaskCompleted {
        /// The task as reported to the parser.
        task_ins: Box<TaskInstance>,
    },
    /// One dispatcher tick finished.
    DispatchInitDagInsCompleted {
        /// Tick duration in milliseconds.
        elapsed_ms: i64,
        /// Error message when the tick failed.
        error: Option<String>,
    },
    /// One parser scheduled-watcher tick finished.
    ParseScheduleDagInsCompleted {
        /// Tick duration in milliseconds.
        elapsed_ms: i64,
        /// Error message when the tick failed.
        error: Option<String>,
    },
}

impl FlowEvent {
    /// Returns the event's topic.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::LeaderChanged { .. } => Topic::LeaderChanged,
            Self::DagInstanceUpdated { .. } => Topic::DagInstanceUpdated,
            Self::DagInstancePatched { .. } => Topic::DagInstancePatched,
            Self::TaskBegin { .. } => Topic::TaskBegin,
            Self::TaskCompleted { .. } => Topic::TaskCompleted,
            Self::DispatchInitDagInsCompleted { .. } => Topic::DispatchInitDagInsCompleted,
            Self::ParseScheduleDagInsCompleted { .. } => Topic::ParseScheduleDagInsCompleted,
        }
    }
}

/// Multi-subscriber event bus.
///
/// Cheap to clone; all clones publish into the same channel.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<FlowEvent>,
}

impl EventBus {
    /// Creates a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Creates a bus with a specific channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to every current subscriber.
    ///
    /// Publishing with no subscribers is a no-op.
    pub fn publish(&self, event: FlowEvent) {
        let _ = self.tx.send(event);
    }

    /// Subscribes to all events published after this call.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of active subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
