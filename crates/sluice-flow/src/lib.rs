//! # sluice-flow
//!
//! A distributed DAG workflow engine.
//!
//! Users define workflows as DAGs of named tasks with declared dependencies
//! and action names; the engine instantiates those DAGs on submission and
//! drives each instance to completion across a cluster of worker processes,
//! honoring dependency order, parallelism, per-task timeouts,
//! retry/cancel/continue commands, pre-check gates, and variable
//! substitution.
//!
//! ## Architecture
//!
//! Every worker process runs a [`parser::Parser`] (the per-worker scheduler)
//! and an [`executor::Executor`] (the action worker pool). Exactly one worker
//! additionally leads the cluster, with its lease maintained by the
//! [`keeper::Keeper`] backend, and runs the [`dispatcher::Dispatcher`]
//! (binds fresh instances to workers) and the [`watchdog::Watchdog`]
//! (recovers instances stuck on dead workers and force-fails timed-out
//! tasks). All durable state lives behind the [`store::Store`] contract.
//!
//! Data flow for one DAG instance:
//!
//! ```text
//! submit (init) ─► dispatcher binds worker, sets scheduled
//!               ─► parser materializes task instances, sets running
//!               ─► executor runs root tasks
//!               ─► each completion advances the task tree, pushes next tasks
//!               ─► terminal rollup: success | failed | blocked
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use sluice_core::IdGenerator;
//! use sluice_flow::action::ActionRegistry;
//! use sluice_flow::engine::{Engine, EngineOptions};
//! use sluice_flow::events::EventBus;
//! use sluice_flow::keeper::memory::{ClusterState, LocalKeeper, LocalKeeperOptions};
//! use sluice_flow::store::memory::MemoryStore;
//! use sluice_flow::store::Store;
//!
//! # async fn boot() -> sluice_flow::error::Result<()> {
//! let bus = EventBus::new();
//! let keeper = LocalKeeper::start(
//!     &LocalKeeperOptions::new("worker-1"),
//!     Arc::new(ClusterState::default()),
//!     bus.clone(),
//! )?;
//! let store: Arc<dyn Store> =
//!     Arc::new(MemoryStore::new(Arc::new(IdGenerator::new(1)), bus.clone()));
//!
//! let engine = Engine::start(
//!     EngineOptions::new(keeper, store, bus),
//!     ActionRegistry::new(),
//! )
//! .await?;
//!
//! let dag_ins = engine
//!     .commander()
//!     .run_dag(&"my-dag".into(), &BTreeMap::new())
//!     .await?;
//! println!("submitted {}", dag_ins.id);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod action;
pub mod commander;
pub mod context;
pub mod dag;
pub mod dag_instance;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod events;
pub mod executor;
pub mod keeper;
pub mod metrics;
pub mod parser;
pub mod render;
pub mod store;
pub mod task_instance;
pub mod tasktree;
pub mod watchdog;
pub mod yaml;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::action::{Action, ActionOutcome, ActionRegistry};
    pub use crate::commander::{CommandOption, Commander};
    pub use crate::context::{ExecuteContext, TracePersist};
    pub use crate::dag::{Check, CheckAction, Dag, DagStatus, Task, TaskCondition};
    pub use crate::dag_instance::{
        Command, CommandName, DagInstance, DagInstanceStatus, ShareData, Trigger,
    };
    pub use crate::engine::{Engine, EngineOptions};
    pub use crate::error::{Error, Result};
    pub use crate::events::{EventBus, FlowEvent, Topic};
    pub use crate::keeper::{DistributedMutex, Keeper, LockOptions};
    pub use crate::store::{
        DagInsField, DagInstancePatch, ListDagInstanceInput, ListTaskInstanceInput, Store,
        TaskInsField, TaskInstancePatch,
    };
    pub use crate::task_instance::{TaskInstance, TaskInstanceStatus, TraceInfo};
    pub use crate::tasktree::{TaskTree, TreeStatus};
}
