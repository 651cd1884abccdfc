//! Engine bootstrap and lifecycle.
//!
//! [`Engine::start`] wires one worker process: it freezes the action
//! registry, builds the executor and parser, subscribes the leadership
//! handler, and optionally loads DAG definitions from disk. Every component
//! receives its dependencies by handle; there is no global mutable state.
//!
//! Leader-only components (dispatcher and watchdog) are created when this
//! worker gains leadership and closed when it loses it, idempotently, driven
//! by [`crate::events::FlowEvent::LeaderChanged`].

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::action::{ActionRegistry, Waiting};
use crate::commander::Commander;
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::events::{EventBus, FlowEvent};
use crate::executor::Executor;
use crate::keeper::Keeper;
use crate::parser::Parser;
use crate::store::Store;
use crate::watchdog::Watchdog;
use crate::yaml::load_dags_from_dir;

/// Engine initialization options.
///
/// The keeper and store are external collaborators: construct and start them
/// first (sharing the engine's [`EventBus`]), then hand them in.
#[derive(Clone)]
pub struct EngineOptions {
    /// Cluster membership backend.
    pub keeper: Arc<dyn Keeper>,
    /// Persistence backend.
    pub store: Arc<dyn Store>,
    /// Event bus shared with the keeper and store.
    pub bus: EventBus,
    /// Parser shard workers. Default 100.
    pub parser_workers_cnt: usize,
    /// Executor pool size. Default 1000.
    pub executor_worker_cnt: usize,
    /// Default per-task deadline. Default 30 s.
    pub executor_timeout: Duration,
    /// Watchdog threshold for stuck `scheduled` instances. Default 15 s.
    pub dag_schedule_timeout: Duration,
    /// Optional directory of DAG YAML definitions loaded at boot.
    pub read_dag_from_dir: Option<PathBuf>,
}

impl EngineOptions {
    /// Creates options with the defaults.
    #[must_use]
    pub fn new(keeper: Arc<dyn Keeper>, store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self {
            keeper,
            store,
            bus,
            parser_workers_cnt: 100,
            executor_worker_cnt: 1000,
            executor_timeout: Duration::from_secs(30),
            dag_schedule_timeout: Duration::from_secs(15),
            read_dag_from_dir: None,
        }
    }

    /// Sets the parser shard worker count.
    #[must_use]
    pub const fn with_parser_workers(mut self, count: usize) -> Self {
        self.parser_workers_cnt = count;
        self
    }

    /// Sets the executor pool size.
    #[must_use]
    pub const fn with_executor_workers(mut self, count: usize) -> Self {
        self.executor_worker_cnt = count;
        self
    }

    /// Sets the default per-task deadline.
    #[must_use]
    pub const fn with_executor_timeout(mut self, timeout: Duration) -> Self {
        self.executor_timeout = timeout;
        self
    }

    /// Sets the watchdog threshold for stuck `scheduled` instances.
    #[must_use]
    pub const fn with_dag_schedule_timeout(mut self, timeout: Duration) -> Self {
        self.dag_schedule_timeout = timeout;
        self
    }

    /// Enables the YAML directory loader.
    #[must_use]
    pub fn with_read_dag_from_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.read_dag_from_dir = Some(dir.into());
        self
    }
}

/// Dispatcher and watchdog, alive only while this worker leads.
struct LeaderComponents {
    dispatcher: Arc<Dispatcher>,
    watchdog: Arc<Watchdog>,
}

impl LeaderComponents {
    fn start(options: &EngineOptions) -> Self {
        let dispatcher = Dispatcher::new(
            Arc::clone(&options.store),
            Arc::clone(&options.keeper),
            options.bus.clone(),
        );
        dispatcher.start();

        let watchdog = Watchdog::new(Arc::clone(&options.store), options.dag_schedule_timeout);
        watchdog.start();

        Self {
            dispatcher,
            watchdog,
        }
    }

    async fn close(self) {
        self.dispatcher.close().await;
        self.watchdog.close().await;
    }
}

/// One worker process of the cluster.
pub struct Engine {
    options: EngineOptions,
    parser: Arc<Parser>,
    executor: Arc<Executor>,
    commander: Arc<Commander>,
    actions: Arc<ActionRegistry>,
    leader_components: Arc<tokio::sync::Mutex<Option<LeaderComponents>>>,
    leader_cancel: CancellationToken,
    leader_handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Boots a worker: freezes the registry, starts executor and parser,
    /// subscribes the leadership handler, loads DAG definitions.
    ///
    /// The built-in [`Waiting`] action is always registered.
    ///
    /// # Errors
    ///
    /// Fails when the YAML directory cannot be loaded.
    pub async fn start(options: EngineOptions, mut actions: ActionRegistry) -> Result<Self> {
        actions.register(Arc::new(Waiting));
        let actions = Arc::new(actions);

        let executor = Executor::new(
            Arc::clone(&options.store),
            options.bus.clone(),
            Arc::clone(&actions),
            options.executor_timeout,
            options.executor_worker_cnt,
        );
        let parser = Parser::new(
            Arc::clone(&options.store),
            Arc::clone(&options.keeper),
            options.bus.clone(),
            options.parser_workers_cnt,
            options.executor_timeout,
        );
        executor.set_parser(Arc::clone(&parser));
        parser.set_executor(Arc::clone(&executor));

        // The executor must run before the parser starts pushing.
        executor.start();
        parser.start().await;

        let commander = Arc::new(Commander::new(
            Arc::clone(&options.store),
            Arc::clone(&options.keeper),
        ));

        let leader_components = Arc::new(tokio::sync::Mutex::new(None));
        let leader_cancel = CancellationToken::new();
        let leader_handle = Self::spawn_leader_handler(
            &options,
            Arc::clone(&leader_components),
            leader_cancel.clone(),
        );

        // Election may have settled before our subscription; catch up.
        if options.keeper.is_leader() {
            let mut components = leader_components.lock().await;
            if components.is_none() {
                tracing::info!(worker = options.keeper.worker_key(), "leader initial");
                *components = Some(LeaderComponents::start(&options));
            }
        }

        if let Some(dir) = &options.read_dag_from_dir {
            load_dags_from_dir(&options.store, dir).await?;
        }

        Ok(Self {
            options,
            parser,
            executor,
            commander,
            actions,
            leader_components,
            leader_cancel,
            leader_handle: tokio::sync::Mutex::new(Some(leader_handle)),
        })
    }

    fn spawn_leader_handler(
        options: &EngineOptions,
        components: Arc<tokio::sync::Mutex<Option<LeaderComponents>>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let options = options.clone();
        let mut rx = options.bus.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Ok(FlowEvent::LeaderChanged { is_leader, worker_key }) => {
                            // A shared bus carries other workers' flips too.
                            if worker_key != options.keeper.worker_key() {
                                continue;
                            }
                            let mut guard = components.lock().await;
                            if is_leader && guard.is_none() {
                                tracing::info!(worker = worker_key, "leader initial");
                                *guard = Some(LeaderComponents::start(&options));
                            } else if !is_leader {
                                if let Some(active) = guard.take() {
                                    tracing::info!(worker = worker_key, "leader lost");
                                    active.close().await;
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "leadership handler lagged");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        })
    }

    /// The command surface for submitting and steering DAG instances.
    #[must_use]
    pub fn commander(&self) -> &Arc<Commander> {
        &self.commander
    }

    /// The event bus.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.options.bus
    }

    /// The persistence backend.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.options.store
    }

    /// The membership backend.
    #[must_use]
    pub fn keeper(&self) -> &Arc<dyn Keeper> {
        &self.options.keeper
    }

    /// The frozen action registry.
    #[must_use]
    pub fn actions(&self) -> &Arc<ActionRegistry> {
        &self.actions
    }

    /// Shuts the worker down: leader components, executor, parser, store,
    /// keeper, in that order.
    pub async fn close(&self) {
        self.leader_cancel.cancel();
        if let Some(handle) = self.leader_handle.lock().await.take() {
            let _ = handle.await;
        }
        if let Some(components) = self.leader_components.lock().await.take() {
            components.close().await;
        }

        self.executor.close().await;
        self.parser.close().await;
        self.options.store.close().await;
        self.options.keeper.close().await;
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("worker", &self.options.keeper.worker_key())
            .finish_non_exhaustive()
    }
}
