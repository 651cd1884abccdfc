//! Parser behavior tests with hand-wired components: tree initialization
//! idempotence and command no-ops.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use sluice_core::IdGenerator;
use sluice_flow::action::{Action, ActionOutcome, ActionRegistry};
use sluice_flow::context::ExecuteContext;
use sluice_flow::dag::{Dag, Task};
use sluice_flow::dag_instance::{DagInstance, DagInstanceStatus, Trigger};
use sluice_flow::events::EventBus;
use sluice_flow::executor::Executor;
use sluice_flow::keeper::memory::{ClusterState, LocalKeeper, LocalKeeperOptions};
use sluice_flow::keeper::Keeper;
use sluice_flow::parser::Parser;
use sluice_flow::store::memory::MemoryStore;
use sluice_flow::store::{ListTaskInstanceInput, Store};
use sluice_flow::task_instance::{TaskInstance, TaskInstanceStatus};

/// Counts runs and sleeps briefly so overlapping pushes would be observable.
#[derive(Debug, Default)]
struct SlowCounting {
    runs: AtomicUsize,
}

#[async_trait]
impl Action for SlowCounting {
    fn name(&self) -> &str {
        "slow-counting"
    }

    async fn run(&self, _ctx: &ExecuteContext, _params: &Value) -> ActionOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(())
    }
}

struct Wiring {
    store: Arc<dyn Store>,
    parser: Arc<Parser>,
    executor: Arc<Executor>,
    keeper: Arc<LocalKeeper>,
}

impl Wiring {
    async fn start(action: Arc<dyn Action>) -> Self {
        let bus = EventBus::new();
        let keeper = LocalKeeper::start(
            &LocalKeeperOptions::new("worker-1"),
            Arc::new(ClusterState::default()),
            bus.clone(),
        )
        .unwrap();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(
            Arc::new(IdGenerator::new(1)),
            bus.clone(),
        ));

        let mut registry = ActionRegistry::new();
        registry.register(action);

        let executor = Executor::new(
            Arc::clone(&store),
            bus.clone(),
            Arc::new(registry),
            Duration::from_secs(5),
            4,
        );
        let parser = Parser::new(
            Arc::clone(&store),
            keeper.clone(),
            bus.clone(),
            2,
            Duration::from_secs(5),
        );
        executor.set_parser(Arc::clone(&parser));
        parser.set_executor(Arc::clone(&executor));
        executor.start();
        parser.start().await;

        Self {
            store,
            parser,
            executor,
            keeper,
        }
    }

    /// A running instance with its task instances already materialized, the
    /// state a parser sees after a worker restart.
    async fn running_instance(&self, dag: &Dag) -> (DagInstance, Vec<TaskInstance>) {
        self.store.create_dag(dag).await.unwrap();
        let mut ins = dag.run(Trigger::Manually, &BTreeMap::new()).unwrap();
        ins.worker = "worker-1".to_string();
        ins.status = DagInstanceStatus::Running;
        self.store.create_dag_ins(&mut ins).await.unwrap();

        let mut tasks: Vec<TaskInstance> = dag
            .tasks
            .iter()
            .map(|t| TaskInstance::from_task(ins.id.clone(), t))
            .collect();
        self.store.batch_create_task_ins(&mut tasks).await.unwrap();
        (ins, tasks)
    }

    async fn wait_for_dag_status(&self, ins: &DagInstance, expected: DagInstanceStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let fetched = self.store.get_dag_instance(&ins.id).await.unwrap();
            if fetched.status == expected {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {expected}, instance is {}",
                fetched.status
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn close(self) {
        self.executor.close().await;
        self.parser.close().await;
        self.keeper.close().await;
    }
}

#[tokio::test]
async fn initial_dag_ins_twice_does_not_duplicate_execution() {
    let action = Arc::new(SlowCounting::default());
    let wiring = Wiring::start(action.clone()).await;

    let dag = Dag::new("idempotent").with_task(Task::new("t", "slow-counting"));
    let (ins, _tasks) = wiring.running_instance(&dag).await;

    // Initializing twice must not push the task past the executable set.
    wiring.parser.initial_dag_ins(ins.clone()).await;
    wiring.parser.initial_dag_ins(ins.clone()).await;

    wiring
        .wait_for_dag_status(&ins, DagInstanceStatus::Success)
        .await;
    assert_eq!(action.runs.load(Ordering::SeqCst), 1);

    wiring.close().await;
}

#[tokio::test]
async fn initial_dag_ins_with_terminal_tree_writes_rollup() {
    let wiring = Wiring::start(Arc::new(SlowCounting::default())).await;

    let dag = Dag::new("settled")
        .with_task(Task::new("a", "slow-counting"))
        .with_task(Task::new("b", "slow-counting").with_depends(vec!["a".into()]));
    let (ins, tasks) = wiring.running_instance(&dag).await;

    // Mark the whole tree settled: a failed, so b can never start.
    let mut failed = tasks[0].clone();
    failed.status = TaskInstanceStatus::Failed;
    wiring.store.update_task_ins(&failed).await.unwrap();

    wiring.parser.initial_dag_ins(ins.clone()).await;

    wiring
        .wait_for_dag_status(&ins, DagInstanceStatus::Failed)
        .await;
    let fetched = wiring.store.get_dag_instance(&ins.id).await.unwrap();
    assert!(
        fetched
            .reason
            .contains(&format!("initial failed because task ins[{}]", failed.id)),
        "unexpected reason: {}",
        fetched.reason
    );
    assert_eq!(wiring.parser.active_tree_count(), 0);

    wiring.close().await;
}

#[tokio::test]
async fn retry_command_against_already_retrying_tasks_is_a_noop() {
    let wiring = Wiring::start(Arc::new(SlowCounting::default())).await;

    let dag = Dag::new("noop-retry").with_task(Task::new("t", "slow-counting"));
    let (mut ins, tasks) = wiring.running_instance(&dag).await;

    // The target is already retrying: the command watcher finds nothing to
    // change and simply clears the slot.
    let mut retrying = tasks[0].clone();
    retrying.status = TaskInstanceStatus::Failed;
    wiring.store.update_task_ins(&retrying).await.unwrap();
    retrying.status = TaskInstanceStatus::Retrying;
    wiring.store.update_task_ins(&retrying).await.unwrap();

    ins.retry(vec![retrying.id.clone()]).unwrap();
    wiring.store.update_dag_ins(&ins).await.unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let fetched = wiring.store.get_dag_instance(&ins.id).await.unwrap();
        if fetched.cmd.is_none() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "command was never consumed"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    // The task was not touched and nothing was pushed.
    let fetched = wiring
        .store
        .list_task_instance(&ListTaskInstanceInput {
            dag_ins_id: Some(ins.id.clone()),
            ..ListTaskInstanceInput::default()
        })
        .await
        .unwrap();
    assert_eq!(fetched[0].status, TaskInstanceStatus::Retrying);
    assert_eq!(wiring.parser.active_tree_count(), 0);

    wiring.close().await;
}

#[tokio::test]
async fn boot_recovery_resumes_running_instances() {
    // Simulate a worker restart: state exists before the parser starts.
    let bus = EventBus::new();
    let keeper = LocalKeeper::start(
        &LocalKeeperOptions::new("worker-1"),
        Arc::new(ClusterState::default()),
        bus.clone(),
    )
    .unwrap();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new(
        Arc::new(IdGenerator::new(1)),
        bus.clone(),
    ));

    let dag = Dag::new("recovered").with_task(Task::new("t", "slow-counting"));
    store.create_dag(&dag).await.unwrap();
    let mut ins = dag.run(Trigger::Manually, &BTreeMap::new()).unwrap();
    ins.worker = "worker-1".to_string();
    ins.status = DagInstanceStatus::Running;
    store.create_dag_ins(&mut ins).await.unwrap();
    let mut tasks = vec![TaskInstance::from_task(ins.id.clone(), &dag.tasks[0])];
    store.batch_create_task_ins(&mut tasks).await.unwrap();

    let action = Arc::new(SlowCounting::default());
    let mut registry = ActionRegistry::new();
    registry.register(action.clone());

    let executor = Executor::new(
        Arc::clone(&store),
        bus.clone(),
        Arc::new(registry),
        Duration::from_secs(5),
        4,
    );
    let parser = Parser::new(
        Arc::clone(&store),
        keeper.clone(),
        bus.clone(),
        2,
        Duration::from_secs(5),
    );
    executor.set_parser(Arc::clone(&parser));
    parser.set_executor(Arc::clone(&executor));
    executor.start();
    parser.start().await;

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let fetched = store.get_dag_instance(&ins.id).await.unwrap();
        if fetched.status == DagInstanceStatus::Success {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "recovered instance never completed"
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(action.runs.load(Ordering::SeqCst), 1);

    executor.close().await;
    parser.close().await;
    keeper.close().await;
}
