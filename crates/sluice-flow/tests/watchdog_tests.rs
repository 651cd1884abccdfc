//! Watchdog recovery tests: left-behind `scheduled` instances and expired
//! running tasks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use sluice_core::IdGenerator;
use sluice_flow::dag::{Dag, Task};
use sluice_flow::dag_instance::{DagInstance, DagInstanceStatus, Trigger};
use sluice_flow::dispatcher::Dispatcher;
use sluice_flow::events::EventBus;
use sluice_flow::keeper::memory::{ClusterState, LocalKeeper, LocalKeeperOptions};
use sluice_flow::keeper::Keeper;
use sluice_flow::store::memory::MemoryStore;
use sluice_flow::store::Store;
use sluice_flow::task_instance::{TaskInstance, TaskInstanceStatus};
use sluice_flow::watchdog::{Watchdog, REASON_FORCE_FAILED};

async fn submitted_instance(store: &Arc<dyn Store>, timeout_secs: u64) -> DagInstance {
    let dag = Dag::new("etl").with_task(Task::new("t", "noop").with_timeout_secs(timeout_secs));
    store.create_dag(&dag).await.unwrap();
    let mut ins = dag.run(Trigger::Manually, &BTreeMap::new()).unwrap();
    store.create_dag_ins(&mut ins).await.unwrap();
    ins
}

#[tokio::test]
async fn left_behind_scheduled_instance_is_redispatched() {
    let bus = EventBus::new();
    let cluster = Arc::new(ClusterState::default());
    let keeper = LocalKeeper::start(
        &LocalKeeperOptions::new("worker-1"),
        cluster,
        bus.clone(),
    )
    .unwrap();

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new(
        Arc::new(IdGenerator::new(1)),
        bus.clone(),
    ));

    // An instance assigned to a worker that died right after dispatch.
    let mut ins = submitted_instance(&store, 0).await;
    ins.status = DagInstanceStatus::Scheduled;
    ins.worker = "ghost-7".to_string();
    store.update_dag_ins(&ins).await.unwrap();

    let watchdog = Watchdog::new(Arc::clone(&store), Duration::from_millis(200));

    // Not yet past the schedule timeout: nothing to rescue.
    watchdog.handle_left_behind_dag_ins().await.unwrap();
    let fetched = store.get_dag_instance(&ins.id).await.unwrap();
    assert_eq!(fetched.status, DagInstanceStatus::Scheduled);

    tokio::time::sleep(Duration::from_millis(300)).await;

    watchdog.handle_left_behind_dag_ins().await.unwrap();
    let fetched = store.get_dag_instance(&ins.id).await.unwrap();
    assert_eq!(fetched.status, DagInstanceStatus::Init);

    // The next dispatcher round reassigns it to a live worker.
    let dispatcher = Dispatcher::new(Arc::clone(&store), keeper.clone(), bus.clone());
    dispatcher.dispatch().await.unwrap();

    let fetched = store.get_dag_instance(&ins.id).await.unwrap();
    assert_eq!(fetched.status, DagInstanceStatus::Scheduled);
    assert_eq!(fetched.worker, "worker-1");

    keeper.close().await;
}

#[tokio::test]
async fn fresh_scheduled_instances_are_left_alone() {
    let bus = EventBus::new();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new(
        Arc::new(IdGenerator::new(1)),
        bus.clone(),
    ));

    let mut ins = submitted_instance(&store, 0).await;
    ins.status = DagInstanceStatus::Scheduled;
    ins.worker = "worker-1".to_string();
    store.update_dag_ins(&ins).await.unwrap();

    let watchdog = Watchdog::new(Arc::clone(&store), Duration::from_secs(15));
    watchdog.handle_left_behind_dag_ins().await.unwrap();

    let fetched = store.get_dag_instance(&ins.id).await.unwrap();
    assert_eq!(fetched.status, DagInstanceStatus::Scheduled);
    assert_eq!(fetched.worker, "worker-1");
}

// Slow test: the expired filter carries a fixed 5 s slack so the watchdog
// never races a live executor's own deadline.
#[tokio::test]
async fn expired_running_task_is_force_failed() {
    let bus = EventBus::new();
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new(
        Arc::new(IdGenerator::new(1)),
        bus.clone(),
    ));

    let ins = submitted_instance(&store, 1).await;
    let dag = store.get_dag(&ins.dag_id).await.unwrap();
    let mut tasks = vec![TaskInstance::from_task(ins.id.clone(), &dag.tasks[0])];
    store.batch_create_task_ins(&mut tasks).await.unwrap();

    let mut running = tasks[0].clone();
    running.status = TaskInstanceStatus::Running;
    store.update_task_ins(&running).await.unwrap();

    let watchdog = Watchdog::new(Arc::clone(&store), Duration::from_secs(15));

    // Within timeout + slack: untouched.
    watchdog.handle_expired_task_ins().await.unwrap();
    let fetched = store.get_task_ins(&running.id).await.unwrap();
    assert_eq!(fetched.status, TaskInstanceStatus::Running);

    tokio::time::sleep(Duration::from_millis(6300)).await;

    watchdog.handle_expired_task_ins().await.unwrap();

    let fetched = store.get_task_ins(&running.id).await.unwrap();
    assert_eq!(fetched.status, TaskInstanceStatus::Failed);
    assert_eq!(fetched.reason, REASON_FORCE_FAILED);

    let fetched_ins = store.get_dag_instance(&ins.id).await.unwrap();
    assert_eq!(fetched_ins.status, DagInstanceStatus::Failed);
}
