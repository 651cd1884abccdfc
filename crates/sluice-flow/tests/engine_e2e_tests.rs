//! End-to-end scenarios: one worker driving DAG instances from submission to
//! their terminal status.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use sluice_core::{DagInstanceId, IdGenerator};
use sluice_flow::action::{Action, ActionOutcome, ActionRegistry};
use sluice_flow::context::ExecuteContext;
use sluice_flow::dag::{Check, CheckAction, ConditionOp, ConditionSource, Dag, Task, TaskCondition};
use sluice_flow::dag_instance::DagInstanceStatus;
use sluice_flow::engine::{Engine, EngineOptions};
use sluice_flow::events::{EventBus, FlowEvent};
use sluice_flow::executor::{REASON_PARENT_CANCEL, REASON_SUCCESS_AFTER_CANCELED};
use sluice_flow::keeper::memory::{ClusterState, LocalKeeper, LocalKeeperOptions};
use sluice_flow::keeper::Keeper;
use sluice_flow::store::memory::MemoryStore;
use sluice_flow::store::{ListTaskInstanceInput, Store};
use sluice_flow::task_instance::TaskInstanceStatus;

/// A no-op action.
#[derive(Debug, Default)]
struct Noop;

#[async_trait]
impl Action for Noop {
    fn name(&self) -> &str {
        "noop"
    }

    async fn run(&self, _ctx: &ExecuteContext, _params: &Value) -> ActionOutcome {
        Ok(())
    }
}

/// Counts invocations; fails while the flag is up.
#[derive(Debug)]
struct Flaky {
    runs: AtomicUsize,
    failing: AtomicBool,
}

impl Flaky {
    fn new(failing: bool) -> Self {
        Self {
            runs: AtomicUsize::new(0),
            failing: AtomicBool::new(failing),
        }
    }
}

#[async_trait]
impl Action for Flaky {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn run(&self, _ctx: &ExecuteContext, _params: &Value) -> ActionOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err("simulated failure".into());
        }
        Ok(())
    }
}

/// Returns an error once its cancellation token fires.
#[derive(Debug, Default)]
struct ObservesCancel;

#[async_trait]
impl Action for ObservesCancel {
    fn name(&self) -> &str {
        "observes-cancel"
    }

    async fn run(&self, ctx: &ExecuteContext, _params: &Value) -> ActionOutcome {
        ctx.cancellation().cancelled().await;
        Err("interrupted".into())
    }
}

/// Ignores cancellation and reports success after the token fires.
#[derive(Debug, Default)]
struct SucceedsAfterCancel;

#[async_trait]
impl Action for SucceedsAfterCancel {
    fn name(&self) -> &str {
        "succeeds-after-cancel"
    }

    async fn run(&self, ctx: &ExecuteContext, _params: &Value) -> ActionOutcome {
        ctx.cancellation().cancelled().await;
        Ok(())
    }
}

/// Writes a share-data entry, then succeeds.
#[derive(Debug, Default)]
struct Publishes;

#[async_trait]
impl Action for Publishes {
    fn name(&self) -> &str {
        "publishes"
    }

    async fn run(&self, ctx: &ExecuteContext, _params: &Value) -> ActionOutcome {
        ctx.share_data().set("token", "from-upstream").await;
        ctx.trace("published token").await;
        Ok(())
    }
}

struct Harness {
    engine: Engine,
    bus: EventBus,
}

impl Harness {
    async fn start(registry: ActionRegistry) -> Self {
        let bus = EventBus::new();
        let keeper = LocalKeeper::start(
            &LocalKeeperOptions::new("worker-1"),
            Arc::new(ClusterState::default()),
            bus.clone(),
        )
        .expect("keeper starts");
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new(
            Arc::new(IdGenerator::new(keeper.worker_number())),
            bus.clone(),
        ));

        let options = EngineOptions::new(keeper, store, bus.clone())
            .with_parser_workers(4)
            .with_executor_workers(8)
            .with_executor_timeout(Duration::from_secs(10));
        let engine = Engine::start(options, registry)
            .await
            .expect("engine starts");

        Self { engine, bus }
    }

    async fn wait_for_dag_status(
        &self,
        dag_ins_id: &DagInstanceId,
        expected: DagInstanceStatus,
    ) -> sluice_flow::dag_instance::DagInstance {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let ins = self
                .engine
                .store()
                .get_dag_instance(dag_ins_id)
                .await
                .expect("instance exists");
            if ins.status == expected {
                return ins;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {expected}, instance is {} ({})",
                ins.status,
                ins.reason
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn wait_for_task_status(
        &self,
        dag_ins_id: &DagInstanceId,
        task_id: &str,
        expected: TaskInstanceStatus,
    ) -> sluice_flow::task_instance::TaskInstance {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let tasks = self.tasks_of(dag_ins_id).await;
            if let Some(task) = tasks
                .iter()
                .find(|t| t.task_id == task_id && t.status == expected)
            {
                return task.clone();
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for task {task_id} to reach {expected}"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    async fn tasks_of(
        &self,
        dag_ins_id: &DagInstanceId,
    ) -> Vec<sluice_flow::task_instance::TaskInstance> {
        self.engine
            .store()
            .list_task_instance(&ListTaskInstanceInput {
                dag_ins_id: Some(dag_ins_id.clone()),
                ..ListTaskInstanceInput::default()
            })
            .await
            .expect("list tasks")
    }
}

#[tokio::test]
async fn linear_dag_runs_to_success_in_order() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Noop));

    let harness = Harness::start(registry).await;
    let mut begin_rx = harness.bus.subscribe();

    let dag = Dag::new("linear")
        .with_task(Task::new("a", "noop"))
        .with_task(Task::new("b", "noop").with_depends(vec!["a".into()]))
        .with_task(Task::new("c", "noop").with_depends(vec!["b".into()]));
    harness.engine.store().create_dag(&dag).await.unwrap();

    let dag_ins = harness
        .engine
        .commander()
        .run_dag(&dag.id, &BTreeMap::new())
        .await
        .unwrap();

    harness
        .wait_for_dag_status(&dag_ins.id, DagInstanceStatus::Success)
        .await;

    // Every task ended in success.
    let tasks = harness.tasks_of(&dag_ins.id).await;
    assert_eq!(tasks.len(), 3);
    for task in &tasks {
        assert_eq!(task.status, TaskInstanceStatus::Success, "{}", task.task_id);
    }

    // TaskBegin order respects the dependency chain.
    let mut begun = Vec::new();
    while let Ok(event) = begin_rx.try_recv() {
        if let FlowEvent::TaskBegin { task_ins } = event {
            begun.push(task_ins.task_id);
        }
    }
    assert_eq!(begun, vec!["a".to_string(), "b".to_string(), "c".to_string()]);

    harness.engine.close().await;
}

#[tokio::test]
async fn fan_out_failure_leaves_descendants_untouched() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Noop));
    registry.register(Arc::new(Flaky::new(true)));

    let harness = Harness::start(registry).await;

    // a -> {b, c} -> d, where c fails.
    let dag = Dag::new("fan")
        .with_task(Task::new("a", "noop"))
        .with_task(Task::new("b", "noop").with_depends(vec!["a".into()]))
        .with_task(Task::new("c", "flaky").with_depends(vec!["a".into()]))
        .with_task(Task::new("d", "noop").with_depends(vec!["b".into(), "c".into()]));
    harness.engine.store().create_dag(&dag).await.unwrap();

    let dag_ins = harness
        .engine
        .commander()
        .run_dag(&dag.id, &BTreeMap::new())
        .await
        .unwrap();

    let ended = harness
        .wait_for_dag_status(&dag_ins.id, DagInstanceStatus::Failed)
        .await;

    let tasks = harness.tasks_of(&dag_ins.id).await;
    let c = tasks.iter().find(|t| t.task_id == "c").unwrap();
    assert_eq!(c.status, TaskInstanceStatus::Failed);
    assert!(c.reason.contains("simulated failure"));

    // d never left init.
    let d = tasks.iter().find(|t| t.task_id == "d").unwrap();
    assert_eq!(d.status, TaskInstanceStatus::Init);

    assert!(
        ended.reason.contains(&format!("task[{}] failed", c.id)),
        "unexpected reason: {}",
        ended.reason
    );

    harness.engine.close().await;
}

#[tokio::test]
async fn retry_after_failure_completes_the_dag() {
    let flaky = Arc::new(Flaky::new(true));
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Noop));
    registry.register(flaky.clone());

    let harness = Harness::start(registry).await;

    let dag = Dag::new("retryable")
        .with_task(Task::new("a", "flaky"))
        .with_task(Task::new("b", "noop").with_depends(vec!["a".into()]));
    harness.engine.store().create_dag(&dag).await.unwrap();

    let dag_ins = harness
        .engine
        .commander()
        .run_dag(&dag.id, &BTreeMap::new())
        .await
        .unwrap();
    harness
        .wait_for_dag_status(&dag_ins.id, DagInstanceStatus::Failed)
        .await;
    assert_eq!(flaky.runs.load(Ordering::SeqCst), 1);

    // Heal the action, then retry the whole instance.
    flaky.failing.store(false, Ordering::SeqCst);
    harness
        .engine
        .commander()
        .retry_dag_ins(&dag_ins.id, sluice_flow::commander::CommandOption::default())
        .await
        .unwrap();

    let ended = harness
        .wait_for_dag_status(&dag_ins.id, DagInstanceStatus::Success)
        .await;
    assert!(ended.reason.is_empty());
    assert_eq!(flaky.runs.load(Ordering::SeqCst), 2);

    let tasks = harness.tasks_of(&dag_ins.id).await;
    for task in &tasks {
        assert_eq!(task.status, TaskInstanceStatus::Success, "{}", task.task_id);
    }

    harness.engine.close().await;
}

#[tokio::test]
async fn retry_with_no_matching_tasks_is_rejected() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Noop));

    let harness = Harness::start(registry).await;

    let dag = Dag::new("healthy").with_task(Task::new("a", "noop"));
    harness.engine.store().create_dag(&dag).await.unwrap();

    let dag_ins = harness
        .engine
        .commander()
        .run_dag(&dag.id, &BTreeMap::new())
        .await
        .unwrap();
    harness
        .wait_for_dag_status(&dag_ins.id, DagInstanceStatus::Success)
        .await;

    // Nothing failed, so there is nothing to retry.
    assert!(harness
        .engine
        .commander()
        .retry_dag_ins(&dag_ins.id, sluice_flow::commander::CommandOption::default())
        .await
        .is_err());

    harness.engine.close().await;
}

#[tokio::test]
async fn cancel_observed_by_action_cancels_the_instance() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Noop));
    registry.register(Arc::new(ObservesCancel));

    let harness = Harness::start(registry).await;

    let dag = Dag::new("cancelable")
        .with_task(Task::new("a", "observes-cancel"))
        .with_task(Task::new("b", "noop").with_depends(vec!["a".into()]));
    harness.engine.store().create_dag(&dag).await.unwrap();

    let dag_ins = harness
        .engine
        .commander()
        .run_dag(&dag.id, &BTreeMap::new())
        .await
        .unwrap();

    let a = harness
        .wait_for_task_status(&dag_ins.id, "a", TaskInstanceStatus::Running)
        .await;

    harness
        .engine
        .commander()
        .cancel_tasks(&[a.id], sluice_flow::commander::CommandOption::default())
        .await
        .unwrap();

    harness
        .wait_for_dag_status(&dag_ins.id, DagInstanceStatus::Failed)
        .await;

    let tasks = harness.tasks_of(&dag_ins.id).await;
    let a = tasks.iter().find(|t| t.task_id == "a").unwrap();
    assert_eq!(a.status, TaskInstanceStatus::Canceled);
    let b = tasks.iter().find(|t| t.task_id == "b").unwrap();
    assert_eq!(b.status, TaskInstanceStatus::Init);

    harness.engine.close().await;
}

#[tokio::test]
async fn cancel_ignored_by_action_cascades_to_descendants() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Noop));
    registry.register(Arc::new(SucceedsAfterCancel));

    let harness = Harness::start(registry).await;

    let dag = Dag::new("stubborn")
        .with_task(Task::new("a", "succeeds-after-cancel"))
        .with_task(Task::new("b", "noop").with_depends(vec!["a".into()]));
    harness.engine.store().create_dag(&dag).await.unwrap();

    let dag_ins = harness
        .engine
        .commander()
        .run_dag(&dag.id, &BTreeMap::new())
        .await
        .unwrap();

    let a = harness
        .wait_for_task_status(&dag_ins.id, "a", TaskInstanceStatus::Running)
        .await;

    harness
        .engine
        .commander()
        .cancel_tasks(&[a.id], sluice_flow::commander::CommandOption::default())
        .await
        .unwrap();

    harness
        .wait_for_dag_status(&dag_ins.id, DagInstanceStatus::Failed)
        .await;

    // The stubborn task kept its success but carries the marker; its child
    // was canceled in its stead.
    let tasks = harness.tasks_of(&dag_ins.id).await;
    let a = tasks.iter().find(|t| t.task_id == "a").unwrap();
    assert_eq!(a.status, TaskInstanceStatus::Success);
    assert_eq!(a.reason, REASON_SUCCESS_AFTER_CANCELED);

    let b = tasks.iter().find(|t| t.task_id == "b").unwrap();
    assert_eq!(b.status, TaskInstanceStatus::Canceled);
    assert_eq!(b.reason, REASON_PARENT_CANCEL);

    harness.engine.close().await;
}

#[tokio::test]
async fn pre_check_skip_lets_children_run() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Noop));

    let harness = Harness::start(registry).await;

    let gate = Check {
        conditions: vec![TaskCondition {
            source: ConditionSource::Vars,
            key: "env".into(),
            values: vec!["prod".into()],
            op: ConditionOp::In,
        }],
        act: CheckAction::Skip,
    };
    let dag = Dag::new("gated")
        .with_var("env", "dev")
        .with_task(Task::new("t", "noop").with_pre_check("env-gate", gate))
        .with_task(Task::new("child", "noop").with_depends(vec!["t".into()]));
    harness.engine.store().create_dag(&dag).await.unwrap();

    let overrides = BTreeMap::from([("env".to_string(), "prod".to_string())]);
    let dag_ins = harness
        .engine
        .commander()
        .run_dag(&dag.id, &overrides)
        .await
        .unwrap();

    harness
        .wait_for_dag_status(&dag_ins.id, DagInstanceStatus::Success)
        .await;

    let tasks = harness.tasks_of(&dag_ins.id).await;
    let t = tasks.iter().find(|t| t.task_id == "t").unwrap();
    assert_eq!(t.status, TaskInstanceStatus::Skipped);
    let child = tasks.iter().find(|t| t.task_id == "child").unwrap();
    assert_eq!(child.status, TaskInstanceStatus::Success);

    harness.engine.close().await;
}

#[tokio::test]
async fn pre_check_block_resumes_with_continue() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Noop));

    let harness = Harness::start(registry).await;

    let gate = Check {
        conditions: vec![TaskCondition {
            source: ConditionSource::Vars,
            key: "approval".into(),
            values: vec!["granted".into()],
            op: ConditionOp::NotIn,
        }],
        act: CheckAction::Block,
    };
    let dag = Dag::new("approval-gated")
        .with_var("approval", "pending")
        .with_task(Task::new("deploy", "noop").with_pre_check("approval-gate", gate));
    harness.engine.store().create_dag(&dag).await.unwrap();

    let dag_ins = harness
        .engine
        .commander()
        .run_dag(&dag.id, &BTreeMap::new())
        .await
        .unwrap();

    harness
        .wait_for_dag_status(&dag_ins.id, DagInstanceStatus::Blocked)
        .await;

    harness
        .engine
        .commander()
        .continue_dag_ins(&dag_ins.id, sluice_flow::commander::CommandOption::default())
        .await
        .unwrap();

    harness
        .wait_for_dag_status(&dag_ins.id, DagInstanceStatus::Success)
        .await;

    harness.engine.close().await;
}

#[tokio::test]
async fn share_data_flows_between_tasks_and_renders_params() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Noop));
    registry.register(Arc::new(Publishes));

    let harness = Harness::start(registry).await;

    let params = serde_json::json!({"report": "{{.vars.env.Value}}-report"})
        .as_object()
        .cloned()
        .unwrap();
    let dag = Dag::new("pipeline")
        .with_var("env", "prod")
        .with_task(Task::new("produce", "publishes"))
        .with_task(
            Task::new("consume", "noop")
                .with_depends(vec!["produce".into()])
                .with_params(params),
        );
    harness.engine.store().create_dag(&dag).await.unwrap();

    let dag_ins = harness
        .engine
        .commander()
        .run_dag(&dag.id, &BTreeMap::new())
        .await
        .unwrap();

    harness
        .wait_for_dag_status(&dag_ins.id, DagInstanceStatus::Success)
        .await;

    // The write was persisted onto the instance.
    let stored = harness
        .engine
        .store()
        .get_dag_instance(&dag_ins.id)
        .await
        .unwrap();
    assert_eq!(
        stored.share_data.get("token").as_deref(),
        Some("from-upstream")
    );

    // The trace landed on the producing task.
    let tasks = harness.tasks_of(&dag_ins.id).await;
    let produce = tasks.iter().find(|t| t.task_id == "produce").unwrap();
    assert!(produce
        .traces
        .iter()
        .any(|t| t.message == "published token"));

    // The consumer's params were rendered at materialization.
    let consume = tasks.iter().find(|t| t.task_id == "consume").unwrap();
    assert_eq!(consume.params["report"], serde_json::json!("prod-report"));

    harness.engine.close().await;
}

#[tokio::test]
async fn unresolvable_param_placeholder_fails_the_task() {
    let mut registry = ActionRegistry::new();
    registry.register(Arc::new(Noop));

    let harness = Harness::start(registry).await;

    let params = serde_json::json!({"target": "{{.vars.ghost.Value}}"})
        .as_object()
        .cloned()
        .unwrap();
    let dag = Dag::new("untemplatable").with_task(Task::new("t", "noop").with_params(params));
    harness.engine.store().create_dag(&dag).await.unwrap();

    let dag_ins = harness
        .engine
        .commander()
        .run_dag(&dag.id, &BTreeMap::new())
        .await
        .unwrap();

    harness
        .wait_for_dag_status(&dag_ins.id, DagInstanceStatus::Failed)
        .await;

    let tasks = harness.tasks_of(&dag_ins.id).await;
    assert_eq!(tasks[0].status, TaskInstanceStatus::Failed);
    assert!(tasks[0].reason.contains("ghost"));

    harness.engine.close().await;
}

#[tokio::test]
async fn unknown_action_fails_the_task() {
    let registry = ActionRegistry::new();
    let harness = Harness::start(registry).await;

    let dag = Dag::new("mystery").with_task(Task::new("t", "does-not-exist"));
    harness.engine.store().create_dag(&dag).await.unwrap();

    let dag_ins = harness
        .engine
        .commander()
        .run_dag(&dag.id, &BTreeMap::new())
        .await
        .unwrap();

    harness
        .wait_for_dag_status(&dag_ins.id, DagInstanceStatus::Failed)
        .await;

    let tasks = harness.tasks_of(&dag_ins.id).await;
    assert_eq!(tasks[0].status, TaskInstanceStatus::Failed);
    assert_eq!(tasks[0].reason, "action not found: does-not-exist");

    harness.engine.close().await;
}
