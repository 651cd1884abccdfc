//! In-memory task dependency tree.
//!
//! The parser maintains one [`TaskTree`] per active DAG instance: a virtual
//! root (always `success`) with edges mirroring the template topology, each
//! node carrying its task instance's current status. The tree answers three
//! questions:
//!
//! - which tasks are *executable* right now,
//! - which tasks become executable after a given task completes,
//! - what terminal status the whole instance rolls up to.
//!
//! Construction validates the graph: unique task ids, resolvable
//! dependencies, at least one start node, and acyclicity. Cycle detection is
//! a Kahn-style BFS gated on all-parents-visited; the first node (in
//! insertion order) never reached under that condition is reported as the
//! cycle start.
//!
//! Trees are owned by exactly one parser shard worker, so no internal locking
//! is required.

use std::collections::{HashMap, VecDeque};

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use petgraph::Direction;

use sluice_core::TaskInstanceId;

use crate::dag::Task;
use crate::dag_instance::DagInstance;
use crate::error::{Error, Result};
use crate::task_instance::{TaskInstance, TaskInstanceStatus};

/// Node id of the virtual root.
const VIRTUAL_ROOT_ID: &str = "_virtual_root";

/// The facts the tree builder needs about one task.
///
/// Implemented by both [`TaskInstance`] (instance trees) and [`Task`]
/// (template validation at DAG creation).
pub trait TaskNodeSource {
    /// Graph identity: the template task id, unique within one DAG.
    fn graph_id(&self) -> &str;
    /// Node identity: the id the tree reports back (instance id, or the
    /// template id during validation).
    fn node_id(&self) -> &str;
    /// Graph ids this node depends on.
    fn depends_on(&self) -> &[String];
    /// Current status.
    fn status(&self) -> TaskInstanceStatus;
}

impl TaskNodeSource for TaskInstance {
    fn graph_id(&self) -> &str {
        &self.task_id
    }

    fn node_id(&self) -> &str {
        self.id.as_str()
    }

    fn depends_on(&self) -> &[String] {
        &self.depend_on
    }

    fn status(&self) -> TaskInstanceStatus {
        self.status
    }
}

impl TaskNodeSource for Task {
    fn graph_id(&self) -> &str {
        &self.id
    }

    fn node_id(&self) -> &str {
        &self.id
    }

    fn depends_on(&self) -> &[String] {
        &self.depend_on
    }

    fn status(&self) -> TaskInstanceStatus {
        TaskInstanceStatus::Init
    }
}

/// Terminal rollup of a whole tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeStatus {
    /// Some branch is still active.
    Running,
    /// Every leaf path ended in success or skipped.
    Success,
    /// Some node failed or was canceled.
    Failed,
    /// Some node is blocked (and nothing failed before it).
    Blocked,
}

/// One node of the tree.
#[derive(Debug, Clone)]
struct TreeNode {
    /// Task instance id (or `_virtual_root`).
    task_ins_id: TaskInstanceId,
    /// Current status; the virtual root is always `success`.
    status: TaskInstanceStatus,
}

/// The dependency tree of one DAG instance.
#[derive(Debug)]
pub struct TaskTree {
    /// The owning DAG instance, carried so rollups can transition it.
    pub dag_ins: DagInstance,
    graph: DiGraph<TreeNode, ()>,
    /// Node lookup by task instance id.
    node_index: HashMap<TaskInstanceId, NodeIndex>,
    /// Insertion order for deterministic traversal and cycle reporting.
    insertion_order: Vec<NodeIndex>,
    root: NodeIndex,
}

impl TaskTree {
    /// Builds and validates a tree from the DAG instance's task instances.
    ///
    /// # Errors
    ///
    /// - [`Error::DuplicateTaskId`] when two tasks share a graph id
    /// - [`Error::DanglingDependency`] when a dependency does not resolve
    /// - [`Error::NoStartNodes`] when every task declares dependencies
    /// - [`Error::CycleDetected`] when the graph has a cycle
    pub fn build<S: TaskNodeSource>(dag_ins: DagInstance, tasks: &[S]) -> Result<Self> {
        let mut graph = DiGraph::new();
        let mut insertion_order = Vec::with_capacity(tasks.len() + 1);

        let root = graph.add_node(TreeNode {
            task_ins_id: TaskInstanceId::from(VIRTUAL_ROOT_ID),
            status: TaskInstanceStatus::Success,
        });
        insertion_order.push(root);

        // Graph ids must be unique before edges can be wired.
        let mut by_graph_id: HashMap<&str, NodeIndex> = HashMap::with_capacity(tasks.len());
        for task in tasks {
            let idx = graph.add_node(TreeNode {
                task_ins_id: TaskInstanceId::from(task.node_id()),
                status: task.status(),
            });
            if by_graph_id.insert(task.graph_id(), idx).is_some() {
                return Err(Error::DuplicateTaskId {
                    task_id: task.graph_id().to_string(),
                });
            }
            insertion_order.push(idx);
        }

        let mut has_start_node = false;
        for task in tasks {
            let node = by_graph_id[task.graph_id()];
            if task.depends_on().is_empty() {
                graph.add_edge(root, node, ());
                has_start_node = true;
                continue;
            }
            for depend in task.depends_on() {
                let parent =
                    *by_graph_id
                        .get(depend.as_str())
                        .ok_or_else(|| Error::DanglingDependency {
                            task_id: task.graph_id().to_string(),
                            depend: depend.clone(),
                        })?;
                graph.add_edge(parent, node, ());
            }
        }

        if !has_start_node {
            return Err(Error::NoStartNodes);
        }

        let node_index = graph
            .node_indices()
            .map(|idx| (graph[idx].task_ins_id.clone(), idx))
            .collect();

        let tree = Self {
            dag_ins,
            graph,
            node_index,
            insertion_order,
            root,
        };
        tree.check_cycle()?;
        Ok(tree)
    }

    /// Validates a template's task list without keeping the tree.
    ///
    /// Used by stores to reject invalid DAGs at creation time.
    ///
    /// # Errors
    ///
    /// Same conditions as [`TaskTree::build`].
    pub fn validate_tasks(tasks: &[Task]) -> Result<()> {
        let dag_ins = DagInstance::new(
            sluice_core::DagId::new("_validate"),
            crate::dag_instance::Trigger::Manually,
            crate::dag_instance::DagInstanceVars::new(),
            crate::dag_instance::ShareData::default(),
        );
        Self::build(dag_ins, tasks).map(|_| ())
    }

    /// Kahn's algorithm over the whole graph; any node never reached once all
    /// of its parents were visited is part of a cycle.
    fn check_cycle(&self) -> Result<()> {
        let mut in_degree: HashMap<NodeIndex, usize> = HashMap::new();
        for idx in self.graph.node_indices() {
            in_degree.insert(idx, 0);
        }
        for edge in self.graph.edge_references() {
            *in_degree.entry(edge.target()).or_insert(0) += 1;
        }

        let mut queue: VecDeque<NodeIndex> = self
            .insertion_order
            .iter()
            .filter(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) == 0)
            .copied()
            .collect();

        let mut visited = 0_usize;
        while let Some(idx) = queue.pop_front() {
            visited += 1;
            for neighbor in self.sorted_children(idx) {
                if let Some(deg) = in_degree.get_mut(&neighbor) {
                    *deg = deg.saturating_sub(1);
                    if *deg == 0 {
                        queue.push_back(neighbor);
                    }
                }
            }
        }

        if visited != self.graph.node_count() {
            let start = self
                .insertion_order
                .iter()
                .find(|&&idx| in_degree.get(&idx).copied().unwrap_or(0) > 0)
                .map_or_else(
                    || "unknown".to_string(),
                    |&idx| self.graph[idx].task_ins_id.to_string(),
                );
            return Err(Error::CycleDetected { start });
        }
        Ok(())
    }

    /// Children of a node, sorted by insertion order for determinism.
    fn sorted_children(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        let mut children: Vec<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();
        children.sort_by_key(|n| {
            self.insertion_order
                .iter()
                .position(|i| i == n)
                .unwrap_or(usize::MAX)
        });
        children
    }

    fn parents(&self, idx: NodeIndex) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.neighbors_directed(idx, Direction::Incoming)
    }

    /// True if every parent of the node allows child execution.
    fn can_be_executed(&self, idx: NodeIndex) -> bool {
        self.parents(idx)
            .all(|p| self.graph[p].status.allows_child_execution())
    }

    /// True if the node itself is executable right now.
    fn executable(&self, idx: NodeIndex) -> bool {
        self.graph[idx].status.is_runnable_entry() && self.can_be_executed(idx)
    }

    /// Walks the tree depth-first from the root, honoring execution gates.
    ///
    /// `walk` receives every reachable non-root node; returning false stops
    /// the traversal. Children are only entered below nodes whose status
    /// allows child execution, and a child with several parents is skipped
    /// until all of them do.
    fn walk(&self, mut walk: impl FnMut(NodeIndex, &TreeNode) -> bool) {
        self.dfs(self.root, &mut walk);
    }

    fn dfs(&self, idx: NodeIndex, walk: &mut impl FnMut(NodeIndex, &TreeNode) -> bool) -> bool {
        if idx != self.root {
            if !walk(idx, &self.graph[idx]) {
                return false;
            }
            if !self.graph[idx].status.allows_child_execution() {
                return true;
            }
        }

        for child in self.sorted_children(idx) {
            if self.parents(child).count() > 1 && !self.can_be_executed(child) {
                continue;
            }
            if !self.dfs(child, walk) {
                return false;
            }
        }
        true
    }

    /// Returns the task instance ids executable right now, in deterministic
    /// (insertion) order.
    #[must_use]
    pub fn executable_task_ids(&self) -> Vec<TaskInstanceId> {
        let mut executables = Vec::new();
        self.walk(|idx, node| {
            if self.executable(idx) {
                executables.push(node.task_ins_id.clone());
            }
            true
        });
        executables
    }

    /// Applies a completed (or re-entering) task's status and returns the
    /// task instance ids that became executable.
    ///
    /// A report with status `init` (a retry passing back through init) makes
    /// that single node executable again. Otherwise, when the new status
    /// allows child execution, the node's now-executable children are
    /// returned. An empty result for an unsuccessful terminal status means
    /// the caller should compute the rollup.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TaskNodeMissing`] when the reported task has no node
    /// in this tree.
    pub fn next_task_ids(&mut self, report: &TaskInstance) -> Result<Vec<TaskInstanceId>> {
        let idx = *self
            .node_index
            .get(&report.id)
            .ok_or_else(|| Error::TaskNodeMissing {
                task_ins_id: report.id.clone(),
            })?;

        self.graph[idx].status = report.status;

        if report.status == TaskInstanceStatus::Init {
            return Ok(vec![self.graph[idx].task_ins_id.clone()]);
        }

        if !report.status.allows_child_execution() {
            return Ok(Vec::new());
        }

        Ok(self
            .sorted_children(idx)
            .into_iter()
            .filter(|&child| self.executable(child))
            .map(|child| self.graph[child].task_ins_id.clone())
            .collect())
    }

    /// Overwrites the status of the given nodes to `canceled`.
    ///
    /// Used for parent-cancel propagation; unknown ids are ignored.
    pub fn mark_canceled(&mut self, ids: &[TaskInstanceId]) {
        for id in ids {
            if let Some(&idx) = self.node_index.get(id) {
                self.graph[idx].status = TaskInstanceStatus::Canceled;
            }
        }
    }

    /// Computes the rollup status of the whole tree.
    ///
    /// Walks depth-first following only executable paths. Any still-active
    /// node short-circuits to `Running` (other branches must settle first).
    /// Among settled trees, failed/canceled wins over blocked wins over
    /// success. Returns the id of the node that decided a non-success status.
    #[must_use]
    pub fn compute_status(&self) -> (TreeStatus, Option<TaskInstanceId>) {
        let mut failed: Option<TaskInstanceId> = None;
        let mut blocked: Option<TaskInstanceId> = None;
        let mut active: Option<TaskInstanceId> = None;

        self.walk(|_, node| match node.status {
            TaskInstanceStatus::Failed | TaskInstanceStatus::Canceled => {
                failed.get_or_insert_with(|| node.task_ins_id.clone());
                true
            }
            TaskInstanceStatus::Blocked => {
                blocked.get_or_insert_with(|| node.task_ins_id.clone());
                true
            }
            TaskInstanceStatus::Success | TaskInstanceStatus::Skipped => true,
            _ => {
                active = Some(node.task_ins_id.clone());
                false
            }
        });

        if let Some(id) = active {
            return (TreeStatus::Running, Some(id));
        }
        if let Some(id) = failed {
            return (TreeStatus::Failed, Some(id));
        }
        if let Some(id) = blocked {
            return (TreeStatus::Blocked, Some(id));
        }
        (TreeStatus::Success, None)
    }
}
