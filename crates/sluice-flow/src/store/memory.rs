//! In-memory store implementation.
//!
//! [`MemoryStore`] keeps all state in process memory behind `RwLock`s. It is
//! the reference implementation of the [`Store`] contract, suitable for tests
//! and single-node deployments.
//!
//! ## Limitations
//!
//! - **No durability**: all state is lost when the process exits
//! - **Single-process only**: state is not shared across process boundaries

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{Duration, Utc};

use sluice_core::{DagId, DagInstanceId, IdMinter, TaskInstanceId};

use super::{
    DagInsField, DagInstancePatch, ListDagInstanceInput, ListTaskInstanceInput, Store,
    TaskInsField, TaskInstancePatch,
};
use crate::dag::Dag;
use crate::dag_instance::{DagInstance, DagInstanceStatus};
use crate::error::{Error, Result};
use crate::events::{EventBus, FlowEvent};
use crate::task_instance::{TaskInstance, TaskInstanceStatus};
use crate::tasktree::TaskTree;

/// Slack subtracted from "now" by the expired-task filter, so the watchdog
/// never races the executor's own deadline.
const EXPIRED_SLACK_SECS: i64 = 5;

/// Ordered table: rows by id plus insertion order for deterministic listing.
#[derive(Debug)]
struct Table<K, V> {
    rows: HashMap<K, V>,
    order: Vec<K>,
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            rows: HashMap::default(),
            order: Vec::default(),
        }
    }
}

impl<K: std::hash::Hash + Eq + Clone, V> Table<K, V> {
    fn insert(&mut self, key: K, value: V) {
        if self.rows.insert(key.clone(), value).is_none() {
            self.order.push(key);
        }
    }

    fn iter_ordered(&self) -> impl Iterator<Item = &V> {
        self.order.iter().filter_map(|key| self.rows.get(key))
    }
}

/// In-memory store.
pub struct MemoryStore {
    dags: RwLock<Table<DagId, Dag>>,
    dag_instances: RwLock<Table<DagInstanceId, DagInstance>>,
    task_instances: RwLock<Table<TaskInstanceId, TaskInstance>>,
    ids: Arc<dyn IdMinter>,
    bus: EventBus,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore").finish_non_exhaustive()
    }
}

fn poison_err<T>(_: PoisonError<T>) -> Error {
    Error::storage("lock poisoned")
}

impl MemoryStore {
    /// Creates a store minting ids through the given generator and publishing
    /// change events to the given bus.
    #[must_use]
    pub fn new(ids: Arc<dyn IdMinter>, bus: EventBus) -> Self {
        Self {
            dags: RwLock::new(Table::default()),
            dag_instances: RwLock::new(Table::default()),
            task_instances: RwLock::new(Table::default()),
            ids,
            bus,
        }
    }

    fn matches_dag_ins(input: &ListDagInstanceInput, ins: &DagInstance) -> bool {
        if let Some(worker) = &input.worker {
            if &ins.worker != worker {
                return false;
            }
        }
        if let Some(dag_id) = &input.dag_id {
            if &ins.dag_id != dag_id {
                return false;
            }
        }
        if let Some(updated_end) = input.updated_end {
            if ins.updated_at > updated_end {
                return false;
            }
        }
        if !input.status.is_empty() && !input.status.contains(&ins.status) {
            return false;
        }
        if input.has_cmd && ins.cmd.is_none() {
            return false;
        }
        input
            .tags
            .iter()
            .all(|(k, v)| ins.tags.get(k).is_some_and(|tag| tag == v))
    }

    fn matches_task_ins(input: &ListTaskInstanceInput, ins: &TaskInstance) -> bool {
        if !input.ids.is_empty() && !input.ids.contains(&ins.id) {
            return false;
        }
        if let Some(dag_ins_id) = &input.dag_ins_id {
            if &ins.dag_ins_id != dag_ins_id {
                return false;
            }
        }
        if !input.status.is_empty() && !input.status.contains(&ins.status) {
            return false;
        }
        if input.expired {
            if ins.status != TaskInstanceStatus::Running {
                return false;
            }
            let timeout =
                Duration::seconds(i64::try_from(ins.timeout_secs).unwrap_or(i64::MAX));
            let deadline = ins.updated_at + timeout;
            if deadline > Utc::now() - Duration::seconds(EXPIRED_SLACK_SECS) {
                return false;
            }
        }
        true
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn create_dag(&self, dag: &Dag) -> Result<()> {
        if dag.id.is_empty() {
            return Err(Error::storage("dag id cannot be empty"));
        }
        TaskTree::validate_tasks(&dag.tasks)?;

        let mut dags = self.dags.write().map_err(poison_err)?;
        if dags.rows.contains_key(&dag.id) {
            return Err(Error::DataConflicted {
                resource: "dag",
                id: dag.id.to_string(),
            });
        }
        dags.insert(dag.id.clone(), dag.clone());
        Ok(())
    }

    async fn update_dag(&self, dag: &Dag) -> Result<()> {
        TaskTree::validate_tasks(&dag.tasks)?;

        let mut dags = self.dags.write().map_err(poison_err)?;
        if !dags.rows.contains_key(&dag.id) {
            return Err(Error::DataNotFound {
                resource: "dag",
                id: dag.id.to_string(),
            });
        }
        dags.insert(dag.id.clone(), dag.clone());
        Ok(())
    }

    async fn get_dag(&self, dag_id: &DagId) -> Result<Dag> {
        let dags = self.dags.read().map_err(poison_err)?;
        dags.rows.get(dag_id).cloned().ok_or(Error::DataNotFound {
            resource: "dag",
            id: dag_id.to_string(),
        })
    }

    async fn create_dag_ins(&self, dag_ins: &mut DagInstance) -> Result<()> {
        if dag_ins.id.is_empty() {
            dag_ins.id = DagInstanceId::from(self.ids.next_string_id());
        }
        dag_ins.updated_at = Utc::now();

        let mut instances = self.dag_instances.write().map_err(poison_err)?;
        if instances.rows.contains_key(&dag_ins.id) {
            return Err(Error::DataConflicted {
                resource: "dag_instance",
                id: dag_ins.id.to_string(),
            });
        }
        instances.insert(dag_ins.id.clone(), dag_ins.clone());
        Ok(())
    }

    async fn get_dag_instance(&self, dag_ins_id: &DagInstanceId) -> Result<DagInstance> {
        let instances = self.dag_instances.read().map_err(poison_err)?;
        instances
            .rows
            .get(dag_ins_id)
            .cloned()
            .ok_or(Error::DataNotFound {
                resource: "dag_instance",
                id: dag_ins_id.to_string(),
            })
    }

    async fn list_dag_instance(&self, input: &ListDagInstanceInput) -> Result<Vec<DagInstance>> {
        let instances = self.dag_instances.read().map_err(poison_err)?;
        let mut matched: Vec<DagInstance> = instances
            .iter_ordered()
            .filter(|ins| Self::matches_dag_ins(input, ins))
            .cloned()
            .collect();
        if let Some(limit) = input.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn patch_dag_ins(
        &self,
        patch: DagInstancePatch,
        must_patch_fields: &[DagInsField],
    ) -> Result<()> {
        {
            let mut instances = self.dag_instances.write().map_err(poison_err)?;
            let ins = instances
                .rows
                .get_mut(&patch.id)
                .ok_or_else(|| Error::DataNotFound {
                    resource: "dag_instance",
                    id: patch.id.to_string(),
                })?;

            if let Some(worker) = &patch.worker {
                ins.worker = worker.clone();
            } else if must_patch_fields.contains(&DagInsField::Worker) {
                ins.worker = String::new();
            }

            if let Some(status) = patch.status {
                ins.status = status;
            }

            if let Some(reason) = &patch.reason {
                ins.reason = reason.clone();
            } else if must_patch_fields.contains(&DagInsField::Reason) {
                ins.reason = String::new();
            }

            if let Some(cmd) = &patch.cmd {
                ins.cmd = Some(cmd.clone());
            } else if must_patch_fields.contains(&DagInsField::Cmd) {
                ins.cmd = None;
            }

            if let Some(share_data) = &patch.share_data {
                ins.share_data = crate::dag_instance::ShareData::from_map(share_data.clone());
            }

            ins.updated_at = Utc::now();
        }

        self.bus.publish(FlowEvent::DagInstancePatched {
            payload: Box::new(patch),
            must_patch_fields: must_patch_fields.to_vec(),
        });
        Ok(())
    }

    async fn update_dag_ins(&self, dag_ins: &DagInstance) -> Result<()> {
        {
            let mut instances = self.dag_instances.write().map_err(poison_err)?;
            if !instances.rows.contains_key(&dag_ins.id) {
                return Err(Error::DataNotFound {
                    resource: "dag_instance",
                    id: dag_ins.id.to_string(),
                });
            }
            let mut updated = dag_ins.clone();
            updated.updated_at = Utc::now();
            instances.insert(updated.id.clone(), updated);
        }

        self.bus.publish(FlowEvent::DagInstanceUpdated {
            payload: Box::new(dag_ins.clone()),
        });
        Ok(())
    }

    async fn batch_update_dag_ins(&self, dag_ins: &[DagInstance]) -> Result<()> {
        let mut messages = Vec::new();
        for ins in dag_ins {
            if let Err(err) = self.update_dag_ins(ins).await {
                messages.push(format!("dag instance[{}]: {err}", ins.id));
            }
        }
        if messages.is_empty() {
            Ok(())
        } else {
            Err(Error::Batch { messages })
        }
    }

    async fn batch_create_task_ins(&self, task_ins: &mut [TaskInstance]) -> Result<()> {
        let mut instances = self.task_instances.write().map_err(poison_err)?;
        for ins in task_ins.iter_mut() {
            if ins.id.is_empty() {
                ins.id = TaskInstanceId::from(self.ids.next_string_id());
            }
            ins.updated_at = Utc::now();
            if instances.rows.contains_key(&ins.id) {
                return Err(Error::DataConflicted {
                    resource: "task_instance",
                    id: ins.id.to_string(),
                });
            }
            instances.insert(ins.id.clone(), ins.clone());
        }
        Ok(())
    }

    async fn get_task_ins(&self, task_ins_id: &TaskInstanceId) -> Result<TaskInstance> {
        let instances = self.task_instances.read().map_err(poison_err)?;
        instances
            .rows
            .get(task_ins_id)
            .cloned()
            .ok_or(Error::DataNotFound {
                resource: "task_instance",
                id: task_ins_id.to_string(),
            })
    }

    async fn list_task_instance(&self, input: &ListTaskInstanceInput) -> Result<Vec<TaskInstance>> {
        let instances = self.task_instances.read().map_err(poison_err)?;
        Ok(instances
            .iter_ordered()
            .filter(|ins| Self::matches_task_ins(input, ins))
            .cloned()
            .collect())
    }

    async fn patch_task_ins(
        &self,
        patch: TaskInstancePatch,
        must_patch_fields: &[TaskInsField],
    ) -> Result<()> {
        let mut instances = self.task_instances.write().map_err(poison_err)?;
        let ins = instances
            .rows
            .get_mut(&patch.id)
            .ok_or_else(|| Error::DataNotFound {
                resource: "task_instance",
                id: patch.id.to_string(),
            })?;

        if let Some(status) = patch.status {
            ins.status = status;
        }

        if let Some(reason) = &patch.reason {
            ins.reason = reason.clone();
        } else if must_patch_fields.contains(&TaskInsField::Reason) {
            ins.reason = String::new();
        }

        if let Some(traces) = &patch.traces {
            ins.traces = traces.clone();
        } else if must_patch_fields.contains(&TaskInsField::Traces) {
            ins.traces = Vec::new();
        }

        ins.updated_at = Utc::now();
        Ok(())
    }

    async fn update_task_ins(&self, task_ins: &TaskInstance) -> Result<()> {
        let mut instances = self.task_instances.write().map_err(poison_err)?;
        if !instances.rows.contains_key(&task_ins.id) {
            return Err(Error::DataNotFound {
                resource: "task_instance",
                id: task_ins.id.to_string(),
            });
        }
        let mut updated = task_ins.clone();
        updated.updated_at = Utc::now();
        instances.insert(updated.id.clone(), updated);
        Ok(())
    }

    async fn batch_update_task_ins(&self, task_ins: &[TaskInstance]) -> Result<()> {
        let mut messages = Vec::new();
        for ins in task_ins {
            if let Err(err) = self.update_task_ins(ins).await {
                messages.push(format!("task instance[{}]: {err}", ins.id));
            }
        }
        if messages.is_empty() {
            Ok(())
        } else {
            Err(Error::Batch { messages })
        }
    }

    fn marshal(&self, share_data: &BTreeMap<String, String>) -> Result<Vec<u8>> {
        serde_json::to_vec(share_data)
            .map_err(|err| Error::storage_with_source("marshal share data failed", err))
    }

    fn unmarshal(&self, bytes: &[u8]) -> Result<BTreeMap<String, String>> {
        serde_json::from_slice(bytes)
            .map_err(|err| Error::storage_with_source("unmarshal share data failed", err))
    }

    async fn close(&self) {}
}
