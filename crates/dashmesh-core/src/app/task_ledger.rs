//! Task ledger: create, transition and query records under `tasks/`.
//!
//! Every status change goes through `transition`, a compare-and-swap on the
//! record's current status. It is the only thing that stops two nodes from
//! both running or both completing the same task.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;

use crate::domain::errors::{StoreError, TaskError};
use crate::domain::ids::{Identity, NodeId, TaskId};
use crate::domain::task::{TaskPayload, TaskRecord, TaskStatus, TransitionFields};
use crate::ports::{CasOutcome, CasWrite, Clock, Snapshot, StateStore, Subscription, child_path, transaction};

pub const TASKS: &str = "tasks";

/// Decoded ledger contents, in creation order.
pub type TaskSnapshot = BTreeMap<TaskId, TaskRecord>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFilter {
    OwnedBy(Identity),
    Status(TaskStatus),
    ClaimedBy(NodeId),
    OriginNode(NodeId),
}

impl TaskFilter {
    fn field_and_value(&self) -> (&'static str, Value) {
        match self {
            TaskFilter::OwnedBy(identity) => ("userId", Value::from(identity.as_str())),
            TaskFilter::Status(status) => ("status", Value::from(status.as_str())),
            TaskFilter::ClaimedBy(node) => ("assignedTo", Value::from(node.as_str())),
            TaskFilter::OriginNode(node) => ("clientId", Value::from(node.as_str())),
        }
    }
}

pub fn task_path(task_id: &TaskId) -> String {
    child_path(TASKS, &task_id.key())
}

fn encode(path: &str, record: &TaskRecord) -> Result<Value, StoreError> {
    serde_json::to_value(record).map_err(|e| StoreError::codec(path, e))
}

fn decode(path: &str, value: &Value) -> Result<TaskRecord, StoreError> {
    serde_json::from_value(value.clone()).map_err(|e| StoreError::codec(path, e))
}

/// Decode a raw `tasks/` snapshot, skipping records that do not parse.
pub fn decode_snapshot(snapshot: &Snapshot) -> TaskSnapshot {
    snapshot
        .iter()
        .filter_map(|(key, value)| {
            let task_id = TaskId::from_key(key).ok()?;
            match decode(&child_path(TASKS, key), value) {
                Ok(record) => Some((task_id, record)),
                Err(err) => {
                    tracing::warn!(%task_id, error = %err, "skipping malformed task record");
                    None
                }
            }
        })
        .collect()
}

pub struct TaskLedger {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    retry_budget: u32,
}

impl TaskLedger {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, retry_budget: u32) -> Self {
        Self {
            store,
            clock,
            retry_budget,
        }
    }

    /// Validate `payload` and write a new `pending` task.
    pub async fn create_task(
        &self,
        owner: &Identity,
        origin: &NodeId,
        payload: TaskPayload,
    ) -> Result<TaskId, TaskError> {
        payload.validate()?;

        let key = self.store.push_key(TASKS).await?;
        let task_id = TaskId::from_key(&key).map_err(|e| StoreError::codec(TASKS, e))?;
        let path = task_path(&task_id);
        let record = TaskRecord::new(owner.clone(), origin.clone(), payload, self.clock.now());

        let write = CasWrite {
            path: path.clone(),
            expected_version: None,
            value: Some(encode(&path, &record)?),
        };
        match self.store.compare_and_set(vec![write]).await? {
            CasOutcome::Committed => {
                tracing::info!(%task_id, owner = %owner, origin = %origin, "task created");
                Ok(task_id)
            }
            CasOutcome::Conflict { path } => {
                Err(StoreError::ConflictExhausted { path, attempts: 1 }.into())
            }
        }
    }

    pub async fn get(&self, task_id: &TaskId) -> Result<Option<TaskRecord>, TaskError> {
        let path = task_path(task_id);
        match self.store.get(&path).await? {
            Some(versioned) => Ok(Some(decode(&path, &versioned.value)?)),
            None => Ok(None),
        }
    }

    /// Move `task_id` to `to` iff its current status is in `from_allowed`,
    /// the edge exists and the assignee guard in `fields` holds.
    ///
    /// Returns the record as written. A rejected transition writes nothing.
    pub async fn transition(
        &self,
        task_id: &TaskId,
        from_allowed: &[TaskStatus],
        to: TaskStatus,
        fields: TransitionFields,
    ) -> Result<TaskRecord, TaskError> {
        let path = task_path(task_id);
        let now = self.clock.now();

        let written = transaction(self.store.as_ref(), &path, self.retry_budget, |current| {
            let current = current.ok_or(TaskError::NotFound(*task_id))?;
            let mut record = decode(&path, current)?;
            if !record.admits(from_allowed, to, &fields) {
                return Err(TaskError::InvalidTransition {
                    task_id: *task_id,
                    from: record.status,
                    to,
                });
            }
            record.apply(to, &fields, now);
            Ok(encode(&path, &record)?)
        })
        .await?;

        Ok(decode(&path, &written)?)
    }

    /// First claim wins: `pending -> assigned` with `assignedTo = node`.
    pub async fn assign(&self, task_id: &TaskId, node: &NodeId) -> Result<TaskRecord, TaskError> {
        let fields = TransitionFields {
            assigned_to: Some(node.clone()),
            ..TransitionFields::default()
        };
        self.transition(task_id, &[TaskStatus::Pending], TaskStatus::Assigned, fields)
            .await
    }

    /// Force a non-terminal task to `stopped`.
    pub async fn stop(&self, task_id: &TaskId) -> Result<TaskRecord, TaskError> {
        let fields = TransitionFields {
            stopped_at: Some(self.clock.now()),
            ..TransitionFields::default()
        };
        let record = self
            .transition(
                task_id,
                &[TaskStatus::Pending, TaskStatus::Assigned, TaskStatus::Running],
                TaskStatus::Stopped,
                fields,
            )
            .await?;
        tracing::info!(%task_id, "task stopped");
        Ok(record)
    }

    /// Administrative delete.
    pub async fn purge(&self, task_id: &TaskId) -> Result<(), TaskError> {
        let path = task_path(task_id);
        if self.store.get(&path).await?.is_none() {
            return Err(TaskError::NotFound(*task_id));
        }
        self.store.remove(&path).await?;
        tracing::info!(%task_id, "task purged");
        Ok(())
    }

    pub async fn query(&self, filter: &TaskFilter) -> Result<TaskSnapshot, TaskError> {
        let (field, value) = filter.field_and_value();
        let snapshot = self.store.query_child(TASKS, field, &value).await?;
        Ok(decode_snapshot(&snapshot))
    }

    pub async fn list_all(&self) -> Result<TaskSnapshot, TaskError> {
        Ok(decode_snapshot(&self.store.children(TASKS).await?))
    }

    pub async fn subscribe(&self) -> Result<TaskSubscription, TaskError> {
        Ok(TaskSubscription {
            inner: self.store.subscribe(TASKS).await?,
        })
    }

    pub fn connection(&self) -> watch::Receiver<bool> {
        self.store.connection()
    }
}

/// Full decoded ledger snapshot on every change.
pub struct TaskSubscription {
    inner: Subscription,
}

impl TaskSubscription {
    pub async fn next(&mut self) -> Option<TaskSnapshot> {
        let raw = self.inner.next().await?;
        Some(decode_snapshot(&raw))
    }
}
