//! Per-node execution loop.
//!
//! Watches the task ledger and, for every task assigned to this node:
//! assigned -> running (CAS on the assignee), executor call, then
//! running -> completed | failed, award. The node reports `busy` while
//! anything is in flight and `idle` otherwise. With a claim policy
//! other than `off` the loop also claims pending tasks for itself while it
//! has spare capacity.
//!
//! Snapshots repeat; a local in-flight set makes sure one claim never
//! reaches the executor twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;

use super::claim::ClaimPolicy;
use super::points_ledger::PointsLedger;
use super::presence::PresenceManager;
use super::task_ledger::{TaskLedger, TaskSnapshot};
use crate::domain::errors::ExecutorError;
use crate::domain::ids::{Identity, NodeId, TaskId};
use crate::domain::presence::{NodeLoad, NodeStatus};
use crate::domain::task::{TaskPayload, TaskRecord, TaskStatus, TransitionFields};
use crate::ports::{Clock, ContainerRun, Executor};

const RESUBSCRIBE_DELAY: Duration = Duration::from_millis(250);

type InFlightSet = Arc<Mutex<HashSet<TaskId>>>;

/// Removes a task from the in-flight set when processing ends, however it ends.
struct InFlight {
    set: InFlightSet,
    task_id: TaskId,
}

impl InFlight {
    fn acquire(set: &InFlightSet, task_id: TaskId) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id);
        inserted.then(|| Self {
            set: set.clone(),
            task_id,
        })
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.task_id);
    }
}

pub struct ExecutionLoop {
    node_id: NodeId,
    owner: Identity,
    presence: Arc<PresenceManager>,
    ledger: Arc<TaskLedger>,
    points: Arc<PointsLedger>,
    executor: Arc<dyn Executor>,
    clock: Arc<dyn Clock>,
    policy: ClaimPolicy,
    capacity: usize,
    in_flight: InFlightSet,
    load_publish: AsyncMutex<()>,
}

impl ExecutionLoop {
    pub fn new(
        presence: Arc<PresenceManager>,
        ledger: Arc<TaskLedger>,
        points: Arc<PointsLedger>,
        executor: Arc<dyn Executor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let identity = presence.identity();
        Self {
            node_id: identity.node_id.clone(),
            owner: identity.owner.id.clone(),
            presence,
            ledger,
            points,
            executor,
            clock,
            policy: ClaimPolicy::Off,
            capacity: 1,
            in_flight: Arc::default(),
            load_publish: AsyncMutex::new(()),
        }
    }

    pub fn with_policy(mut self, policy: ClaimPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Upper bound on tasks this loop claims for itself at once.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn is_mine_to_run(&self, record: &TaskRecord) -> bool {
        record.status == TaskStatus::Assigned && record.assigned_to.as_ref() == Some(&self.node_id)
    }

    /// React to one ledger snapshot. Returns the workers it spawned.
    pub async fn handle_snapshot(self: &Arc<Self>, snapshot: &TaskSnapshot) -> Vec<JoinHandle<()>> {
        let mut workers = Vec::new();

        for (task_id, record) in snapshot.iter().filter(|(_, r)| self.is_mine_to_run(r)) {
            if let Some(worker) = self.spawn_worker(*task_id, record.clone()) {
                workers.push(worker);
            }
        }

        if self.policy == ClaimPolicy::Off {
            return workers;
        }

        let mut spare = self.capacity.saturating_sub(self.in_flight());
        let mut candidates: Vec<(&TaskId, &TaskRecord)> = snapshot
            .iter()
            .filter(|(_, r)| self.policy.allows(r, &self.owner))
            .collect();
        candidates.sort_by_key(|(id, r)| (r.created_at, **id));

        for (task_id, _) in candidates {
            if spare == 0 {
                break;
            }
            match self.ledger.assign(task_id, &self.node_id).await {
                Ok(record) => {
                    tracing::info!(node_id = %self.node_id, %task_id, "task claimed");
                    if let Some(worker) = self.spawn_worker(*task_id, record) {
                        workers.push(worker);
                        spare -= 1;
                    }
                }
                Err(err) if err.is_lost_race() => {
                    tracing::debug!(node_id = %self.node_id, %task_id, "claim lost to another node");
                }
                Err(err) => {
                    tracing::warn!(node_id = %self.node_id, %task_id, error = %err, "claim failed");
                    break;
                }
            }
        }
        workers
    }

    fn spawn_worker(self: &Arc<Self>, task_id: TaskId, record: TaskRecord) -> Option<JoinHandle<()>> {
        let guard = InFlight::acquire(&self.in_flight, task_id)?;
        let this = Arc::clone(self);
        Some(tokio::spawn(async move {
            this.process(task_id, record).await;
            drop(guard);
            this.publish_load().await;
        }))
    }

    async fn process(&self, task_id: TaskId, record: TaskRecord) {
        let started_at = self.clock.now();
        let start = TransitionFields {
            expected_assignee: Some(self.node_id.clone()),
            started_at: Some(started_at),
            ..TransitionFields::default()
        };
        match self
            .ledger
            .transition(&task_id, &[TaskStatus::Assigned], TaskStatus::Running, start)
            .await
        {
            Ok(_) => {}
            Err(err) if err.is_lost_race() => {
                tracing::debug!(node_id = %self.node_id, %task_id, "start lost, not executing");
                return;
            }
            Err(err) => {
                tracing::warn!(node_id = %self.node_id, %task_id, error = %err, "failed to start task");
                return;
            }
        }

        self.publish_load().await;
        let result = self.execute(&task_id, &record.payload).await;
        let completed_at = self.clock.now();

        match result {
            Ok(output) => {
                let runtime = (completed_at - started_at).num_seconds().max(0) as u64;
                let done = TransitionFields {
                    expected_assignee: Some(self.node_id.clone()),
                    completed_at: Some(completed_at),
                    output: Some(output),
                    runtime_seconds: Some(runtime),
                    done_by: Some(self.owner.clone()),
                    ..TransitionFields::default()
                };
                match self
                    .ledger
                    .transition(&task_id, &[TaskStatus::Running], TaskStatus::Completed, done)
                    .await
                {
                    Ok(_) => {
                        tracing::info!(node_id = %self.node_id, %task_id, runtime, "task completed");
                        if let Err(err) = self.points.award(&self.owner, runtime).await {
                            tracing::warn!(%task_id, identity = %self.owner, error = %err, "award failed");
                        }
                    }
                    Err(err) => self.report_lost_result(&task_id, &err.to_string()),
                }
            }
            Err(failure) => {
                let failed = TransitionFields {
                    expected_assignee: Some(self.node_id.clone()),
                    completed_at: Some(completed_at),
                    error: Some(failure.to_string()),
                    ..TransitionFields::default()
                };
                match self
                    .ledger
                    .transition(&task_id, &[TaskStatus::Running], TaskStatus::Failed, failed)
                    .await
                {
                    Ok(_) => {
                        tracing::info!(node_id = %self.node_id, %task_id, error = %failure, "task failed");
                    }
                    Err(err) => self.report_lost_result(&task_id, &err.to_string()),
                }
            }
        }
    }

    /// The task moved on while we ran it (usually stopped); the result is dropped.
    fn report_lost_result(&self, task_id: &TaskId, reason: &str) {
        tracing::info!(node_id = %self.node_id, %task_id, reason, "result discarded");
    }

    async fn execute(&self, task_id: &TaskId, payload: &TaskPayload) -> Result<String, ExecutorError> {
        match payload {
            TaskPayload::Code { code, requirements } => {
                self.executor.run_code(code, requirements.as_deref()).await
            }
            TaskPayload::Container { config } => {
                self.executor
                    .run_container(ContainerRun::for_task(task_id, config))
                    .await
            }
        }
    }

    /// Publish `busy`/`idle` and the task count from the in-flight set.
    /// Serialized so a stale count never lands after a newer one.
    async fn publish_load(&self) {
        let _serial = self.load_publish.lock().await;
        let tasks = self.in_flight();
        let status = if tasks > 0 { NodeStatus::Busy } else { NodeStatus::Idle };
        if let Err(err) = self.presence.set_status(status).await {
            tracing::warn!(node_id = %self.node_id, %status, error = %err, "status update failed");
        }
        let load = NodeLoad {
            tasks: u32::try_from(tasks).unwrap_or(u32::MAX),
            ..self.presence.load()
        };
        if let Err(err) = self.presence.set_metadata(load).await {
            tracing::warn!(node_id = %self.node_id, tasks, error = %err, "load update failed");
        }
    }

    /// Spawn the subscription loop.
    pub fn start(self: Arc<Self>) -> ExecutionHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        ExecutionHandle { shutdown_tx, join }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut connection = self.ledger.connection();
        let mut workers: Vec<JoinHandle<()>> = Vec::new();

        'outer: while !*shutdown.borrow() {
            let mut subscription = match self.ledger.subscribe().await {
                Ok(subscription) => subscription,
                Err(err) => {
                    tracing::warn!(node_id = %self.node_id, error = %err, "task subscription failed");
                    if !resume_when_connected(&mut connection, &mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break 'outer;
                        }
                    }
                    snapshot = subscription.next() => match snapshot {
                        Some(snapshot) => {
                            workers.retain(|w| !w.is_finished());
                            workers.extend(self.handle_snapshot(&snapshot).await);
                        }
                        None => {
                            tracing::debug!(node_id = %self.node_id, "task subscription ended");
                            break;
                        }
                    },
                }
            }

            if !resume_when_connected(&mut connection, &mut shutdown).await {
                break;
            }
        }

        // in-flight executions run to completion
        for worker in workers {
            if let Err(err) = worker.await {
                tracing::warn!(node_id = %self.node_id, error = %err, "task worker panicked");
            }
        }
    }
}

/// Wait until the store is connected, pausing briefly before the next
/// subscribe. `false` means shut down instead.
async fn resume_when_connected(
    connection: &mut watch::Receiver<bool>,
    shutdown: &mut watch::Receiver<bool>,
) -> bool {
    while !*connection.borrow_and_update() {
        tokio::select! {
            changed = connection.changed() => {
                if changed.is_err() {
                    return false;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return false;
                }
            }
        }
    }
    tokio::select! {
        _ = tokio::time::sleep(RESUBSCRIBE_DELAY) => true,
        changed = shutdown.changed() => changed.is_ok() && !*shutdown.borrow(),
    }
}

/// Running execution loop.
pub struct ExecutionHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl ExecutionHandle {
    /// Stop taking new work. In-flight executions are not cancelled.
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await {
            tracing::warn!(error = %err, "execution loop panicked");
        }
    }
}
