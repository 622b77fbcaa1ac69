//! StateStore port: the shared, realtime JSON tree every node reads and writes.
//!
//! Records live at `{collection}/{key}` (`presence/…`, `tasks/…`,
//! `userPoints/…`, `messages/…`). Each record carries a version that changes
//! on every write. `compare_and_set` is the only primitive that checks
//! versions; the `transaction*` helpers below build the read-check-write
//! retry loop on top of it.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::domain::errors::StoreError;

/// Children of a collection, keyed by child key, in key order.
pub type Snapshot = BTreeMap<String, Value>;

#[derive(Debug, Clone, PartialEq)]
pub struct Versioned {
    pub value: Value,
    pub version: u64,
}

/// One leg of an atomic compare-and-set.
#[derive(Debug, Clone, PartialEq)]
pub struct CasWrite {
    pub path: String,
    /// `None` means the path must currently be absent.
    pub expected_version: Option<u64>,
    /// `None` deletes the record.
    pub value: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    Committed,
    /// The first path whose version did not match. Nothing was written.
    Conflict { path: String },
}

/// Live view of a collection.
///
/// The first `next()` yields the latest snapshot right away; later calls
/// yield the latest snapshot after a change (intermediate ones may be
/// coalesced). `None` means the subscription ended, e.g. on disconnect.
/// Dropping it cancels the subscription.
pub struct Subscription {
    started: bool,
    rx: watch::Receiver<Snapshot>,
}

impl Subscription {
    pub fn new(rx: watch::Receiver<Snapshot>) -> Self {
        Self { started: false, rx }
    }

    pub async fn next(&mut self) -> Option<Snapshot> {
        if self.started {
            self.rx.changed().await.ok()?;
        }
        self.started = true;
        Some(self.rx.borrow_and_update().clone())
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Versioned>, StoreError>;

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Shallow merge into the object at `path`; `null` members delete fields.
    /// Creates the record when absent.
    async fn update(&self, path: &str, patch: Map<String, Value>) -> Result<(), StoreError>;

    async fn remove(&self, path: &str) -> Result<(), StoreError>;

    async fn children(&self, prefix: &str) -> Result<Snapshot, StoreError>;

    /// Children whose `child` member equals `equals`.
    async fn query_child(
        &self,
        prefix: &str,
        child: &str,
        equals: &Value,
    ) -> Result<Snapshot, StoreError>;

    /// A fresh, time-ordered key under `prefix`. Nothing is written.
    async fn push_key(&self, prefix: &str) -> Result<String, StoreError>;

    /// Apply every write iff every expected version matches.
    async fn compare_and_set(&self, writes: Vec<CasWrite>) -> Result<CasOutcome, StoreError>;

    async fn subscribe(&self, prefix: &str) -> Result<Subscription, StoreError>;

    /// `true` while this session is connected.
    fn connection(&self) -> watch::Receiver<bool>;

    /// Remove `path` when this session disconnects. Must be re-armed after
    /// a reconnect.
    async fn on_disconnect_remove(&self, path: &str) -> Result<(), StoreError>;
}

/// Read-modify-write on one path with optimistic concurrency.
///
/// `f` sees the current value (or `None`) and returns the value to commit,
/// or an error to abort without writing. `f` may run several times; it must
/// not have side effects. Gives up with `ConflictExhausted` after `budget`
/// conflicting attempts.
pub async fn transaction<S, E, F>(store: &S, path: &str, budget: u32, mut f: F) -> Result<Value, E>
where
    S: StateStore + ?Sized,
    E: From<StoreError>,
    F: FnMut(Option<&Value>) -> Result<Value, E>,
{
    for attempt in 1..=budget.max(1) {
        let current = store.get(path).await?;
        let next = f(current.as_ref().map(|v| &v.value))?;
        let write = CasWrite {
            path: path.to_string(),
            expected_version: current.map(|v| v.version),
            value: Some(next.clone()),
        };
        match store.compare_and_set(vec![write]).await? {
            CasOutcome::Committed => return Ok(next),
            CasOutcome::Conflict { .. } => {
                tracing::debug!(path, attempt, "transaction conflict, retrying");
            }
        }
    }
    Err(StoreError::ConflictExhausted {
        path: path.to_string(),
        attempts: budget.max(1),
    }
    .into())
}

/// `transaction` over several paths, committed atomically.
///
/// `f` receives the current values in `paths` order and returns the new
/// values in the same order.
pub async fn transaction_many<S, E, F>(
    store: &S,
    paths: &[&str],
    budget: u32,
    mut f: F,
) -> Result<Vec<Value>, E>
where
    S: StateStore + ?Sized,
    E: From<StoreError>,
    F: FnMut(&[Option<Value>]) -> Result<Vec<Value>, E>,
{
    for attempt in 1..=budget.max(1) {
        let mut versions = Vec::with_capacity(paths.len());
        let mut values = Vec::with_capacity(paths.len());
        for path in paths {
            let current = store.get(path).await?;
            versions.push(current.as_ref().map(|v| v.version));
            values.push(current.map(|v| v.value));
        }

        let next = f(&values)?;
        if next.len() != paths.len() {
            return Err(StoreError::codec(
                paths.join(","),
                format!("expected {} values, got {}", paths.len(), next.len()),
            )
            .into());
        }

        let writes = paths
            .iter()
            .zip(versions)
            .zip(next.iter().cloned())
            .map(|((path, expected_version), value)| CasWrite {
                path: path.to_string(),
                expected_version,
                value: Some(value),
            })
            .collect();

        match store.compare_and_set(writes).await? {
            CasOutcome::Committed => return Ok(next),
            CasOutcome::Conflict { path } => {
                tracing::debug!(%path, attempt, "multi-path transaction conflict, retrying");
            }
        }
    }
    Err(StoreError::ConflictExhausted {
        path: paths.join(","),
        attempts: budget.max(1),
    }
    .into())
}

/// `{collection}/{key}`.
pub fn child_path(collection: &str, key: &str) -> String {
    format!("{collection}/{key}")
}
