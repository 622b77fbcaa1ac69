//! In-memory shared store.
//!
//! `InMemoryStore` is the shared backend; every node talks to it through its
//! own `StoreClient` session. A session can be disconnected and reconnected,
//! which runs its disconnect hooks, ends its subscriptions and makes its
//! operations fail with `StoreError::Unavailable` in between.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::domain::errors::StoreError;
use crate::ports::{
    CasOutcome, CasWrite, IdGenerator, Snapshot, StateStore, Subscription, SystemClock,
    UlidGenerator, Versioned,
};

struct Entry {
    value: Value,
    version: u64,
}

struct Watcher {
    session: u64,
    prefix: String,
    tx: watch::Sender<Snapshot>,
}

#[derive(Default)]
struct Backend {
    entries: BTreeMap<String, Entry>,
    last_version: u64,
    watchers: Vec<Watcher>,
    disconnect_hooks: HashMap<u64, Vec<String>>,
}

impl Backend {
    fn bump(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn write(&mut self, path: &str, value: Option<Value>) {
        match value {
            Some(value) => {
                let version = self.bump();
                self.entries.insert(path.to_string(), Entry { value, version });
            }
            None => {
                self.entries.remove(path);
            }
        }
    }

    fn children(&self, prefix: &str) -> Snapshot {
        let start = format!("{prefix}/");
        self.entries
            .range(start.clone()..)
            .take_while(|(path, _)| path.starts_with(&start))
            .filter_map(|(path, entry)| {
                let key = &path[start.len()..];
                (!key.contains('/')).then(|| (key.to_string(), entry.value.clone()))
            })
            .collect()
    }

    /// Push fresh snapshots to every watcher of a collection touched by `paths`.
    fn notify<'a>(&mut self, paths: impl IntoIterator<Item = &'a str>) {
        let paths: Vec<&str> = paths.into_iter().collect();
        self.watchers.retain(|w| !w.tx.is_closed());

        let mut touched: Vec<String> = self
            .watchers
            .iter()
            .filter(|w| paths.iter().any(|p| is_under(p, &w.prefix)))
            .map(|w| w.prefix.clone())
            .collect();
        touched.sort();
        touched.dedup();

        for prefix in touched {
            let snapshot = self.children(&prefix);
            for watcher in self.watchers.iter().filter(|w| w.prefix == prefix) {
                watcher.tx.send_replace(snapshot.clone());
            }
        }
    }
}

fn is_under(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix)
        .is_some_and(|rest| rest.starts_with('/'))
}

/// Shared backend. Cheap to clone.
#[derive(Clone)]
pub struct InMemoryStore {
    backend: Arc<Mutex<Backend>>,
    ids: Arc<dyn IdGenerator>,
    sessions: Arc<AtomicU64>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            backend: Arc::new(Mutex::new(Backend::default())),
            ids,
            sessions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Open a new, connected session.
    pub fn client(&self) -> StoreClient {
        let (connected, _) = watch::channel(true);
        StoreClient {
            store: self.clone(),
            session: self.sessions.fetch_add(1, Ordering::Relaxed),
            connected,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Backend> {
        self.backend.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's session against an `InMemoryStore`.
pub struct StoreClient {
    store: InMemoryStore,
    session: u64,
    connected: watch::Sender<bool>,
}

impl StoreClient {
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Drop the session: run its disconnect hooks and end its subscriptions.
    pub fn disconnect(&self) {
        if !self.connected.send_replace(false) {
            return;
        }
        let mut backend = self.store.lock();
        let hooks = backend
            .disconnect_hooks
            .remove(&self.session)
            .unwrap_or_default();
        for path in &hooks {
            backend.write(path, None);
        }
        backend.watchers.retain(|w| w.session != self.session);
        backend.notify(hooks.iter().map(String::as_str));
        tracing::debug!(session = self.session, hooks = hooks.len(), "store session disconnected");
    }

    pub fn reconnect(&self) {
        if !self.connected.send_replace(true) {
            tracing::debug!(session = self.session, "store session reconnected");
        }
    }

    fn ensure_connected(&self) -> Result<MutexGuard<'_, Backend>, StoreError> {
        if self.is_connected() {
            Ok(self.store.lock())
        } else {
            Err(StoreError::Unavailable)
        }
    }
}

#[async_trait]
impl StateStore for StoreClient {
    async fn get(&self, path: &str) -> Result<Option<Versioned>, StoreError> {
        let backend = self.ensure_connected()?;
        Ok(backend.entries.get(path).map(|e| Versioned {
            value: e.value.clone(),
            version: e.version,
        }))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let mut backend = self.ensure_connected()?;
        backend.write(path, Some(value));
        backend.notify([path]);
        Ok(())
    }

    async fn update(&self, path: &str, patch: Map<String, Value>) -> Result<(), StoreError> {
        let mut backend = self.ensure_connected()?;
        let mut merged = match backend.entries.get(path).map(|e| &e.value) {
            Some(Value::Object(existing)) => existing.clone(),
            _ => Map::new(),
        };
        for (field, value) in patch {
            if value.is_null() {
                merged.remove(&field);
            } else {
                merged.insert(field, value);
            }
        }
        backend.write(path, Some(Value::Object(merged)));
        backend.notify([path]);
        Ok(())
    }

    async fn remove(&self, path: &str) -> Result<(), StoreError> {
        let mut backend = self.ensure_connected()?;
        if backend.entries.contains_key(path) {
            backend.write(path, None);
            backend.notify([path]);
        }
        Ok(())
    }

    async fn children(&self, prefix: &str) -> Result<Snapshot, StoreError> {
        Ok(self.ensure_connected()?.children(prefix))
    }

    async fn query_child(
        &self,
        prefix: &str,
        child: &str,
        equals: &Value,
    ) -> Result<Snapshot, StoreError> {
        let mut snapshot = self.ensure_connected()?.children(prefix);
        snapshot.retain(|_, value| value.get(child) == Some(equals));
        Ok(snapshot)
    }

    async fn push_key(&self, _prefix: &str) -> Result<String, StoreError> {
        drop(self.ensure_connected()?);
        Ok(self.store.ids.generate_key().to_string())
    }

    async fn compare_and_set(&self, writes: Vec<CasWrite>) -> Result<CasOutcome, StoreError> {
        let mut backend = self.ensure_connected()?;
        for write in &writes {
            let current = backend.entries.get(&write.path).map(|e| e.version);
            if current != write.expected_version {
                return Ok(CasOutcome::Conflict {
                    path: write.path.clone(),
                });
            }
        }
        for write in &writes {
            backend.write(&write.path, write.value.clone());
        }
        backend.notify(writes.iter().map(|w| w.path.as_str()));
        Ok(CasOutcome::Committed)
    }

    async fn subscribe(&self, prefix: &str) -> Result<Subscription, StoreError> {
        let mut backend = self.ensure_connected()?;
        let (tx, rx) = watch::channel(backend.children(prefix));
        backend.watchers.push(Watcher {
            session: self.session,
            prefix: prefix.to_string(),
            tx,
        });
        Ok(Subscription::new(rx))
    }

    fn connection(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    async fn on_disconnect_remove(&self, path: &str) -> Result<(), StoreError> {
        let mut backend = self.ensure_connected()?;
        let hooks = backend.disconnect_hooks.entry(self.session).or_default();
        if !hooks.iter().any(|p| p == path) {
            hooks.push(path.to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{transaction, transaction_many};
    use serde_json::json;
    use std::time::Duration;

    fn patch(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn versions_change_on_every_write() {
        let store = InMemoryStore::new();
        let client = store.client();

        client.set("tasks/a", json!({"n": 1})).await.unwrap();
        let v1 = client.get("tasks/a").await.unwrap().unwrap().version;
        client.set("tasks/a", json!({"n": 1})).await.unwrap();
        let v2 = client.get("tasks/a").await.unwrap().unwrap().version;

        assert!(v2 > v1);
        assert!(client.get("tasks/missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_merges_and_null_deletes() {
        let client = InMemoryStore::new().client();
        client
            .set("nodes/a", json!({"status": "idle", "email": "x@y"}))
            .await
            .unwrap();

        client
            .update("nodes/a", patch(json!({"status": "busy", "email": null})))
            .await
            .unwrap();

        let value = client.get("nodes/a").await.unwrap().unwrap().value;
        assert_eq!(value, json!({"status": "busy"}));

        client
            .update("nodes/b", patch(json!({"status": "idle"})))
            .await
            .unwrap();
        assert!(client.get("nodes/b").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn children_are_immediate_and_queryable() {
        let client = InMemoryStore::new().client();
        client.set("tasks/a", json!({"status": "pending"})).await.unwrap();
        client.set("tasks/b", json!({"status": "running"})).await.unwrap();
        client.set("tasks/b/deep", json!({})).await.unwrap();
        client.set("tasksx/c", json!({"status": "pending"})).await.unwrap();

        let all = client.children("tasks").await.unwrap();
        assert_eq!(all.keys().collect::<Vec<_>>(), vec!["a", "b"]);

        let pending = client
            .query_child("tasks", "status", &json!("pending"))
            .await
            .unwrap();
        assert_eq!(pending.keys().collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn compare_and_set_is_all_or_nothing() {
        let client = InMemoryStore::new().client();
        client.set("points/a", json!(1)).await.unwrap();
        let a = client.get("points/a").await.unwrap().unwrap();

        let outcome = client
            .compare_and_set(vec![
                CasWrite {
                    path: "points/a".into(),
                    expected_version: Some(a.version),
                    value: Some(json!(2)),
                },
                CasWrite {
                    path: "points/b".into(),
                    expected_version: Some(99),
                    value: Some(json!(3)),
                },
            ])
            .await
            .unwrap();

        assert_eq!(
            outcome,
            CasOutcome::Conflict {
                path: "points/b".into()
            }
        );
        assert_eq!(client.get("points/a").await.unwrap().unwrap().value, json!(1));
        assert!(client.get("points/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn subscription_sees_initial_and_changes() {
        let store = InMemoryStore::new();
        let writer = store.client();
        let reader = store.client();
        writer.set("tasks/a", json!(1)).await.unwrap();

        let mut sub = reader.subscribe("tasks").await.unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.len(), 1);

        writer.set("messages/x", json!("unrelated")).await.unwrap();
        writer.set("tasks/b", json!(2)).await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn write_before_first_next_is_delivered() {
        let store = InMemoryStore::new();
        let writer = store.client();
        let reader = store.client();

        let mut sub = reader.subscribe("tasks").await.unwrap();
        writer.set("tasks/a", json!(1)).await.unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.keys().collect::<Vec<_>>(), vec!["a"]);

        writer.set("tasks/b", json!(2)).await.unwrap();
        let second = tokio::time::timeout(Duration::from_millis(200), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn disconnect_runs_hooks_and_blocks_operations() {
        let store = InMemoryStore::new();
        let node = store.client();
        let observer = store.client();

        node.set("nodes/a", json!({"status": "idle"})).await.unwrap();
        node.on_disconnect_remove("nodes/a").await.unwrap();
        let mut own_sub = node.subscribe("tasks").await.unwrap();
        own_sub.next().await.unwrap();
        let mut connection = node.connection();

        node.disconnect();

        assert!(!*connection.borrow_and_update());
        assert!(observer.get("nodes/a").await.unwrap().is_none());
        assert_eq!(node.get("nodes/a").await, Err(StoreError::Unavailable));
        assert!(own_sub.next().await.is_none());

        node.reconnect();
        connection.changed().await.unwrap();
        assert!(*connection.borrow());
        assert!(node.get("nodes/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn disconnect_hook_notifies_other_sessions() {
        let store = InMemoryStore::new();
        let node = store.client();
        let observer = store.client();
        node.set("nodes/a", json!({})).await.unwrap();
        node.on_disconnect_remove("nodes/a").await.unwrap();

        let mut sub = observer.subscribe("nodes").await.unwrap();
        assert_eq!(sub.next().await.unwrap().len(), 1);

        node.disconnect();
        let after = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn concurrent_transactions_do_not_lose_updates() {
        let store = InMemoryStore::new();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = store.client();
            handles.push(tokio::spawn(async move {
                transaction::<_, StoreError, _>(&client, "counter/n", 64, |current| {
                    let n = current.and_then(Value::as_u64).unwrap_or(0);
                    Ok(json!(n + 1))
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let value = store.client().get("counter/n").await.unwrap().unwrap().value;
        assert_eq!(value, json!(8));
    }

    #[tokio::test]
    async fn transaction_gives_up_after_budget() {
        let store = InMemoryStore::new();
        let client = store.client();
        let mut attempts = 0;

        let err = transaction::<_, StoreError, _>(&client, "counter/n", 3, |_| {
            attempts += 1;
            // a competing writer lands between our read and our write
            store.lock().write("counter/n", Some(json!(attempts)));
            Ok(json!(0))
        })
        .await
        .unwrap_err();

        assert_eq!(
            err,
            StoreError::ConflictExhausted {
                path: "counter/n".into(),
                attempts: 3
            }
        );
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn transaction_abort_writes_nothing() {
        let client = InMemoryStore::new().client();
        let result = transaction::<_, StoreError, _>(&client, "points/a", 4, |_| {
            Err(StoreError::codec("points/a", "nope"))
        })
        .await;

        assert!(matches!(result, Err(StoreError::Codec { .. })));
        assert!(client.get("points/a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn multi_path_transaction_commits_together() {
        let client = InMemoryStore::new().client();
        client.set("points/a", json!(10)).await.unwrap();

        transaction_many::<_, StoreError, _>(&client, &["points/a", "points/b"], 4, |values| {
            let a = values[0].as_ref().and_then(Value::as_u64).unwrap_or(0);
            let b = values[1].as_ref().and_then(Value::as_u64).unwrap_or(0);
            Ok(vec![json!(a - 4), json!(b + 4)])
        })
        .await
        .unwrap();

        assert_eq!(client.get("points/a").await.unwrap().unwrap().value, json!(6));
        assert_eq!(client.get("points/b").await.unwrap().unwrap().value, json!(4));
    }
}
