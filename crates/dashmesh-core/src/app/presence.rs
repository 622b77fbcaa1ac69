//! Presence: keep this node's record under `presence/{nodeId}` alive.
//!
//! While the store session is connected the record is (re)announced,
//! armed for removal on disconnect and refreshed every heartbeat. Write
//! failures are logged; the next tick retries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::{Map, json};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::domain::errors::StoreError;
use crate::domain::ids::NodeId;
use crate::domain::presence::{NodeLoad, NodeRole, NodeStatus, PresenceRecord, SystemMetadata};
use crate::ports::{AuthIdentity, Clock, StateStore, child_path};

pub const PRESENCE: &str = "presence";

/// Who this node is. Passed to every manager instead of living in globals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub node_id: NodeId,
    pub owner: AuthIdentity,
    pub role: NodeRole,
}

pub struct PresenceManager {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    identity: NodeIdentity,
    system_metadata: Option<SystemMetadata>,
    heartbeat: Duration,
    reported: Mutex<NodeStatus>,
    online: AtomicBool,
    load: Mutex<NodeLoad>,
}

impl PresenceManager {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        identity: NodeIdentity,
        system_metadata: Option<SystemMetadata>,
        heartbeat: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            identity,
            system_metadata,
            heartbeat,
            reported: Mutex::new(NodeStatus::Idle),
            online: AtomicBool::new(false),
            load: Mutex::new(NodeLoad::default()),
        }
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn path(&self) -> String {
        child_path(PRESENCE, self.identity.node_id.as_str())
    }

    /// Local view of our own status; `offline` until announced and while disconnected.
    pub fn status(&self) -> NodeStatus {
        if self.online.load(Ordering::SeqCst) {
            self.reported_status()
        } else {
            NodeStatus::Offline
        }
    }

    fn reported_status(&self) -> NodeStatus {
        *self.reported.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn load(&self) -> NodeLoad {
        self.load.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Arm removal on disconnect, then write the full record with the
    /// current status and load.
    pub async fn announce(&self) -> Result<(), StoreError> {
        let record = PresenceRecord {
            status: self.reported_status(),
            last_seen: self.clock.now(),
            role: self.identity.role,
            email: self.identity.owner.email.clone(),
            owner_identity: self.identity.owner.id.clone(),
            system_metadata: self.system_metadata.clone(),
            metadata: Some(self.load()),
        };
        let path = self.path();
        let value = serde_json::to_value(&record).map_err(|e| StoreError::codec(&path, e))?;
        self.store.on_disconnect_remove(&path).await?;
        self.store.set(&path, value).await?;
        self.online.store(true, Ordering::SeqCst);
        tracing::info!(
            node_id = %self.identity.node_id,
            role = %self.identity.role,
            status = %record.status,
            "presence announced"
        );
        Ok(())
    }

    /// Bump `lastSeen` and re-publish the current status and load.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let mut patch = Map::new();
        patch.insert("lastSeen".into(), json!(self.clock.now()));
        patch.insert("status".into(), json!(self.reported_status()));
        patch.insert("metadata".into(), json!(self.load()));
        self.store.update(&self.path(), patch).await
    }

    /// Publish a status change immediately (e.g. `busy` while executing).
    /// The status is kept locally even when the write fails.
    pub async fn set_status(&self, status: NodeStatus) -> Result<(), StoreError> {
        *self.reported.lock().unwrap_or_else(PoisonError::into_inner) = status;
        let mut patch = Map::new();
        patch.insert("status".into(), json!(status));
        patch.insert("lastSeen".into(), json!(self.clock.now()));
        self.store.update(&self.path(), patch).await
    }

    /// Replace the self-reported load.
    pub async fn set_metadata(&self, load: NodeLoad) -> Result<(), StoreError> {
        let value = json!(&load);
        *self.load.lock().unwrap_or_else(PoisonError::into_inner) = load;
        let mut patch = Map::new();
        patch.insert("metadata".into(), value);
        self.store.update(&self.path(), patch).await
    }

    /// Spawn the announce/refresh loop.
    pub fn start(self: Arc<Self>) -> PresenceHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn(self.run(shutdown_rx));
        PresenceHandle { shutdown_tx, join }
    }

    async fn try_announce(&self) {
        if let Err(err) = self.announce().await {
            tracing::warn!(node_id = %self.identity.node_id, error = %err, "presence announce failed");
        }
    }

    /// Refresh the record, or announce it again when it is gone.
    async fn beat(&self) {
        let result = match self.store.get(&self.path()).await {
            Ok(Some(_)) if self.online.load(Ordering::SeqCst) => self.refresh().await,
            Ok(_) => self.announce().await,
            Err(err) => Err(err),
        };
        if let Err(err) = result {
            tracing::warn!(node_id = %self.identity.node_id, error = %err, "presence heartbeat failed");
        }
    }

    fn ticker(&self) -> Interval {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut connection = self.store.connection();
        let mut connected = *connection.borrow_and_update();
        let mut ticker = None;

        if connected {
            self.try_announce().await;
            ticker = Some(self.ticker());
        }

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                changed = connection.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    connected = *connection.borrow_and_update();
                    if connected {
                        // a drop and reconnect may arrive as a single change
                        self.try_announce().await;
                        ticker = Some(self.ticker());
                    } else {
                        ticker = None;
                        self.online.store(false, Ordering::SeqCst);
                        tracing::info!(node_id = %self.identity.node_id, "store connection lost");
                    }
                }
                _ = next_tick(&mut ticker) => self.beat().await,
            }
        }

        if connected
            && let Err(err) = self.store.remove(&self.path()).await
        {
            tracing::warn!(node_id = %self.identity.node_id, error = %err, "failed to retract presence");
        }
        self.online.store(false, Ordering::SeqCst);
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Running presence loop.
pub struct PresenceHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl PresenceHandle {
    pub fn request_shutdown(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop refreshing and retract the record.
    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await {
            tracing::warn!(error = %err, "presence loop panicked");
        }
    }
}
