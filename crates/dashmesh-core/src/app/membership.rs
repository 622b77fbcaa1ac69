//! Membership: how many peers of a role are currently alive.
//!
//! A read-side projection of `presence/`. Partial or malformed records are
//! skipped, never an error.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::presence::PRESENCE;
use super::to_chrono;
use crate::domain::errors::StoreError;
use crate::domain::ids::NodeId;
use crate::domain::presence::{NodeRole, PresenceProbe};
use crate::ports::{Clock, Snapshot, StateStore, Subscription};

/// Live presences of `role` in a snapshot, in key order.
pub fn active_nodes(
    snapshot: &Snapshot,
    role: NodeRole,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> Vec<NodeId> {
    snapshot
        .iter()
        .filter(|(_, value)| PresenceProbe::from_value(value).is_live(role, now, window))
        .map(|(key, _)| NodeId::new(key.as_str()))
        .collect()
}

pub fn count_active(
    snapshot: &Snapshot,
    role: NodeRole,
    now: DateTime<Utc>,
    window: chrono::Duration,
) -> usize {
    snapshot
        .values()
        .filter(|value| PresenceProbe::from_value(value).is_live(role, now, window))
        .count()
}

pub struct MembershipView {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    role: NodeRole,
    window: chrono::Duration,
}

impl MembershipView {
    pub fn new(
        store: Arc<dyn StateStore>,
        clock: Arc<dyn Clock>,
        role: NodeRole,
        window: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            role,
            window: to_chrono(window),
        }
    }

    pub async fn active_count(&self) -> Result<usize, StoreError> {
        let snapshot = self.store.children(PRESENCE).await?;
        Ok(count_active(&snapshot, self.role, self.clock.now(), self.window))
    }

    pub async fn active_nodes(&self) -> Result<Vec<NodeId>, StoreError> {
        let snapshot = self.store.children(PRESENCE).await?;
        Ok(active_nodes(&snapshot, self.role, self.clock.now(), self.window))
    }

    /// A count per presence snapshot. Ages are evaluated when the snapshot
    /// arrives, so a record going stale is noticed on the next change.
    pub async fn observe(&self) -> Result<MembershipStream, StoreError> {
        Ok(MembershipStream {
            subscription: self.store.subscribe(PRESENCE).await?,
            clock: self.clock.clone(),
            role: self.role,
            window: self.window,
        })
    }
}

pub struct MembershipStream {
    subscription: Subscription,
    clock: Arc<dyn Clock>,
    role: NodeRole,
    window: chrono::Duration,
}

impl MembershipStream {
    pub async fn next(&mut self) -> Option<usize> {
        let snapshot = self.subscription.next().await?;
        Some(count_active(&snapshot, self.role, self.clock.now(), self.window))
    }
}
