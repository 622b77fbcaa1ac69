//! Points ledger: per-identity balances under `userPoints/`.
//!
//! Both mutations are transactions against the store. A transfer debits and
//! credits in one atomic multi-path commit, with the balance checked at
//! commit time.

use std::sync::Arc;

use serde_json::Value;

use crate::domain::errors::{PointsError, StoreError};
use crate::domain::ids::Identity;
use crate::domain::points::PointsAccount;
use crate::ports::{Clock, StateStore, child_path, transaction, transaction_many};

pub const USER_POINTS: &str = "userPoints";

pub fn points_path(identity: &Identity) -> String {
    child_path(USER_POINTS, identity.as_str())
}

fn decode(path: &str, value: Option<&Value>) -> Result<PointsAccount, StoreError> {
    match value {
        Some(value) => serde_json::from_value(value.clone()).map_err(|e| StoreError::codec(path, e)),
        None => Ok(PointsAccount::default()),
    }
}

fn encode(path: &str, account: &PointsAccount) -> Result<Value, StoreError> {
    serde_json::to_value(account).map_err(|e| StoreError::codec(path, e))
}

/// Balances right after a committed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReceipt {
    pub from_balance: u64,
    pub to_balance: u64,
}

pub struct PointsLedger {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    retry_budget: u32,
}

impl PointsLedger {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>, retry_budget: u32) -> Self {
        Self {
            store,
            clock,
            retry_budget,
        }
    }

    /// Absent accounts read as zero.
    pub async fn account(&self, identity: &Identity) -> Result<PointsAccount, PointsError> {
        let path = points_path(identity);
        let current = self.store.get(&path).await?;
        Ok(decode(&path, current.as_ref().map(|v| &v.value))?)
    }

    pub async fn balance(&self, identity: &Identity) -> Result<u64, PointsError> {
        Ok(self.account(identity).await?.total_points)
    }

    /// Credit `seconds` of work. Returns the new total.
    pub async fn award(&self, identity: &Identity, seconds: u64) -> Result<u64, PointsError> {
        let path = points_path(identity);
        let now = self.clock.now();

        let written = transaction(self.store.as_ref(), &path, self.retry_budget, |current| {
            let mut account = decode(&path, current)?;
            account.credit(seconds, now);
            Ok::<_, PointsError>(encode(&path, &account)?)
        })
        .await?;

        let total = decode(&path, Some(&written))?.total_points;
        tracing::info!(identity = %identity, seconds, total, "points awarded");
        Ok(total)
    }

    /// Move `amount` from one identity to another.
    pub async fn transfer(
        &self,
        from: &Identity,
        to: &Identity,
        amount: u64,
    ) -> Result<TransferReceipt, PointsError> {
        if amount == 0 {
            return Err(PointsError::InvalidAmount);
        }
        if from == to {
            return Err(PointsError::SelfTransfer);
        }

        // cheap early rejection; the binding check is inside the transaction
        let available = self.balance(from).await?;
        if available < amount {
            return Err(PointsError::InsufficientBalance {
                available,
                requested: amount,
            });
        }

        let from_path = points_path(from);
        let to_path = points_path(to);
        let now = self.clock.now();

        let written = transaction_many(
            self.store.as_ref(),
            &[from_path.as_str(), to_path.as_str()],
            self.retry_budget,
            |current| {
                let mut sender = decode(&from_path, current[0].as_ref())?;
                let mut receiver = decode(&to_path, current[1].as_ref())?;
                sender.debit(amount, now)?;
                receiver.credit(amount, now);
                Ok::<_, PointsError>(vec![
                    encode(&from_path, &sender)?,
                    encode(&to_path, &receiver)?,
                ])
            },
        )
        .await?;

        let receipt = TransferReceipt {
            from_balance: decode(&from_path, written.first())?.total_points,
            to_balance: decode(&to_path, written.get(1))?.total_points,
        };
        tracing::info!(from = %from, to = %to, amount, "points transferred");
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::impls::InMemoryStore;
    use crate::ports::SystemClock;

    fn ledger(store: &InMemoryStore) -> PointsLedger {
        PointsLedger::new(Arc::new(store.client()), Arc::new(SystemClock), 32)
    }

    fn id(s: &str) -> Identity {
        Identity::new(s)
    }

    #[tokio::test]
    async fn award_creates_and_accumulates() {
        let store = InMemoryStore::new();
        let ledger = ledger(&store);

        assert_eq!(ledger.balance(&id("a")).await.unwrap(), 0);
        assert_eq!(ledger.award(&id("a"), 5).await.unwrap(), 5);
        assert_eq!(ledger.award(&id("a"), 7).await.unwrap(), 12);
        assert!(ledger.account(&id("a")).await.unwrap().last_updated.is_some());
    }

    #[tokio::test]
    async fn concurrent_awards_do_not_lose_updates() {
        let store = InMemoryStore::new();
        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger(&store);
            handles.push(tokio::spawn(async move { ledger.award(&id("a"), 3).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(ledger(&store).balance(&id("a")).await.unwrap(), 30);
    }

    #[tokio::test]
    async fn overdraft_is_rejected_and_nothing_moves() {
        let store = InMemoryStore::new();
        let ledger = ledger(&store);
        ledger.award(&id("a"), 30).await.unwrap();

        let err = ledger.transfer(&id("a"), &id("b"), 50).await.unwrap_err();

        assert_eq!(
            err,
            PointsError::InsufficientBalance {
                available: 30,
                requested: 50
            }
        );
        assert_eq!(ledger.balance(&id("a")).await.unwrap(), 30);
        assert_eq!(ledger.balance(&id("b")).await.unwrap(), 0);
        assert!(store.client().get("userPoints/b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn transfer_moves_points_atomically() {
        let store = InMemoryStore::new();
        let ledger = ledger(&store);
        ledger.award(&id("a"), 30).await.unwrap();

        let receipt = ledger.transfer(&id("a"), &id("b"), 20).await.unwrap();

        assert_eq!(
            receipt,
            TransferReceipt {
                from_balance: 10,
                to_balance: 20
            }
        );
        assert_eq!(ledger.balance(&id("a")).await.unwrap(), 10);
        assert_eq!(ledger.balance(&id("b")).await.unwrap(), 20);
    }

    #[tokio::test]
    async fn transfer_preconditions() {
        let store = InMemoryStore::new();
        let ledger = ledger(&store);
        ledger.award(&id("a"), 10).await.unwrap();

        assert_eq!(
            ledger.transfer(&id("a"), &id("b"), 0).await,
            Err(PointsError::InvalidAmount)
        );
        assert_eq!(
            ledger.transfer(&id("a"), &id("a"), 5).await,
            Err(PointsError::SelfTransfer)
        );
    }

    #[tokio::test]
    async fn racing_transfers_never_overdraw() {
        let store = InMemoryStore::new();
        ledger(&store).award(&id("a"), 10).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..5 {
            let ledger = ledger(&store);
            handles.push(tokio::spawn(async move {
                ledger.transfer(&id("a"), &id(&format!("r{n}")), 4).await
            }));
        }
        let mut ok = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => ok += 1,
                Err(PointsError::InsufficientBalance { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        let ledger = ledger(&store);
        let remaining = ledger.balance(&id("a")).await.unwrap();
        assert_eq!(ok, 2);
        assert_eq!(remaining, 2);
        let mut received = 0;
        for n in 0..5 {
            received += ledger.balance(&id(&format!("r{n}"))).await.unwrap();
        }
        assert_eq!(received + remaining, 10);
    }
}
