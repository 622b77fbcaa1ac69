//! App: node logic composed from the ports.
//!
//! - **PresenceManager**: heartbeat record under `presence/`
//! - **MembershipView**: live peers per role
//! - **TaskLedger**: task records and CAS status transitions
//! - **ExecutionLoop**: claim, run, report
//! - **PointsLedger**: awards and atomic transfers
//! - **ChatFeed** / **NetworkStats**: thin consumers
//! - **NodeBuilder**: wiring

pub mod builder;
pub mod chat;
pub mod claim;
pub mod execution_loop;
pub mod membership;
pub mod points_ledger;
pub mod presence;
pub mod runtime;
pub mod status;
pub mod task_ledger;

pub use self::builder::{BuildError, Node, NodeBuilder};
pub use self::chat::ChatFeed;
pub use self::claim::ClaimPolicy;
pub use self::execution_loop::{ExecutionHandle, ExecutionLoop};
pub use self::membership::{MembershipStream, MembershipView};
pub use self::points_ledger::{PointsLedger, TransferReceipt};
pub use self::presence::{NodeIdentity, PresenceHandle, PresenceManager};
pub use self::runtime::NodeRuntime;
pub use self::status::{NetworkStats, TaskCounts};
pub use self::task_ledger::{TaskFilter, TaskLedger, TaskSnapshot, TaskSubscription};

/// Saturates instead of failing on absurd configured windows.
pub(crate) fn to_chrono(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
