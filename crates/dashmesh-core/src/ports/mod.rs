//! Ports: the seams between the node logic and the outside world.
//!
//! The shared store, the executor bridge, the identity provider, time and
//! id generation are all traits here, so tests run a whole mesh in memory.

pub mod clock;
pub mod executor;
pub mod id_generator;
pub mod identity;
pub mod state_store;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::executor::{ContainerRun, Executor};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::identity::{AuthIdentity, IdentityProvider};
pub use self::state_store::{
    CasOutcome, CasWrite, Snapshot, StateStore, Subscription, Versioned, child_path, transaction,
    transaction_many,
};
