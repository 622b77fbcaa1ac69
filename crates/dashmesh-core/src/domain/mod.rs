//! Domain model: identifiers, records and error types.

pub mod chat;
pub mod errors;
pub mod ids;
pub mod points;
pub mod presence;
pub mod task;

pub use chat::{ChatMessage, MessageKind};
pub use errors::{ErrorKind, ExecutorError, PointsError, StoreError, TaskError};
pub use ids::{Identity, MessageId, NodeId, TaskId};
pub use points::PointsAccount;
pub use presence::{NodeLoad, NodeRole, NodeStatus, PresenceProbe, PresenceRecord, SystemMetadata};
pub use task::{ContainerConfig, TaskPayload, TaskRecord, TaskStatus, TransitionFields, parse_command};
