//! Error types and their operational classification.
//!
//! Each concern has its own `thiserror` enum. `ErrorKind` groups them the
//! way an operator reads a log: transient (lost race, conflict), permanent
//! (bad input, balance), infrastructure (store unreachable).

use std::time::Duration;

use thiserror::Error;

use super::ids::TaskId;
use super::task::TaskStatus;

/// Operational classification of an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

/// Failures of the shared state store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("state store unavailable")]
    Unavailable,

    #[error("transaction on {path} gave up after {attempts} conflicting attempts")]
    ConflictExhausted { path: String, attempts: u32 },

    #[error("malformed record at {path}: {message}")]
    Codec { path: String, message: String },
}

impl StoreError {
    pub fn codec(path: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::Codec {
            path: path.into(),
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::Unavailable => ErrorKind::Infrastructure,
            StoreError::ConflictExhausted { .. } => ErrorKind::Transient,
            StoreError::Codec { .. } => ErrorKind::Permanent,
        }
    }
}

/// Task ledger failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TaskError {
    #[error("invalid task payload: {0}")]
    InvalidPayload(String),

    /// The compare-and-swap on the status did not hold. Usually a lost race.
    #[error("task {task_id}: transition {from} -> {to} rejected")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("task {0} not found")]
    NotFound(TaskId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TaskError {
    pub fn is_lost_race(&self) -> bool {
        matches!(self, TaskError::InvalidTransition { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::InvalidPayload(_) | TaskError::NotFound(_) => ErrorKind::Permanent,
            TaskError::InvalidTransition { .. } => ErrorKind::Transient,
            TaskError::Store(e) => e.kind(),
        }
    }
}

/// Points ledger failures. `InvalidAmount` and `SelfTransfer` are rejected
/// before the store is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PointsError {
    #[error("transfer amount must be positive")]
    InvalidAmount,

    #[error("cannot transfer to yourself")]
    SelfTransfer,

    #[error("insufficient balance: {available} available, {requested} requested")]
    InsufficientBalance { available: u64, requested: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl PointsError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PointsError::Store(e) => e.kind(),
            _ => ErrorKind::Permanent,
        }
    }
}

/// Failures reported by the executor bridge. Recorded on the task, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecutorError {
    #[error("{0}")]
    Failed(String),

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("rejected: {0}")]
    Rejected(String),

    #[error("executor io: {0}")]
    Io(String),
}

impl ExecutorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecutorError::Io(_) => ErrorKind::Infrastructure,
            _ => ErrorKind::Permanent,
        }
    }
}

impl From<std::io::Error> for ExecutorError {
    fn from(err: std::io::Error) -> Self {
        ExecutorError::Io(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lost_race_is_transient() {
        let err = TaskError::InvalidTransition {
            task_id: TaskId::from_ulid(ulid::Ulid::new()),
            from: TaskStatus::Completed,
            to: TaskStatus::Running,
        };
        assert!(err.is_lost_race());
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(err.to_string().contains("completed -> running"));
    }

    #[test]
    fn store_kind_flows_through_wrappers() {
        let err = PointsError::from(StoreError::Unavailable);
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        let err = TaskError::from(StoreError::Unavailable);
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
    }
}
