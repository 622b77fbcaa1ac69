//! Task record, payload shapes and the status state machine.
//!
//! State transitions:
//! - pending -> assigned -> running -> completed | failed
//! - pending | assigned | running -> stopped
//!
//! completed, failed and stopped are terminal.

use std::fmt;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::errors::TaskError;
use super::ids::{Identity, NodeId};

static MEMORY_LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\d+[kmg]b?$").expect("memory limit pattern"));
static CPU_LIMIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(\.\d+)?$").expect("cpu limit pattern"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Running,
    Completed,
    Failed,
    Stopped,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Stopped
        )
    }

    /// Is `self -> next` one of the lifecycle edges?
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Assigned)
                | (Assigned, Running)
                | (Running, Completed)
                | (Running, Failed)
                | (Pending | Assigned | Running, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Assigned => "assigned",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Stopped => "stopped",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container run request as submitted by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerConfig {
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    /// Seconds, as a decimal string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_limit: Option<String>,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    pub fn time_limit_secs(&self) -> Option<u64> {
        self.time_limit.as_deref().and_then(|s| s.trim().parse().ok())
    }
}

/// What a task asks to run. Stored flattened into the record with a
/// `taskType` tag, so a record carries exactly one shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "taskType", rename_all = "lowercase")]
pub enum TaskPayload {
    Code {
        code: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requirements: Option<String>,
    },
    #[serde(rename = "docker")]
    Container {
        #[serde(rename = "dockerConfig")]
        config: ContainerConfig,
    },
}

impl TaskPayload {
    pub fn code(code: impl Into<String>) -> Self {
        TaskPayload::Code {
            code: code.into(),
            requirements: None,
        }
    }

    pub fn container(config: ContainerConfig) -> Self {
        TaskPayload::Container { config }
    }

    /// Reject payloads that must never reach the ledger.
    pub fn validate(&self) -> Result<(), TaskError> {
        match self {
            TaskPayload::Code { code, .. } => {
                if code.trim().is_empty() {
                    return Err(TaskError::InvalidPayload("code is required".into()));
                }
            }
            TaskPayload::Container { config } => {
                if config.image.trim().is_empty() {
                    return Err(TaskError::InvalidPayload("container image is required".into()));
                }
                if let Some(mem) = &config.memory_limit
                    && !MEMORY_LIMIT.is_match(mem)
                {
                    return Err(TaskError::InvalidPayload(format!(
                        "invalid memory limit {mem:?} (e.g. 512m, 1g)"
                    )));
                }
                if let Some(cpu) = &config.cpu_limit
                    && !CPU_LIMIT.is_match(cpu)
                {
                    return Err(TaskError::InvalidPayload(format!(
                        "invalid cpu limit {cpu:?} (e.g. 1, 0.5)"
                    )));
                }
                if let Some(limit) = &config.time_limit
                    && !matches!(limit.trim().parse::<u64>(), Ok(secs) if secs > 0)
                {
                    return Err(TaskError::InvalidPayload(format!(
                        "invalid time limit {limit:?} (whole seconds)"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Split a shell-ish command line into arguments. Quotes group words and are dropped.
pub fn parse_command(command: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut quoted = false;

    for ch in command.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                quoted = true;
            }
            None if ch.is_whitespace() => {
                if !current.is_empty() || quoted {
                    args.push(std::mem::take(&mut current));
                    quoted = false;
                }
            }
            None => current.push(ch),
        }
    }
    if !current.is_empty() || quoted {
        args.push(current);
    }
    args
}

/// Fields a transition may write alongside the new status.
///
/// `expected_assignee` is a guard, not a write: when set, the transition
/// only applies if the record is currently assigned to that node.
#[derive(Debug, Clone, Default)]
pub struct TransitionFields {
    pub assigned_to: Option<NodeId>,
    pub expected_assignee: Option<NodeId>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub runtime_seconds: Option<u64>,
    pub done_by: Option<Identity>,
}

/// A task as stored under `tasks/{taskId}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub status: TaskStatus,
    #[serde(rename = "userId")]
    pub owner_identity: Identity,
    #[serde(rename = "clientId")]
    pub origin_node_id: NodeId,
    #[serde(flatten)]
    pub payload: TaskPayload,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<NodeId>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Only meaningful once `completed_at` is set.
    #[serde(default, rename = "runtime", skip_serializing_if = "Option::is_none")]
    pub runtime_seconds: Option<u64>,
    #[serde(default, rename = "doneUserId", skip_serializing_if = "Option::is_none")]
    pub done_by: Option<Identity>,
}

impl TaskRecord {
    pub fn new(
        owner_identity: Identity,
        origin_node_id: NodeId,
        payload: TaskPayload,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            status: TaskStatus::Pending,
            owner_identity,
            origin_node_id,
            payload,
            assigned_to: None,
            created_at,
            updated_at: None,
            started_at: None,
            completed_at: None,
            stopped_at: None,
            output: None,
            error: None,
            runtime_seconds: None,
            done_by: None,
        }
    }

    /// Would `to` with these fields be accepted from the current state?
    pub fn admits(&self, from_allowed: &[TaskStatus], to: TaskStatus, fields: &TransitionFields) -> bool {
        if !from_allowed.contains(&self.status) || !self.status.can_transition_to(to) {
            return false;
        }
        if let Some(expected) = &fields.expected_assignee
            && self.assigned_to.as_ref() != Some(expected)
        {
            return false;
        }
        // an assignment must name the assignee
        if to == TaskStatus::Assigned && fields.assigned_to.is_none() {
            return false;
        }
        true
    }

    /// Write the new status and fields. Callers check `admits` first.
    pub fn apply(&mut self, to: TaskStatus, fields: &TransitionFields, now: DateTime<Utc>) {
        self.status = to;
        self.updated_at = Some(now);
        if let Some(node) = &fields.assigned_to {
            self.assigned_to = Some(node.clone());
        }
        if fields.started_at.is_some() {
            self.started_at = fields.started_at;
        }
        if fields.completed_at.is_some() {
            self.completed_at = fields.completed_at;
        }
        if fields.stopped_at.is_some() {
            self.stopped_at = fields.stopped_at;
        }
        if let Some(output) = &fields.output {
            self.output = Some(output.clone());
        }
        if let Some(error) = &fields.error {
            self.error = Some(error.clone());
        }
        if fields.runtime_seconds.is_some() {
            self.runtime_seconds = fields.runtime_seconds;
        }
        if let Some(doer) = &fields.done_by {
            self.done_by = Some(doer.clone());
        }
    }
}
