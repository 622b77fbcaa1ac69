//! Which pending tasks an execution loop may claim for itself.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::domain::ids::Identity;
use crate::domain::task::{TaskRecord, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimPolicy {
    /// Never claim; only run tasks some other party assigned to us.
    Off,
    /// Claim any pending task.
    #[default]
    Any,
    /// Claim only tasks submitted by the node's own owner.
    SameOwner,
}

impl ClaimPolicy {
    pub fn allows(self, task: &TaskRecord, owner: &Identity) -> bool {
        if task.status != TaskStatus::Pending {
            return false;
        }
        match self {
            ClaimPolicy::Off => false,
            ClaimPolicy::Any => true,
            ClaimPolicy::SameOwner => &task.owner_identity == owner,
        }
    }
}

impl fmt::Display for ClaimPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClaimPolicy::Off => "off",
            ClaimPolicy::Any => "any",
            ClaimPolicy::SameOwner => "same_owner",
        })
    }
}

impl FromStr for ClaimPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(ClaimPolicy::Off),
            "any" => Ok(ClaimPolicy::Any),
            "same_owner" | "same-owner" => Ok(ClaimPolicy::SameOwner),
            other => Err(format!("unknown claim policy {other:?} (off, any, same_owner)")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ids::NodeId;
    use crate::domain::task::TaskPayload;
    use chrono::Utc;
    use rstest::rstest;

    fn pending_from(owner: &str) -> TaskRecord {
        TaskRecord::new(
            Identity::new(owner),
            NodeId::new("origin"),
            TaskPayload::code("print(1)"),
            Utc::now(),
        )
    }

    #[rstest]
    #[case(ClaimPolicy::Off, "alice", false)]
    #[case(ClaimPolicy::Any, "alice", true)]
    #[case(ClaimPolicy::Any, "bob", true)]
    #[case(ClaimPolicy::SameOwner, "alice", true)]
    #[case(ClaimPolicy::SameOwner, "bob", false)]
    fn policy_filters_pending_tasks(
        #[case] policy: ClaimPolicy,
        #[case] submitter: &str,
        #[case] allowed: bool,
    ) {
        let task = pending_from(submitter);
        assert_eq!(policy.allows(&task, &Identity::new("alice")), allowed);
    }

    #[test]
    fn non_pending_tasks_are_never_claimable() {
        let mut task = pending_from("alice");
        task.status = TaskStatus::Assigned;
        assert!(!ClaimPolicy::Any.allows(&task, &Identity::new("alice")));
    }

    #[test]
    fn parses_cli_spellings() {
        assert_eq!("same-owner".parse::<ClaimPolicy>(), Ok(ClaimPolicy::SameOwner));
        assert_eq!("off".parse::<ClaimPolicy>(), Ok(ClaimPolicy::Off));
        assert!("all".parse::<ClaimPolicy>().is_err());
    }
}
