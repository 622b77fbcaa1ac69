//! NodeRuntime: the running loops of one node.

use crate::domain::ids::NodeId;

use super::execution_loop::ExecutionHandle;
use super::presence::PresenceHandle;

pub struct NodeRuntime {
    node_id: NodeId,
    presence: PresenceHandle,
    execution: ExecutionHandle,
}

impl NodeRuntime {
    pub(crate) fn new(node_id: NodeId, presence: PresenceHandle, execution: ExecutionHandle) -> Self {
        Self {
            node_id,
            presence,
            execution,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Stop claiming, let in-flight tasks finish, then retract presence.
    pub async fn shutdown_and_join(self) {
        self.execution.shutdown_and_join().await;
        self.presence.shutdown_and_join().await;
        tracing::info!(node_id = %self.node_id, "node stopped");
    }
}
