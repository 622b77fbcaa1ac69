//! NodeBuilder: wires one mesh node out of its collaborators.
//!
//! Fail-fast: `build()` checks every required collaborator, the config and
//! the signed-in identity before anything touches the store.

use std::sync::Arc;

use super::chat::ChatFeed;
use super::execution_loop::ExecutionLoop;
use super::membership::MembershipView;
use super::points_ledger::PointsLedger;
use super::presence::{NodeIdentity, PRESENCE, PresenceManager};
use super::runtime::NodeRuntime;
use super::status::NetworkStats;
use super::task_ledger::TaskLedger;
use super::to_chrono;
use crate::config::{ConfigError, NodeConfig};
use crate::domain::errors::TaskError;
use crate::domain::ids::{NodeId, TaskId};
use crate::domain::presence::{NodeRole, SystemMetadata};
use crate::domain::task::TaskPayload;
use crate::ports::{Clock, Executor, IdGenerator, IdentityProvider, StateStore, SystemClock, UlidGenerator};

/// # Example
/// ```ignore
/// let node = NodeBuilder::new()
///     .store(Arc::new(store.client()))
///     .executor(Arc::new(EchoExecutor::new()))
///     .identity_provider(Arc::new(StaticIdentity::new(AuthIdentity::new("alice"))))
///     .build()?;
/// let runtime = node.start();
/// ```
pub struct NodeBuilder {
    store: Option<Arc<dyn StateStore>>,
    executor: Option<Arc<dyn Executor>>,
    identity_provider: Option<Arc<dyn IdentityProvider>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    config: NodeConfig,
    node_id: Option<NodeId>,
    role: NodeRole,
    system_metadata: Option<SystemMetadata>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing collaborator: {0}")]
    MissingCollaborator(&'static str),

    #[error("no signed-in identity; a node cannot start anonymously")]
    Unauthenticated,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl NodeBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            executor: None,
            identity_provider: None,
            clock: None,
            ids: None,
            config: NodeConfig::default(),
            node_id: None,
            role: NodeRole::Worker,
            system_metadata: None,
        }
    }

    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn identity_provider(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.identity_provider = Some(provider);
        self
    }

    /// Defaults to the wall clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    pub fn config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    /// The persisted installation id. A fresh one is generated when unset.
    pub fn node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = Some(node_id);
        self
    }

    pub fn role(mut self, role: NodeRole) -> Self {
        self.role = role;
        self
    }

    pub fn system_metadata(mut self, metadata: SystemMetadata) -> Self {
        self.system_metadata = Some(metadata);
        self
    }

    pub fn build(self) -> Result<Node, BuildError> {
        self.config.validate()?;
        let store = self.store.ok_or(BuildError::MissingCollaborator("store"))?;
        let executor = self.executor.ok_or(BuildError::MissingCollaborator("executor"))?;
        let provider = self
            .identity_provider
            .ok_or(BuildError::MissingCollaborator("identity provider"))?;
        let owner = provider.current_identity().ok_or(BuildError::Unauthenticated)?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids: Arc<dyn IdGenerator> = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let node_id = self.node_id.unwrap_or_else(|| ids.generate_node_id());
        let config = self.config;

        let identity = NodeIdentity {
            node_id,
            owner,
            role: self.role,
        };
        let budget = config.transaction_retry_budget;
        let presence = Arc::new(PresenceManager::new(
            store.clone(),
            clock.clone(),
            identity.clone(),
            self.system_metadata,
            config.heartbeat_interval(),
        ));
        let tasks = Arc::new(TaskLedger::new(store.clone(), clock.clone(), budget));
        let points = Arc::new(PointsLedger::new(store.clone(), clock.clone(), budget));
        let chat = Arc::new(ChatFeed::new(store.clone(), clock.clone()));
        let execution = Arc::new(
            ExecutionLoop::new(
                presence.clone(),
                tasks.clone(),
                points.clone(),
                executor,
                clock.clone(),
            )
            .with_policy(config.claim_policy)
            .with_capacity(config.max_concurrent_tasks),
        );

        tracing::debug!(node_id = %identity.node_id, owner = %identity.owner.id, "node built");
        Ok(Node {
            identity,
            config,
            store,
            clock,
            presence,
            tasks,
            points,
            chat,
            execution,
        })
    }
}

impl Default for NodeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A wired node. Nothing runs until `start()`.
pub struct Node {
    identity: NodeIdentity,
    config: NodeConfig,
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    presence: Arc<PresenceManager>,
    tasks: Arc<TaskLedger>,
    points: Arc<PointsLedger>,
    chat: Arc<ChatFeed>,
    execution: Arc<ExecutionLoop>,
}

impl Node {
    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn node_id(&self) -> &NodeId {
        &self.identity.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn presence(&self) -> &Arc<PresenceManager> {
        &self.presence
    }

    pub fn tasks(&self) -> &Arc<TaskLedger> {
        &self.tasks
    }

    pub fn points(&self) -> &Arc<PointsLedger> {
        &self.points
    }

    pub fn chat(&self) -> &Arc<ChatFeed> {
        &self.chat
    }

    /// Live peers of `role`, using the configured liveness window.
    pub fn membership(&self, role: NodeRole) -> MembershipView {
        MembershipView::new(
            self.store.clone(),
            self.clock.clone(),
            role,
            self.config.liveness_window(),
        )
    }

    /// Submit a task owned by this node's identity.
    pub async fn submit(&self, payload: TaskPayload) -> Result<TaskId, TaskError> {
        self.tasks
            .create_task(&self.identity.owner.id, &self.identity.node_id, payload)
            .await
    }

    pub async fn stats(&self) -> Result<NetworkStats, TaskError> {
        let presence = self.store.children(PRESENCE).await?;
        let tasks = self.tasks.list_all().await?;
        Ok(NetworkStats::compute(
            &presence,
            &tasks,
            self.clock.now(),
            to_chrono(self.config.stats_active_window()),
        ))
    }

    /// Launch the presence loop and the execution loop.
    pub fn start(&self) -> NodeRuntime {
        tracing::info!(node_id = %self.identity.node_id, role = %self.identity.role, "node starting");
        NodeRuntime::new(
            self.identity.node_id.clone(),
            self.presence.clone().start(),
            self.execution.clone().start(),
        )
    }
}
