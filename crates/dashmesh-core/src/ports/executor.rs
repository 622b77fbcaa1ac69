//! Executor port: the native bridge that actually runs task payloads.

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::errors::ExecutorError;
use crate::domain::ids::TaskId;
use crate::domain::task::ContainerConfig;

/// A container run resolved from a task's `dockerConfig`.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerRun {
    /// Names the container, so it can be stopped later.
    pub id: String,
    pub image: String,
    pub command: Vec<String>,
    pub memory_limit: Option<String>,
    pub cpu_limit: Option<String>,
    pub time_limit: Option<Duration>,
}

impl ContainerRun {
    pub fn for_task(task_id: &TaskId, config: &ContainerConfig) -> Self {
        Self {
            id: task_id.key(),
            image: config.image.clone(),
            command: config.command.clone(),
            memory_limit: config.memory_limit.clone(),
            cpu_limit: config.cpu_limit.clone(),
            time_limit: config.time_limit_secs().map(Duration::from_secs),
        }
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Run a Python snippet. `requirements` is a comma-separated package list.
    async fn run_code(&self, code: &str, requirements: Option<&str>) -> Result<String, ExecutorError>;

    async fn run_container(&self, run: ContainerRun) -> Result<String, ExecutorError>;

    async fn stop_container(&self, id: &str) -> Result<String, ExecutorError>;
}
