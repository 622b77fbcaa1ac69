use std::time::Duration;

use async_trait::async_trait;

use crate::domain::errors::ExecutorError;
use crate::ports::{ContainerRun, Executor};

/// Development executor: echoes payloads back instead of running them.
///
/// Code that contains `raise` fails, so demos can show both outcomes.
#[derive(Debug, Clone, Default)]
pub struct EchoExecutor {
    delay: Duration,
}

impl EchoExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long before answering.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }

    async fn pause(&self) {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl Executor for EchoExecutor {
    async fn run_code(&self, code: &str, _requirements: Option<&str>) -> Result<String, ExecutorError> {
        self.pause().await;
        if code.contains("raise") {
            return Err(ExecutorError::Failed(format!("Traceback (echo):\n{code}")));
        }
        Ok(code.to_string())
    }

    async fn run_container(&self, run: ContainerRun) -> Result<String, ExecutorError> {
        self.pause().await;
        let mut line = run.image;
        for arg in run.command {
            line.push(' ');
            line.push_str(&arg);
        }
        Ok(line)
    }

    async fn stop_container(&self, _id: &str) -> Result<String, ExecutorError> {
        Ok("No running containers found.".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_code_and_fails_on_raise() {
        let executor = EchoExecutor::new();
        assert_eq!(executor.run_code("print(1)", None).await.unwrap(), "print(1)");
        assert!(executor.run_code("raise ValueError()", None).await.is_err());
    }

    #[tokio::test]
    async fn echoes_image_and_command() {
        let run = ContainerRun {
            id: "x".into(),
            image: "alpine".into(),
            command: vec!["echo".into(), "hi".into()],
            memory_limit: None,
            cpu_limit: None,
            time_limit: None,
        };
        assert_eq!(EchoExecutor::new().run_container(run).await.unwrap(), "alpine echo hi");
    }
}
