//! Executor backed by the docker CLI.
//!
//! Code runs in a throwaway `python` container with networking disabled;
//! container tasks pull and run the requested image under
//! `hub-runner-{taskId}`, so `stop_container` can find them again.

use std::process::{Output, Stdio};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::ExecutorConfig;
use crate::domain::errors::ExecutorError;
use crate::ports::{ContainerRun, Executor};

pub struct DockerExecutor {
    config: ExecutorConfig,
}

impl DockerExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }

    fn code_run_args(&self, image: &str, name: &str) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".into(), "-i".into()];
        args.extend(["--name".into(), name.to_string()]);
        args.extend(["--memory".into(), self.config.default_memory_limit.clone()]);
        args.extend(["--cpus".into(), self.config.default_cpu_limit.clone()]);
        args.extend(sandbox_args());
        args.extend([image.to_string(), "python".into(), "-".into()]);
        args
    }

    fn container_run_args(&self, run: &ContainerRun) -> Vec<String> {
        let mut args = vec!["run".to_string(), "--rm".into()];
        args.extend(["--name".into(), container_name(&run.id)]);
        args.extend(sandbox_args());
        let memory = run
            .memory_limit
            .clone()
            .unwrap_or_else(|| self.config.default_memory_limit.clone());
        let cpus = run
            .cpu_limit
            .clone()
            .unwrap_or_else(|| self.config.default_cpu_limit.clone());
        args.extend(["--memory".into(), memory, "--cpus".into(), cpus]);
        args.push(run.image.clone());
        args.extend(run.command.iter().cloned());
        args
    }

    async fn docker(&self, args: &[String], stdin: Option<&[u8]>) -> Result<Output, ExecutorError> {
        tracing::debug!(args = ?args, "docker");
        let mut child = Command::new(&self.config.docker_bin)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let (Some(bytes), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(bytes).await?;
            // closing stdin lets `python -` start
            drop(pipe);
        }
        Ok(child.wait_with_output().await?)
    }

    async fn remove_image(&self, tag: &str) {
        let args = ["rmi".to_string(), "-f".into(), tag.to_string()];
        if let Err(err) = self.docker(&args, None).await {
            tracing::warn!(image = tag, error = %err, "failed to remove throwaway image");
        }
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    async fn run_code(&self, code: &str, requirements: Option<&str>) -> Result<String, ExecutorError> {
        if code.len() > self.config.max_code_bytes {
            return Err(ExecutorError::Rejected("Code is too large!".into()));
        }

        let run_id = ulid::Ulid::new().to_string().to_lowercase();
        let requirements = split_requirements(requirements);

        let (image, throwaway) = if requirements.is_empty() {
            (self.config.python_image.clone(), None)
        } else {
            let tag = format!("python-runner-{run_id}");
            let dockerfile = requirements_dockerfile(&self.config.python_image, &requirements);
            let args = ["build".to_string(), "-t".into(), tag.clone(), "-".into()];
            let build = self.docker(&args, Some(dockerfile.as_bytes())).await?;
            if !build.status.success() {
                return Err(ExecutorError::Failed(format!(
                    "Docker build failed:\n{}",
                    String::from_utf8_lossy(&build.stderr)
                )));
            }
            (tag.clone(), Some(tag))
        };

        let args = self.code_run_args(&image, &format!("runner-{run_id}"));
        let result = self.docker(&args, Some(code.as_bytes())).await;

        if let Some(tag) = throwaway {
            self.remove_image(&tag).await;
        }
        let output = result?;
        render_output(output.status.success(), &output.stdout, &output.stderr)
    }

    async fn run_container(&self, run: ContainerRun) -> Result<String, ExecutorError> {
        let pull = self
            .docker(&["pull".to_string(), run.image.clone()], None)
            .await?;
        if !pull.status.success() {
            return Err(ExecutorError::Failed(format!(
                "Failed to pull image:\n{}",
                String::from_utf8_lossy(&pull.stderr)
            )));
        }

        let args = self.container_run_args(&run);
        let output = match run.time_limit {
            Some(limit) => match tokio::time::timeout(limit, self.docker(&args, None)).await {
                Ok(output) => output?,
                Err(_) => {
                    // the CLI process is gone, the container is not
                    if let Err(err) = self.stop_container(&run.id).await {
                        tracing::warn!(container = %container_name(&run.id), error = %err, "failed to stop timed out container");
                    }
                    return Err(ExecutorError::Timeout(limit));
                }
            },
            None => self.docker(&args, None).await?,
        };
        render_output(output.status.success(), &output.stdout, &output.stderr)
    }

    async fn stop_container(&self, id: &str) -> Result<String, ExecutorError> {
        let filter = format!("name={}", container_name(id));
        let ps = self
            .docker(&["ps".to_string(), "-q".into(), "--filter".into(), filter], None)
            .await?;
        let ids = String::from_utf8_lossy(&ps.stdout).to_string();
        if ids.trim().is_empty() {
            return Ok("No running containers found.".into());
        }

        for container in ids.split_whitespace() {
            let stop = self
                .docker(&["stop".to_string(), container.to_string()], None)
                .await?;
            if !stop.status.success() {
                return Err(ExecutorError::Failed(format!(
                    "Failed to stop container {container}:\n{}",
                    String::from_utf8_lossy(&stop.stderr)
                )));
            }
        }
        Ok("Container(s) stopped successfully.".into())
    }
}

fn container_name(id: &str) -> String {
    format!("hub-runner-{id}")
}

fn sandbox_args() -> [String; 4] {
    [
        "--network".into(),
        "none".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
    ]
}

fn split_requirements(raw: Option<&str>) -> Vec<String> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn requirements_dockerfile(base: &str, requirements: &[String]) -> String {
    format!(
        "FROM {base}\nRUN pip install --no-cache-dir {}\n",
        requirements.join(" ")
    )
}

fn render_output(success: bool, stdout: &[u8], stderr: &[u8]) -> Result<String, ExecutorError> {
    let stdout = String::from_utf8_lossy(stdout);
    let stderr = String::from_utf8_lossy(stderr);
    if !success {
        Err(ExecutorError::Failed(format!(
            "Container execution failed:\nOutput:\n{stdout}\nErrors:\n{stderr}"
        )))
    } else if !stderr.is_empty() {
        Ok(format!("Docker Output:\n{stdout}\nWarnings:\n{stderr}"))
    } else {
        Ok(stdout.into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn executor() -> DockerExecutor {
        DockerExecutor::new(ExecutorConfig::default())
    }

    #[test]
    fn requirements_are_comma_separated_and_trimmed() {
        assert_eq!(
            split_requirements(Some(" numpy, pandas ,,requests")),
            vec!["numpy", "pandas", "requests"]
        );
        assert!(split_requirements(None).is_empty());
        assert!(split_requirements(Some(" , ")).is_empty());
    }

    #[test]
    fn dockerfile_installs_requirements() {
        let dockerfile = requirements_dockerfile("python:3.9-slim", &["numpy".into(), "pandas".into()]);
        assert!(dockerfile.starts_with("FROM python:3.9-slim\n"));
        assert!(dockerfile.contains("pip install --no-cache-dir numpy pandas"));
    }

    #[test]
    fn code_runs_sandboxed_with_default_limits() {
        let args = executor().code_run_args("python:3.9-slim", "runner-x");
        let joined = args.join(" ");
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--security-opt no-new-privileges"));
        assert!(joined.contains("--memory 512m"));
        assert!(joined.contains("--cpus 1"));
        assert!(joined.ends_with("python:3.9-slim python -"));
    }

    #[test]
    fn container_run_uses_task_limits_and_name() {
        let run = ContainerRun {
            id: "01ABC".into(),
            image: "alpine".into(),
            command: vec!["echo".into(), "hi there".into()],
            memory_limit: Some("1g".into()),
            cpu_limit: None,
            time_limit: Some(Duration::from_secs(5)),
        };
        let args = executor().container_run_args(&run);
        let joined = args.join(" ");
        assert!(joined.contains("--name hub-runner-01ABC"));
        assert!(joined.contains("--memory 1g"));
        assert!(joined.contains("--cpus 1"));
        assert_eq!(&args[args.len() - 3..], ["alpine", "echo", "hi there"]);
    }

    #[test]
    fn output_rendering_follows_exit_status() {
        assert_eq!(render_output(true, b"1\n", b"").unwrap(), "1\n");
        assert_eq!(
            render_output(true, b"1\n", b"deprecated").unwrap(),
            "Docker Output:\n1\n\nWarnings:\ndeprecated"
        );
        let err = render_output(false, b"", b"Traceback").unwrap_err();
        assert!(matches!(err, ExecutorError::Failed(msg) if msg.contains("Errors:\nTraceback")));
    }

    #[tokio::test]
    async fn oversized_code_is_rejected_before_docker() {
        let executor = DockerExecutor::new(ExecutorConfig {
            max_code_bytes: 4,
            docker_bin: "/nonexistent/docker".into(),
            ..ExecutorConfig::default()
        });
        let err = executor.run_code("print(1)", None).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Rejected(_)));
    }

    #[tokio::test]
    async fn missing_docker_binary_is_an_io_error() {
        let executor = DockerExecutor::new(ExecutorConfig {
            docker_bin: "/nonexistent/docker".into(),
            ..ExecutorConfig::default()
        });
        let err = executor.run_code("print(1)", None).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Io(_)));
    }
}
