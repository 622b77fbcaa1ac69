use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tracing_subscriber::EnvFilter;

use dashmesh_core::app::{ClaimPolicy, NetworkStats, Node, NodeBuilder, TaskLedger, TaskSnapshot};
use dashmesh_core::config::NodeConfig;
use dashmesh_core::domain::{
    ContainerConfig, Identity, NodeId, NodeRole, PointsError, TaskPayload, TaskStatus, parse_command,
};
use dashmesh_core::impls::{
    DockerExecutor, EchoExecutor, InMemoryStore, StaticIdentity, detect_system_metadata,
};
use dashmesh_core::ports::{AuthIdentity, Executor};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ExecutorKind {
    /// Echo payloads back
    Echo,
    /// Run payloads through the docker CLI
    Docker,
}

#[derive(Parser)]
#[command(name = "dashmesh", about = "Run an in-process dashmesh network")]
struct Cli {
    /// Worker nodes to start next to the submitting client
    #[arg(long, env = "DASHMESH_NODES", default_value = "3")]
    nodes: usize,

    /// Tasks the client submits
    #[arg(long, env = "DASHMESH_TASKS", default_value = "6")]
    tasks: usize,

    /// Node configuration (TOML)
    #[arg(long, env = "DASHMESH_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, env = "DASHMESH_EXECUTOR", default_value = "echo")]
    executor: ExecutorKind,

    /// Override the configured claim policy (off, any, same_owner)
    #[arg(long, env = "DASHMESH_CLAIM_POLICY")]
    claim_policy: Option<ClaimPolicy>,

    /// Give up waiting for tasks after this many seconds
    #[arg(long, default_value = "120")]
    timeout: u64,

    /// Print the final report as JSON
    #[arg(long, default_value = "false")]
    json: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskLine {
    id: String,
    status: TaskStatus,
    assigned_to: Option<String>,
    output: Option<String>,
    error: Option<String>,
    runtime: Option<u64>,
}

#[derive(Serialize)]
struct Report {
    tasks: Vec<TaskLine>,
    balances: BTreeMap<String, u64>,
    stats: NetworkStats,
}

fn build_node(
    store: &InMemoryStore,
    executor: &Arc<dyn Executor>,
    config: &NodeConfig,
    node_id: String,
    owner: AuthIdentity,
    role: NodeRole,
) -> Result<Node> {
    let node = NodeBuilder::new()
        .store(Arc::new(store.client()))
        .executor(executor.clone())
        .identity_provider(Arc::new(StaticIdentity::new(owner)))
        .config(config.clone())
        .node_id(NodeId::new(node_id))
        .role(role)
        .system_metadata(detect_system_metadata())
        .build()?;
    Ok(node)
}

fn demo_payload(n: usize) -> TaskPayload {
    match n % 3 {
        0 => TaskPayload::code(format!("print({n})")),
        1 => {
            let mut config = ContainerConfig::new("alpine:3.20");
            config.command = parse_command(&format!("echo 'hello from task {n}'"));
            config.time_limit = Some("30".into());
            TaskPayload::container(config)
        }
        _ => TaskPayload::code(format!("raise ValueError('task {n}')")),
    }
}

async fn wait_until_settled(tasks: &TaskLedger, expected: usize) -> Result<TaskSnapshot> {
    let mut subscription = tasks.subscribe().await?;
    while let Some(snapshot) = subscription.next().await {
        let settled = snapshot.values().filter(|r| r.status.is_terminal()).count();
        tracing::debug!(settled, expected, "ledger update");
        if snapshot.len() >= expected && settled == snapshot.len() {
            return Ok(snapshot);
        }
    }
    anyhow::bail!("task subscription ended before every task settled")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();
    tokio::select! {
        _ = ctrl_c => tracing::info!("received SIGINT"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => NodeConfig::default(),
    };
    if let Some(policy) = cli.claim_policy {
        config.claim_policy = policy;
    }

    let executor: Arc<dyn Executor> = match cli.executor {
        ExecutorKind::Echo => Arc::new(EchoExecutor::with_delay(Duration::from_millis(300))),
        ExecutorKind::Docker => Arc::new(DockerExecutor::new(config.executor.clone())),
    };
    let store = InMemoryStore::new();

    // the submitting client never claims its own work
    let client_config = NodeConfig {
        claim_policy: ClaimPolicy::Off,
        ..config.clone()
    };
    let client = build_node(
        &store,
        &executor,
        &client_config,
        "node-client".into(),
        AuthIdentity::new("alice").with_email("alice@example.com"),
        NodeRole::Client,
    )?;
    let mut workers = Vec::with_capacity(cli.nodes);
    for i in 1..=cli.nodes {
        workers.push(build_node(
            &store,
            &executor,
            &config,
            format!("node-worker-{i}"),
            AuthIdentity::new(format!("worker-{i}")),
            NodeRole::Worker,
        )?);
    }

    tracing::info!(
        workers = cli.nodes,
        tasks = cli.tasks,
        claim_policy = %config.claim_policy,
        executor = ?cli.executor,
        "starting mesh"
    );
    let mut runtimes = vec![client.start()];
    runtimes.extend(workers.iter().map(Node::start));

    let owner = &client.identity().owner;
    let chat = client.chat();
    chat.send_status(&owner.id, "node-client joined").await?;
    chat.send(&owner.id, owner.label(), &format!("submitting {} tasks", cli.tasks))
        .await?;

    for n in 0..cli.tasks {
        match client.submit(demo_payload(n)).await {
            Ok(task_id) => tracing::info!(%task_id, "submitted"),
            Err(err) => tracing::warn!(error = %err, "submission rejected"),
        }
    }

    let expected = cli.tasks;
    let settled = tokio::select! {
        result = tokio::time::timeout(
            Duration::from_secs(cli.timeout),
            wait_until_settled(client.tasks(), expected),
        ) => match result {
            Ok(snapshot) => Some(snapshot?),
            Err(_) => {
                tracing::warn!(timeout_secs = cli.timeout, "tasks did not settle in time");
                None
            }
        },
        _ = shutdown_signal() => None,
    };

    let snapshot = match settled {
        Some(snapshot) => snapshot,
        None => client.tasks().list_all().await?,
    };

    // an overdraft is refused without moving anything
    if let Some(worker) = workers.first() {
        let from = &worker.identity().owner.id;
        let balance = worker.points().balance(from).await?;
        match worker.points().transfer(from, &owner.id, balance + 1).await {
            Err(PointsError::InsufficientBalance { available, requested }) => {
                tracing::info!(available, requested, "overdraft refused");
            }
            Err(err) => tracing::warn!(error = %err, "transfer failed"),
            Ok(_) => tracing::warn!("overdraft unexpectedly accepted"),
        }
        if balance > 1 {
            let receipt = worker.points().transfer(from, &owner.id, balance / 2).await?;
            tracing::info!(
                from = %from,
                to = %owner.id,
                remaining = receipt.from_balance,
                "tipped the submitter"
            );
        }
    }

    let mut identities: Vec<Identity> = vec![owner.id.clone()];
    identities.extend(workers.iter().map(|w| w.identity().owner.id.clone()));
    let mut balances = BTreeMap::new();
    for identity in identities {
        let balance = client.points().balance(&identity).await?;
        balances.insert(identity.to_string(), balance);
    }

    let report = Report {
        tasks: snapshot
            .iter()
            .map(|(id, r)| TaskLine {
                id: id.to_string(),
                status: r.status,
                assigned_to: r.assigned_to.as_ref().map(ToString::to_string),
                output: r.output.clone(),
                error: r.error.clone(),
                runtime: r.runtime_seconds,
            })
            .collect(),
        balances,
        stats: client.stats().await?,
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }

    for runtime in runtimes {
        runtime.shutdown_and_join().await;
    }
    Ok(())
}

fn print_report(report: &Report) {
    println!("tasks:");
    for line in &report.tasks {
        let detail = line
            .output
            .as_deref()
            .or(line.error.as_deref())
            .unwrap_or("")
            .lines()
            .next()
            .unwrap_or("");
        println!(
            "  {:<32} {:<9} {:<16} {}",
            line.id,
            line.status.as_str(),
            line.assigned_to.as_deref().unwrap_or("-"),
            detail
        );
    }
    println!("balances:");
    for (identity, points) in &report.balances {
        println!("  {identity:<16} {points}");
    }
    let stats = &report.stats;
    println!(
        "stats: activeUsers={} today={} lastHour={} avgLatency={}s completed={} failed={}",
        stats.active_users,
        stats.total_tasks_today,
        stats.tasks_last_hour,
        stats.average_latency_secs,
        stats.counts.completed,
        stats.counts.failed
    );
}
