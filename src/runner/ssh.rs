//! SSH-based runner: connects to every node in parallel, checks
//! prerequisites, then runs the workload with rank 0 acting as master.

use async_trait::async_trait;
use openssh::{KnownHosts, Session};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{info, warn};

use super::{DistributedResult, ExecutionResult, ExecutionStatus, Inventory, NodeConfig, Runner, WorkloadSpec};
use crate::error::{MadError, Result};

pub struct SshRunner {
    sessions: BTreeMap<String, Session>,
    nodes: Vec<NodeConfig>,
    /// Remote directory each node's command is run from (spec.md §4.7:
    /// `cd <working_dir> && ...`).
    working_dir: String,
    /// Remote orchestrator CLI binary invoked per node.
    cli_binary: String,
}

impl Default for SshRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SshRunner {
    pub fn new() -> Self {
        Self {
            sessions: BTreeMap::new(),
            nodes: Vec::new(),
            working_dir: ".".to_string(),
            cli_binary: "madorc".to_string(),
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_cli_binary(mut self, bin: impl Into<String>) -> Self {
        self.cli_binary = bin.into();
        self
    }

    fn master(&self) -> Option<&NodeConfig> {
        self.nodes.iter().min_by_key(|n| n.rank.unwrap_or(u32::MAX))
    }

    async fn connect(node: &NodeConfig) -> Result<Session> {
        let user = node.user.as_deref().unwrap_or("root");
        let port = node.port.unwrap_or(22);
        let destination = format!("ssh://{user}@{}:{port}", node.dial_address());
        Session::connect(&destination, KnownHosts::Add)
            .await
            .map_err(|e| {
                MadError::connection(format!("failed to connect to {}: {e}", node.host))
                    .with_field("host", &node.host)
            })
    }

    /// Checks the three preconditions spec.md §4.7 requires before dispatch:
    /// the working directory exists, the orchestrator CLI binary is
    /// resolvable on the node's `PATH`, and the directory can actually be
    /// entered. Every failure is a `configuration` error identifying the
    /// offending node and path.
    async fn check_prerequisites(&self, session: &Session, host: &str) -> Result<()> {
        let dir_status = session
            .command("test")
            .arg("-d")
            .arg(&self.working_dir)
            .status()
            .await
            .map_err(|e| MadError::connection(format!("prerequisite check failed on {host}: {e}")))?;
        if !dir_status.success() {
            return Err(MadError::configuration(format!(
                "working directory '{}' does not exist on {host}",
                self.working_dir
            ))
            .with_field("host", host)
            .with_field("working_dir", &self.working_dir)
            .with_suggestion("stage runtime support files onto the node before running"));
        }

        let enter_status = session
            .command("sh")
            .arg("-c")
            .arg(format!("cd {} && true", self.working_dir))
            .status()
            .await
            .map_err(|e| MadError::connection(format!("prerequisite check failed on {host}: {e}")))?;
        if !enter_status.success() {
            return Err(MadError::configuration(format!(
                "working directory '{}' is not enterable on {host}",
                self.working_dir
            ))
            .with_field("host", host)
            .with_field("working_dir", &self.working_dir));
        }

        let cli_status = session
            .command("sh")
            .arg("-c")
            .arg(format!("command -v {}", self.cli_binary))
            .status()
            .await
            .map_err(|e| MadError::connection(format!("prerequisite check failed on {host}: {e}")))?;
        if !cli_status.success() {
            return Err(MadError::configuration(format!(
                "cli binary '{}' is not resolvable on {host}",
                self.cli_binary
            ))
            .with_field("host", host)
            .with_field("cli_binary", &self.cli_binary)
            .with_suggestion("install or add the orchestrator binary to the node's PATH"));
        }

        Ok(())
    }
}

#[async_trait]
impl Runner for SshRunner {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    async fn setup_infrastructure(&mut self, inventory: &Inventory) -> Result<()> {
        self.nodes = inventory.all_nodes().into_iter().cloned().collect();
        if self.nodes.is_empty() {
            return Err(MadError::validation("ssh runner requires at least one node"));
        }

        let connections = futures::future::join_all(
            self.nodes.iter().map(|n| async move { (n.host.clone(), Self::connect(n).await) }),
        )
        .await;

        for (host, result) in connections {
            match result {
                Ok(session) => {
                    info!(host = %host, "connected");
                    self.sessions.insert(host, session);
                }
                Err(e) => return Err(e),
            }
        }

        for node in &self.nodes {
            let session = self.sessions.get(&node.host).expect("just connected");
            self.check_prerequisites(session, &node.host).await?;
        }
        Ok(())
    }

    async fn execute_workload(&mut self, workload: &WorkloadSpec) -> Result<DistributedResult> {
        let master_addr = self
            .master()
            .map(|n| n.dial_address().to_string())
            .ok_or_else(|| MadError::orchestration("no master node determined (empty topology)"))?;
        let master_port = 29500u16;
        let n_nodes = self.nodes.len();

        // Dispatched in parallel across nodes (spec.md §4.7); each node's
        // session is independent so one slow/hung node never blocks another.
        // There is no inter-node barrier here — the collective library on
        // the remote side is assumed to rendezvous via MASTER_ADDR/PORT.
        let dispatches = self.nodes.iter().map(|node| {
            let session = self.sessions.get(&node.host).expect("session present after setup");
            let host = node.host.clone();
            let master_addr = master_addr.clone();
            let rank = node.rank.unwrap_or(0);
            let command_line = build_node_command(
                &self.working_dir,
                &self.cli_binary,
                workload,
                rank,
                n_nodes as u32,
                &master_addr,
                master_port,
            );
            async move {
                let start = Instant::now();
                let mut cmd = session.command("sh");
                cmd.arg("-c").arg(&command_line);
                let output = cmd.output().await;
                let duration_secs = start.elapsed().as_secs_f64();

                match output {
                    Ok(out) if out.status.success() => ExecutionResult {
                        node: host,
                        model: workload.model.clone(),
                        status: ExecutionStatus::Success,
                        duration_secs,
                        error_message: None,
                        output: Some(String::from_utf8_lossy(&out.stdout).to_string()),
                    },
                    Ok(out) => ExecutionResult {
                        node: host,
                        model: workload.model.clone(),
                        status: ExecutionStatus::Failed,
                        duration_secs,
                        error_message: Some(String::from_utf8_lossy(&out.stderr).to_string()),
                        output: None,
                    },
                    Err(e) => ExecutionResult {
                        node: host,
                        model: workload.model.clone(),
                        status: ExecutionStatus::Failed,
                        duration_secs,
                        error_message: Some(e.to_string()),
                        output: None,
                    },
                }
            }
        });

        let results = futures::future::join_all(dispatches).await;
        Ok(DistributedResult::from_results(results))
    }

    async fn cleanup_infrastructure(&mut self) {
        for (host, session) in self.sessions.drain() {
            if let Err(e) = session.close().await {
                warn!(host = %host, error = %e, "failed to close ssh session cleanly");
            }
        }
    }
}

/// Composes the remote invocation spec.md §4.7 specifies: `cd <working_dir>
/// && <cli_binary> run --tags <model> --timeout <sec> --additional-context
/// '<json>' <extra_args>`. The embedded context object must round-trip as
/// parseable JSON on the remote side; key order is not significant.
fn build_node_command(
    working_dir: &str,
    cli_binary: &str,
    workload: &WorkloadSpec,
    rank: u32,
    n_nodes: u32,
    master_addr: &str,
    master_port: u16,
) -> String {
    let mut context = serde_json::Map::new();
    context.insert("NODE_RANK".to_string(), serde_json::Value::String(rank.to_string()));
    context.insert("NNODES".to_string(), serde_json::Value::String(n_nodes.to_string()));
    context.insert(
        "MASTER_ADDR".to_string(),
        serde_json::Value::String(master_addr.to_string()),
    );
    context.insert(
        "MASTER_PORT".to_string(),
        serde_json::Value::String(master_port.to_string()),
    );
    for (k, v) in &workload.env {
        context.insert(k.clone(), serde_json::Value::String(v.clone()));
    }
    let context_json = serde_json::Value::Object(context).to_string();

    let timeout_arg = workload
        .timeout_secs
        .map(|s| format!(" --timeout {s}"))
        .unwrap_or_default();
    let extra_args = if workload.command.is_empty() {
        String::new()
    } else {
        format!(" {}", workload.command.join(" "))
    };

    format!(
        "cd {working_dir} && {cli_binary} run --tags {model}{timeout_arg} --additional-context '{context_json}'{extra_args}",
        model = workload.model,
    )
}
