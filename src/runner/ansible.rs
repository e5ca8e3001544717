//! Runner backend that drives `ansible-playbook` against a generated
//! inventory file, for sites that already manage their fleet with Ansible.

use async_trait::async_trait;
use std::time::Instant;
use tempfile::NamedTempFile;

use super::{DistributedResult, ExecutionResult, ExecutionStatus, Inventory, NodeConfig, Runner, WorkloadSpec};
use crate::console::{Console, RunOptions};
use crate::error::{MadError, Result};

pub struct AnsibleRunner {
    console: Console,
    nodes: Vec<NodeConfig>,
    inventory_file: Option<NamedTempFile>,
}

impl Default for AnsibleRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl AnsibleRunner {
    pub fn new() -> Self {
        Self {
            console: Console::new(),
            nodes: Vec::new(),
            inventory_file: None,
        }
    }

    fn render_ini(nodes: &[NodeConfig]) -> String {
        let mut out = String::from("[workers]\n");
        for node in nodes {
            let user = node.user.as_deref().unwrap_or("root");
            let port = node.port.unwrap_or(22);
            out.push_str(&format!(
                "{} ansible_host={} ansible_user={user} ansible_port={port}\n",
                node.host,
                node.dial_address(),
            ));
        }
        out
    }
}

#[async_trait]
impl Runner for AnsibleRunner {
    fn kind(&self) -> &'static str {
        "ansible"
    }

    async fn setup_infrastructure(&mut self, inventory: &Inventory) -> Result<()> {
        self.nodes = inventory.all_nodes().into_iter().cloned().collect();
        if self.nodes.is_empty() {
            return Err(MadError::validation("ansible runner requires at least one node"));
        }
        which::which("ansible-playbook").map_err(|_| {
            MadError::configuration("ansible-playbook not found on PATH")
                .with_suggestion("install the 'ansible' package or disable the runner-ansible feature")
        })?;

        let file = NamedTempFile::new().map_err(MadError::from)?;
        tokio::fs::write(file.path(), Self::render_ini(&self.nodes))
            .await
            .map_err(MadError::from)?;
        self.inventory_file = Some(file);
        Ok(())
    }

    async fn execute_workload(&mut self, workload: &WorkloadSpec) -> Result<DistributedResult> {
        let inventory_path = self
            .inventory_file
            .as_ref()
            .ok_or_else(|| MadError::orchestration("ansible runner not set up"))?
            .path()
            .display()
            .to_string();

        let start = Instant::now();
        let output = self
            .console
            .run(
                "ansible-playbook",
                &[
                    "-i",
                    &inventory_path,
                    "--extra-vars",
                    &format!("image_ref={} model={}", workload.image_ref, workload.model),
                    "run_workload.yml",
                ],
                &RunOptions::new().can_fail(true),
            )
            .await?;
        let duration_secs = start.elapsed().as_secs_f64();

        let results = self
            .nodes
            .iter()
            .map(|n| ExecutionResult {
                node: n.host.clone(),
                model: workload.model.clone(),
                status: if output.success() {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::Failed
                },
                duration_secs,
                error_message: if output.success() {
                    None
                } else {
                    Some(output.output.clone())
                },
                output: if output.success() {
                    Some(output.output.clone())
                } else {
                    None
                },
            })
            .collect();
        Ok(DistributedResult::from_results(results))
    }

    async fn cleanup_infrastructure(&mut self) {
        self.inventory_file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_ini_with_user_and_port() {
        let nodes = vec![NodeConfig {
            host: "node01".into(),
            address: "10.0.0.1".into(),
            port: Some(2222),
            user: Some("deploy".into()),
            rank: None,
            gpu_vendor: None,
            gpu_count: 0,
            auth: None,
            labels: vec![],
        }];
        let ini = AnsibleRunner::render_ini(&nodes);
        assert!(ini.contains("node01 ansible_host=10.0.0.1 ansible_user=deploy ansible_port=2222"));
    }
}
