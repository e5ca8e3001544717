//! Pluggable execution backends. Every backend implements [`Runner`]'s
//! three-phase lifecycle: stand up infrastructure, execute the workload
//! across it, tear it down.

pub mod ansible;
pub mod factory;
pub mod slurm;
pub mod ssh;
#[cfg(feature = "runner-k8s")]
pub mod k8s;

use async_trait::async_trait;
use std::path::Path;

pub use crate::model::{
    DistributedResult, ExecutionResult, ExecutionStatus, Inventory, NodeConfig, WorkloadSpec,
};
use crate::error::{MadError, Result};

/// A backend capable of running a [`WorkloadSpec`] across an inventory of
/// nodes.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Short, stable identifier used by the runner factory registry
    /// (`"ssh"`, `"slurm"`, `"ansible"`, `"k8s"`).
    fn kind(&self) -> &'static str;

    /// Validates connectivity/prerequisites and prepares whatever state the
    /// backend needs (SSH connections, SLURM job scripts, a k8s client).
    async fn setup_infrastructure(&mut self, inventory: &Inventory) -> Result<()>;

    /// Runs `workload` across the infrastructure prepared by
    /// [`setup_infrastructure`].
    async fn execute_workload(&mut self, workload: &WorkloadSpec) -> Result<DistributedResult>;

    /// Best-effort teardown; never propagates an error that would mask a
    /// result already obtained from `execute_workload`.
    async fn cleanup_infrastructure(&mut self);

    /// Checks the workload/inventory pair before any side effect runs
    /// (spec.md §4.6 step 1/3): the workload must name a model, and at
    /// least one node must be present in the inventory. Individual backends
    /// still perform their own deeper checks inside `setup_infrastructure`
    /// (connectivity, prerequisites, ...).
    fn validate(&self, inventory: &Inventory, workload: &WorkloadSpec) -> Result<()> {
        if workload.model.is_empty() {
            return Err(MadError::validation("workload must name a model"));
        }
        if inventory.all_nodes().is_empty() && inventory.slurm_cluster.is_none() {
            return Err(MadError::validation(
                "no nodes remain in the inventory after loading",
            ));
        }
        Ok(())
    }

    /// The public convenience spec.md §4.6 names: `validate(workload) &&
    /// setup && execute`, with `cleanup_infrastructure` guaranteed to run on
    /// every exit path once setup has been attempted (success, setup
    /// failure, or execute failure) — spec.md §8 scenario 2. A `validate`
    /// failure returns before any side effect, including cleanup, runs.
    async fn run(
        &mut self,
        inventory: &Inventory,
        workload: &WorkloadSpec,
    ) -> Result<DistributedResult> {
        self.validate(inventory, workload)?;
        let outcome = match self.setup_infrastructure(inventory).await {
            Ok(()) => self.execute_workload(workload).await,
            Err(e) => Err(e),
        };
        self.cleanup_infrastructure().await;
        outcome
    }
}

/// Loads an [`Inventory`] from a JSON or YAML file, inferring the format
/// from the extension (defaulting to JSON). Validates every node against
/// spec.md §3's Node Config invariants before returning (spec.md §4.6:
/// "validation errors surfaced as `configuration` errors identifying the
/// offending entry").
pub async fn load_inventory(path: &Path) -> Result<Inventory> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(crate::error::MadError::from)?;
    let is_yaml = matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml") | Some("yml")
    );
    let inventory: Inventory = if is_yaml {
        serde_yaml::from_str(&contents)?
    } else {
        serde_json::from_str(&contents)?
    };
    crate::model::validate_inventory(&inventory)?;
    Ok(inventory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Write;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tempfile::NamedTempFile;

    /// A fake backend whose `setup_infrastructure` always fails, used to
    /// verify spec.md §8 scenario 2: cleanup still runs and execute never
    /// does when setup fails.
    #[derive(Default)]
    struct FailingSetupRunner {
        setup_called: AtomicBool,
        execute_calls: AtomicUsize,
        cleanup_called: AtomicBool,
    }

    #[async_trait]
    impl Runner for FailingSetupRunner {
        fn kind(&self) -> &'static str {
            "failing-setup"
        }

        async fn setup_infrastructure(&mut self, _inventory: &Inventory) -> Result<()> {
            self.setup_called.store(true, Ordering::SeqCst);
            Err(MadError::connection("node02 unreachable"))
        }

        async fn execute_workload(&mut self, _workload: &WorkloadSpec) -> Result<DistributedResult> {
            self.execute_calls.fetch_add(1, Ordering::SeqCst);
            Ok(DistributedResult::new())
        }

        async fn cleanup_infrastructure(&mut self) {
            self.cleanup_called.store(true, Ordering::SeqCst);
        }
    }

    fn workload() -> WorkloadSpec {
        WorkloadSpec {
            model: "dummy".to_string(),
            image_ref: "ci-dummy:latest".to_string(),
            command: vec![],
            env: BTreeMap::new(),
            timeout_secs: None,
            gpu_architecture: None,
        }
    }

    #[tokio::test]
    async fn run_guarantees_cleanup_when_setup_fails_and_skips_execute() {
        let inventory = Inventory {
            nodes: vec![NodeConfig {
                host: "node01".into(),
                address: "10.0.0.1".into(),
                port: None,
                user: None,
                rank: Some(0),
                gpu_vendor: None,
                gpu_count: 0,
                auth: None,
                labels: vec![],
            }],
            gpu_nodes: vec![],
            slurm_cluster: None,
        };
        let mut runner = FailingSetupRunner::default();
        let err = runner.run(&inventory, &workload()).await.unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Connection);
        assert!(runner.setup_called.load(Ordering::SeqCst));
        assert_eq!(runner.execute_calls.load(Ordering::SeqCst), 0);
        assert!(runner.cleanup_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn run_rejects_empty_inventory_before_setup() {
        let mut runner = FailingSetupRunner::default();
        let err = runner.run(&Inventory::default(), &workload()).await.unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Validation);
        assert!(!runner.setup_called.load(Ordering::SeqCst));
        assert!(!runner.cleanup_called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn loads_json_inventory() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(
            file,
            r#"{{"nodes": [{{"host": "node01", "address": "10.0.0.1", "rank": 0}}]}}"#
        )
        .unwrap();
        let inventory = load_inventory(file.path()).await.unwrap();
        assert_eq!(inventory.nodes.len(), 1);
        assert_eq!(inventory.nodes[0].host, "node01");
    }

    #[tokio::test]
    async fn loads_yaml_inventory() {
        let mut file = NamedTempFile::with_suffix(".yaml").unwrap();
        write!(
            file,
            "gpu_nodes:\n  - host: node02\n    address: 10.0.0.2\n    gpu_vendor: amd\n"
        )
        .unwrap();
        let inventory = load_inventory(file.path()).await.unwrap();
        assert_eq!(inventory.gpu_nodes.len(), 1);
        assert_eq!(inventory.gpu_nodes[0].gpu_vendor.as_deref(), Some("amd"));
    }

    #[tokio::test]
    async fn load_inventory_rejects_duplicate_hostnames() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(
            file,
            r#"{{"nodes": [{{"host": "node01", "address": "10.0.0.1"}}, {{"host": "node01", "address": "10.0.0.2"}}]}}"#
        )
        .unwrap();
        let err = load_inventory(file.path()).await.unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Configuration);
    }

    #[tokio::test]
    async fn load_inventory_rejects_missing_address() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        write!(file, r#"{{"nodes": [{{"host": "node01"}}]}}"#).unwrap();
        let err = load_inventory(file.path()).await.unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Configuration);
    }
}
