//! Shared data-model types that cross component boundaries: node inventory,
//! workload specs, and execution results.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Immutable record produced by model discovery (spec.md §3). `name` may be
/// hierarchical (`group/name`); `n_gpus == -1` means "all".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelDescriptor {
    pub name: String,
    pub dockerfile: String,
    pub docker_context: String,
    #[serde(default)]
    pub scripts_path: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default = "default_n_gpus")]
    pub n_gpus: i32,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub training_precision: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub cred: Option<String>,
    #[serde(default)]
    pub dataname: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub multiple_results: bool,
    #[serde(default)]
    pub skip_gpu_arch: Vec<String>,
}

fn default_n_gpus() -> i32 {
    -1
}

/// The reserved tag every model set filter treats specially: "all models".
pub const RESERVED_TAG_ALL: &str = "all";

impl ModelDescriptor {
    /// True iff the descriptor satisfies spec.md §3's tag invariant: `tags`
    /// never contains the reserved token `all`.
    pub fn has_valid_tags(&self) -> bool {
        !self.tags.contains(RESERVED_TAG_ALL)
    }

    /// Matches this model against a requested tag/name list. `all` always
    /// matches; otherwise a match is either the literal model name or
    /// membership in `tags`.
    pub fn matches_any(&self, requested: &[String]) -> bool {
        requested.iter().any(|r| {
            r == RESERVED_TAG_ALL || r == &self.name || self.tags.contains(r)
        })
    }
}

impl std::fmt::Display for ModelDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Checks spec.md §3's cross-model invariant: names unique, no model
/// declares the reserved `all` tag.
pub fn validate_model_set(models: &[ModelDescriptor]) -> crate::error::Result<()> {
    let mut seen = BTreeSet::new();
    for m in models {
        if !m.has_valid_tags() {
            return Err(crate::error::MadError::validation(format!(
                "model '{}' declares the reserved tag 'all'",
                m.name
            )));
        }
        if !seen.insert(&m.name) {
            return Err(crate::error::MadError::validation(format!(
                "duplicate model name '{}'",
                m.name
            )));
        }
    }
    Ok(())
}

/// Authentication material for a node (spec.md §3 Node Config: "optional
/// auth material (password or key path)"). Untagged so either shape
/// deserializes from the key actually present in the inventory file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum NodeAuth {
    Password { password: String },
    KeyPath { key_path: String },
}

/// Accepted `gpu_vendor` values (spec.md §3 Node Config: "gpu_vendor ∈
/// {AMD, NVIDIA, INTEL}"), matched case-insensitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuVendor {
    Amd,
    Nvidia,
    Intel,
}

impl GpuVendor {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "amd" => Some(Self::Amd),
            "nvidia" => Some(Self::Nvidia),
            "intel" => Some(Self::Intel),
            _ => None,
        }
    }
}

/// One node in a runner's inventory (spec.md §3 Node Config).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeConfig {
    /// Logical id (spec.md's "hostname").
    pub host: String,
    /// Network address the runner actually dials.
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub rank: Option<u32>,
    #[serde(default)]
    pub gpu_vendor: Option<String>,
    #[serde(default)]
    pub gpu_count: u32,
    #[serde(default)]
    pub auth: Option<NodeAuth>,
    #[serde(default)]
    pub labels: Vec<String>,
}

impl NodeConfig {
    pub fn matches(&self, gpu_vendor: Option<&str>, labels: &[String]) -> bool {
        if let Some(v) = gpu_vendor {
            if self.gpu_vendor.as_deref() != Some(v) {
                return false;
            }
        }
        labels.iter().all(|l| self.labels.contains(l))
    }

    /// The address a runner should dial: the declared network address, or
    /// `host` when no separate address was given (inventories written
    /// before spec.md's address field existed).
    pub fn dial_address(&self) -> &str {
        if self.address.is_empty() {
            &self.host
        } else {
            &self.address
        }
    }
}

/// Checks a single node against spec.md §3's Node Config invariants:
/// hostname+address required, `gpu_vendor` constrained to the enum.
pub fn validate_node(node: &NodeConfig) -> crate::error::Result<()> {
    if node.host.trim().is_empty() {
        return Err(crate::error::MadError::configuration(
            "node config is missing a hostname",
        ));
    }
    if node.address.trim().is_empty() {
        return Err(crate::error::MadError::configuration(format!(
            "node '{}' is missing a network address",
            node.host
        ))
        .with_field("host", &node.host));
    }
    if let Some(vendor) = &node.gpu_vendor {
        if GpuVendor::parse(vendor).is_none() {
            return Err(crate::error::MadError::configuration(format!(
                "node '{}' has invalid gpu_vendor '{vendor}', expected one of AMD, NVIDIA, INTEL",
                node.host
            ))
            .with_field("host", &node.host)
            .with_field("gpu_vendor", vendor));
        }
    }
    Ok(())
}

/// Checks spec.md §3/§4.6's cross-node invariant: every node individually
/// valid, no duplicate hostnames. Errors identify the offending entry.
pub fn validate_inventory(inventory: &Inventory) -> crate::error::Result<()> {
    let mut seen = BTreeSet::new();
    for node in inventory.all_nodes() {
        validate_node(node)?;
        if !seen.insert(node.host.as_str()) {
            return Err(crate::error::MadError::configuration(format!(
                "duplicate node hostname '{}'",
                node.host
            ))
            .with_field("host", &node.host));
        }
    }
    Ok(())
}

/// The top-level shape of an inventory file (JSON or YAML): either a flat
/// `nodes` list, a `gpu_nodes` list, or a `slurm_cluster` block.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Inventory {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub gpu_nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub slurm_cluster: Option<SlurmClusterConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlurmClusterConfig {
    pub login_node: String,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default = "default_node_count")]
    pub node_count: u32,
    /// Remote directory the job scripts are staged into, under which
    /// `job_scripts/` is created (spec.md §4.8 setup step).
    #[serde(default = "default_workspace")]
    pub workspace: String,
}

fn default_node_count() -> u32 {
    1
}

fn default_workspace() -> String {
    "~/madorc-workspace".to_string()
}

impl Inventory {
    /// All nodes across whichever section(s) are populated, in file order.
    pub fn all_nodes(&self) -> Vec<&NodeConfig> {
        self.nodes.iter().chain(self.gpu_nodes.iter()).collect()
    }

    pub fn filtered(&self, gpu_vendor: Option<&str>, labels: &[String]) -> Vec<&NodeConfig> {
        self.all_nodes()
            .into_iter()
            .filter(|n| n.matches(gpu_vendor, labels))
            .collect()
    }
}

/// A unit of work handed to a runner: the image to run, the command, and
/// resource/environment requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub model: String,
    pub image_ref: String,
    pub command: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub gpu_architecture: Option<String>,
}

/// Status of a single node's execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Success,
    Failed,
    Timeout,
}

/// Outcome of running a workload on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub node: String,
    /// The model tag this result belongs to (spec.md §3: "node id, model
    /// tag, status ..."). A single `execute_workload` call fans a single
    /// workload's model out across every node, so every result it produces
    /// shares this value.
    pub model: String,
    pub status: ExecutionStatus,
    pub duration_secs: f64,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub output: Option<String>,
}

impl ExecutionResult {
    /// Panics (in debug builds of callers that choose to assert it) if the
    /// invariant "duration >= 0 and SUCCESS never carries an error_message"
    /// is violated; exposed for test use instead of enforcing at
    /// construction so deserialized data can still be inspected.
    pub fn is_well_formed(&self) -> bool {
        self.duration_secs >= 0.0
            && !(self.status == ExecutionStatus::Success && self.error_message.is_some())
    }
}

/// Aggregate result of running a workload across every node in a runner's
/// topology.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedResult {
    pub results: Vec<ExecutionResult>,
    pub successful: usize,
    pub failed: usize,
}

impl DistributedResult {
    pub fn new() -> Self {
        Self {
            results: Vec::new(),
            successful: 0,
            failed: 0,
        }
    }

    pub fn from_results(results: Vec<ExecutionResult>) -> Self {
        let mut dist = Self::new();
        for r in results {
            dist.add(r);
        }
        dist
    }

    /// Appends one result, updating the success/failure counters atomically
    /// with the append so `successful + failed == results.len()` always
    /// holds between calls.
    pub fn add(&mut self, result: ExecutionResult) {
        match result.status {
            ExecutionStatus::Success => self.successful += 1,
            ExecutionStatus::Failed | ExecutionStatus::Timeout => self.failed += 1,
        }
        self.results.push(result);
    }

    pub fn is_consistent(&self) -> bool {
        self.successful + self.failed == self.results.len()
    }
}

impl Default for DistributedResult {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, tags: &[&str]) -> ModelDescriptor {
        ModelDescriptor {
            name: name.to_string(),
            dockerfile: "Dockerfile".into(),
            docker_context: ".".into(),
            scripts_path: None,
            owner: None,
            n_gpus: -1,
            timeout_secs: None,
            training_precision: None,
            tags: tags.iter().map(|s| s.to_string()).collect(),
            cred: None,
            dataname: None,
            args: vec![],
            multiple_results: false,
            skip_gpu_arch: vec![],
        }
    }

    #[test]
    fn reserved_all_tag_is_rejected() {
        let m = descriptor("resnet50", &["all"]);
        assert!(!m.has_valid_tags());
        assert!(validate_model_set(&[m]).is_err());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let models = vec![descriptor("resnet50", &[]), descriptor("resnet50", &["fp16"])];
        assert!(validate_model_set(&models).is_err());
    }

    #[test]
    fn matches_any_handles_name_tag_and_all() {
        let m = descriptor("group/resnet50", &["vision", "fp16"]);
        assert!(m.matches_any(&["group/resnet50".to_string()]));
        assert!(m.matches_any(&["fp16".to_string()]));
        assert!(m.matches_any(&["all".to_string()]));
        assert!(!m.matches_any(&["bert".to_string()]));
    }

    #[test]
    fn distributed_result_counts_are_consistent() {
        let results = vec![
            ExecutionResult {
                node: "a".into(),
                model: "dummy".to_string(),
                status: ExecutionStatus::Success,
                duration_secs: 1.0,
                error_message: None,
                output: None,
            },
            ExecutionResult {
                node: "b".into(),
                model: "dummy".to_string(),
                status: ExecutionStatus::Failed,
                duration_secs: 2.0,
                error_message: Some("boom".into()),
                output: None,
            },
        ];
        let dist = DistributedResult::from_results(results);
        assert!(dist.is_consistent());
        assert_eq!(dist.successful, 1);
        assert_eq!(dist.failed, 1);
    }

    #[test]
    fn add_keeps_counters_in_sync_with_results() {
        let mut dist = DistributedResult::new();
        dist.add(ExecutionResult {
            node: "a".into(),
            model: "dummy".to_string(),
            status: ExecutionStatus::Success,
            duration_secs: 1.0,
            error_message: None,
            output: None,
        });
        assert!(dist.is_consistent());
        dist.add(ExecutionResult {
            node: "b".into(),
            model: "dummy".to_string(),
            status: ExecutionStatus::Timeout,
            duration_secs: 30.0,
            error_message: Some("deadline exceeded".into()),
            output: None,
        });
        assert!(dist.is_consistent());
        assert_eq!(dist.successful, 1);
        assert_eq!(dist.failed, 1);
    }

    #[test]
    fn success_with_error_message_is_not_well_formed() {
        let r = ExecutionResult {
            node: "a".into(),
            model: "dummy".to_string(),
            status: ExecutionStatus::Success,
            duration_secs: 1.0,
            error_message: Some("shouldn't be here".into()),
            output: None,
        };
        assert!(!r.is_well_formed());
    }

    #[test]
    fn node_matches_checks_vendor_and_labels() {
        let node = NodeConfig {
            host: "node01".into(),
            address: "10.0.0.1".into(),
            port: None,
            user: None,
            rank: Some(0),
            gpu_vendor: Some("amd".into()),
            gpu_count: 0,
            auth: None,
            labels: vec!["fast-interconnect".into()],
        };
        assert!(node.matches(Some("amd"), &["fast-interconnect".to_string()]));
        assert!(!node.matches(Some("nvidia"), &[]));
        assert!(!node.matches(None, &["missing-label".to_string()]));
    }

    fn node(host: &str, address: &str) -> NodeConfig {
        NodeConfig {
            host: host.to_string(),
            address: address.to_string(),
            port: None,
            user: None,
            rank: None,
            gpu_vendor: None,
            gpu_count: 0,
            auth: None,
            labels: vec![],
        }
    }

    #[test]
    fn validate_node_rejects_missing_address() {
        let mut n = node("node01", "");
        n.address = String::new();
        let err = validate_node(&n).unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Configuration);
    }

    #[test]
    fn validate_node_rejects_unknown_gpu_vendor() {
        let mut n = node("node01", "10.0.0.1");
        n.gpu_vendor = Some("bogus".to_string());
        let err = validate_node(&n).unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Configuration);
    }

    #[test]
    fn validate_node_accepts_known_gpu_vendor_case_insensitively() {
        let mut n = node("node01", "10.0.0.1");
        n.gpu_vendor = Some("Nvidia".to_string());
        assert!(validate_node(&n).is_ok());
    }

    #[test]
    fn validate_inventory_rejects_duplicate_hostnames() {
        let inventory = Inventory {
            nodes: vec![node("node01", "10.0.0.1"), node("node01", "10.0.0.2")],
            gpu_nodes: vec![],
            slurm_cluster: None,
        };
        let err = validate_inventory(&inventory).unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Configuration);
        assert!(err.to_string().contains("node01"));
    }

    #[test]
    fn validate_inventory_accepts_well_formed_nodes() {
        let inventory = Inventory {
            nodes: vec![node("node01", "10.0.0.1"), node("node02", "10.0.0.2")],
            gpu_nodes: vec![],
            slurm_cluster: None,
        };
        assert!(validate_inventory(&inventory).is_ok());
    }
}
