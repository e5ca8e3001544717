//! Registry of runner backends by short kind name (`"ssh"`, `"slurm"`,
//! `"ansible"`, `"k8s"`). Backends register themselves at process start;
//! an optional backend whose build-time feature is disabled logs one
//! `configuration`-category warning instead of failing registration.

use tracing::warn;

use super::ansible::AnsibleRunner;
use super::slurm::SlurmRunner;
use super::ssh::SshRunner;
use super::Runner;
use crate::error::{MadError, Result};

/// The fixed set of kind names spec.md §4.9 assigns to the factory,
/// independent of which backends are actually compiled in.
pub const KNOWN_KINDS: &[&str] = &["ssh", "slurm", "ansible", "k8s"];

/// Kinds this build can actually construct, in [`KNOWN_KINDS`] order.
pub fn available() -> Vec<&'static str> {
    KNOWN_KINDS
        .iter()
        .copied()
        .filter(|kind| match *kind {
            "ssh" | "slurm" | "ansible" => true,
            "k8s" => cfg!(feature = "runner-k8s"),
            _ => false,
        })
        .collect()
}

/// Logs one warning per known kind this build cannot construct. Call once
/// at process start so a disabled optional backend is visible without
/// making the overall registration step fail.
pub fn warn_unavailable() {
    for kind in KNOWN_KINDS {
        if !available().contains(kind) {
            warn!(kind, "runner backend unavailable in this build (feature disabled)");
        }
    }
}

/// Constructs a fresh runner instance for `kind`. Each call returns an
/// independent instance — runners are not safe to share across concurrent
/// workloads (spec.md §5).
pub fn create(kind: &str) -> Result<Box<dyn Runner>> {
    match kind {
        "ssh" => Ok(Box::new(SshRunner::new())),
        "slurm" => Ok(Box::new(SlurmRunner::new())),
        "ansible" => Ok(Box::new(AnsibleRunner::new())),
        #[cfg(feature = "runner-k8s")]
        "k8s" => Ok(Box::new(super::k8s::K8sRunner::new())),
        #[cfg(not(feature = "runner-k8s"))]
        "k8s" => Err(MadError::configuration(
            "the k8s runner is not available in this build",
        )
        .with_suggestion("rebuild with --features runner-k8s")),
        other => Err(MadError::configuration(format!("unknown runner kind '{other}'"))
            .with_field("kind", other)
            .with_suggestion(format!("available kinds: {}", KNOWN_KINDS.join(", ")))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_ssh_slurm_ansible() {
        assert_eq!(create("ssh").unwrap().kind(), "ssh");
        assert_eq!(create("slurm").unwrap().kind(), "slurm");
        assert_eq!(create("ansible").unwrap().kind(), "ansible");
    }

    #[test]
    fn unknown_kind_is_configuration_error_with_suggestion() {
        let err = create("bogus").unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Configuration);
        assert!(!err.suggestions.is_empty());
    }

    #[test]
    fn available_never_exceeds_known_kinds() {
        for kind in available() {
            assert!(KNOWN_KINDS.contains(&kind));
        }
    }
}
