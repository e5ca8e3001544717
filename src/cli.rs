//! CLI surface (spec.md §6). Flag names here are part of the external
//! contract used by automation driving this binary — don't rename without
//! updating that section.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "madorc", version, about = "Distributed build-and-run orchestrator for containerized model workloads")]
pub struct Cli {
    /// Increase log verbosity; also prints the full error cause chain.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Build container images for the selected models and write a build manifest.
    Build {
        #[arg(long = "tags", num_args = 0.., required = true)]
        tags: Vec<String>,
        #[arg(long)]
        registry: Option<String>,
        #[arg(long = "clean-docker-cache")]
        clean_docker_cache: bool,
        #[arg(long = "manifest-output", default_value = "build_manifest.json")]
        manifest_output: PathBuf,
        #[arg(long = "additional-context")]
        additional_context: Option<String>,
        #[arg(long = "additional-context-file")]
        additional_context_file: Option<PathBuf>,
        #[arg(long = "models-dir", default_value = "models")]
        models_dir: PathBuf,
        #[arg(long = "target-arch", num_args = 0..)]
        target_arch: Vec<String>,
        #[arg(long = "credential-file", default_value = "credential.json")]
        credential_file: PathBuf,
    },
    /// Run previously built images across the configured backend.
    Run {
        #[arg(long = "manifest-file", default_value = "build_manifest.json")]
        manifest_file: PathBuf,
        #[arg(long)]
        registry: Option<String>,
        #[arg(long, default_value_t = -1)]
        timeout: i64,
        #[arg(long = "keep-alive")]
        keep_alive: bool,
        #[arg(long = "keep-model-dir")]
        keep_model_dir: bool,
        #[arg(long = "skip-model-run")]
        skip_model_run: bool,
        #[arg(short = 'o', long = "output", default_value = "perf.csv")]
        output: PathBuf,
        #[arg(long = "runner")]
        runner: Option<String>,
        #[arg(long = "inventory-file")]
        inventory_file: Option<PathBuf>,
        #[arg(long = "host-arch")]
        host_arch: Option<String>,
    },
    /// Build then run with the union of both phases' flags.
    Full {
        #[arg(long = "tags", num_args = 0.., required = true)]
        tags: Vec<String>,
        #[arg(long)]
        registry: Option<String>,
        #[arg(long = "clean-docker-cache")]
        clean_docker_cache: bool,
        #[arg(long = "manifest-output", default_value = "build_manifest.json")]
        manifest_output: PathBuf,
        #[arg(long = "additional-context")]
        additional_context: Option<String>,
        #[arg(long = "additional-context-file")]
        additional_context_file: Option<PathBuf>,
        #[arg(long = "models-dir", default_value = "models")]
        models_dir: PathBuf,
        #[arg(long = "target-arch", num_args = 0..)]
        target_arch: Vec<String>,
        #[arg(long = "credential-file", default_value = "credential.json")]
        credential_file: PathBuf,
        #[arg(long, default_value_t = -1)]
        timeout: i64,
        #[arg(long = "keep-alive")]
        keep_alive: bool,
        #[arg(long = "runner")]
        runner: Option<String>,
        #[arg(long = "inventory-file")]
        inventory_file: Option<PathBuf>,
        #[arg(long = "host-arch")]
        host_arch: Option<String>,
        #[arg(short = 'o', long = "output", default_value = "perf.csv")]
        output: PathBuf,
    },
    /// Generate an orchestration playbook or manifest from a build manifest.
    Generate {
        #[command(subcommand)]
        target: GenerateTarget,
    },
    /// Dump the discovered, tag-filtered model set and context to JSON without building.
    ExportConfig {
        #[arg(long = "tags", num_args = 0.., required = true)]
        tags: Vec<String>,
        #[arg(long = "models-dir", default_value = "models")]
        models_dir: PathBuf,
        #[arg(long = "output", default_value = "execution_config.json")]
        output: PathBuf,
        #[arg(long = "additional-context")]
        additional_context: Option<String>,
        #[arg(long = "additional-context-file")]
        additional_context_file: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
pub enum GenerateTarget {
    /// Generate an Ansible playbook that drives the manifest's images.
    Ansible {
        #[arg(long = "manifest-file", default_value = "build_manifest.json")]
        manifest_file: PathBuf,
        #[arg(long = "environment")]
        environment: String,
        #[arg(long = "output", default_value = "madorc_distributed.yml")]
        output: PathBuf,
    },
    /// Generate a Kubernetes Job manifest that drives the manifest's images.
    K8s {
        #[arg(long = "manifest-file", default_value = "build_manifest.json")]
        manifest_file: PathBuf,
        #[arg(long = "environment")]
        environment: String,
        #[arg(long = "namespace", default_value = "madorc")]
        namespace: String,
    },
}

/// Exit codes per spec.md §6: `0` success, `1` any phase had >=1 failure or
/// an uncaught error, `2` invalid invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    Failure = 1,
    InvalidInvocation = 2,
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_build_with_tags() {
        let cli = Cli::parse_from(["madorc", "build", "--tags", "resnet50", "bert"]);
        match cli.command {
            Command::Build { tags, .. } => assert_eq!(tags, vec!["resnet50", "bert"]),
            _ => panic!("expected Build"),
        }
    }

    #[test]
    fn parses_run_with_defaults() {
        let cli = Cli::parse_from(["madorc", "run"]);
        match cli.command {
            Command::Run { manifest_file, timeout, .. } => {
                assert_eq!(manifest_file, PathBuf::from("build_manifest.json"));
                assert_eq!(timeout, -1);
            }
            _ => panic!("expected Run"),
        }
    }

    #[test]
    fn parses_generate_ansible_subcommand() {
        let cli = Cli::parse_from([
            "madorc",
            "generate",
            "ansible",
            "--environment",
            "staging",
        ]);
        match cli.command {
            Command::Generate {
                target: GenerateTarget::Ansible { environment, .. },
            } => assert_eq!(environment, "staging"),
            _ => panic!("expected Generate Ansible"),
        }
    }
}
