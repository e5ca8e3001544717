//! Explicit process configuration, assembled once in `main` (Design Notes
//! §9, "Global configuration"). No module reads environment variables or
//! `credential.json` as a side effect of import/construction; the only
//! legal process-wide mutable state is the error reporter seat
//! (`error::set_reporter`).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::warn;

use crate::container_driver::RegistryCredential;
use crate::context::Context;
use crate::error::{MadError, Result};

/// Detected host facts folded into the build/run [`Context`] at the
/// `detected` merge layer (spec.md §4.2). Kept as its own struct so tests
/// can construct a deterministic instance instead of probing the real host.
#[derive(Debug, Clone)]
pub struct HostFacts {
    pub gpu_vendor: Option<String>,
    pub gpu_architecture: Option<String>,
    pub os: String,
    pub container_engine_version: Option<String>,
}

impl HostFacts {
    /// Detects what it cheaply can from the current process environment.
    /// GPU facts fall back to `None` when no vendor tool is reachable — this
    /// crate does not link against vendor SMI libraries (spec.md §1,
    /// out of scope).
    pub fn detect() -> Self {
        Self {
            gpu_vendor: std::env::var("MADORC_GPU_VENDOR").ok(),
            gpu_architecture: std::env::var("MADORC_GPU_ARCH").ok(),
            os: std::env::consts::OS.to_string(),
            container_engine_version: None,
        }
    }

    pub fn into_context(self) -> Context {
        let mut ctx = Context::new();
        if let Some(v) = self.gpu_vendor {
            ctx.set("gpu_vendor", Value::String(v));
        }
        if let Some(a) = self.gpu_architecture {
            ctx.set("gfx_arch", Value::String(a));
        }
        ctx.set("host_os", Value::String(self.os));
        ctx
    }
}

/// Parsed `credential.json`: registry key -> credential (plus arbitrary
/// extra fields a model's `cred` key may reference, exposed as raw JSON
/// values for build-arg expansion).
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub registries: BTreeMap<String, RegistryCredential>,
    pub raw: BTreeMap<String, Value>,
}

impl Credentials {
    /// Loads `credential.json`. A missing file is not an error — spec.md
    /// §4.10 step 1 says to proceed with empty credentials; a present-but-
    /// malformed file is a recoverable `configuration` error the caller may
    /// choose to log and continue past.
    pub async fn load(path: &Path) -> Result<Self> {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(MadError::configuration(format!(
                    "failed to read credential file: {e}"
                ))
                .with_field("path", path.display()))
            }
        };
        let raw: BTreeMap<String, Value> = serde_json::from_str(&contents).map_err(|e| {
            MadError::configuration(format!("credential.json is not valid JSON: {e}"))
                .with_field("path", path.display())
        })?;

        let mut registries = BTreeMap::new();
        for (key, value) in &raw {
            if let Ok(cred) = serde_json::from_value::<RegistryCredential>(value.clone()) {
                registries.insert(key.clone(), cred);
            }
        }
        Ok(Self { registries, raw })
    }

    pub fn get(&self, registry_key: &str) -> Option<&RegistryCredential> {
        self.registries.get(registry_key)
    }
}

/// Every value the orchestrator needs, assembled once instead of read
/// piecemeal from globals.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub models_dir: PathBuf,
    pub credential_file: PathBuf,
    pub manifest_file: PathBuf,
    pub registry: Option<String>,
    pub tags: Vec<String>,
    pub additional_context: Option<String>,
    pub additional_context_file: Option<PathBuf>,
    pub runner_kind: Option<String>,
    pub inventory_file: Option<PathBuf>,
    pub timeout_secs: i64,
    pub perf_csv: PathBuf,
    /// `--clean-docker-cache` (spec.md §6): forwarded to the container
    /// driver's `docker build --no-cache`.
    pub clean_docker_cache: bool,
    /// Per-model registry override (spec.md §4.5 step 6's `batch_overrides`)
    /// keyed by model name; supersedes `registry` when writing that
    /// model's manifest entry. Not currently exposed on the CLI surface —
    /// embedders drive it directly.
    pub registry_overrides: BTreeMap<String, String>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            models_dir: PathBuf::from("models"),
            credential_file: PathBuf::from("credential.json"),
            manifest_file: PathBuf::from("build_manifest.json"),
            registry: None,
            tags: Vec::new(),
            additional_context: None,
            additional_context_file: None,
            runner_kind: None,
            inventory_file: None,
            timeout_secs: -1,
            perf_csv: PathBuf::from("perf.csv"),
            clean_docker_cache: false,
            registry_overrides: BTreeMap::new(),
        }
    }
}

impl Configuration {
    /// Builds the merged [`Context`] for this configuration: detected host
    /// facts, then `--additional-context-file`, then `--additional-context`
    /// (later wins), per spec.md §4.2's `detected -> file -> string ->
    /// model` order (model-level merge happens later, per model, in the
    /// image builder).
    pub async fn build_context(&self) -> Result<Context> {
        let mut ctx = HostFacts::detect().into_context();

        if let Some(path) = &self.additional_context_file {
            let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
                MadError::configuration(format!("failed to read additional context file: {e}"))
                    .with_field("path", path.display())
            })?;
            let facts: BTreeMap<String, Value> = serde_json::from_str(&contents)?;
            ctx.merge(Context::from_map(facts));
        }

        if let Some(raw) = &self.additional_context {
            let facts: BTreeMap<String, Value> = serde_json::from_str(raw).map_err(|e| {
                MadError::configuration(format!("--additional-context is not valid JSON: {e}"))
            })?;
            ctx.merge(Context::from_map(facts));
        }

        Ok(ctx)
    }

    pub async fn load_credentials(&self) -> Credentials {
        match Credentials::load(&self.credential_file).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "credential file missing or invalid, proceeding with none");
                Credentials::default()
            }
        }
    }
}
