//! C11: drives the Build phase, persists the manifest, drives the Run
//! phase by reading the manifest and dispatching to a configured runner or
//! in-process container execution, and aggregates results into `perf.csv`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Configuration;
use crate::container_driver::ContainerDriver;
use crate::context::Context;
use crate::error::{MadError, Result};
use crate::gpu_arch;
use crate::image_builder::{BuildSummary, ImageBuilder};
use crate::manifest::BuildManifest;
use crate::model::{ExecutionResult, ExecutionStatus, ModelDescriptor};
use crate::runner::{self, Inventory, Runner, WorkloadSpec};

/// Reads `models_dir/models.json` (a JSON array of [`ModelDescriptor`]) and
/// filters it by `tags`, matching `"all"`/name/tag semantics (spec.md
/// §4.10 step 3's "discover models, external collaborator, filtered by
/// --tags"). This crate's core does not implement model *authoring*; it
/// only consumes the discovered set.
pub async fn discover_models(models_dir: &Path, tags: &[String]) -> Result<Vec<ModelDescriptor>> {
    if tags.is_empty() {
        return Err(MadError::validation("model_tags must not be empty")
            .with_suggestion("pass --tags all to select every model"));
    }

    let path = models_dir.join("models.json");
    let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
        MadError::discovery(format!("failed to read model index: {e}")).with_field("path", path.display())
    })?;
    let all: Vec<ModelDescriptor> = serde_json::from_str(&contents)?;
    crate::model::validate_model_set(&all)?;

    let selected: Vec<ModelDescriptor> = all.into_iter().filter(|m| m.matches_any(tags)).collect();

    if selected.is_empty() {
        return Err(MadError::discovery("no models matched the requested tags")
            .with_field("tags", tags.join(",")));
    }
    Ok(selected)
}

/// Outcome of driving the Build phase.
#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub models_discovered: usize,
    pub built: usize,
    pub skipped: usize,
    pub successful_pushes: usize,
    pub failed_pushes: usize,
    pub failed_builds: Vec<(String, String)>,
}

impl BuildReport {
    pub fn has_failures(&self) -> bool {
        !self.failed_builds.is_empty()
    }
}

/// Runs the Build phase end to end: load credentials, build a `Context`,
/// discover models, build+push every image, and persist the manifest.
/// Setup-level failures (manifest write failure, no models matched) abort
/// and raise; per-model build/push failures are recorded but never abort
/// the batch (spec.md §7).
pub async fn run_build(config: &Configuration, target_archs: &[String]) -> Result<BuildReport> {
    let credentials = config.load_credentials().await;
    let ctx = config.build_context().await?;
    let models = discover_models(&config.models_dir, &config.tags).await?;

    let mut manifest = BuildManifest::new(ctx.snapshot().clone());
    manifest.credentials_required = models
        .iter()
        .filter_map(|m| m.cred.clone())
        .collect::<std::collections::BTreeSet<_>>()
        .into_iter()
        .collect();

    let driver = ContainerDriver::default();
    let builder = ImageBuilder::new(
        driver,
        credentials.registries.clone(),
        credentials.raw.clone(),
        config.registry.clone(),
        config.clean_docker_cache,
    );

    let summary: BuildSummary = builder
        .build_all(
            &config.models_dir,
            &models,
            &ctx,
            target_archs,
            &mut manifest,
            &config.registry_overrides,
        )
        .await;

    manifest.write(&config.manifest_file).await.map_err(|e| {
        MadError::orchestration(format!("failed to write build manifest: {e}"))
            .with_field("path", config.manifest_file.display())
    })?;

    info!(
        built = summary.built,
        failed = summary.failed_builds.len(),
        "build phase complete"
    );

    Ok(BuildReport {
        models_discovered: models.len(),
        built: summary.built,
        skipped: summary.skipped,
        successful_pushes: summary.successful_pushes,
        failed_pushes: summary.failed_pushes,
        failed_builds: summary.failed_builds,
    })
}

/// Keeps only manifest entries compatible with `requested` architecture
/// (spec.md §4.11): legacy entries without an arch field always pass,
/// entries with a recorded arch pass iff it normalizes equal to `requested`.
pub fn arch_filter<'a>(
    images: &'a [crate::manifest::BuildEntry],
    requested: &str,
) -> Vec<&'a crate::manifest::BuildEntry> {
    images
        .iter()
        .filter(|e| gpu_arch::is_compatible(&e.architectures, requested))
        .collect()
}

/// Outcome of driving the Run phase.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub total_nodes: usize,
    pub successful: usize,
    pub failed: usize,
    pub total_duration_secs: f64,
}

/// One row of `perf.csv` (spec.md §6). Column order is fixed and stable
/// across writes in a run.
#[derive(Debug, Clone, Serialize)]
struct PerfRow<'a> {
    model: &'a str,
    n_gpus: i32,
    dockerfile: &'a str,
    machine_name: &'a str,
    gpu_architecture: &'a str,
    performance: f64,
    metric: &'a str,
    status: &'static str,
    dataname: &'a str,
}

/// Runs the Run phase end to end: load the manifest, arch-filter it for
/// `host_arch`, dispatch each surviving (image, model) pair to a configured
/// runner (or run it in-process via the container driver when no runner
/// kind is configured), and append one `perf.csv` row per result.
pub async fn run_run(
    config: &Configuration,
    host_arch: &str,
    runner_kind: Option<&str>,
    inventory: Option<&Inventory>,
) -> Result<RunReport> {
    let manifest = BuildManifest::read(&config.manifest_file).await.map_err(|e| {
        MadError::orchestration(format!("failed to load build manifest: {e}"))
            .with_field("path", config.manifest_file.display())
    })?;
    let mut ctx = Context::from_map(manifest.context.clone());
    ctx.set("host_gfx_arch", serde_json::Value::String(host_arch.to_string()));

    let filtered = arch_filter(&manifest.built_images, host_arch);
    if filtered.is_empty() {
        return Err(MadError::validation(format!(
            "no manifest images are compatible with architecture '{host_arch}'"
        )));
    }

    let mut writer = csv::Writer::from_path(&config.perf_csv).map_err(|e| {
        MadError::orchestration(format!("failed to open perf csv for writing: {e}"))
            .with_field("path", config.perf_csv.display())
    })?;

    let mut total = 0usize;
    let mut successful = 0usize;
    let mut failed = 0usize;
    let mut total_duration = 0.0f64;

    match runner_kind {
        Some(kind) => {
            let inventory = inventory
                .ok_or_else(|| MadError::validation("a runner kind was configured but no inventory was supplied"))?;
            // One runner instance drives every model in this phase; its
            // `run()` convenience (spec.md §4.6) validates, sets up once,
            // and tears down exactly once per call, but setup is idempotent
            // enough on every current backend that re-running it per model
            // here would just re-probe the same nodes. Instead we set up
            // once and execute per model, guaranteeing cleanup via a guard
            // that always fires even if an execute call errors.
            let mut runner = runner::factory::create(kind)?;
            runner.validate(
                inventory,
                &WorkloadSpec {
                    model: filtered[0].model.clone(),
                    image_ref: filtered[0].image_ref.clone(),
                    command: Vec::new(),
                    env: BTreeMap::new(),
                    timeout_secs: timeout_for(config),
                    gpu_architecture: filtered[0].architectures.first().cloned(),
                },
            )?;
            let setup_result = runner.setup_infrastructure(inventory).await;
            let execute_result = match setup_result {
                Ok(()) => {
                    let mut outcome = Ok(());
                    for entry in &filtered {
                        let workload = WorkloadSpec {
                            model: entry.model.clone(),
                            image_ref: entry.image_ref.clone(),
                            command: Vec::new(),
                            env: BTreeMap::new(),
                            timeout_secs: timeout_for(config),
                            gpu_architecture: entry.architectures.first().cloned(),
                        };
                        match runner.execute_workload(&workload).await {
                            Ok(dist) => {
                                for r in &dist.results {
                                    total += 1;
                                    match r.status {
                                        ExecutionStatus::Success => successful += 1,
                                        ExecutionStatus::Failed | ExecutionStatus::Timeout => failed += 1,
                                    }
                                    total_duration += r.duration_secs;
                                    if let Err(e) = write_row(&mut writer, entry, r) {
                                        outcome = Err(e);
                                        break;
                                    }
                                }
                            }
                            Err(e) => {
                                outcome = Err(e);
                                break;
                            }
                        }
                    }
                    outcome
                }
                Err(e) => Err(e),
            };
            // Cleanup is unconditional (spec.md §8 scenario 2): it runs even
            // when setup or an execute call failed.
            runner.cleanup_infrastructure().await;
            execute_result?;
        }
        None => {
            let driver = ContainerDriver::default();
            for entry in &filtered {
                let start = std::time::Instant::now();
                let container_name = format!("madorc-{}", entry.model.replace('/', "-"));
                let run_result = driver
                    .run_container(&entry.image_ref, &container_name, &[], &BTreeMap::new(), None)
                    .await;
                let result = match run_result {
                    Ok(container_id) => {
                        let exec_result = driver.exec(&container_id, "true").await;
                        let _ = driver.stop(&container_id).await;
                        let _ = driver.remove(&container_id).await;
                        match exec_result {
                            Ok(out) if out.success() => ExecutionResult {
                                node: "localhost".to_string(),
                                model: entry.model.clone(),
                                status: ExecutionStatus::Success,
                                duration_secs: start.elapsed().as_secs_f64(),
                                error_message: None,
                                output: Some(out.output),
                            },
                            Ok(out) => ExecutionResult {
                                node: "localhost".to_string(),
                                model: entry.model.clone(),
                                status: ExecutionStatus::Failed,
                                duration_secs: start.elapsed().as_secs_f64(),
                                error_message: Some(out.output),
                                output: None,
                            },
                            Err(e) => ExecutionResult {
                                node: "localhost".to_string(),
                                model: entry.model.clone(),
                                status: ExecutionStatus::Failed,
                                duration_secs: start.elapsed().as_secs_f64(),
                                error_message: Some(e.message),
                                output: None,
                            },
                        }
                    }
                    Err(e) => {
                        warn!(model = %entry.model, error = %e, "in-process run failed");
                        ExecutionResult {
                            node: "localhost".to_string(),
                            model: entry.model.clone(),
                            status: ExecutionStatus::Failed,
                            duration_secs: start.elapsed().as_secs_f64(),
                            error_message: Some(e.message),
                            output: None,
                        }
                    }
                };
                total += 1;
                match result.status {
                    ExecutionStatus::Success => successful += 1,
                    ExecutionStatus::Failed | ExecutionStatus::Timeout => failed += 1,
                }
                total_duration += result.duration_secs;
                write_row(&mut writer, entry, &result)?;
            }
        }
    }

    writer
        .flush()
        .map_err(|e| MadError::orchestration(format!("failed to flush perf csv: {e}")))?;

    Ok(RunReport {
        total_nodes: total,
        successful,
        failed,
        total_duration_secs: total_duration,
    })
}

fn timeout_for(config: &Configuration) -> Option<u64> {
    if config.timeout_secs > 0 {
        Some(config.timeout_secs as u64)
    } else {
        None
    }
}

fn write_row(
    writer: &mut csv::Writer<std::fs::File>,
    entry: &crate::manifest::BuildEntry,
    result: &ExecutionResult,
) -> Result<()> {
    let row = PerfRow {
        model: &entry.model,
        n_gpus: -1,
        dockerfile: &entry.dockerfile,
        machine_name: &result.node,
        gpu_architecture: entry.architectures.first().map(|s| s.as_str()).unwrap_or(""),
        performance: 0.0,
        metric: "",
        status: match result.status {
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILURE",
            ExecutionStatus::Timeout => "TIMEOUT",
        },
        dataname: "",
    };
    writer
        .serialize(row)
        .map_err(|e| MadError::orchestration(format!("failed to write perf csv row: {e}")))
}

/// Exports the discovered, tag-filtered model set plus the current context
/// snapshot to `output` without performing a build (§6 `export-config`,
/// supplemented from the original's `distributed_cli.py::export_config`).
pub async fn export_config(config: &Configuration, output: &Path) -> Result<usize> {
    let ctx = config.build_context().await?;
    let models = discover_models(&config.models_dir, &config.tags).await?;

    #[derive(Serialize)]
    struct ExecutionConfig<'a> {
        models: &'a [ModelDescriptor],
        context: &'a BTreeMap<String, serde_json::Value>,
    }
    let payload = ExecutionConfig {
        models: &models,
        context: ctx.snapshot(),
    };
    let json = serde_json::to_string_pretty(&payload)?;
    tokio::fs::write(output, json).await.map_err(|e| {
        MadError::orchestration(format!("failed to write execution config: {e}"))
            .with_field("path", output.display())
    })?;
    Ok(models.len())
}

/// Manifest path resolved relative to the working directory, mirroring the
/// CLI's `--manifest-file`/`--manifest-output` default of
/// `build_manifest.json`.
pub fn default_manifest_path() -> PathBuf {
    PathBuf::from("build_manifest.json")
}
