//! Builds every dockerfile variant for a model, fanning out across GPU
//! architectures and filtering variants by their `# CONTEXT` comment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::container_driver::{credential_key_for_registry, ContainerDriver, RegistryCredential};
use crate::context::{self, Context};
use crate::error::{MadError, Result};
use crate::gpu_arch;
use crate::manifest::{BuildEntry, BuildManifest};
use crate::model::ModelDescriptor;

/// One dockerfile found under a model's directory, with its parsed
/// `# CONTEXT` filter (if any) and any GPU-architecture build args it
/// declares.
#[derive(Debug, Clone)]
pub struct DockerfileCandidate {
    pub path: PathBuf,
    pub context_filter: Option<context::ContextExpr>,
    pub arch_values: Vec<String>,
}

/// Aggregate outcome of building every model's dockerfile candidates.
#[derive(Debug, Clone, Default)]
pub struct BuildSummary {
    pub built: usize,
    pub skipped: usize,
    pub successful_pushes: usize,
    pub failed_pushes: usize,
    /// `(model, dockerfile)` pairs whose `docker build` itself failed.
    /// A unit failure never aborts the remaining candidates (spec.md §7,
    /// "Propagation policy").
    pub failed_builds: Vec<(String, String)>,
}

pub struct ImageBuilder {
    driver: ContainerDriver,
    credentials: BTreeMap<String, RegistryCredential>,
    /// Raw `credential.json` values, keyed the same way as a model's `cred`
    /// field, so arbitrary (non-registry) credential keys can still be
    /// expanded into build-args (spec.md §4.5 step 4 / §6).
    raw_credentials: BTreeMap<String, serde_json::Value>,
    registry: Option<String>,
    /// `--clean-docker-cache` / `docker build --no-cache` (spec.md §4.4,
    /// §6).
    no_cache: bool,
}

impl ImageBuilder {
    pub fn new(
        driver: ContainerDriver,
        credentials: BTreeMap<String, RegistryCredential>,
        raw_credentials: BTreeMap<String, serde_json::Value>,
        registry: Option<String>,
        no_cache: bool,
    ) -> Self {
        Self {
            driver,
            credentials,
            raw_credentials,
            registry,
            no_cache,
        }
    }

    /// Finds every `<model.dockerfile>*` under `models_dir/<model.name>/`
    /// (spec.md §4.5 step 1: "globbing the model's `dockerfile` prefix, e.g.
    /// `foo.Dockerfile.*`"), parsing each one's leading `# CONTEXT <expr>`
    /// comment (if present) and scanning its `ARG`/`ENV` lines for any of
    /// [`gpu_arch::GPU_ARCH_VARS`].
    pub async fn discover(
        &self,
        models_dir: &Path,
        model: &ModelDescriptor,
    ) -> Result<Vec<DockerfileCandidate>> {
        let model_dir = models_dir.join(&model.name);
        let mut entries = tokio::fs::read_dir(&model_dir).await.map_err(|e| {
            MadError::discovery(format!("cannot read model directory: {e}"))
                .with_field("model", &model.name)
                .with_field("path", model_dir.display())
        })?;

        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(MadError::from)? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.starts_with(model.dockerfile.as_str()) {
                continue;
            }
            let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
                MadError::discovery(format!("cannot read dockerfile: {e}"))
                    .with_field("path", path.display())
            })?;
            candidates.push(parse_candidate(path, &contents)?);
        }
        candidates.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(candidates)
    }

    /// Computes the build-args for one model: `docker_build_arg` from the
    /// context, `MODEL_NAME`, and — when the model declares a `cred` key
    /// (spec.md §4.5 step 4, §6) — every field of that credential expanded
    /// as `<KEY>_<FIELD_UPPER>=<value>`. A model that names a `cred` key
    /// absent from `credential.json` is a `configuration` error naming the
    /// missing key (spec.md §4.5 "Failure semantics").
    pub fn build_arg(&self, ctx: &Context, model: &ModelDescriptor) -> Result<BTreeMap<String, String>> {
        let mut args = BTreeMap::new();
        if let Some(serde_json::Value::Object(map)) = ctx.get("docker_build_arg") {
            for (k, v) in map {
                if let serde_json::Value::String(s) = v {
                    args.insert(k.clone(), expand_credentials(s, &self.credentials));
                }
            }
        }
        args.insert("MODEL_NAME".to_string(), model.name.clone());

        if let Some(cred_key) = &model.cred {
            let fields = self.raw_credentials.get(cred_key).ok_or_else(|| {
                MadError::configuration(format!(
                    "model '{}' declares credential '{cred_key}' but it is not present in credential.json",
                    model.name
                ))
                .with_field("model_name", &model.name)
                .with_suggestion(format!(
                    "add a \"{cred_key}\": {{ ... }} entry to credential.json"
                ))
            })?;
            let key_upper = cred_key.to_uppercase();
            if let serde_json::Value::Object(fields) = fields {
                for (field, value) in fields {
                    let value_str = match value {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    args.insert(format!("{key_upper}_{}", field.to_uppercase()), value_str);
                }
            }
        }
        Ok(args)
    }

    /// Computes the local image tag (spec.md §4.5 step 3): `ci-<model>_<stem>`,
    /// with an `_<arch>` suffix appended only when `arch` is non-empty (i.e.
    /// the chosen dockerfile declared a recognized GPU-arch variable).
    fn local_tag(model: &str, dockerfile_stem: &str, arch: &str) -> String {
        let slug = model.replace('/', "-");
        if arch.is_empty() {
            format!("ci-{slug}_{dockerfile_stem}")
        } else {
            format!("ci-{slug}_{dockerfile_stem}_{arch}")
        }
    }

    /// Resolves the fully-qualified registry image name for `local_tag`
    /// (spec.md §4.5 step 6): Docker Hub uses `<repository>:<local_tag>` (or
    /// the bare local tag if no repository credential is on file); any other
    /// registry prefixes `<registry>/<repository>:<local_tag>`, falling back
    /// to `<registry>/<local_tag>` without a repository credential.
    fn registry_image_name(&self, local_tag: &str) -> Option<String> {
        let registry = self.registry.as_deref()?;
        Some(self.registry_image_name_with(local_tag, registry))
    }

    /// Same as [`Self::registry_image_name`] but for an explicit registry —
    /// used when a per-model override from `batch_overrides` supersedes the
    /// batch registry (spec.md §4.5 step 6).
    fn registry_image_name_with(&self, local_tag: &str, registry: &str) -> String {
        let cred_key = credential_key_for_registry(Some(registry));
        let repository = self.credentials.get(cred_key).and_then(|c| c.repository.as_deref());
        if cred_key == "dockerhub" {
            match repository {
                Some(repo) => format!("{repo}:{local_tag}"),
                None => local_tag.to_string(),
            }
        } else {
            match repository {
                Some(repo) => format!("{registry}/{repo}:{local_tag}"),
                None => format!("{registry}/{local_tag}"),
            }
        }
    }

    /// Builds and (best-effort) pushes every dockerfile variant for one
    /// model, fanning out across `requested_arches` when a dockerfile
    /// declares an architecture build-arg. Push failures are recorded on the
    /// manifest but never abort the remaining builds.
    pub async fn build_model(
        &self,
        models_dir: &Path,
        model: &ModelDescriptor,
        ctx: &Context,
        requested_arches: &[String],
        manifest: &mut BuildManifest,
        summary: &mut BuildSummary,
        batch_overrides: &BTreeMap<String, String>,
    ) -> Result<()> {
        let candidates = self.discover(models_dir, model).await?;
        let build_args = self.build_arg(ctx, model)?;
        let model_dir = models_dir.join(&model.name);
        // spec.md §4.5 step 6: "a registry is provided (per-model override
        // from `batch_overrides` wins)".
        let effective_registry = batch_overrides.get(&model.name).cloned().or_else(|| self.registry.clone());

        for candidate in &candidates {
            if let Some(filter) = &candidate.context_filter {
                if !ctx.filter(filter) {
                    summary.skipped += 1;
                    continue;
                }
            }

            let stem = candidate
                .path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("Dockerfile")
                .to_string();

            let arches_to_build: Vec<String> = if candidate.arch_values.is_empty() {
                vec![String::new()]
            } else if requested_arches.is_empty() {
                candidate.arch_values.clone()
            } else {
                requested_arches
                    .iter()
                    .map(|a| gpu_arch::normalize(a))
                    .filter(|a| candidate.arch_values.iter().any(|c| gpu_arch::normalize(c) == *a))
                    .collect()
            };

            for arch in &arches_to_build {
                let mut per_arch_args = build_args.clone();
                if !arch.is_empty() {
                    for var in gpu_arch::GPU_ARCH_VARS {
                        per_arch_args.insert(var.to_string(), arch.clone());
                    }
                }
                let local_tag = Self::local_tag(&model.name, &stem, arch);
                let started = std::time::Instant::now();
                if let Err(e) = self
                    .driver
                    .build(&candidate.path, &model_dir, &local_tag, &per_arch_args, self.no_cache, Some("host"))
                    .await
                {
                    warn!(model = %model, dockerfile = %candidate.path.display(), error = %e, "build failed, continuing");
                    summary
                        .failed_builds
                        .push((model.to_string(), candidate.path.display().to_string()));
                    continue;
                }
                let build_duration_secs = started.elapsed().as_secs_f64();
                summary.built += 1;

                let base_image_ref = parse_base_docker(&candidate.path, &per_arch_args).await;
                let base_digest = match &base_image_ref {
                    Some(base_ref) => match self.driver.manifest_digest(base_ref).await {
                        Ok(digest) => Some(digest),
                        Err(e) => {
                            warn!(base_ref = %base_ref, error = %e, "base image digest lookup failed, continuing");
                            None
                        }
                    },
                    None => None,
                };

                let mut entry = BuildEntry {
                    model: model.to_string(),
                    dockerfile: candidate.path.display().to_string(),
                    image_ref: local_tag.clone(),
                    architectures: if arch.is_empty() {
                        Vec::new()
                    } else {
                        vec![arch.clone()]
                    },
                    pushed: false,
                    push_failed: false,
                    push_error: None,
                    registry: effective_registry.clone(),
                    registry_image: None,
                    base_image_ref,
                    base_digest,
                    build_duration_secs,
                };

                if let Some(registry) = &effective_registry {
                    let registry_image = self.registry_image_name_with(&local_tag, registry);
                    if registry_image != local_tag {
                        if let Err(e) = self.driver.tag(&local_tag, &registry_image).await {
                            warn!(image = %local_tag, error = %e, "tag before push failed, continuing");
                        }
                    }
                    match self.push(&registry_image, registry).await {
                        Ok(()) => {
                            entry.pushed = true;
                            entry.registry_image = Some(registry_image);
                            summary.successful_pushes += 1;
                        }
                        Err(e) => {
                            warn!(image = %registry_image, error = %e, "push failed, continuing");
                            entry.push_failed = true;
                            entry.push_error = Some(e.message.clone());
                            entry.registry_image = Some(registry_image);
                            summary.failed_pushes += 1;
                        }
                    }
                }
                manifest.record_build(entry);
            }
        }
        info!(model = %model, built = summary.built, "model build complete");
        Ok(())
    }

    async fn push(&self, image_ref: &str, registry: &str) -> Result<()> {
        let key = credential_key_for_registry(Some(registry));
        if let Some(cred) = self.credentials.get(key) {
            self.driver.login(Some(registry), cred).await?;
        }
        self.driver.push(image_ref).await
    }

    /// Drives [`Self::build_model`] over every model, collecting one shared
    /// [`BuildSummary`] and recording every produced image into `manifest`.
    /// A single model's discovery failure (e.g. its directory is missing)
    /// is recorded as a failed build rather than aborting the batch, per
    /// spec.md §7's unit-of-work propagation policy.
    pub async fn build_all(
        &self,
        models_dir: &Path,
        models: &[ModelDescriptor],
        ctx: &Context,
        requested_arches: &[String],
        manifest: &mut BuildManifest,
        batch_overrides: &BTreeMap<String, String>,
    ) -> BuildSummary {
        let mut summary = BuildSummary::default();
        for model in models {
            if let Err(e) = self
                .build_model(models_dir, model, ctx, requested_arches, manifest, &mut summary, batch_overrides)
                .await
            {
                warn!(model = %model, error = %e, "model build aborted before any dockerfile ran");
                summary.failed_builds.push((model.to_string(), String::new()));
            }
        }
        summary
    }
}

fn parse_candidate(path: PathBuf, contents: &str) -> Result<DockerfileCandidate> {
    let mut context_filter = None;
    let mut arch_values = Vec::new();

    for line in contents.lines() {
        let trimmed = line.trim();
        if let Some(expr_text) = trimmed.strip_prefix("# CONTEXT ") {
            context_filter = Some(context::parse(expr_text)?);
        }
        for var in gpu_arch::GPU_ARCH_VARS {
            let arg_prefix = format!("ARG {var}");
            let env_prefix = format!("ENV {var}");
            if let Some(rest) = trimmed
                .strip_prefix(&arg_prefix)
                .or_else(|| trimmed.strip_prefix(&env_prefix))
            {
                if let Some(value) = rest.trim().strip_prefix('=') {
                    arch_values.extend(gpu_arch::normalize_list(value.trim_matches('"')));
                }
            }
        }
    }

    Ok(DockerfileCandidate {
        path,
        context_filter,
        arch_values,
    })
}

/// Resolves the BASE image reference for a build (spec.md §4.5 step 5): a
/// `BASE_DOCKER` build-arg override from the context wins; otherwise the
/// dockerfile's own `ARG BASE_DOCKER=<ref>` line is parsed. Returns `None`
/// when neither source declares one.
async fn parse_base_docker(path: &Path, build_args: &BTreeMap<String, String>) -> Option<String> {
    if let Some(v) = build_args.get("BASE_DOCKER") {
        return Some(v.clone());
    }
    let contents = tokio::fs::read_to_string(path).await.ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.trim().strip_prefix("ARG BASE_DOCKER") {
            if let Some(value) = rest.trim().strip_prefix('=') {
                let value = value.trim().trim_matches('"');
                if !value.is_empty() {
                    return Some(value.to_string());
                }
            }
        }
    }
    None
}

fn expand_credentials(template: &str, credentials: &BTreeMap<String, RegistryCredential>) -> String {
    let mut out = template.to_string();
    for (key, cred) in credentials {
        out = out.replace(&format!("${{{key}_username}}"), &cred.username);
        out = out.replace(&format!("${{{key}_password}}"), &cred.password);
    }
    out
}
