//! The persisted handoff between the build phase and the run phase.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{MadError, Result};

/// One built image: the model it belongs to, its registry reference, the
/// architectures it was built for, and push outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEntry {
    pub model: String,
    pub dockerfile: String,
    pub image_ref: String,
    #[serde(default)]
    pub architectures: Vec<String>,
    #[serde(default)]
    pub pushed: bool,
    #[serde(default)]
    pub push_failed: bool,
    #[serde(default)]
    pub push_error: Option<String>,
    /// Registry this entry was pushed (or attempted to push) to.
    #[serde(default)]
    pub registry: Option<String>,
    /// Fully-qualified registry image name, when different from `image_ref`.
    #[serde(default)]
    pub registry_image: Option<String>,
    /// `ARG BASE_DOCKER=...` resolved from the dockerfile or context.
    #[serde(default)]
    pub base_image_ref: Option<String>,
    /// Content digest of the base image, when resolvable (best-effort).
    #[serde(default)]
    pub base_digest: Option<String>,
    /// Wall-clock seconds the `docker build` invocation took.
    #[serde(default)]
    pub build_duration_secs: f64,
}

impl BuildEntry {
    pub fn is_well_formed(&self) -> bool {
        !self.image_ref.is_empty() && (!self.push_failed || self.push_error.is_some())
    }
}

/// One failed push, recorded separately from [`BuildEntry`] so a successful
/// build with a failed push is still usable by the run phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushFailure {
    pub image_ref: String,
    pub error: String,
}

/// The full persisted build manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildManifest {
    pub built_images: Vec<BuildEntry>,
    pub built_models: Vec<String>,
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub credentials_required: Vec<String>,
    #[serde(default)]
    pub push_failures: Vec<PushFailure>,
}

impl BuildManifest {
    pub fn new(context: BTreeMap<String, Value>) -> Self {
        Self {
            built_images: Vec::new(),
            built_models: Vec::new(),
            context,
            credentials_required: Vec::new(),
            push_failures: Vec::new(),
        }
    }

    pub fn record_build(&mut self, entry: BuildEntry) {
        if !self.built_models.contains(&entry.model) {
            self.built_models.push(entry.model.clone());
        }
        if entry.push_failed {
            self.push_failures.push(PushFailure {
                image_ref: entry.image_ref.clone(),
                error: entry
                    .push_error
                    .clone()
                    .unwrap_or_else(|| "push failed".to_string()),
            });
        }
        self.built_images.push(entry);
    }

    pub async fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json).await.map_err(|e| {
            MadError::runtime(format!("failed to write build manifest: {e}"))
                .with_field("path", path.display())
        })
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            MadError::discovery(format!("failed to read build manifest: {e}"))
                .with_field("path", path.display())
        })?;
        let manifest: Self = serde_json::from_str(&contents)?;
        Ok(manifest)
    }

    /// Images for `model`, optionally filtered to a requested architecture.
    pub fn images_for(&self, model: &str, arch: Option<&str>) -> Vec<&BuildEntry> {
        self.built_images
            .iter()
            .filter(|e| e.model == model)
            .filter(|e| match arch {
                Some(a) => crate::gpu_arch::is_compatible(&e.architectures, a),
                None => true,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(model: &str, arch: &[&str]) -> BuildEntry {
        BuildEntry {
            model: model.to_string(),
            dockerfile: "Dockerfile".into(),
            image_ref: format!("registry/{model}:latest"),
            architectures: arch.iter().map(|s| s.to_string()).collect(),
            pushed: true,
            push_failed: false,
            push_error: None,
            registry: None,
            registry_image: None,
            base_image_ref: None,
            base_digest: None,
            build_duration_secs: 0.0,
        }
    }

    #[test]
    fn build_entry_requires_nonempty_image_ref() {
        let mut e = entry("resnet50", &["gfx942"]);
        assert!(e.is_well_formed());
        e.image_ref.clear();
        assert!(!e.is_well_formed());
    }

    #[test]
    fn push_failed_without_error_is_malformed() {
        let mut e = entry("resnet50", &[]);
        e.push_failed = true;
        assert!(!e.is_well_formed());
        e.push_error = Some("denied".into());
        assert!(e.is_well_formed());
    }

    #[test]
    fn record_build_tracks_push_failures_and_models() {
        let mut manifest = BuildManifest::new(BTreeMap::new());
        let mut failing = entry("bert", &["gfx90a"]);
        failing.push_failed = true;
        failing.push_error = Some("unauthorized".into());
        manifest.record_build(failing);
        manifest.record_build(entry("bert", &["gfx942"]));

        assert_eq!(manifest.built_models, vec!["bert".to_string()]);
        assert_eq!(manifest.push_failures.len(), 1);
        assert_eq!(manifest.built_images.len(), 2);
    }

    #[tokio::test]
    async fn round_trips_through_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("manifest.json");
        let mut manifest = BuildManifest::new(BTreeMap::new());
        manifest.record_build(entry("resnet50", &["gfx942"]));
        manifest.write(&path).await.unwrap();

        let loaded = BuildManifest::read(&path).await.unwrap();
        assert_eq!(loaded.built_images.len(), 1);
        assert_eq!(loaded.built_images[0].model, "resnet50");
    }

    #[test]
    fn images_for_filters_by_architecture() {
        let mut manifest = BuildManifest::new(BTreeMap::new());
        manifest.record_build(entry("resnet50", &["gfx90a"]));
        manifest.record_build(entry("resnet50", &["gfx942"]));
        let filtered = manifest.images_for("resnet50", Some("mi300x"));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].architectures, vec!["gfx942".to_string()]);
    }
}
