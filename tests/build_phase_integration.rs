//! End-to-end build-phase scenarios (spec.md §8) driven against a stub
//! `docker` binary instead of a real container engine.

use std::collections::BTreeMap;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use madorc::container_driver::ContainerDriver;
use madorc::context::Context;
use madorc::image_builder::{BuildSummary, ImageBuilder};
use madorc::manifest::BuildManifest;
use madorc::model::ModelDescriptor;

/// Every subcommand succeeds except `push` on an image ref containing
/// "failpush", which exits non-zero with a message on stderr.
fn stub_docker(dir: &Path) -> PathBuf {
    let path = dir.join("fake-docker");
    let script = r#"#!/bin/sh
case "$1" in
  push)
    case "$2" in
      *failpush*) echo "denied: requested access to the resource is denied" 1>&2; exit 1 ;;
      *) exit 0 ;;
    esac
    ;;
  manifest) echo "sha256:deadbeef" ;;
esac
exit 0
"#;
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

fn model_with_dockerfile(root: &Path, name: &str, dockerfile: &str) -> ModelDescriptor {
    let dir = root.join(name);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("Dockerfile"), dockerfile).unwrap();
    ModelDescriptor {
        name: name.to_string(),
        dockerfile: "Dockerfile".to_string(),
        docker_context: ".".to_string(),
        scripts_path: None,
        owner: None,
        n_gpus: -1,
        timeout_secs: None,
        training_precision: None,
        tags: Default::default(),
        cred: None,
        dataname: None,
        args: vec![],
        multiple_results: false,
        skip_gpu_arch: vec![],
    }
}

#[tokio::test]
async fn multi_arch_build_skips_incompatible_architecture() {
    // spec.md §8 scenario 5
    let models_root = tempfile::tempdir().unwrap();
    let model = model_with_dockerfile(
        models_root.path(),
        "resnet50",
        "FROM scratch\nARG MAD_SYSTEM_GPU_ARCHITECTURE=gfx908\n",
    );

    let stub_dir = tempfile::tempdir().unwrap();
    let docker = stub_docker(stub_dir.path());
    let builder = ImageBuilder::new(
        ContainerDriver::new(docker.display().to_string()),
        BTreeMap::new(),
        BTreeMap::new(),
        None,
        false,
    );

    let ctx = Context::new();
    let mut manifest = BuildManifest::new(Default::default());
    let mut summary = BuildSummary::default();
    builder
        .build_model(
            models_root.path(),
            &model,
            &ctx,
            &["gfx908".to_string(), "gfx942".to_string()],
            &mut manifest,
            &mut summary,
            &BTreeMap::new(),
        )
        .await
        .unwrap();

    assert_eq!(summary.built, 1);
    assert!(summary.failed_builds.is_empty());
    assert_eq!(manifest.built_images.len(), 1);
    assert!(manifest.built_images[0].image_ref.ends_with("_gfx908"));
}

#[tokio::test]
async fn push_failure_is_recorded_but_build_still_counts_as_success() {
    // spec.md §8 scenario 6
    let models_root = tempfile::tempdir().unwrap();
    let model = model_with_dockerfile(models_root.path(), "failpush-model", "FROM scratch\n");

    let stub_dir = tempfile::tempdir().unwrap();
    let docker = stub_docker(stub_dir.path());
    let builder = ImageBuilder::new(
        ContainerDriver::new(docker.display().to_string()),
        BTreeMap::new(),
        BTreeMap::new(),
        Some("registry.example.com".to_string()),
        false,
    );

    let ctx = Context::new();
    let mut manifest = BuildManifest::new(Default::default());
    let mut summary = BuildSummary::default();
    builder
        .build_model(models_root.path(), &model, &ctx, &[], &mut manifest, &mut summary, &BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(summary.built, 1);
    assert_eq!(summary.failed_pushes, 1);
    assert_eq!(manifest.push_failures.len(), 1);
    let entry = &manifest.built_images[0];
    assert!(entry.push_failed);
    assert!(entry.push_error.as_deref().unwrap().contains("denied"));
    assert!(entry.is_well_formed());
}

#[tokio::test]
async fn context_filtered_dockerfile_is_skipped_not_built() {
    let models_root = tempfile::tempdir().unwrap();
    let model = model_with_dockerfile(
        models_root.path(),
        "bert",
        "# CONTEXT gpu_vendor == \"nvidia\"\nFROM scratch\n",
    );

    let stub_dir = tempfile::tempdir().unwrap();
    let docker = stub_docker(stub_dir.path());
    let builder = ImageBuilder::new(
        ContainerDriver::new(docker.display().to_string()),
        BTreeMap::new(),
        BTreeMap::new(),
        None,
        false,
    );

    let mut ctx = Context::new();
    ctx.set("gpu_vendor", serde_json::Value::String("amd".to_string()));
    let mut manifest = BuildManifest::new(Default::default());
    let mut summary = BuildSummary::default();
    builder
        .build_model(models_root.path(), &model, &ctx, &[], &mut manifest, &mut summary, &BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(summary.built, 0);
    assert_eq!(summary.skipped, 1);
    assert!(manifest.built_images.is_empty());
}
