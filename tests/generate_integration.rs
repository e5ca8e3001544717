//! `generate ansible`/`generate k8s` driven against a manifest round-tripped
//! through disk, the way the CLI actually invokes them (spec.md §6).

use std::collections::BTreeMap;

use madorc::generate::{generate_ansible_playbook, generate_k8s_manifest};
use madorc::manifest::{BuildEntry, BuildManifest};

fn entry(model: &str) -> BuildEntry {
    BuildEntry {
        model: model.to_string(),
        dockerfile: "Dockerfile".into(),
        image_ref: format!("registry.example.com/ci-{model}:latest"),
        architectures: vec!["gfx942".into()],
        pushed: true,
        push_failed: false,
        push_error: None,
        registry: Some("registry.example.com".into()),
        registry_image: Some(format!("registry.example.com/ci-{model}:latest")),
        base_image_ref: None,
        base_digest: None,
        build_duration_secs: 12.5,
    }
}

#[tokio::test]
async fn ansible_and_k8s_artifacts_round_trip_through_a_persisted_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let manifest_path = dir.path().join("build_manifest.json");

    let mut manifest = BuildManifest::new(BTreeMap::new());
    manifest.record_build(entry("resnet50"));
    manifest.record_build(entry("bert"));
    manifest.write(&manifest_path).await.unwrap();

    let loaded = BuildManifest::read(&manifest_path).await.unwrap();
    assert_eq!(loaded.built_images.len(), 2);

    let playbook = generate_ansible_playbook(&loaded, "staging");
    assert!(playbook.contains("ci-resnet50:latest"));
    assert!(playbook.contains("ci-bert:latest"));
    assert!(playbook.contains("environment: staging"));

    let k8s_yaml = generate_k8s_manifest(&loaded, "prod", "madorc-prod");
    assert!(k8s_yaml.contains("madorc-resnet50"));
    assert!(k8s_yaml.contains("madorc-bert"));
    assert!(k8s_yaml.matches("kind: Job").count() == 2);
}
