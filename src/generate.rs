//! `generate ansible` / `generate k8s` (spec.md §6): renders a
//! ready-to-run playbook or Job manifest from a persisted build manifest,
//! without executing anything.

use crate::manifest::BuildManifest;

/// Renders an Ansible playbook that pulls and runs each manifest image,
/// tagged with `environment` so a single playbook can be filtered per
/// deploy target via `--limit`/host groups in the usual Ansible fashion.
pub fn generate_ansible_playbook(manifest: &BuildManifest, environment: &str) -> String {
    let mut out = format!("---\n# generated for environment: {environment}\n- hosts: workers\n  tasks:\n");
    for entry in &manifest.built_images {
        out.push_str(&format!(
            "    - name: run {model}\n      community.docker.docker_container:\n        name: {name}\n        image: {image}\n        state: started\n",
            model = entry.model,
            name = entry.model.replace('/', "-"),
            image = entry.image_ref,
        ));
    }
    out
}

/// Renders one Kubernetes `Job` manifest (concatenated YAML documents) per
/// build entry, in `namespace`.
pub fn generate_k8s_manifest(manifest: &BuildManifest, environment: &str, namespace: &str) -> String {
    let mut out = String::new();
    for entry in &manifest.built_images {
        out.push_str(&format!(
            "apiVersion: batch/v1\nkind: Job\nmetadata:\n  name: madorc-{name}\n  namespace: {namespace}\n  labels:\n    environment: {environment}\nspec:\n  template:\n    spec:\n      restartPolicy: Never\n      containers:\n        - name: workload\n          image: {image}\n---\n",
            name = entry.model.replace('/', "-"),
            image = entry.image_ref,
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::BuildEntry;
    use std::collections::BTreeMap;

    fn manifest_with_one_entry() -> BuildManifest {
        let mut m = BuildManifest::new(BTreeMap::new());
        m.record_build(BuildEntry {
            model: "resnet50".into(),
            dockerfile: "Dockerfile".into(),
            image_ref: "ci-resnet50:latest".into(),
            architectures: vec!["gfx942".into()],
            pushed: true,
            push_failed: false,
            push_error: None,
            registry: None,
            registry_image: None,
            base_image_ref: None,
            base_digest: None,
            build_duration_secs: 0.0,
        });
        m
    }

    #[test]
    fn ansible_playbook_contains_each_image() {
        let playbook = generate_ansible_playbook(&manifest_with_one_entry(), "staging");
        assert!(playbook.contains("ci-resnet50:latest"));
        assert!(playbook.contains("staging"));
    }

    #[test]
    fn k8s_manifest_sets_namespace_and_image() {
        let yaml = generate_k8s_manifest(&manifest_with_one_entry(), "prod", "madorc-prod");
        assert!(yaml.contains("namespace: madorc-prod"));
        assert!(yaml.contains("image: ci-resnet50:latest"));
    }
}
