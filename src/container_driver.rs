//! Thin wrapper around an external container engine binary (`docker` by
//! default). Every operation shells out through [`Console`] rather than
//! linking against a daemon API, matching the original `Docker` helper's
//! design.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::console::{Console, RunOptions};
use crate::error::{MadError, Result};

/// Credentials for one registry, as loaded from `credential.json` (spec.md
/// §6: each registry key maps to `{ repository, username, password }`).
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RegistryCredential {
    #[serde(default)]
    pub repository: Option<String>,
    pub username: String,
    pub password: String,
}

/// Driver for the container engine binary. Cheap to clone; holds only the
/// binary name and a `Console`.
#[derive(Debug, Clone)]
pub struct ContainerDriver {
    binary: String,
    console: Console,
}

impl Default for ContainerDriver {
    fn default() -> Self {
        Self::new("docker")
    }
}

impl ContainerDriver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            console: Console::new(),
        }
    }

    async fn run(&self, args: Vec<String>, opts: RunOptions) -> Result<crate::console::CommandOutput> {
        self.console.run_owned(&self.binary, args, &opts).await
    }

    pub async fn build(
        &self,
        dockerfile: &Path,
        context_dir: &Path,
        tag: &str,
        build_args: &BTreeMap<String, String>,
        no_cache: bool,
        network: Option<&str>,
    ) -> Result<()> {
        let mut args = vec!["build".to_string(), "--pull".to_string()];
        if no_cache {
            args.push("--no-cache".to_string());
        }
        if let Some(network) = network {
            args.push(format!("--network={network}"));
        }
        args.push("-f".to_string());
        args.push(dockerfile.display().to_string());
        args.push("-t".to_string());
        args.push(tag.to_string());
        for (k, v) in build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{k}={v}"));
        }
        args.push(context_dir.display().to_string());
        self.run(args, RunOptions::new().timeout(Duration::from_secs(3600)))
            .await?;
        Ok(())
    }

    pub async fn tag(&self, source: &str, target: &str) -> Result<()> {
        self.run(
            vec!["tag".into(), source.into(), target.into()],
            RunOptions::new(),
        )
        .await?;
        Ok(())
    }

    /// Pushes `tag`. Failures are returned (not panicked on) so callers can
    /// implement the non-fatal push-failure bookkeeping the build phase
    /// requires.
    pub async fn push(&self, tag: &str) -> Result<()> {
        self.run(vec!["push".into(), tag.into()], RunOptions::new())
            .await?;
        Ok(())
    }

    /// Logs into `registry` (or Docker Hub's implicit registry when `None`)
    /// using `--password-stdin`, matching the original helper's preference
    /// for never putting a password on the command line.
    pub async fn login(&self, registry: Option<&str>, cred: &RegistryCredential) -> Result<()> {
        if cred.username.is_empty() || cred.password.is_empty() {
            return Err(MadError::configuration(
                "registry credential is missing username or password",
            )
            .with_suggestion(
                r#"add an entry to credential.json, e.g. {"dockerhub": {"username": "...", "password": "..."}}"#,
            ));
        }
        let mut args = vec![
            "login".to_string(),
            "-u".to_string(),
            cred.username.clone(),
            "--password-stdin".to_string(),
        ];
        if let Some(r) = registry {
            args.push(r.to_string());
        }
        // `--password-stdin` means the password itself never appears in argv;
        // `secret` additionally suppresses it from logs if a caller still
        // routes it through env/stdin emulation.
        self.run(args, RunOptions::new().secret(true)).await?;
        Ok(())
    }

    pub async fn logout(&self, registry: Option<&str>) -> Result<()> {
        let mut args = vec!["logout".to_string()];
        if let Some(r) = registry {
            args.push(r.to_string());
        }
        self.run(args, RunOptions::new().can_fail(true)).await?;
        Ok(())
    }

    /// Looks up the manifest digest for `image_ref` without pulling it.
    /// Failures are non-fatal to callers (the original build helper uses
    /// this only as a best-effort base-image freshness check).
    pub async fn manifest_digest(&self, image_ref: &str) -> Result<String> {
        let out = self
            .run(
                vec![
                    "manifest".to_string(),
                    "inspect".to_string(),
                    image_ref.to_string(),
                ],
                RunOptions::new(),
            )
            .await?;
        Ok(out.output)
    }

    /// Starts a detached container named `name`. Refuses if a container by
    /// that name already exists, matching the original helper's
    /// fail-fast-on-collision behavior rather than silently reusing it.
    pub async fn run_container(
        &self,
        image_ref: &str,
        name: &str,
        mounts: &[(String, String)],
        env: &BTreeMap<String, String>,
        workdir: Option<&str>,
    ) -> Result<String> {
        if self.container_exists(name).await? {
            return Err(MadError::runtime(format!(
                "container named '{name}' already exists"
            ))
            .with_field("container", name));
        }
        let mut args = vec![
            "run".to_string(),
            "-t".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            name.to_string(),
        ];
        for (host, container) in mounts {
            args.push("-v".to_string());
            args.push(format!("{host}:{container}"));
        }
        for (k, v) in env {
            args.push("-e".to_string());
            args.push(format!("{k}={v}"));
        }
        if let Some(w) = workdir {
            args.push("-w".to_string());
            args.push(w.to_string());
        }
        args.push(image_ref.to_string());
        let out = self.run(args, RunOptions::new()).await?;
        Ok(out.output.trim().to_string())
    }

    pub async fn exec(&self, container: &str, command: &str) -> Result<crate::console::CommandOutput> {
        self.run(
            vec![
                "exec".to_string(),
                container.to_string(),
                "bash".to_string(),
                "-c".to_string(),
                command.to_string(),
            ],
            RunOptions::new().can_fail(true),
        )
        .await
    }

    pub async fn stop(&self, container: &str) -> Result<()> {
        self.run(
            vec!["stop".to_string(), container.to_string()],
            RunOptions::new().can_fail(true),
        )
        .await?;
        Ok(())
    }

    pub async fn remove(&self, container: &str) -> Result<()> {
        self.run(
            vec!["rm".to_string(), "-f".to_string(), container.to_string()],
            RunOptions::new().can_fail(true),
        )
        .await?;
        Ok(())
    }

    async fn container_exists(&self, name: &str) -> Result<bool> {
        let out = self
            .run(
                vec![
                    "ps".to_string(),
                    "-a".to_string(),
                    "--filter".to_string(),
                    format!("name=^{name}$"),
                    "--format".to_string(),
                    "{{.Names}}".to_string(),
                ],
                RunOptions::new(),
            )
            .await?;
        Ok(!out.output.trim().is_empty())
    }

    /// Runs `container_name`'s full lifecycle (start, call `body`, always
    /// stop+remove on the way out) as a scoped acquisition, replacing the
    /// original destructor-based cleanup with an explicit guard that runs
    /// even if `body` returns an error.
    pub async fn with_container<F, Fut, T>(
        &self,
        image_ref: &str,
        name: &str,
        mounts: &[(String, String)],
        env: &BTreeMap<String, String>,
        workdir: Option<&str>,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(String) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let container_id = self
            .run_container(image_ref, name, mounts, env, workdir)
            .await?;
        let result = body(container_id).await;
        let _ = self.stop(name).await;
        let _ = self.remove(name).await;
        result
    }
}

/// Resolves the credential key for a registry: Docker Hub (empty registry or
/// `docker.io`) aliases to the `dockerhub` key.
pub fn credential_key_for_registry(registry: Option<&str>) -> &str {
    match registry {
        None | Some("docker.io") | Some("") => "dockerhub",
        Some(other) => other,
    }
}
