//! Async subprocess execution primitive shared by every component that
//! shells out: the container driver, the SSH/SLURM/Ansible runners, and the
//! orchestrator's git/credential helpers.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::{MadError, Result};

/// Options controlling a single [`Console::run`] invocation.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Don't turn a non-zero exit into an error; caller inspects the result.
    pub can_fail: bool,
    /// Wall-clock budget for the whole invocation.
    pub timeout: Option<Duration>,
    /// Redact the command line and output from logs (credentials, tokens).
    pub secret: bool,
    /// Tee output line-by-line to tracing as it arrives, in addition to
    /// capturing it.
    pub live_output: bool,
    /// Extra environment variables layered on top of the inherited one.
    pub env: HashMap<String, String>,
    /// Prefix prepended to each teed line, e.g. a node name.
    pub prefix: Option<String>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn can_fail(mut self, v: bool) -> Self {
        self.can_fail = v;
        self
    }
    pub fn timeout(mut self, d: Duration) -> Self {
        self.timeout = Some(d);
        self
    }
    pub fn secret(mut self, v: bool) -> Self {
        self.secret = v;
        self
    }
    pub fn live_output(mut self, v: bool) -> Self {
        self.live_output = v;
        self
    }
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
    pub fn prefix(mut self, p: impl Into<String>) -> Self {
        self.prefix = Some(p.into());
        self
    }
}

/// Outcome of a command run. stdout/stderr are merged into one stream,
/// matching the original shell-wrapper's behavior.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Thin async wrapper over `tokio::process::Command`.
#[derive(Debug, Clone, Default)]
pub struct Console;

impl Console {
    pub fn new() -> Self {
        Self
    }

    /// Runs `program` with `args`, honoring [`RunOptions`]. Mirrors the
    /// original shell helper's contract: on timeout the child is killed and a
    /// timeout error returned; on a non-zero exit, an error is returned
    /// unless `can_fail` is set, in which case the (failed) output is
    /// returned to the caller instead.
    pub async fn run(
        &self,
        program: &str,
        args: &[impl AsRef<str>],
        opts: &RunOptions,
    ) -> Result<CommandOutput> {
        let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
        let display_cmd = if opts.secret {
            "<redacted>".to_string()
        } else {
            format!("{program} {}", args.join(" "))
        };
        debug!(command = %display_cmd, "spawning command");

        let mut command = Command::new(program);
        command
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(Stdio::null());
        for (k, v) in &opts.env {
            command.env(k, v);
        }

        let mut child = command.spawn().map_err(|e| {
            MadError::runtime(format!("failed to spawn {program}: {e}"))
                .with_field("command", &display_cmd)
        })?;

        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let live = opts.live_output;
        let secret = opts.secret;
        let prefix = opts.prefix.clone();

        let prefix_out = prefix.clone();
        let stdout_task = tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                if live && !secret {
                    match &prefix_out {
                        Some(p) => println!("[{p}] {line}"),
                        None => println!("{line}"),
                    }
                }
                lines.push(line);
            }
            lines.join("\n")
        });
        let stderr_task = tokio::spawn(async move {
            let mut lines = Vec::new();
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                lines.push(line);
            }
            lines.join("\n")
        });

        let wait = async {
            let status = child.wait().await?;
            let out = stdout_task.await.unwrap_or_default();
            let err = stderr_task.await.unwrap_or_default();
            std::io::Result::Ok((status, out, err))
        };

        let (status, out, err) = match opts.timeout {
            Some(d) => match timeout(d, wait).await {
                Ok(res) => res.map_err(MadError::from)?,
                Err(_) => {
                    warn!(command = %display_cmd, "command timed out, killing child");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    return Err(MadError::timeout(format!(
                        "command timed out after {d:?}: {display_cmd}"
                    ))
                    .with_field("command", &display_cmd));
                }
            },
            None => wait.await.map_err(MadError::from)?,
        };

        let combined = if err.is_empty() {
            out
        } else if out.is_empty() {
            err
        } else {
            format!("{out}\n{err}")
        };
        let exit_code = status.code().unwrap_or(-1);
        let result = CommandOutput {
            exit_code,
            output: combined,
        };

        if exit_code != 0 && !opts.can_fail {
            let shown = if secret { "<redacted output>" } else { &result.output };
            return Err(MadError::runtime(format!(
                "command failed with exit code {exit_code}: {display_cmd}"
            ))
            .with_field("command", &display_cmd)
            .with_field("output", shown));
        }

        Ok(result)
    }

    /// Convenience wrapper for `program foo bar` style calls with owned
    /// `String` args.
    pub async fn run_owned(
        &self,
        program: &str,
        args: Vec<String>,
        opts: &RunOptions,
    ) -> Result<CommandOutput> {
        self.run(program, &args, opts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let console = Console::new();
        let out = console
            .run("echo", &["hello"], &RunOptions::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, 0);
        assert!(out.output.contains("hello"));
    }

    #[tokio::test]
    async fn non_zero_exit_without_can_fail_errors() {
        let console = Console::new();
        let err = console
            .run("sh", &["-c", "exit 3"], &RunOptions::new())
            .await
            .unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Runtime);
    }

    #[tokio::test]
    async fn non_zero_exit_with_can_fail_returns_output() {
        let console = Console::new();
        let out = console
            .run("sh", &["-c", "exit 7"], &RunOptions::new().can_fail(true))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 7);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn timeout_kills_child_and_errors() {
        let console = Console::new();
        let err = console
            .run(
                "sh",
                &["-c", "sleep 5"],
                &RunOptions::new().timeout(Duration::from_millis(100)),
            )
            .await
            .unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Timeout);
    }
}
