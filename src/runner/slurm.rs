//! SLURM runner: connects to the cluster's login node over SSH, stages the
//! job scripts, submits a setup job followed by a dependent job array, and
//! polls `squeue`/`sacct` until every array task reaches a terminal state.

use async_trait::async_trait;
use openssh::{KnownHosts, Session};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

use super::{DistributedResult, ExecutionResult, ExecutionStatus, Inventory, Runner, WorkloadSpec};
use crate::console::{Console, RunOptions};
use crate::error::{MadError, Result};
use crate::model::SlurmClusterConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(30);
const SETUP_SCRIPT: &str = "setup_environment.sh";
const JOB_ARRAY_SCRIPT: &str = "madengine_job_array.sh";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlurmJobState {
    Pending,
    Running,
    Completed,
    Failed,
}

fn terminal(state: SlurmJobState) -> bool {
    matches!(state, SlurmJobState::Completed | SlurmJobState::Failed)
}

fn parse_squeue_state(s: &str) -> Option<SlurmJobState> {
    match s.trim() {
        "PENDING" | "PD" => Some(SlurmJobState::Pending),
        "RUNNING" | "R" => Some(SlurmJobState::Running),
        _ => None,
    }
}

/// Parses a `sacct` `State,ExitCode` line, e.g. `COMPLETED,0:0`. Success is
/// `COMPLETED` with an exit code starting `"0:"`.
fn parse_sacct_line(line: &str) -> Option<(SlurmJobState, bool)> {
    let mut parts = line.trim().splitn(2, ',');
    let state = parts.next()?.trim();
    let exit_code = parts.next().unwrap_or("").trim();
    let job_state = match state {
        "COMPLETED" => SlurmJobState::Completed,
        "PENDING" => SlurmJobState::Pending,
        "RUNNING" => SlurmJobState::Running,
        _ => SlurmJobState::Failed,
    };
    let success = job_state == SlurmJobState::Completed && exit_code.starts_with("0:");
    Some((job_state, success))
}

pub struct SlurmRunner {
    session: Option<Session>,
    cluster: Option<SlurmClusterConfig>,
    submitted_job_ids: Vec<String>,
    console: Console,
    /// Local directory holding the pre-generated job scripts (spec.md §4.8
    /// setup step: "validate that a set of pre-generated job scripts exists
    /// locally"). Defaults to `./job_scripts`.
    job_scripts_dir: PathBuf,
}

impl Default for SlurmRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SlurmRunner {
    pub fn new() -> Self {
        Self {
            session: None,
            cluster: None,
            submitted_job_ids: Vec::new(),
            console: Console::new(),
            job_scripts_dir: PathBuf::from("job_scripts"),
        }
    }

    pub fn with_job_scripts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.job_scripts_dir = dir.into();
        self
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| MadError::orchestration("slurm runner not set up"))
    }

    async fn run_remote(&self, program: &str, args: &[&str]) -> Result<String> {
        let mut cmd = self.session()?.command(program);
        cmd.args(args);
        let out = cmd.output().await.map_err(|e| {
            MadError::runner(format!("{program} failed over ssh: {e}")).with_field("command", program)
        })?;
        if !out.status.success() {
            return Err(MadError::runner(format!(
                "{program} exited with {:?}",
                out.status.code()
            ))
            .with_field("stderr", String::from_utf8_lossy(&out.stderr)));
        }
        Ok(String::from_utf8_lossy(&out.stdout).to_string())
    }
}

#[async_trait]
impl Runner for SlurmRunner {
    fn kind(&self) -> &'static str {
        "slurm"
    }

    async fn setup_infrastructure(&mut self, inventory: &Inventory) -> Result<()> {
        let cluster = inventory
            .slurm_cluster
            .clone()
            .ok_or_else(|| MadError::validation("inventory has no slurm_cluster section"))?;

        // "validate that a set of pre-generated job scripts exists locally"
        // (spec.md §4.8) happens before any network side effect.
        if !self.job_scripts_dir.join(SETUP_SCRIPT).is_file() {
            return Err(MadError::validation(format!(
                "job script '{SETUP_SCRIPT}' not found under '{}'",
                self.job_scripts_dir.display()
            )));
        }
        if !self.job_scripts_dir.join(JOB_ARRAY_SCRIPT).is_file() {
            return Err(MadError::validation(format!(
                "job script '{JOB_ARRAY_SCRIPT}' not found under '{}'",
                self.job_scripts_dir.display()
            )));
        }

        let session = Session::connect(format!("ssh://{}", cluster.login_node), KnownHosts::Add)
            .await
            .map_err(|e| {
                MadError::connection(format!("failed to reach slurm login node: {e}"))
                    .with_field("login_node", &cluster.login_node)
            })?;
        self.session = Some(session);
        self.cluster = Some(cluster.clone());

        let sinfo_out = self
            .run_remote("sinfo", &["-h", "-o", "%P"])
            .await
            .map_err(|e| MadError::connection(format!("cannot reach slurm controller: {e}")))?;
        let partitions: Vec<&str> = sinfo_out.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        info!(partitions = ?partitions, "slurm partitions listed");

        self.stage_job_scripts(&cluster).await?;
        Ok(())
    }

    async fn execute_workload(&mut self, workload: &WorkloadSpec) -> Result<DistributedResult> {
        let cluster = self
            .cluster
            .clone()
            .ok_or_else(|| MadError::orchestration("slurm runner not set up"))?;
        let remote_scripts_dir = format!("{}/job_scripts", cluster.workspace);
        let remote_setup_script = format!("{remote_scripts_dir}/{SETUP_SCRIPT}");
        let remote_job_array_script = format!("{remote_scripts_dir}/{JOB_ARRAY_SCRIPT}");

        let setup_out = self
            .run_remote("sbatch", &["--parsable", &remote_setup_script])
            .await?;
        let setup_job_id = setup_out.trim().to_string();
        self.submitted_job_ids.push(setup_job_id.clone());

        let dependency = format!("--dependency=afterok:{setup_job_id}");
        let array_arg = format!("--array=0-{}", cluster.node_count.saturating_sub(1));
        let array_out = self
            .run_remote(
                "sbatch",
                &[
                    "--parsable",
                    &dependency,
                    &array_arg,
                    &remote_job_array_script,
                    &workload.image_ref,
                ],
            )
            .await?;
        let array_job_id = array_out.trim().to_string();
        self.submitted_job_ids.push(array_job_id.clone());

        info!(setup_job_id = %setup_job_id, array_job_id = %array_job_id, "submitted slurm jobs");
        self.monitor_job(
            &array_job_id,
            cluster.node_count,
            &workload.model,
            workload.timeout_secs,
        )
        .await
    }

    async fn cleanup_infrastructure(&mut self) {
        for job_id in self.submitted_job_ids.drain(..) {
            if let Some(session) = &self.session {
                let mut cmd = session.command("scancel");
                cmd.arg(&job_id);
                if let Err(e) = cmd.status().await {
                    warn!(job_id = %job_id, error = %e, "failed to scancel job during cleanup");
                }
            }
        }
        if let Some(session) = self.session.take() {
            if let Err(e) = session.close().await {
                warn!(error = %e, "failed to close slurm login-node session");
            }
        }
    }
}

impl SlurmRunner {
    /// Copies every `*.sh` (and an optional `submit_jobs.py`) from the local
    /// `job_scripts_dir` to `<workspace>/job_scripts/` on the login node and
    /// marks them executable (spec.md §4.8 setup step). Local existence of
    /// the required scripts has already been checked by the caller.
    async fn stage_job_scripts(&self, cluster: &SlurmClusterConfig) -> Result<()> {
        let remote_dir = format!("{}/job_scripts", cluster.workspace);
        self.run_remote("mkdir", &["-p", &remote_dir]).await?;

        let mut entries = tokio::fs::read_dir(&self.job_scripts_dir)
            .await
            .map_err(MadError::from)?;
        let mut staged = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(MadError::from)? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !(name.ends_with(".sh") || name == "submit_jobs.py") {
                continue;
            }
            let destination = format!("{}:{remote_dir}/{name}", cluster.login_node);
            self.console
                .run(
                    "scp",
                    &[path.display().to_string().as_str(), destination.as_str()],
                    &RunOptions::new(),
                )
                .await?;
            staged.push(name.to_string());
        }
        for name in &staged {
            self.run_remote("chmod", &["+x", &format!("{remote_dir}/{name}")]).await?;
        }
        info!(count = staged.len(), dir = %remote_dir, "staged slurm job scripts");
        Ok(())
    }

    /// Polls `squeue` every [`POLL_INTERVAL`] until every task in the array
    /// reaches a terminal state or `timeout_secs` elapses (spec.md §4.8). On
    /// a timeout the outer deadline fires with jobs still non-terminal: a
    /// TIMEOUT result is emitted per still-active task rather than waiting
    /// forever, and whatever already finished is still collected normally.
    async fn monitor_job(
        &self,
        array_job_id: &str,
        node_count: u32,
        model: &str,
        timeout_secs: Option<u64>,
    ) -> Result<DistributedResult> {
        let deadline = timeout_secs
            .filter(|s| *s > 0)
            .map(|s| Instant::now() + Duration::from_secs(s));
        let mut timed_out = false;
        loop {
            let squeue_out = self
                .run_remote("squeue", &["-j", array_job_id, "-h", "-o", "%T"])
                .await
                .unwrap_or_default();
            let still_active = squeue_out
                .lines()
                .filter_map(parse_squeue_state)
                .any(|s| !terminal(s));
            if !still_active {
                break;
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    timed_out = true;
                    break;
                }
            }
            sleep(POLL_INTERVAL).await;
        }
        self.collect_results(array_job_id, node_count, model, timed_out).await
    }

    async fn collect_results(
        &self,
        array_job_id: &str,
        node_count: u32,
        model: &str,
        timed_out: bool,
    ) -> Result<DistributedResult> {
        let mut results = Vec::new();
        for task_id in 0..node_count {
            let job_ref = format!("{array_job_id}_{task_id}");

            if timed_out && self.task_still_active(&job_ref).await {
                results.push(ExecutionResult {
                    node: format!("task-{task_id}"),
                    model: model.to_string(),
                    status: ExecutionStatus::Timeout,
                    duration_secs: 0.0,
                    error_message: Some(format!(
                        "slurm task {job_ref} did not reach a terminal state before the workload deadline"
                    )),
                    output: None,
                });
                continue;
            }

            let sacct_out = self
                .run_remote(
                    "sacct",
                    &[
                        "-j",
                        &job_ref,
                        "-n",
                        "-P",
                        "--delimiter=,",
                        "-o",
                        "State,ExitCode,Elapsed",
                    ],
                )
                .await
                .unwrap_or_default();
            let first_line = sacct_out.lines().next().unwrap_or("");
            let mut fields = first_line.splitn(3, ',');
            let state_field = fields.next().unwrap_or("");
            let exit_field = fields.next().unwrap_or("");
            let elapsed_field = fields.next().unwrap_or("0:00:00");

            let (_, success) =
                parse_sacct_line(&format!("{state_field},{exit_field}")).unwrap_or((SlurmJobState::Failed, false));

            results.push(ExecutionResult {
                node: format!("task-{task_id}"),
                model: model.to_string(),
                status: if success {
                    ExecutionStatus::Success
                } else {
                    ExecutionStatus::Failed
                },
                duration_secs: parse_elapsed(elapsed_field),
                error_message: if success {
                    None
                } else {
                    Some(format!(
                        "slurm task {job_ref} ended in state {state_field} (exit code {exit_field})"
                    ))
                },
                output: None,
            });
        }
        Ok(DistributedResult::from_results(results))
    }

    async fn task_still_active(&self, job_ref: &str) -> bool {
        let squeue_out = self
            .run_remote("squeue", &["-j", job_ref, "-h", "-o", "%T"])
            .await
            .unwrap_or_default();
        squeue_out.lines().filter_map(parse_squeue_state).any(|s| !terminal(s))
    }
}

/// Parses a SLURM `Elapsed` field (`[D-]HH:MM:SS`) into seconds.
fn parse_elapsed(elapsed: &str) -> f64 {
    let (days, rest) = match elapsed.split_once('-') {
        Some((d, r)) => (d.parse::<f64>().unwrap_or(0.0), r),
        None => (0.0, elapsed),
    };
    let parts: Vec<&str> = rest.split(':').collect();
    let (h, m, s) = match parts.as_slice() {
        [h, m, s] => (
            h.parse::<f64>().unwrap_or(0.0),
            m.parse::<f64>().unwrap_or(0.0),
            s.parse::<f64>().unwrap_or(0.0),
        ),
        [m, s] => (0.0, m.parse::<f64>().unwrap_or(0.0), s.parse::<f64>().unwrap_or(0.0)),
        _ => (0.0, 0.0, 0.0),
    };
    days * 86400.0 + h * 3600.0 + m * 60.0 + s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sacct_success_requires_completed_and_zero_exit() {
        let (state, success) = parse_sacct_line("COMPLETED,0:0").unwrap();
        assert_eq!(state, SlurmJobState::Completed);
        assert!(success);

        let (_, success) = parse_sacct_line("COMPLETED,1:0").unwrap();
        assert!(!success);

        let (state, success) = parse_sacct_line("FAILED,1:0").unwrap();
        assert_eq!(state, SlurmJobState::Failed);
        assert!(!success);
    }

    #[test]
    fn elapsed_parses_with_and_without_days() {
        assert_eq!(parse_elapsed("00:01:30"), 90.0);
        assert_eq!(parse_elapsed("1-00:00:00"), 86400.0);
    }

    #[test]
    fn squeue_state_recognizes_active_states() {
        assert_eq!(parse_squeue_state("RUNNING"), Some(SlurmJobState::Running));
        assert_eq!(parse_squeue_state("PD"), Some(SlurmJobState::Pending));
        assert_eq!(parse_squeue_state("COMPLETED"), None);
    }

    /// spec.md §8 scenario 3: `1234_0 COMPLETED 0:0 00:01:02 gpu01` succeeds
    /// with duration 62; `1234_1 FAILED 1:0 00:00:30 gpu02` fails with an
    /// error mentioning both the state and the exit code.
    #[test]
    fn scenario_3_job_array_one_task_fails() {
        let (_, success_0) = parse_sacct_line("COMPLETED,0:0").unwrap();
        assert!(success_0);
        assert_eq!(parse_elapsed("00:01:02"), 62.0);

        let (state_1, success_1) = parse_sacct_line("FAILED,1:0").unwrap();
        assert_eq!(state_1, SlurmJobState::Failed);
        assert!(!success_1);
        let message = "slurm task 1234_1 ended in state FAILED (exit code 1:0)";
        assert!(message.contains("FAILED"));
        assert!(message.contains("1:0"));
    }

    fn inventory_with_cluster() -> Inventory {
        Inventory {
            nodes: vec![],
            gpu_nodes: vec![],
            slurm_cluster: Some(SlurmClusterConfig {
                login_node: "login01.cluster.example".to_string(),
                partition: None,
                account: None,
                node_count: 2,
                workspace: "~/madorc-workspace".to_string(),
            }),
        }
    }

    /// spec.md §4.8: local script validation must fail before any network
    /// call when the job scripts directory is missing the setup script, even
    /// against an unreachable login node.
    #[tokio::test]
    async fn setup_rejects_missing_local_scripts_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = SlurmRunner::new().with_job_scripts_dir(dir.path());
        let err = runner
            .setup_infrastructure(&inventory_with_cluster())
            .await
            .unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Validation);
        assert!(err.to_string().contains(SETUP_SCRIPT));
        assert!(runner.session.is_none());
    }

    #[tokio::test]
    async fn setup_rejects_missing_job_array_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETUP_SCRIPT), "#!/bin/sh\n").unwrap();
        let mut runner = SlurmRunner::new().with_job_scripts_dir(dir.path());
        let err = runner
            .setup_infrastructure(&inventory_with_cluster())
            .await
            .unwrap_err();
        assert_eq!(err.category, crate::error::ErrorCategory::Validation);
        assert!(err.to_string().contains(JOB_ARRAY_SCRIPT));
    }
}
