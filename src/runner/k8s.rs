//! Kubernetes Job runner: submits one batch `Job` per node (feature-gated
//! behind `runner-k8s`, built on `kube` + `k8s-openapi`, matching the
//! client/API patterns used elsewhere in the retrieval pack's operator-style
//! crates).

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{info, warn};

use super::{DistributedResult, ExecutionResult, ExecutionStatus, Inventory, Runner, WorkloadSpec};
use crate::error::{MadError, Result};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct K8sRunner {
    client: Option<Client>,
    namespace: String,
    node_count: usize,
    submitted_job_names: Vec<String>,
}

impl Default for K8sRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl K8sRunner {
    pub fn new() -> Self {
        Self {
            client: None,
            namespace: "default".to_string(),
            node_count: 1,
            submitted_job_names: Vec::new(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    fn jobs_api(&self) -> Result<Api<Job>> {
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| MadError::orchestration("k8s runner not set up"))?;
        Ok(Api::namespaced(client.clone(), &self.namespace))
    }

    fn build_job(&self, workload: &WorkloadSpec, rank: usize) -> Job {
        let name = format!("madorc-{}-{rank}", slug(&workload.model));
        let env: Vec<EnvVar> = workload
            .env
            .iter()
            .map(|(k, v)| EnvVar {
                name: k.clone(),
                value: Some(v.clone()),
                ..Default::default()
            })
            .chain(std::iter::once(EnvVar {
                name: "NODE_RANK".to_string(),
                value: Some(rank.to_string()),
                ..Default::default()
            }))
            .collect();

        Job {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([
                    ("app".to_string(), "madorc".to_string()),
                    ("model".to_string(), slug(&workload.model)),
                ])),
                ..Default::default()
            },
            spec: Some(JobSpec {
                backoff_limit: Some(0),
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        restart_policy: Some("Never".to_string()),
                        containers: vec![Container {
                            name: "workload".to_string(),
                            image: Some(workload.image_ref.clone()),
                            command: if workload.command.is_empty() {
                                None
                            } else {
                                Some(workload.command.clone())
                            },
                            env: Some(env),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

fn slug(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect()
}

#[async_trait]
impl Runner for K8sRunner {
    fn kind(&self) -> &'static str {
        "k8s"
    }

    async fn setup_infrastructure(&mut self, inventory: &Inventory) -> Result<()> {
        self.node_count = inventory.all_nodes().len().max(1);
        let client = Client::try_default().await.map_err(|e| {
            MadError::connection(format!("failed to build kubernetes client: {e}"))
                .with_suggestion("ensure KUBECONFIG or in-cluster config is available")
        })?;
        self.client = Some(client);
        Ok(())
    }

    async fn execute_workload(&mut self, workload: &WorkloadSpec) -> Result<DistributedResult> {
        let api = self.jobs_api()?;
        let mut dist = DistributedResult::new();
        let start = Instant::now();

        for rank in 0..self.node_count {
            let job = self.build_job(workload, rank);
            let name = job.metadata.name.clone().unwrap_or_default();
            match api.create(&PostParams::default(), &job).await {
                Ok(_) => {
                    info!(job = %name, "submitted k8s job");
                    self.submitted_job_names.push(name);
                }
                Err(e) => {
                    warn!(job = %name, error = %e, "failed to submit k8s job");
                    dist.add(ExecutionResult {
                        node: format!("rank-{rank}"),
                        model: workload.model.clone(),
                        status: ExecutionStatus::Failed,
                        duration_secs: start.elapsed().as_secs_f64(),
                        error_message: Some(e.to_string()),
                        output: None,
                    });
                }
            }
        }

        let deadline = workload
            .timeout_secs
            .map(|s| Duration::from_secs(s.max(1)));
        let poll_start = Instant::now();

        for (rank, name) in self.submitted_job_names.clone().into_iter().enumerate() {
            let result = self.poll_job(&api, &name, poll_start, deadline).await;
            dist.add(match result {
                Ok(status) => ExecutionResult {
                    node: format!("rank-{rank}"),
                    model: workload.model.clone(),
                    status,
                    duration_secs: poll_start.elapsed().as_secs_f64(),
                    error_message: if status == ExecutionStatus::Success {
                        None
                    } else {
                        Some(format!("job {name} did not complete successfully"))
                    },
                    output: None,
                },
                Err(e) => ExecutionResult {
                    node: format!("rank-{rank}"),
                    model: workload.model.clone(),
                    status: ExecutionStatus::Failed,
                    duration_secs: poll_start.elapsed().as_secs_f64(),
                    error_message: Some(e.message.clone()),
                    output: None,
                },
            });
        }

        Ok(dist)
    }

    async fn cleanup_infrastructure(&mut self) {
        if let Ok(api) = self.jobs_api() {
            for name in self.submitted_job_names.drain(..) {
                let params = DeleteParams {
                    propagation_policy: Some(kube::api::PropagationPolicy::Background),
                    ..Default::default()
                };
                if let Err(e) = api.delete(&name, &params).await {
                    warn!(job = %name, error = %e, "failed to delete k8s job during cleanup");
                }
            }
        }
    }
}

impl K8sRunner {
    async fn poll_job(
        &self,
        api: &Api<Job>,
        name: &str,
        poll_start: Instant,
        deadline: Option<Duration>,
    ) -> Result<ExecutionStatus> {
        loop {
            let job = api
                .get(name)
                .await
                .map_err(|e| MadError::runner(format!("failed to poll job {name}: {e}")))?;
            if let Some(status) = job.status {
                if status.succeeded.unwrap_or(0) > 0 {
                    return Ok(ExecutionStatus::Success);
                }
                if status.failed.unwrap_or(0) > 0 {
                    return Ok(ExecutionStatus::Failed);
                }
            }
            if let Some(d) = deadline {
                if poll_start.elapsed() >= d {
                    return Ok(ExecutionStatus::Timeout);
                }
            }
            sleep(POLL_INTERVAL).await;
        }
    }
}
