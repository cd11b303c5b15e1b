//! Kubernetes backend, driven through `kubectl`.
//!
//! Each task becomes a `batch/v1` Job named after the task ID and
//! labelled `app=tes-worker`. The job runs `tes worker run` in the
//! configured image, which reports back to the server over HTTP.

use std::process::Stdio;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::reconcile::{JobProvider, JobState, JobStatus};
use super::template::{TemplateVars, render};
use super::ComputeBackend;
use crate::config::KubernetesConfig;
use crate::error::{Error, Result};
use crate::model::Task;

/// Label selecting the jobs this backend owns.
pub const WORKER_LABEL: &str = "app=tes-worker";

pub struct KubernetesBackend {
    kubectl: String,
    namespace: String,
    image: String,
    template: String,
    service_account: String,
    server_address: String,
}

impl KubernetesBackend {
    pub fn new(conf: &KubernetesConfig, server_address: &str) -> Self {
        Self {
            kubectl: conf.kubectl.clone(),
            namespace: conf.namespace.clone(),
            image: conf.image.clone(),
            template: conf.template.clone(),
            service_account: conf.service_account.clone(),
            server_address: server_address.to_string(),
        }
    }

    fn worker_args(&self, task_id: &str) -> Vec<String> {
        vec![
            "tes".into(),
            "worker".into(),
            "run".into(),
            "--task-id".into(),
            task_id.into(),
            "--server-address".into(),
            self.server_address.clone(),
        ]
    }

    /// The job manifest for `task`, as JSON.
    pub fn manifest(&self, task: &Task) -> Result<String> {
        if !self.template.is_empty() {
            let mut vars = TemplateVars::for_task(task, &self.worker_args(&task.id).join(" "), "");
            vars.set("Namespace", self.namespace.clone());
            vars.set("Image", self.image.clone());
            vars.set("ServerAddress", self.server_address.clone());
            return Ok(render(&self.template, &vars));
        }

        let res = task.resources.clone().unwrap_or_default();
        let mut requests = serde_json::Map::new();
        if res.cpu_cores > 0 {
            requests.insert("cpu".into(), json!(res.cpu_cores.to_string()));
        }
        if res.ram_gb > 0.0 {
            requests.insert("memory".into(), json!(format!("{}Mi", (res.ram_gb * 1024.0) as u64)));
        }
        if res.disk_gb > 0.0 {
            requests.insert(
                "ephemeral-storage".into(),
                json!(format!("{}Mi", (res.disk_gb * 1024.0) as u64)),
            );
        }

        let mut pod_spec = json!({
            "restartPolicy": "Never",
            "containers": [{
                "name": "tes-worker",
                "image": self.image,
                "args": self.worker_args(&task.id),
                "resources": { "requests": requests },
            }],
        });
        if !self.service_account.is_empty() {
            pod_spec["serviceAccountName"] = json!(self.service_account);
        }

        let job = json!({
            "apiVersion": "batch/v1",
            "kind": "Job",
            "metadata": {
                "name": task.id,
                "namespace": self.namespace,
                "labels": { "app": "tes-worker", "task-id": task.id },
            },
            "spec": {
                "backoffLimit": 0,
                "completions": 1,
                "template": {
                    "metadata": { "labels": { "app": "tes-worker", "task-id": task.id } },
                    "spec": pod_spec,
                },
            },
        });
        Ok(serde_json::to_string(&job)?)
    }

    async fn kubectl(&self, args: &[&str], stdin: Option<&str>) -> Result<String> {
        let mut cmd = Command::new(&self.kubectl);
        cmd.arg("--namespace")
            .arg(&self.namespace)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if stdin.is_some() {
            cmd.stdin(Stdio::piped());
        }
        let mut child = cmd.spawn()?;
        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input.as_bytes()).await?;
            drop(pipe);
        }
        let out = child.wait_with_output().await?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).into_owned())
        } else {
            let stderr = String::from_utf8_lossy(&out.stderr).trim().to_string();
            if stderr.contains("AlreadyExists") || stderr.contains("already exists") {
                Err(Error::AlreadyExists(stderr))
            } else if stderr.contains("NotFound") || stderr.contains("not found") {
                Err(Error::NotFound(stderr))
            } else if stderr.contains("is invalid") {
                Err(Error::Permanent(stderr))
            } else {
                Err(Error::Transient(format!("kubectl {}: {stderr}", args.join(" "))))
            }
        }
    }

    async fn delete_job(&self, task_id: &str) -> Result<()> {
        match self
            .kubectl(
                &["delete", "job", task_id, "--ignore-not-found", "--cascade=foreground"],
                None,
            )
            .await
        {
            Ok(_) | Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ComputeBackend for KubernetesBackend {
    fn name(&self) -> &str {
        "kubernetes"
    }

    async fn submit(&self, task: &Task) -> Result<()> {
        let manifest = self.manifest(task)?;
        match self.kubectl(&["create", "-f", "-"], Some(&manifest)).await {
            Ok(_) => {
                info!(task_id = %task.id, "kubernetes job created");
                Ok(())
            }
            Err(Error::AlreadyExists(_)) => {
                debug!(task_id = %task.id, "kubernetes job already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        self.delete_job(id).await
    }
}

#[derive(Deserialize)]
struct JobList {
    #[serde(default)]
    items: Vec<Job>,
}

#[derive(Deserialize)]
struct Job {
    metadata: JobMetadata,
    #[serde(default)]
    status: JobStatusRaw,
}

#[derive(Deserialize)]
struct JobMetadata {
    name: String,
}

#[derive(Deserialize, Default)]
struct JobStatusRaw {
    #[serde(default)]
    active: u32,
    #[serde(default)]
    succeeded: u32,
    #[serde(default)]
    failed: u32,
    #[serde(default)]
    conditions: Vec<serde_json::Value>,
}

/// Parse `kubectl get jobs -o json` into job states keyed by task ID.
pub fn parse_job_list(out: &str) -> Result<Vec<JobStatus>> {
    let list: JobList = serde_json::from_str(out)?;
    Ok(list
        .items
        .into_iter()
        .map(|job| {
            let s = job.status;
            let (state, native) = if s.failed > 0 {
                (JobState::Failed, "Failed")
            } else if s.succeeded > 0 {
                (JobState::Succeeded, "Succeeded")
            } else if s.active > 0 {
                (JobState::Running, "Active")
            } else {
                (JobState::Queued, "Pending")
            };
            let mut status = JobStatus::new(job.metadata.name, state, native);
            if state == JobState::Failed {
                status = status.with_detail(serde_json::to_string(&s.conditions).unwrap_or_default());
            }
            status
        })
        .collect())
}

#[async_trait]
impl JobProvider for KubernetesBackend {
    fn provider_name(&self) -> &str {
        "kubernetes"
    }

    async fn job_states(&self, _active: &[Task]) -> Result<Vec<JobStatus>> {
        let out = self
            .kubectl(&["get", "jobs", "-l", WORKER_LABEL, "-o", "json"], None)
            .await?;
        parse_job_list(&out)
    }

    async fn cleanup(&self, task_id: &str) -> Result<()> {
        self.delete_job(task_id).await
    }
}
