//! Batch-scheduler backends: HTCondor, Slurm, PBS/Torque and Grid Engine.
//!
//! All four share one shape. A task is submitted by rendering a submit
//! script into `{work_dir}/{task_id}/` and handing it to the scheduler's
//! submit command; the scheduler's job ID is recorded as task metadata
//! under `{backend}_id`, which also marks the task as submitted. The
//! worker started by the script reports back to the server itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::reconcile::{JobProvider, JobState, JobStatus};
use super::template::{TemplateVars, render};
use super::ComputeBackend;
use crate::config::{ComputeBackendKind, HpcConfig};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::events::Event;
use crate::model::{Task, View};

/// Which scheduler a backend drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Htcondor,
    Slurm,
    Pbs,
    Gridengine,
}

impl Flavor {
    pub fn from_kind(kind: ComputeBackendKind) -> Option<Self> {
        match kind {
            ComputeBackendKind::Htcondor => Some(Flavor::Htcondor),
            ComputeBackendKind::Slurm => Some(Flavor::Slurm),
            ComputeBackendKind::Pbs => Some(Flavor::Pbs),
            ComputeBackendKind::Gridengine => Some(Flavor::Gridengine),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Flavor::Htcondor => "htcondor",
            Flavor::Slurm => "slurm",
            Flavor::Pbs => "pbs",
            Flavor::Gridengine => "gridengine",
        }
    }

    pub fn submit_cmd(self) -> &'static str {
        match self {
            Flavor::Htcondor => "condor_submit",
            Flavor::Slurm => "sbatch",
            Flavor::Pbs | Flavor::Gridengine => "qsub",
        }
    }

    pub fn cancel_cmd(self) -> &'static str {
        match self {
            Flavor::Htcondor => "condor_rm",
            Flavor::Slurm => "scancel",
            Flavor::Pbs | Flavor::Gridengine => "qdel",
        }
    }

    /// Metadata key holding the scheduler's job ID.
    pub fn id_key(self) -> String {
        format!("{}_id", self.name())
    }

    pub fn default_template(self) -> &'static str {
        match self {
            Flavor::Htcondor => HTCONDOR_TEMPLATE,
            Flavor::Slurm => SLURM_TEMPLATE,
            Flavor::Pbs => PBS_TEMPLATE,
            Flavor::Gridengine => GRIDENGINE_TEMPLATE,
        }
    }

    /// Pull the job ID out of the submit command's stdout.
    pub fn extract_id(self, stdout: &str) -> Option<String> {
        let mut tokens = stdout.split_whitespace();
        let id = match self {
            // "1 job(s) submitted to cluster 42."
            Flavor::Htcondor => tokens.next_back()?.trim_end_matches('.'),
            // "Submitted batch job 42"
            Flavor::Slurm => tokens.next_back()?,
            // "42.server"
            Flavor::Pbs => tokens.next()?,
            // "Your job 42 ("name") has been submitted"
            Flavor::Gridengine => tokens.nth(2)?,
        };
        (!id.is_empty()).then(|| id.to_string())
    }
}

const HTCONDOR_TEMPLATE: &str = r#"universe = vanilla
getenv = True
executable = /bin/sh
arguments = "-c '{{WorkerCommand}}'"
log = {{WorkDir}}/condor-event-log
error = {{WorkDir}}/tes-stderr
output = {{WorkDir}}/tes-stdout
request_cpus = {{Cpus}}
request_memory = {{RamGb}} GB
request_disk = {{DiskGb}} GB
requirements = (Zone == "{{Zone}}")
+ProjectName = "{{Project}}"
queue
"#;

const SLURM_TEMPLATE: &str = r#"#!/bin/bash
#SBATCH --job-name {{TaskId}}
#SBATCH --ntasks 1
#SBATCH --error {{WorkDir}}/tes-stderr
#SBATCH --output {{WorkDir}}/tes-stdout
#SBATCH --cpus-per-task {{Cpus}}
#SBATCH --mem {{RamGb}}GB
#SBATCH --tmp {{DiskGb}}GB
#SBATCH --partition {{Zone}}
#SBATCH --account {{Project}}

{{WorkerCommand}}
"#;

const PBS_TEMPLATE: &str = r#"#!/bin/bash
#PBS -N {{TaskId}}
#PBS -o {{WorkDir}}/tes-stdout
#PBS -e {{WorkDir}}/tes-stderr
#PBS -l nodes=1:ppn={{Cpus}}
#PBS -l mem={{RamGb}}gb
#PBS -l file={{DiskGb}}gb
#PBS -q {{Zone}}
#PBS -A {{Project}}

{{WorkerCommand}}
"#;

const GRIDENGINE_TEMPLATE: &str = r#"#!/bin/bash
#$ -N {{TaskId}}
#$ -o {{WorkDir}}/tes-stdout
#$ -e {{WorkDir}}/tes-stderr
#$ -pe mpi {{Cpus}}
#$ -l h_vmem={{RamGb}}G
#$ -l h_fsize={{DiskGb}}G
#$ -q {{Zone}}
#$ -P {{Project}}

{{WorkerCommand}}
"#;

pub struct HpcBackend {
    flavor: Flavor,
    template: String,
    work_dir: PathBuf,
    /// Worker invocation without `--task-id`.
    worker_command: String,
    db: Arc<dyn Database>,
}

impl HpcBackend {
    pub fn new(
        flavor: Flavor,
        conf: &HpcConfig,
        work_dir: &Path,
        worker_command: String,
        db: Arc<dyn Database>,
    ) -> Result<Self> {
        let template = match &conf.template_file {
            Some(path) => std::fs::read_to_string(path)
                .map_err(|e| Error::Config(format!("reading template {}: {e}", path.display())))?,
            None if conf.template.is_empty() => flavor.default_template().to_string(),
            None => conf.template.clone(),
        };
        Ok(Self {
            flavor,
            template,
            work_dir: std::path::absolute(work_dir)?,
            worker_command,
            db,
        })
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    /// Render the submit script for `task`.
    pub fn submit_script(&self, task: &Task) -> String {
        let work_dir = self.work_dir.join(&task.id);
        let command = format!("{} --task-id {}", self.worker_command, task.id);
        let vars = TemplateVars::for_task(task, &command, &work_dir.to_string_lossy());
        render(&self.template, &vars)
    }

    fn backend_id(&self, task: &Task) -> Option<String> {
        let key = self.flavor.id_key();
        task.logs
            .iter()
            .find_map(|log| log.metadata.get(&key))
            .filter(|id| !id.is_empty())
            .cloned()
    }

    async fn write_script(&self, task: &Task) -> Result<PathBuf> {
        let dir = self.work_dir.join(&task.id);
        tokio::fs::create_dir_all(&dir).await?;
        let path = dir.join(format!("{}.submit", self.flavor.name()));
        tokio::fs::write(&path, self.submit_script(task)).await?;
        Ok(path)
    }

    async fn run_cancel(&self, backend_id: &str) -> Result<()> {
        let out = Command::new(self.flavor.cancel_cmd())
            .arg(backend_id)
            .output()
            .await?;
        if !out.status.success() {
            return Err(Error::Other(format!(
                "{} {backend_id}: {}",
                self.flavor.cancel_cmd(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ComputeBackend for HpcBackend {
    fn name(&self) -> &str {
        self.flavor.name()
    }

    async fn submit(&self, task: &Task) -> Result<()> {
        if let Some(id) = self.backend_id(task) {
            debug!(task_id = %task.id, backend_id = %id, "task already submitted");
            return Ok(());
        }
        if let Some(res) = &task.resources {
            if res.backend_parameters_strict && !res.backend_parameters.is_empty() {
                return Err(Error::Permanent("backend parameters not supported".into()));
            }
        }

        let script = self.write_script(task).await?;
        let out = Command::new(self.flavor.submit_cmd())
            .arg(&script)
            .output()
            .await?;
        let stdout = String::from_utf8_lossy(&out.stdout);
        if !out.status.success() {
            return Err(Error::Permanent(format!(
                "{} failed: {}",
                self.flavor.submit_cmd(),
                String::from_utf8_lossy(&out.stderr).trim()
            )));
        }
        let backend_id = self.flavor.extract_id(&stdout).ok_or_else(|| {
            Error::Permanent(format!("no job id in {} output: {stdout}", self.flavor.submit_cmd()))
        })?;

        info!(task_id = %task.id, backend_id = %backend_id, backend = self.flavor.name(), "job submitted");
        self.db
            .write_event(&Event::metadata(
                &task.id,
                0,
                crate::events::fields([(self.flavor.id_key(), backend_id)]),
            ))
            .await
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        let task = self.db.get_task(id, View::Basic).await?;
        let backend_id = self.backend_id(&task).ok_or_else(|| {
            Error::Other(format!("no {} found in metadata for task {id}", self.flavor.id_key()))
        })?;
        self.run_cancel(&backend_id).await
    }
}

#[async_trait]
impl JobProvider for HpcBackend {
    fn provider_name(&self) -> &str {
        self.flavor.name()
    }

    async fn job_states(&self, active: &[Task]) -> Result<Vec<JobStatus>> {
        let by_backend_id: std::collections::HashMap<String, &str> = active
            .iter()
            .filter_map(|t| self.backend_id(t).map(|b| (b, t.id.as_str())))
            .collect();
        if by_backend_id.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = by_backend_id.keys().cloned().collect();
        let external = query_states(self.flavor, &ids).await?;

        Ok(external
            .into_iter()
            .filter_map(|job| {
                let task_id = *by_backend_id.get(&job.id)?;
                let mut status = JobStatus::new(task_id, job.state, job.native).with_detail(job.reason);
                if job.remove {
                    status = status.removable();
                }
                Some(status)
            })
            .collect())
    }

    async fn cleanup(&self, task_id: &str) -> Result<()> {
        let task = self.db.get_task(task_id, View::Basic).await?;
        match self.backend_id(&task) {
            Some(id) => self.run_cancel(&id).await,
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler state queries
// ---------------------------------------------------------------------------

/// A scheduler job as reported by its status command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalJob {
    pub id: String,
    pub state: JobState,
    pub native: String,
    pub reason: String,
    pub remove: bool,
}

impl ExternalJob {
    fn new(id: impl Into<String>, state: JobState, native: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state,
            native: native.into(),
            reason: String::new(),
            remove: false,
        }
    }

    fn failed(id: impl Into<String>, native: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            ..Self::new(id, JobState::Failed, native)
        }
    }
}

async fn command_output(program: &str, args: &[&str]) -> Result<String> {
    let out = Command::new(program).args(args).output().await?;
    if !out.status.success() {
        return Err(Error::Transient(format!(
            "{program} failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

async fn query_states(flavor: Flavor, ids: &[String]) -> Result<Vec<ExternalJob>> {
    let joined = ids.join(",");
    match flavor {
        Flavor::Slurm => {
            let squeue = command_output(
                "squeue",
                &["--noheader", "--Format", "jobid,state,reason", "--job", &joined],
            )
            .await?;
            let sacct = command_output(
                "sacct",
                &["--noheader", "--format", "jobid,state", "--job", &joined],
            )
            .await?;
            let mut jobs = parse_squeue(&squeue);
            jobs.extend(parse_sacct(&sacct));
            Ok(jobs)
        }
        Flavor::Htcondor => {
            let attrs = "ClusterId,JobStatus,ExitCode";
            let mut args = vec!["-json", "-attributes", attrs];
            args.extend(ids.iter().map(String::as_str));
            let queue = command_output("condor_q", &args).await?;
            let history = command_output("condor_history", &args).await?;
            let mut jobs = parse_condor_json(&queue)?;
            jobs.extend(parse_condor_json(&history)?);
            for job in jobs.iter_mut().filter(|j| j.state == JobState::Queued) {
                let analysis = command_output("condor_q", &["-analyze", &job.id])
                    .await
                    .unwrap_or_default();
                if analysis.contains("No machines matched the jobs's constraints") {
                    job.state = JobState::Failed;
                    job.reason = "no machines matched the job's constraints".into();
                    job.remove = true;
                }
            }
            Ok(jobs)
        }
        Flavor::Pbs => {
            let mut args = vec!["-x", "-f", "-F", "json"];
            args.extend(ids.iter().map(String::as_str));
            let out = command_output("qstat", &args).await?;
            parse_pbs_json(&out)
        }
        Flavor::Gridengine => {
            let out = command_output("qstat", &[]).await?;
            Ok(parse_gridengine(&out))
        }
    }
}

/// `squeue --noheader --Format jobid,state,reason` output.
pub fn parse_squeue(out: &str) -> Vec<ExternalJob> {
    out.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let (id, state, reason) = (parts.next()?, parts.next()?, parts.next().unwrap_or(""));
            let job = match state {
                "PENDING" if reason == "PartitionConfig" => ExternalJob {
                    remove: true,
                    ..ExternalJob::failed(id, state, "No suitable partition available")
                },
                _ => ExternalJob::new(id, slurm_state(state)?, state),
            };
            Some(job)
        })
        .collect()
}

/// `sacct --noheader --format jobid,state` output. Job steps
/// (`42.batch`) are reported too; callers match on the bare ID.
pub fn parse_sacct(out: &str) -> Vec<ExternalJob> {
    out.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let (id, state) = (parts.next()?, parts.next()?);
            Some(ExternalJob::new(id, slurm_state(state)?, state))
        })
        .collect()
}

fn slurm_state(state: &str) -> Option<JobState> {
    Some(match state {
        "PENDING" | "CONFIGURING" => JobState::Queued,
        "RUNNING" | "RESIZING" | "COMPLETING" | "SUSPENDED" => JobState::Running,
        "COMPLETED" => JobState::Succeeded,
        "CANCELLED" | "DEADLINE" | "FAILED" | "NODE_FAIL" | "PREEMPTED" | "TIMEOUT" | "STOPPED"
        | "REVOKED" | "SPECIAL_EXIT" | "OUT_OF_MEMORY" => JobState::Failed,
        _ => return None,
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CondorRecord {
    cluster_id: u64,
    job_status: u32,
    #[serde(default)]
    exit_code: Option<i64>,
}

/// `condor_q -json` / `condor_history -json` output.
pub fn parse_condor_json(out: &str) -> Result<Vec<ExternalJob>> {
    if out.trim().is_empty() {
        return Ok(Vec::new());
    }
    let records: Vec<CondorRecord> = serde_json::from_str(out)?;
    Ok(records
        .into_iter()
        .filter_map(|r| {
            let id = r.cluster_id.to_string();
            let job = match r.job_status {
                1 => ExternalJob::new(id, JobState::Queued, "Idle"),
                2 => ExternalJob::new(id, JobState::Running, "Running"),
                3 => ExternalJob::failed(id, "Removed", "htcondor job was removed"),
                4 if r.exit_code.unwrap_or(0) == 0 => {
                    ExternalJob::new(id, JobState::Succeeded, "Completed")
                }
                4 => ExternalJob::failed(id, "Completed", "worker exited with non-zero status"),
                5 => ExternalJob::new(id, JobState::Running, "Held"),
                6 => ExternalJob::failed(id, "Submission_err", "task encountered submission error"),
                _ => return None,
            };
            Some(job)
        })
        .collect())
}

#[derive(Deserialize)]
struct PbsStatus {
    #[serde(default, rename = "Jobs")]
    jobs: std::collections::BTreeMap<String, PbsJob>,
}

#[derive(Deserialize)]
struct PbsJob {
    job_state: String,
    #[serde(default, rename = "Exit_status")]
    exit_status: Option<i64>,
}

/// `qstat -x -f -F json` output.
pub fn parse_pbs_json(out: &str) -> Result<Vec<ExternalJob>> {
    if out.trim().is_empty() {
        return Ok(Vec::new());
    }
    let status: PbsStatus = serde_json::from_str(out)?;
    Ok(status
        .jobs
        .into_iter()
        .filter_map(|(id, job)| {
            let native = match job.job_state.as_str() {
                "C" | "F" => "Complete",
                "E" => "Exiting",
                "H" => "Held",
                "Q" => "Queued",
                "R" => "Running",
                "S" => "Suspended",
                "T" => "Moving",
                "W" => "Waiting",
                _ => return None,
            };
            let job = match native {
                "Complete" if job.exit_status.unwrap_or(0) == 0 => {
                    ExternalJob::new(id, JobState::Succeeded, native)
                }
                "Complete" => ExternalJob::failed(id, native, "worker exited with non-zero status"),
                "Queued" => ExternalJob::new(id, JobState::Queued, native),
                _ => ExternalJob::new(id, JobState::Running, native),
            };
            Some(job)
        })
        .collect())
}

/// Plain `qstat` output: a two-line header, then
/// `job-ID prior name user state ...` rows. Finished jobs are not listed.
pub fn parse_gridengine(out: &str) -> Vec<ExternalJob> {
    out.lines()
        .skip(2)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            let (id, state) = (*cols.first()?, *cols.get(4)?);
            let job = if state.contains('E') {
                ExternalJob::failed(id, state, "grid engine job is in error state")
            } else if state.contains('d') {
                ExternalJob::failed(id, state, "grid engine job was deleted")
            } else if state.contains('r') || state.contains('t') {
                ExternalJob::new(id, JobState::Running, state)
            } else {
                ExternalJob::new(id, JobState::Queued, state)
            };
            Some(job)
        })
        .collect()
}
