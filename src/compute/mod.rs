//! Compute backends and the plumbing that feeds them.
//!
//! A [`ComputeBackend`] knows how to start and stop the worker for one
//! task on some execution substrate. The [`ComputeSink`] adapts a backend
//! to the event chain: task creation submits, cancellation cancels, and
//! everything else is ignored. The [`dispatch::Dispatcher`] drains the
//! embedded queue into the sink, and a [`reconcile::Reconciler`] per
//! backend corrects tasks whose external job died without reporting.

pub mod dispatch;
pub mod hpc;
pub mod kubernetes;
pub mod local;
pub mod noop;
pub mod reconcile;
pub mod template;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ComputeBackendKind, Config};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, EventWriter};
use crate::model::{State, Task};
use crate::retry::Retrier;
use crate::worker::RunnerConfig;

pub use dispatch::Dispatcher;
pub use reconcile::{JobProvider, JobStatus, Reconciler};

/// An execution substrate for task workers.
#[async_trait]
pub trait ComputeBackend: Send + Sync {
    /// Short name used in logs, metrics and metadata keys.
    fn name(&self) -> &str;

    /// Start the worker for `task`.
    ///
    /// Must succeed without side effects when the task was already
    /// submitted: a restarted dispatcher may hand over the same task twice.
    /// With a dispatcher, retryable errors leave the task queued for the
    /// next pass; anything else fails it.
    async fn submit(&self, task: &Task) -> Result<()>;

    /// Best-effort stop of the task's worker.
    async fn cancel(&self, id: &str) -> Result<()>;

    async fn close(&self) {}
}

/// Outcome of handing a task to a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The backend took the task; it is now `INITIALIZING` (or later).
    Accepted,
    /// The backend refused the task permanently; it is now `SYSTEM_ERROR`.
    Rejected,
}

/// Event-chain adapter in front of a compute backend.
pub struct ComputeSink {
    backend: Arc<dyn ComputeBackend>,
    /// Where acceptance and rejection are recorded (the database).
    events: Arc<dyn EventWriter>,
    /// Submit on `TASK_CREATED` instead of waiting for the dispatcher.
    submit_on_create: bool,
    /// Backoff for submissions made on create, which get no later attempt.
    retrier: Retrier,
}

impl ComputeSink {
    pub fn new(backend: Arc<dyn ComputeBackend>, events: Arc<dyn EventWriter>) -> Self {
        Self {
            backend,
            events,
            submit_on_create: false,
            retrier: Retrier::default(),
        }
    }

    /// Used when the database keeps no queue for a dispatcher to drain.
    pub fn submit_on_create(mut self, enabled: bool) -> Self {
        self.submit_on_create = enabled;
        self
    }

    pub fn with_retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = retrier;
        self
    }

    pub fn backend(&self) -> &Arc<dyn ComputeBackend> {
        &self.backend
    }

    /// Submit `task` and record the outcome.
    ///
    /// Retryable backend errors are returned untouched and nothing is
    /// recorded, so the task stays queued for the next attempt.
    pub async fn submit(&self, task: &Task) -> Result<Submission> {
        match self.backend.submit(task).await {
            Ok(()) => Ok(self.accepted(task).await),
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => self.rejected(task, e).await,
        }
    }

    /// Submit `task` with backoff. Nothing retries a task submitted on
    /// create, so one still failing after the last try is rejected.
    pub async fn submit_with_retry(&self, task: &Task) -> Result<Submission> {
        let res = self
            .retrier
            .retry(&CancellationToken::new(), || self.backend.submit(task))
            .await;
        match res {
            Ok(()) => Ok(self.accepted(task).await),
            Err(e) => self.rejected(task, e).await,
        }
    }

    async fn accepted(&self, task: &Task) -> Submission {
        let ev = Event::state(&task.id, 0, State::Initializing);
        match self.events.write_event(&ev).await {
            Ok(()) => {}
            // The worker can report RUNNING before we get here.
            Err(Error::InvalidTransition { from, .. }) => {
                debug!(task_id = %task.id, %from, "task already past INITIALIZING")
            }
            Err(e) => warn!(task_id = %task.id, "recording INITIALIZING: {e}"),
        }
        info!(task_id = %task.id, backend = self.backend.name(), "task submitted");
        Submission::Accepted
    }

    async fn rejected(&self, task: &Task, err: Error) -> Result<Submission> {
        let backend = self.backend.name();
        warn!(task_id = %task.id, %backend, "task rejected: {err}");
        self.events
            .write_event(&Event::state(&task.id, 0, State::SystemError))
            .await?;
        self.events
            .write_event(&Event::system_log(
                &task.id,
                0,
                0,
                "error",
                format!("error submitting task to {backend}"),
                crate::events::fields([("error", err.to_string())]),
            ))
            .await?;
        Ok(Submission::Rejected)
    }
}

#[async_trait]
impl EventWriter for ComputeSink {
    async fn write_event(&self, event: &Event) -> Result<()> {
        match &event.kind {
            EventKind::TaskCreated(task) if self.submit_on_create => {
                let mut task = task.as_ref().clone();
                task.id = event.id.clone();
                self.submit_with_retry(&task).await.map(|_| ())
            }
            EventKind::TaskState(State::Canceled) => {
                if let Err(e) = self.backend.cancel(&event.id).await {
                    warn!(task_id = %event.id, backend = self.backend.name(), "cancel failed: {e}");
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn close(&self) {
        self.backend.close().await;
    }
}

/// The configured backend, ready to plug into the server.
pub struct Compute {
    pub sink: Arc<ComputeSink>,
    /// Present when the backend watches external jobs.
    pub reconciler: Option<Arc<Reconciler>>,
}

/// Build the backend selected by `conf.compute.backend`.
///
/// `config_path` is forwarded to workers started by batch schedulers so
/// they read the same configuration file as the server.
pub fn build(conf: &Config, config_path: Option<&Path>, db: Arc<dyn Database>) -> Result<Compute> {
    let events: Arc<dyn EventWriter> = Arc::new(db.clone());
    let kind = conf.compute.backend;

    let (backend, reconciler): (Arc<dyn ComputeBackend>, Option<Arc<Reconciler>>) = match kind {
        ComputeBackendKind::Noop => (Arc::new(noop::NoopBackend), None),
        ComputeBackendKind::Local => {
            let backend = local::LocalBackend::new(RunnerConfig::from(conf), db.clone());
            (Arc::new(backend), None)
        }
        ComputeBackendKind::Htcondor
        | ComputeBackendKind::Slurm
        | ComputeBackendKind::Pbs
        | ComputeBackendKind::Gridengine => {
            let hpc_conf = conf
                .hpc(kind)
                .ok_or_else(|| Error::Config(format!("no configuration for {kind}")))?;
            let flavor = hpc::Flavor::from_kind(kind)
                .ok_or_else(|| Error::Config(format!("{kind} is not a batch scheduler")))?;
            let backend = Arc::new(hpc::HpcBackend::new(
                flavor,
                hpc_conf,
                &conf.worker.work_dir,
                worker_command(config_path)?,
                db.clone(),
            )?);
            let reconciler = (!hpc_conf.disable_reconciler).then(|| {
                Arc::new(Reconciler::new(
                    backend.clone(),
                    db.clone(),
                    events.clone(),
                    hpc_conf.reconcile_rate,
                ))
            });
            (backend, reconciler)
        }
        ComputeBackendKind::Kubernetes => {
            let k8s = &conf.kubernetes;
            let backend = Arc::new(kubernetes::KubernetesBackend::new(
                k8s,
                &conf.worker.server_address,
            ));
            let reconciler = (!k8s.disable_reconciler).then(|| {
                Arc::new(
                    Reconciler::new(backend.clone(), db.clone(), events.clone(), k8s.reconcile_rate)
                        .disable_cleanup(k8s.disable_cleanup),
                )
            });
            (backend, reconciler)
        }
    };

    let sink = ComputeSink::new(backend, events)
        .submit_on_create(db.queue().is_none())
        .with_retrier(Retrier::from(&conf.retry));
    Ok(Compute {
        sink: Arc::new(sink),
        reconciler,
    })
}

/// Command line that runs a worker from this binary.
fn worker_command(config_path: Option<&Path>) -> Result<String> {
    let exe = std::env::current_exe()?;
    let mut cmd = format!("{} worker run", exe.display());
    if let Some(path) = config_path {
        let path = std::path::absolute(path)?;
        cmd.push_str(&format!(" --config {}", path.display()));
    }
    Ok(cmd)
}
