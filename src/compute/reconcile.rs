//! Periodic comparison of internal task state with external job state.
//!
//! | internal | external | action |
//! |---|---|---|
//! | `QUEUED` / `INITIALIZING` / `RUNNING` | failed | `SYSTEM_ERROR` + `SYSTEM_LOG`, cleanup |
//! | `RUNNING` | succeeded | `COMPLETE`, cleanup |
//! | terminal | any | cleanup |
//!
//! A task gets at most [`MAX_ERR_EVENT_WRITES`] system-error writes, so a
//! provider that keeps reporting the same failure cannot flood the log.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::events::{Event, EventWriter};
use crate::model::{ListTasksRequest, State, Task, View};
use crate::telemetry::metrics;

/// Cap on system-error events written per task.
pub const MAX_ERR_EVENT_WRITES: u32 = 2;

const LIST_PAGE_SIZE: u32 = 100;

/// What a provider reports about one external job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Running,
    Succeeded,
    Failed,
}

/// One external job, keyed by the task it runs.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub task_id: String,
    pub state: JobState,
    /// Provider-native state name.
    pub native_state: String,
    /// Provider diagnostics, copied verbatim into `SYSTEM_LOG`.
    pub detail: String,
    /// Also clean up when the task is merely stuck (e.g. unschedulable).
    pub remove: bool,
}

impl JobStatus {
    pub fn new(task_id: impl Into<String>, state: JobState, native_state: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            state,
            native_state: native_state.into(),
            detail: String::new(),
            remove: false,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = detail.into();
        self
    }

    pub fn removable(mut self) -> Self {
        self.remove = true;
        self
    }
}

/// The external side of reconciliation.
#[async_trait]
pub trait JobProvider: Send + Sync {
    fn provider_name(&self) -> &str;

    /// States of the external jobs behind `active` (tasks that are queued,
    /// initializing or running). Providers that can enumerate their own
    /// jobs may also report jobs for tasks not in `active`.
    async fn job_states(&self, active: &[Task]) -> Result<Vec<JobStatus>>;

    /// Release external resources held for a task.
    async fn cleanup(&self, task_id: &str) -> Result<()>;
}

/// Reconciliation loop for one backend.
pub struct Reconciler {
    provider: Arc<dyn JobProvider>,
    db: Arc<dyn Database>,
    events: Arc<dyn EventWriter>,
    rate: Duration,
    disable_cleanup: bool,
    error_writes: Mutex<HashMap<String, u32>>,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn JobProvider>,
        db: Arc<dyn Database>,
        events: Arc<dyn EventWriter>,
        rate: Duration,
    ) -> Self {
        Self {
            provider,
            db,
            events,
            rate,
            disable_cleanup: false,
            error_writes: Mutex::new(HashMap::new()),
        }
    }

    pub fn disable_cleanup(mut self, disabled: bool) -> Self {
        self.disable_cleanup = disabled;
        self
    }

    /// Tick every `rate` until `cancel` fires. A failing or panicking tick
    /// is logged and the loop continues.
    pub async fn run(&self, cancel: CancellationToken) {
        let name = self.provider.provider_name().to_string();
        info!(backend = %name, rate = ?self.rate, "reconciler started");
        let mut ticker = tokio::time::interval(self.rate);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; skip it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(backend = %name, "reconciler shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }
            match AssertUnwindSafe(self.reconcile_once()).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(backend = %name, "reconcile failed: {e}"),
                Err(_) => error!(backend = %name, "reconcile panicked"),
            }
        }
    }

    /// One reconciliation pass.
    pub async fn reconcile_once(&self) -> Result<()> {
        let active = self.active_tasks().await?;
        let internal: HashMap<&str, State> =
            active.iter().map(|t| (t.id.as_str(), t.state)).collect();
        let jobs = self.provider.job_states(&active).await?;

        for job in jobs {
            let state = match internal.get(job.task_id.as_str()) {
                Some(state) => *state,
                None => match self.db.get_task(&job.task_id, View::Minimal).await {
                    Ok(task) => task.state,
                    Err(Error::NotFound(_)) => {
                        debug!(task_id = %job.task_id, "external job has no task");
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };
            if let Err(e) = self.reconcile_job(&job, state).await {
                warn!(task_id = %job.task_id, "reconciling task: {e}");
            }
        }

        // Forget counters for tasks that finished.
        if let Ok(mut writes) = self.error_writes.lock() {
            writes.retain(|id, _| internal.contains_key(id.as_str()));
        }
        Ok(())
    }

    async fn reconcile_job(&self, job: &JobStatus, state: State) -> Result<()> {
        let backend = self.provider.provider_name().to_string();
        if state.is_terminal() {
            if matches!(job.state, JobState::Succeeded | JobState::Failed) {
                self.cleanup(&job.task_id).await;
            }
            return Ok(());
        }

        match job.state {
            JobState::Failed => {
                if self.take_error_write(&job.task_id) {
                    self.events
                        .write_event(&Event::state(&job.task_id, 0, State::SystemError))
                        .await?;
                    let mut fields = crate::events::fields([
                        (format!("{backend}_state"), job.native_state.clone()),
                        ("error".to_string(), job.detail.clone()),
                    ]);
                    fields.retain(|_, v| !v.is_empty());
                    self.events
                        .write_event(&Event::system_log(
                            &job.task_id,
                            0,
                            0,
                            "error",
                            format!("{backend} reports system error for task"),
                            fields,
                        ))
                        .await?;
                    metrics::reconcile_corrections().add(
                        1,
                        &[
                            KeyValue::new("backend", backend.clone()),
                            KeyValue::new("action", "system_error"),
                        ],
                    );
                }
                self.cleanup(&job.task_id).await;
            }
            JobState::Succeeded if state == State::Running => {
                match self
                    .events
                    .write_event(&Event::state(&job.task_id, 0, State::Complete))
                    .await
                {
                    Ok(()) | Err(Error::InvalidTransition { .. }) => {}
                    Err(e) => return Err(e),
                }
                metrics::reconcile_corrections().add(
                    1,
                    &[
                        KeyValue::new("backend", backend),
                        KeyValue::new("action", "complete"),
                    ],
                );
                self.cleanup(&job.task_id).await;
            }
            _ if job.remove => self.cleanup(&job.task_id).await,
            _ => {}
        }
        Ok(())
    }

    /// Count a system-error write; false once the task hit the cap.
    fn take_error_write(&self, task_id: &str) -> bool {
        let Ok(mut writes) = self.error_writes.lock() else {
            return false;
        };
        let count = writes.entry(task_id.to_string()).or_insert(0);
        if *count >= MAX_ERR_EVENT_WRITES {
            return false;
        }
        *count += 1;
        true
    }

    async fn cleanup(&self, task_id: &str) {
        if self.disable_cleanup {
            return;
        }
        let backend = self.provider.provider_name().to_string();
        match self.provider.cleanup(task_id).await {
            Ok(()) => metrics::reconcile_corrections().add(
                1,
                &[
                    KeyValue::new("backend", backend),
                    KeyValue::new("action", "cleanup"),
                ],
            ),
            Err(e) => warn!(task_id, %backend, "cleanup failed: {e}"),
        }
    }

    async fn active_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = Vec::new();
        for state in [State::Queued, State::Initializing, State::Running] {
            let mut token: Option<String> = None;
            loop {
                let resp = self
                    .db
                    .list_tasks(&ListTasksRequest {
                        state: Some(state),
                        page_size: Some(LIST_PAGE_SIZE),
                        page_token: token.clone(),
                        view: View::Basic,
                        ..Default::default()
                    })
                    .await?;
                tasks.extend(resp.tasks);
                if resp.next_page_token.is_empty() {
                    break;
                }
                token = Some(resp.next_page_token);
            }
        }
        Ok(tasks)
    }
}
