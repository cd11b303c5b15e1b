//! An event sink that writes every event to the tracing log.

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::{Event, EventKind, EventWriter};
use crate::error::Result;

/// Logs events through `tracing`. Never fails.
#[derive(Debug, Clone, Default)]
pub struct LogWriter {
    /// Component name attached to every line (e.g. "worker").
    pub component: &'static str,
}

impl LogWriter {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }
}

#[async_trait]
impl EventWriter for LogWriter {
    async fn write_event(&self, ev: &Event) -> Result<()> {
        let kind = ev.kind.name();
        let component = self.component;
        let (task_id, attempt, index) = (ev.id.as_str(), ev.attempt, ev.index);

        match &ev.kind {
            EventKind::TaskCreated(task) => {
                info!(component, task_id, attempt, name = %task.name, "{kind}")
            }
            EventKind::TaskState(state) => {
                info!(component, task_id, attempt, %state, "{kind}")
            }
            EventKind::TaskStartTime(t) | EventKind::ExecutorStartTime(t) => {
                info!(component, task_id, attempt, index, start_time = %t, "{kind}")
            }
            EventKind::TaskEndTime(t) | EventKind::ExecutorEndTime(t) => {
                info!(component, task_id, attempt, index, end_time = %t, "{kind}")
            }
            EventKind::TaskOutputs(outputs) => {
                info!(component, task_id, attempt, outputs = outputs.len(), "{kind}")
            }
            EventKind::TaskMetadata(metadata) => {
                info!(component, task_id, attempt, ?metadata, "{kind}")
            }
            EventKind::ExecutorExitCode(code) => {
                info!(component, task_id, attempt, index, exit_code = code, "{kind}")
            }
            EventKind::ExecutorStdout(s) => {
                debug!(component, task_id, attempt, index, stdout = %s, "{kind}")
            }
            EventKind::ExecutorStderr(s) => {
                debug!(component, task_id, attempt, index, stderr = %s, "{kind}")
            }
            EventKind::SystemLog(log) => {
                let fields = &log.fields;
                match log.level.as_str() {
                    "error" => error!(component, task_id, attempt, index, ?fields, "{}", log.msg),
                    "warn" | "warning" => {
                        warn!(component, task_id, attempt, index, ?fields, "{}", log.msg)
                    }
                    "debug" => debug!(component, task_id, attempt, index, ?fields, "{}", log.msg),
                    _ => info!(component, task_id, attempt, index, ?fields, "{}", log.msg),
                }
            }
        }
        Ok(())
    }
}
