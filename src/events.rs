//! Task events: the only way a task changes after creation.
//!
//! Every mutation of a task (state, timestamps, logs, metadata, outputs)
//! is expressed as an [`Event`] and folded into the stored snapshot by
//! [`crate::reducer::reduce`]. Writers in [`writer`] move events between
//! the worker, the server and the database.

pub mod logger;
pub mod ring;
pub mod tailer;
pub mod writer;

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::model::{OutputFileLog, State, Task};

pub use logger::LogWriter;
pub use writer::{EventWriter, ExecutorWriter, MultiWriter, NoopWriter, TaskWriter};

/// One atomic, timestamped change to a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Task ID.
    pub id: String,
    /// Attempt number, 0-based.
    #[serde(default)]
    pub attempt: u32,
    /// Executor index within the attempt; zero for task-level events.
    #[serde(default)]
    pub index: u32,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    TaskCreated(Box<Task>),
    TaskState(State),
    TaskStartTime(DateTime<Utc>),
    TaskEndTime(DateTime<Utc>),
    TaskOutputs(Vec<OutputFileLog>),
    TaskMetadata(BTreeMap<String, String>),
    ExecutorStartTime(DateTime<Utc>),
    ExecutorEndTime(DateTime<Utc>),
    ExecutorExitCode(i32),
    ExecutorStdout(String),
    ExecutorStderr(String),
    SystemLog(SystemLog),
}

impl EventKind {
    /// Wire name of the variant, e.g. `TASK_STATE`.
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::TaskCreated(_) => "TASK_CREATED",
            EventKind::TaskState(_) => "TASK_STATE",
            EventKind::TaskStartTime(_) => "TASK_START_TIME",
            EventKind::TaskEndTime(_) => "TASK_END_TIME",
            EventKind::TaskOutputs(_) => "TASK_OUTPUTS",
            EventKind::TaskMetadata(_) => "TASK_METADATA",
            EventKind::ExecutorStartTime(_) => "EXECUTOR_START_TIME",
            EventKind::ExecutorEndTime(_) => "EXECUTOR_END_TIME",
            EventKind::ExecutorExitCode(_) => "EXECUTOR_EXIT_CODE",
            EventKind::ExecutorStdout(_) => "EXECUTOR_STDOUT",
            EventKind::ExecutorStderr(_) => "EXECUTOR_STDERR",
            EventKind::SystemLog(_) => "SYSTEM_LOG",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A structured log line attached to a task attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemLog {
    pub level: String,
    pub msg: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, String>,
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

impl Event {
    fn new(id: impl Into<String>, attempt: u32, index: u32, kind: EventKind) -> Self {
        Self {
            id: id.into(),
            attempt,
            index,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn task_created(task: Task) -> Self {
        Self::new(task.id.clone(), 0, 0, EventKind::TaskCreated(Box::new(task)))
    }

    pub fn state(id: impl Into<String>, attempt: u32, state: State) -> Self {
        Self::new(id, attempt, 0, EventKind::TaskState(state))
    }

    pub fn start_time(id: impl Into<String>, attempt: u32, t: DateTime<Utc>) -> Self {
        Self::new(id, attempt, 0, EventKind::TaskStartTime(t))
    }

    pub fn end_time(id: impl Into<String>, attempt: u32, t: DateTime<Utc>) -> Self {
        Self::new(id, attempt, 0, EventKind::TaskEndTime(t))
    }

    pub fn outputs(id: impl Into<String>, attempt: u32, outputs: Vec<OutputFileLog>) -> Self {
        Self::new(id, attempt, 0, EventKind::TaskOutputs(outputs))
    }

    pub fn metadata(
        id: impl Into<String>,
        attempt: u32,
        metadata: BTreeMap<String, String>,
    ) -> Self {
        Self::new(id, attempt, 0, EventKind::TaskMetadata(metadata))
    }

    pub fn executor_start_time(
        id: impl Into<String>,
        attempt: u32,
        index: u32,
        t: DateTime<Utc>,
    ) -> Self {
        Self::new(id, attempt, index, EventKind::ExecutorStartTime(t))
    }

    pub fn executor_end_time(
        id: impl Into<String>,
        attempt: u32,
        index: u32,
        t: DateTime<Utc>,
    ) -> Self {
        Self::new(id, attempt, index, EventKind::ExecutorEndTime(t))
    }

    pub fn exit_code(id: impl Into<String>, attempt: u32, index: u32, code: i32) -> Self {
        Self::new(id, attempt, index, EventKind::ExecutorExitCode(code))
    }

    pub fn stdout(id: impl Into<String>, attempt: u32, index: u32, s: impl Into<String>) -> Self {
        Self::new(id, attempt, index, EventKind::ExecutorStdout(s.into()))
    }

    pub fn stderr(id: impl Into<String>, attempt: u32, index: u32, s: impl Into<String>) -> Self {
        Self::new(id, attempt, index, EventKind::ExecutorStderr(s.into()))
    }

    pub fn system_log(
        id: impl Into<String>,
        attempt: u32,
        index: u32,
        level: &str,
        msg: impl Into<String>,
        fields: BTreeMap<String, String>,
    ) -> Self {
        Self::new(
            id,
            attempt,
            index,
            EventKind::SystemLog(SystemLog {
                level: level.to_string(),
                msg: msg.into(),
                fields,
            }),
        )
    }

    /// Render a `SYSTEM_LOG` event as the line stored in the task log.
    ///
    /// Returns `None` for other event kinds.
    pub fn system_log_line(&self) -> Option<String> {
        let EventKind::SystemLog(log) = &self.kind else {
            return None;
        };
        let mut parts = vec![
            format!("level={}", quote(&log.level)),
            format!("msg={}", quote(&log.msg)),
            format!(
                "timestamp={}",
                quote(&self.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true))
            ),
            format!("task_attempt={}", quote(&self.attempt.to_string())),
            format!("executor_index={}", quote(&self.index.to_string())),
        ];
        for (key, value) in &log.fields {
            parts.push(format!("{key}={}", quote(value)));
        }
        Some(parts.join(" "))
    }
}

/// Build a field map from `(key, value)` pairs.
pub fn fields<K, V, I>(pairs: I) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: ToString,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.to_string()))
        .collect()
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "\\'"))
}
