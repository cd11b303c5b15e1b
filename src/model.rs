//! Core data model.
//!
//! A task is a declarative request to run one or more containerised
//! executors with staged inputs and outputs. Its state and logs evolve
//! only through events folded in by [`crate::reducer`].

pub mod validate;
pub mod view;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use view::View;

/// Creates a new globally unique, time-sortable task ID.
///
/// IDs created later in the same process compare greater, so ordering
/// tasks by ID orders them by submission.
pub fn new_task_id() -> String {
    Uuid::now_v7().to_string()
}

// ---------------------------------------------------------------------------
// Task
// ---------------------------------------------------------------------------

/// The user-visible aggregate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    #[serde(default)]
    pub state: State,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Input>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<Output>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<Resources>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub executors: Vec<Executor>,

    /// Absolute container-side paths shared between executors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tags: BTreeMap<String, String>,

    /// One entry per attempt.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<TaskLog>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_time: Option<DateTime<Utc>>,
}

impl Task {
    /// Returns the log for `attempt`, growing the log list as needed.
    pub fn task_log_mut(&mut self, attempt: u32) -> &mut TaskLog {
        let attempt = attempt as usize;
        if self.logs.len() <= attempt {
            self.logs.resize_with(attempt + 1, TaskLog::default);
        }
        &mut self.logs[attempt]
    }

    /// Returns the executor log for `(attempt, index)`, growing both lists as needed.
    pub fn exec_log_mut(&mut self, attempt: u32, index: u32) -> &mut ExecutorLog {
        let task_log = self.task_log_mut(attempt);
        let index = index as usize;
        if task_log.logs.len() <= index {
            task_log.logs.resize_with(index + 1, ExecutorLog::default);
        }
        &mut task_log.logs[index]
    }

    /// Attempt number of the most recent attempt, or 0 if none has begun.
    pub fn current_attempt(&self) -> u32 {
        self.logs.len().saturating_sub(1) as u32
    }

    /// Metadata recorded for the latest attempt.
    pub fn metadata(&self) -> Option<&BTreeMap<String, String>> {
        self.logs.last().map(|l| &l.metadata)
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// One container invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Executor {
    #[serde(default)]
    pub image: String,

    #[serde(default)]
    pub command: Vec<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workdir: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdin: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Keep running subsequent executors when this one exits non-zero.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ignore_error: bool,
}

// ---------------------------------------------------------------------------
// Inputs / Outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FileType {
    #[default]
    File,
    Directory,
}

impl std::fmt::Display for FileType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileType::File => "FILE",
            FileType::Directory => "DIRECTORY",
        };
        write!(f, "{s}")
    }
}

/// A file or directory staged into the container before executors run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Input {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    #[serde(default)]
    pub path: String,

    #[serde(default, rename = "type")]
    pub file_type: FileType,

    /// Inline content. Mutually exclusive with `url`.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub content: String,
}

/// A file or directory uploaded after executors finish.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Output {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub path: String,

    #[serde(default, rename = "type")]
    pub file_type: FileType,
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Resources {
    #[serde(default, skip_serializing_if = "is_zero_u32")]
    pub cpu_cores: u32,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub preemptible: bool,

    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub ram_gb: f64,

    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub disk_gb: f64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,

    /// Opaque backend-specific parameters.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub backend_parameters: BTreeMap<String, String>,

    /// Fail the task if a backend cannot honor every parameter.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub backend_parameters_strict: bool,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}

fn is_zero_f64(v: &f64) -> bool {
    *v == 0.0
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    #[default]
    Unknown,
    Queued,
    Initializing,
    Running,
    /// Reserved. Every transition into or out of it is rejected.
    Paused,
    Complete,
    ExecutorError,
    SystemError,
    Canceled,
}

impl State {
    pub const ALL: [State; 9] = [
        State::Unknown,
        State::Queued,
        State::Initializing,
        State::Running,
        State::Paused,
        State::Complete,
        State::ExecutorError,
        State::SystemError,
        State::Canceled,
    ];

    /// Can a task move from self to `to`? Self-transitions are not covered
    /// here; the reducer treats them as no-ops.
    pub fn can_transition_to(self, to: State) -> bool {
        use State::*;
        if self == Paused || to == Paused || to == Unknown {
            return false;
        }
        match self {
            Unknown => true,
            Queued => to != Queued,
            Initializing => matches!(
                to,
                Running | ExecutorError | SystemError | Canceled
            ),
            Running => matches!(to, Complete | ExecutorError | SystemError | Canceled),
            _ => false,
        }
    }

    /// Is this a terminal state?
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            State::Complete | State::ExecutorError | State::SystemError | State::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            State::Unknown => "UNKNOWN",
            State::Queued => "QUEUED",
            State::Initializing => "INITIALIZING",
            State::Running => "RUNNING",
            State::Paused => "PAUSED",
            State::Complete => "COMPLETE",
            State::ExecutorError => "EXECUTOR_ERROR",
            State::SystemError => "SYSTEM_ERROR",
            State::Canceled => "CANCELED",
        }
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for State {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        State::ALL
            .into_iter()
            .find(|st| st.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| crate::error::Error::Other(format!("unknown task state: {s}")))
    }
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

/// Log of a single attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskLog {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<ExecutorLog>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputFileLog>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub system_logs: Vec<String>,
}

/// Log of a single executor within an attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutorLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,

    /// Tail of the container's stdout.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stdout: String,

    /// Tail of the container's stderr.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub stderr: String,

    #[serde(default)]
    pub exit_code: i32,
}

/// An uploaded output file, with its resolved URL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputFileLog {
    pub url: String,
    pub path: String,
    /// Decimal string, as in the TES wire format.
    pub size_bytes: String,
}

// ---------------------------------------------------------------------------
// API messages
// ---------------------------------------------------------------------------

/// Response to a create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateTaskResponse {
    pub id: String,
}

/// Filters and paging for listing tasks.
#[derive(Debug, Clone, Default)]
pub struct ListTasksRequest {
    pub name_prefix: String,
    pub state: Option<State>,
    /// Conjunctive; an empty value matches any value for the key.
    pub tags: Vec<(String, String)>,
    pub page_size: Option<u32>,
    pub page_token: Option<String>,
    pub view: View,
    /// When set, only tasks created by this user are visible.
    pub owner: Option<String>,
}

impl ListTasksRequest {
    pub const DEFAULT_PAGE_SIZE: u32 = 256;
    pub const MAX_PAGE_SIZE: u32 = 2048;

    /// Requested page size, defaulted and clamped.
    pub fn effective_page_size(&self) -> usize {
        match self.page_size {
            None | Some(0) => Self::DEFAULT_PAGE_SIZE as usize,
            Some(n) => n.min(Self::MAX_PAGE_SIZE) as usize,
        }
    }

    /// Does `task` pass the name, state and tag filters?
    pub fn matches(&self, task: &Task) -> bool {
        if !task.name.starts_with(&self.name_prefix) {
            return false;
        }
        if let Some(state) = self.state {
            if task.state != state {
                return false;
            }
        }
        self.tags.iter().all(|(key, value)| match task.tags.get(key) {
            Some(v) => value.is_empty() || v == value,
            None => false,
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListTasksResponse {
    pub tasks: Vec<Task>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub next_page_token: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CancelTaskResponse {}

// ---------------------------------------------------------------------------
// Service info
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceType {
    pub group: String,
    pub artifact: String,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Organization {
    pub name: String,
    pub url: String,
}

/// Describes this service instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: ServiceType,
    pub description: String,
    pub organization: Organization,
    pub version: String,
    /// URL schemes the workers can stage files through.
    pub storage: Vec<String>,
}
