//! Task view projections used to bound API response size.

use serde::{Deserialize, Serialize};

use super::Task;

/// How much of a task to return.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum View {
    /// Only `id` and `state`.
    #[default]
    Minimal,
    /// Everything except input contents, executor stdout/stderr and system logs.
    Basic,
    Full,
}

impl View {
    /// Project `task` through this view.
    pub fn apply(self, task: Task) -> Task {
        match self {
            View::Minimal => minimal(task),
            View::Basic => basic(task),
            View::Full => task,
        }
    }

    /// Whether the projection reads streamed logs (stdout, stderr, system logs).
    pub fn needs_logs(self) -> bool {
        self == View::Full
    }
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            View::Minimal => "MINIMAL",
            View::Basic => "BASIC",
            View::Full => "FULL",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for View {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "" | "MINIMAL" => Ok(View::Minimal),
            "BASIC" => Ok(View::Basic),
            "FULL" => Ok(View::Full),
            other => Err(crate::error::Error::Validation(vec![format!(
                "unknown view: {other}"
            )])),
        }
    }
}

fn minimal(task: Task) -> Task {
    Task {
        id: task.id,
        state: task.state,
        ..Task::default()
    }
}

fn basic(mut task: Task) -> Task {
    for input in &mut task.inputs {
        input.content.clear();
    }
    for log in &mut task.logs {
        log.system_logs.clear();
        for exec in &mut log.logs {
            exec.stdout.clear();
            exec.stderr.clear();
        }
    }
    task
}
