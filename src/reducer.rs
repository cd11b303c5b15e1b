//! The task reducer: folds one event into a task snapshot.
//!
//! This is the only code that mutates task fields. Every database backend
//! loads the current snapshot, calls [`reduce`], and stores the result
//! inside one transaction.

use crate::error::{Error, Result};
use crate::events::ring::tail_truncate;
use crate::events::{Event, EventKind};
use crate::model::{State, Task};

/// Default cap on stored stdout/stderr per executor, in bytes.
pub const MAX_LOG_SIZE: usize = 10_000;

/// Apply `event` to `task` with the default log size cap.
pub fn reduce(task: Task, event: &Event) -> Result<Task> {
    Reducer::default().reduce(task, event)
}

/// Check a state change against the transition matrix.
///
/// Returns `Ok(false)` when the change is a no-op (self-transition, or
/// cancelling a task that already finished) and `Ok(true)` when the state
/// should be updated.
pub fn check_transition(from: State, to: State) -> Result<bool> {
    if from == State::Paused || to == State::Paused {
        return Err(Error::InvalidTransition { from, to });
    }
    if from == to {
        return Ok(false);
    }
    if from.is_terminal() && to == State::Canceled {
        return Ok(false);
    }
    if from.can_transition_to(to) {
        Ok(true)
    } else {
        Err(Error::InvalidTransition { from, to })
    }
}

/// Reducer configuration.
#[derive(Debug, Clone, Copy)]
pub struct Reducer {
    pub max_log_size: usize,
}

impl Default for Reducer {
    fn default() -> Self {
        Self {
            max_log_size: MAX_LOG_SIZE,
        }
    }
}

impl Reducer {
    pub fn new(max_log_size: usize) -> Self {
        Self { max_log_size }
    }

    /// Apply `event` to `task`, returning the new snapshot.
    ///
    /// `task` is the empty default for an ID that has never been created.
    pub fn reduce(&self, mut task: Task, event: &Event) -> Result<Task> {
        if let EventKind::TaskCreated(created) = &event.kind {
            if !task.id.is_empty() {
                return Err(Error::AlreadyExists(task.id));
            }
            let mut created = created.as_ref().clone();
            created.id = event.id.clone();
            created.state = State::Queued;
            created.logs.clear();
            if created.creation_time.is_none() {
                created.creation_time = Some(event.timestamp);
            }
            return Ok(created);
        }

        if task.id.is_empty() {
            return Err(Error::NotFound(event.id.clone()));
        }

        let (attempt, index) = (event.attempt, event.index);
        match &event.kind {
            EventKind::TaskCreated(_) => {}
            EventKind::TaskState(to) => {
                if check_transition(task.state, *to)? {
                    task.state = *to;
                }
            }
            EventKind::TaskStartTime(t) => task.task_log_mut(attempt).start_time = Some(*t),
            EventKind::TaskEndTime(t) => task.task_log_mut(attempt).end_time = Some(*t),
            EventKind::TaskOutputs(outputs) => {
                task.task_log_mut(attempt).outputs = outputs.clone();
            }
            EventKind::TaskMetadata(metadata) => {
                let log = task.task_log_mut(attempt);
                for (k, v) in metadata {
                    log.metadata.insert(k.clone(), v.clone());
                }
            }
            EventKind::ExecutorStartTime(t) => {
                task.exec_log_mut(attempt, index).start_time = Some(*t);
            }
            EventKind::ExecutorEndTime(t) => {
                task.exec_log_mut(attempt, index).end_time = Some(*t);
            }
            EventKind::ExecutorExitCode(code) => {
                task.exec_log_mut(attempt, index).exit_code = *code;
            }
            EventKind::ExecutorStdout(s) => {
                let log = task.exec_log_mut(attempt, index);
                append_tail(&mut log.stdout, s, self.max_log_size);
            }
            EventKind::ExecutorStderr(s) => {
                let log = task.exec_log_mut(attempt, index);
                append_tail(&mut log.stderr, s, self.max_log_size);
            }
            EventKind::SystemLog(_) => {
                if let Some(line) = event.system_log_line() {
                    task.task_log_mut(attempt).system_logs.push(line);
                }
            }
        }
        Ok(task)
    }

    /// Fold a whole event stream, starting from the empty task.
    pub fn replay<'a, I>(&self, events: I) -> Result<Task>
    where
        I: IntoIterator<Item = &'a Event>,
    {
        events
            .into_iter()
            .try_fold(Task::default(), |task, ev| self.reduce(task, ev))
    }
}

/// Append `chunk` to `log`, keeping at most the last `max` bytes.
pub fn append_tail(log: &mut String, chunk: &str, max: usize) {
    log.push_str(chunk);
    tail_truncate(log, max);
}
