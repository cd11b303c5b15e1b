//! Embedded single-file task store built on sled.
//!
//! Keyspaces (one sled tree each):
//!
//! | tree | key | value |
//! |---|---|---|
//! | `tasks` | id | task JSON without stdout/stderr/system logs |
//! | `queued` | creation time (BE) + id | id |
//! | `active` | id | state |
//! | `complete` | id | state |
//! | `jobs-by-worker` | host + `\0` + id | empty |
//! | `task-auth` | id | owner |
//! | `tags-by-task` | id | tags JSON |
//! | `tasks-by-tag` | key + `\0` + value + `\0` + id | empty |
//! | `sys-logs` | id + `\0` + attempt (BE) | JSON list of lines |
//! | `stdout-per-step` | id + `\0` + attempt (BE) + index (BE) | text |
//! | `stderr-per-step` | id + `\0` + attempt (BE) + index (BE) | text |
//!
//! Task IDs sort by creation, so reverse iteration over `tasks` lists
//! newest first.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sled::transaction::{
    ConflictableTransactionError, TransactionError, TransactionalTree,
};
use sled::{Transactional, Tree};
use tracing::{debug, warn};

use super::{Database, TaskQueue, next_page_token};
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, EventWriter};
use crate::model::{ListTasksRequest, ListTasksResponse, State, Task, View};
use crate::reducer::{Reducer, append_tail};
use crate::telemetry::metrics;

/// Metadata key under which workers record their hostname.
pub const HOSTNAME_KEY: &str = "hostname";

pub struct EmbeddedDb {
    db: sled::Db,
    tasks: Tree,
    queued: Tree,
    active: Tree,
    complete: Tree,
    jobs_by_worker: Tree,
    task_auth: Tree,
    tags_by_task: Tree,
    tasks_by_tag: Tree,
    sys_logs: Tree,
    stdout: Tree,
    stderr: Tree,
    reducer: Reducer,
}

impl EmbeddedDb {
    /// Open (or create) the database file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// A throwaway database that lives only in memory.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self> {
        Ok(Self {
            tasks: db.open_tree("tasks")?,
            queued: db.open_tree("queued")?,
            active: db.open_tree("active")?,
            complete: db.open_tree("complete")?,
            jobs_by_worker: db.open_tree("jobs-by-worker")?,
            task_auth: db.open_tree("task-auth")?,
            tags_by_task: db.open_tree("tags-by-task")?,
            tasks_by_tag: db.open_tree("tasks-by-tag")?,
            sys_logs: db.open_tree("sys-logs")?,
            stdout: db.open_tree("stdout-per-step")?,
            stderr: db.open_tree("stderr-per-step")?,
            reducer: Reducer::default(),
            db,
        })
    }

    /// Cap stored stdout/stderr per executor at `max` bytes.
    pub fn with_max_log_size(mut self, max: usize) -> Self {
        self.reducer = Reducer::new(max);
        self
    }

    /// IDs of tasks a worker host has reported running, oldest first.
    pub fn tasks_for_worker(&self, host: &str) -> Result<Vec<String>> {
        let mut prefix = host.as_bytes().to_vec();
        prefix.push(0);
        let mut ids = Vec::new();
        for entry in self.jobs_by_worker.scan_prefix(&prefix) {
            let (key, _) = entry?;
            ids.push(String::from_utf8_lossy(&key[prefix.len()..]).into_owned());
        }
        Ok(ids)
    }

    /// IDs of tasks currently initializing or running.
    pub fn active_tasks(&self) -> Result<Vec<String>> {
        self.active
            .iter()
            .keys()
            .map(|k| Ok(String::from_utf8_lossy(&k?).into_owned()))
            .collect()
    }

    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    // -- reads --------------------------------------------------------------

    fn load(&self, id: &str) -> Result<Task> {
        match self.tasks.get(id.as_bytes())? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    /// Merge streamed logs (stdout, stderr, system logs) into `task`.
    fn attach_logs(&self, task: &mut Task) -> Result<()> {
        let prefix = id_prefix(&task.id);
        for entry in self.stdout.scan_prefix(&prefix) {
            let (key, value) = entry?;
            if let Some((attempt, index)) = decode_step(&key[prefix.len()..]) {
                task.exec_log_mut(attempt, index).stdout = String::from_utf8_lossy(&value).into_owned();
            }
        }
        for entry in self.stderr.scan_prefix(&prefix) {
            let (key, value) = entry?;
            if let Some((attempt, index)) = decode_step(&key[prefix.len()..]) {
                task.exec_log_mut(attempt, index).stderr = String::from_utf8_lossy(&value).into_owned();
            }
        }
        for entry in self.sys_logs.scan_prefix(&prefix) {
            let (key, value) = entry?;
            if let Some(attempt) = decode_u32(&key[prefix.len()..]) {
                let lines: Vec<String> = serde_json::from_slice(&value)?;
                task.task_log_mut(attempt).system_logs = lines;
            }
        }
        Ok(())
    }

    fn visible_to(&self, id: &str, owner: Option<&str>) -> Result<bool> {
        let Some(owner) = owner else {
            return Ok(true);
        };
        Ok(self
            .task_auth
            .get(id.as_bytes())?
            .is_some_and(|o| o.as_ref() == owner.as_bytes()))
    }

    /// IDs carrying tag `key` (with `value`, unless empty), newest first.
    fn ids_with_tag(&self, key: &str, value: &str) -> Result<Vec<String>> {
        let mut prefix = key.as_bytes().to_vec();
        prefix.push(0);
        if !value.is_empty() {
            prefix.extend_from_slice(value.as_bytes());
            prefix.push(0);
        }
        let mut ids = BTreeSet::new();
        for entry in self.tasks_by_tag.scan_prefix(&prefix) {
            let (k, _) = entry?;
            // The ID follows the last separator.
            if let Some(pos) = k.iter().rposition(|b| *b == 0) {
                ids.insert(String::from_utf8_lossy(&k[pos + 1..]).into_owned());
            }
        }
        Ok(ids.into_iter().rev().collect())
    }

    fn tags_match(&self, id: &str, filters: &[(String, String)]) -> Result<bool> {
        let Some(raw) = self.tags_by_task.get(id.as_bytes())? else {
            return Ok(false);
        };
        let tags: BTreeMap<String, String> = serde_json::from_slice(&raw)?;
        Ok(filters.iter().all(|(key, value)| {
            tags.get(key)
                .is_some_and(|v| value.is_empty() || v == value)
        }))
    }

    // -- writes -------------------------------------------------------------

    fn create(&self, event: &Event) -> Result<()> {
        let task = self.reducer.reduce(Task::default(), event)?;
        let id = task.id.clone();
        let record = serde_json::to_vec(&task)?;
        let tags = serde_json::to_vec(&task.tags)?;
        let queue_key = queue_key(task.creation_time, &id);

        (&self.tasks, &self.queued, &self.tags_by_task, &self.tasks_by_tag)
            .transaction(|(tasks, queued, tags_by_task, tasks_by_tag)| {
                if tasks.get(id.as_bytes())?.is_some() {
                    return Err(ConflictableTransactionError::Abort(Error::AlreadyExists(
                        id.clone(),
                    )));
                }
                tasks.insert(id.as_bytes(), record.clone())?;
                queued.insert(queue_key.clone(), id.as_bytes())?;
                tags_by_task.insert(id.as_bytes(), tags.clone())?;
                for (key, value) in &task.tags {
                    tasks_by_tag.insert(tag_key(key, value, &id), &[] as &[u8])?;
                }
                Ok(())
            })
            .map_err(flatten)?;

        metrics::tasks_created().add(1, &[]);
        Ok(())
    }

    /// Apply a task-level event to the main record and maintain indexes.
    fn update(&self, event: &Event) -> Result<()> {
        let reducer = self.reducer;
        let id = event.id.as_str();

        let transition = (&self.tasks, &self.queued, &self.active, &self.complete, &self.jobs_by_worker)
            .transaction(|(tasks, queued, active, complete, workers)| {
                let task = load_tx(tasks, id)?;
                let from = task.state;
                let creation_time = task.creation_time;
                let next = reducer
                    .reduce(task, event)
                    .map_err(ConflictableTransactionError::Abort)?;
                let to = next.state;

                let record = serde_json::to_vec(&next)
                    .map_err(|e| ConflictableTransactionError::Abort(Error::Json(e)))?;
                tasks.insert(id.as_bytes(), record)?;

                if from != to {
                    update_state_indexes(queued, active, complete, id, creation_time, to)?;
                }
                if let EventKind::TaskMetadata(metadata) = &event.kind {
                    if let Some(host) = metadata.get(HOSTNAME_KEY) {
                        let mut key = host.as_bytes().to_vec();
                        key.push(0);
                        key.extend_from_slice(id.as_bytes());
                        workers.insert(key, &[] as &[u8])?;
                    }
                }
                Ok((from, to))
            })
            .map_err(flatten);

        match transition {
            Ok((from, to)) => {
                if from != to {
                    debug!(task_id = id, %from, %to, "task state changed");
                    metrics::task_state_transitions().add(
                        1,
                        &[
                            opentelemetry::KeyValue::new("from", from.as_str()),
                            opentelemetry::KeyValue::new("to", to.as_str()),
                        ],
                    );
                }
                Ok(())
            }
            Err(err @ Error::InvalidTransition { .. }) => {
                if let Error::InvalidTransition { from, to } = &err {
                    let log = Event::system_log(
                        id,
                        event.attempt,
                        event.index,
                        "error",
                        "invalid state transition",
                        crate::events::fields([("from", from.as_str()), ("to", to.as_str())]),
                    );
                    if let Err(e) = self.append_system_log(&log) {
                        warn!(task_id = id, "failed to record invalid transition: {e}");
                    }
                }
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Append a stdout/stderr chunk to its own row, keeping the tail.
    fn append_stream(&self, event: &Event, tree: &Tree, chunk: &str) -> Result<()> {
        let id = event.id.as_str();
        let key = step_key(id, event.attempt, event.index);
        let max = self.reducer.max_log_size;

        (&self.tasks, tree)
            .transaction(|(tasks, stream)| {
                let mut task = load_tx(tasks, id)?;
                if ensure_exec_log(&mut task, event.attempt, event.index) {
                    let record = serde_json::to_vec(&task)
                        .map_err(|e| ConflictableTransactionError::Abort(Error::Json(e)))?;
                    tasks.insert(id.as_bytes(), record)?;
                }
                let mut current = stream
                    .get(&key)?
                    .map(|v| String::from_utf8_lossy(&v).into_owned())
                    .unwrap_or_default();
                append_tail(&mut current, chunk, max);
                stream.insert(key.clone(), current.into_bytes())?;
                Ok(())
            })
            .map_err(flatten)
    }

    fn append_system_log(&self, event: &Event) -> Result<()> {
        let Some(line) = event.system_log_line() else {
            return Ok(());
        };
        let id = event.id.as_str();
        let key = attempt_key(id, event.attempt);

        (&self.tasks, &self.sys_logs)
            .transaction(|(tasks, sys_logs)| {
                if tasks.get(id.as_bytes())?.is_none() {
                    return Err(ConflictableTransactionError::Abort(Error::NotFound(
                        id.to_string(),
                    )));
                }
                let mut lines: Vec<String> = match sys_logs.get(&key)? {
                    Some(raw) => serde_json::from_slice(&raw)
                        .map_err(|e| ConflictableTransactionError::Abort(Error::Json(e)))?,
                    None => Vec::new(),
                };
                lines.push(line.clone());
                let raw = serde_json::to_vec(&lines)
                    .map_err(|e| ConflictableTransactionError::Abort(Error::Json(e)))?;
                sys_logs.insert(key.clone(), raw)?;
                Ok(())
            })
            .map_err(flatten)
    }
}

#[async_trait]
impl EventWriter for EmbeddedDb {
    async fn write_event(&self, event: &Event) -> Result<()> {
        metrics::events_written().add(1, &[opentelemetry::KeyValue::new("type", event.kind.name())]);
        match &event.kind {
            EventKind::TaskCreated(_) => self.create(event),
            EventKind::ExecutorStdout(s) => self.append_stream(event, &self.stdout, s),
            EventKind::ExecutorStderr(s) => self.append_stream(event, &self.stderr, s),
            EventKind::SystemLog(_) => self.append_system_log(event),
            _ => self.update(event),
        }
    }

    async fn close(&self) {
        if let Err(e) = self.db.flush_async().await {
            warn!("flushing embedded database: {e}");
        }
    }
}

#[async_trait]
impl Database for EmbeddedDb {
    async fn get_task(&self, id: &str, view: View) -> Result<Task> {
        let mut task = self.load(id)?;
        if view.needs_logs() {
            self.attach_logs(&mut task)?;
        }
        Ok(view.apply(task))
    }

    async fn list_tasks(&self, req: &ListTasksRequest) -> Result<ListTasksResponse> {
        let page_size = req.effective_page_size();
        let token = req.page_token.as_deref().filter(|t| !t.is_empty());
        let mut tasks = Vec::with_capacity(page_size.min(64));

        let mut consider = |task: Task| -> Result<bool> {
            if req.matches(&task) && self.visible_to(&task.id, req.owner.as_deref())? {
                let mut task = task;
                if req.view.needs_logs() {
                    self.attach_logs(&mut task)?;
                }
                tasks.push(req.view.apply(task));
            }
            Ok(tasks.len() >= page_size)
        };

        if req.tags.is_empty() {
            let iter = match token {
                Some(t) => self.tasks.range(..t.as_bytes()),
                None => self.tasks.iter(),
            };
            for entry in iter.rev() {
                let (_, raw) = entry?;
                let task: Task = serde_json::from_slice(&raw)?;
                if consider(task)? {
                    break;
                }
            }
        } else {
            let (key, value) = &req.tags[0];
            for id in self.ids_with_tag(key, value)? {
                if token.is_some_and(|t| id.as_str() >= t) {
                    continue;
                }
                if !self.tags_match(&id, &req.tags[1..])? {
                    continue;
                }
                let task = match self.load(&id) {
                    Ok(task) => task,
                    Err(Error::NotFound(_)) => continue,
                    Err(e) => return Err(e),
                };
                if consider(task)? {
                    break;
                }
            }
        }

        let next_page_token = next_page_token(&tasks, page_size);
        Ok(ListTasksResponse {
            tasks,
            next_page_token,
        })
    }

    async fn set_task_owner(&self, id: &str, owner: &str) -> Result<()> {
        self.task_auth.insert(id.as_bytes(), owner.as_bytes())?;
        Ok(())
    }

    async fn task_owner(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .task_auth
            .get(id.as_bytes())?
            .map(|o| String::from_utf8_lossy(&o).into_owned()))
    }

    fn queue(&self) -> Option<&dyn TaskQueue> {
        Some(self)
    }

    async fn health_check(&self) -> Result<()> {
        self.db.checksum()?;
        Ok(())
    }
}

#[async_trait]
impl TaskQueue for EmbeddedDb {
    async fn read_queue(&self, n: usize) -> Result<Vec<String>> {
        self.queued
            .iter()
            .values()
            .take(n)
            .map(|v| Ok(String::from_utf8_lossy(&v?).into_owned()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

type TxResult<T> = std::result::Result<T, ConflictableTransactionError<Error>>;

fn load_tx(tasks: &TransactionalTree, id: &str) -> TxResult<Task> {
    match tasks.get(id.as_bytes())? {
        Some(raw) => serde_json::from_slice(&raw)
            .map_err(|e| ConflictableTransactionError::Abort(Error::Json(e))),
        None => Err(ConflictableTransactionError::Abort(Error::NotFound(
            id.to_string(),
        ))),
    }
}

fn update_state_indexes(
    queued: &TransactionalTree,
    active: &TransactionalTree,
    complete: &TransactionalTree,
    id: &str,
    creation_time: Option<DateTime<Utc>>,
    to: State,
) -> TxResult<()> {
    let state = to.as_str().as_bytes();
    if to == State::Queued {
        queued.insert(queue_key(creation_time, id), id.as_bytes())?;
    } else {
        queued.remove(queue_key(creation_time, id))?;
    }
    if matches!(to, State::Initializing | State::Running) {
        active.insert(id.as_bytes(), state)?;
    } else {
        active.remove(id.as_bytes())?;
    }
    if to.is_terminal() {
        complete.insert(id.as_bytes(), state)?;
    }
    Ok(())
}

/// Grow the executor log list so `(attempt, index)` exists. Returns whether
/// the task changed.
fn ensure_exec_log(task: &mut Task, attempt: u32, index: u32) -> bool {
    let exists = task
        .logs
        .get(attempt as usize)
        .is_some_and(|l| l.logs.len() > index as usize);
    if !exists {
        task.exec_log_mut(attempt, index);
    }
    !exists
}

fn flatten(err: TransactionError<Error>) -> Error {
    match err {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => Error::Sled(e),
    }
}

// ---------------------------------------------------------------------------
// Key encoding
// ---------------------------------------------------------------------------

fn id_prefix(id: &str) -> Vec<u8> {
    let mut key = id.as_bytes().to_vec();
    key.push(0);
    key
}

fn attempt_key(id: &str, attempt: u32) -> Vec<u8> {
    let mut key = id_prefix(id);
    key.extend_from_slice(&attempt.to_be_bytes());
    key
}

fn step_key(id: &str, attempt: u32, index: u32) -> Vec<u8> {
    let mut key = attempt_key(id, attempt);
    key.extend_from_slice(&index.to_be_bytes());
    key
}

fn decode_u32(raw: &[u8]) -> Option<u32> {
    Some(u32::from_be_bytes(raw.get(..4)?.try_into().ok()?))
}

fn decode_step(raw: &[u8]) -> Option<(u32, u32)> {
    Some((decode_u32(raw)?, decode_u32(raw.get(4..)?)?))
}

fn tag_key(key: &str, value: &str, id: &str) -> Vec<u8> {
    let mut k = Vec::with_capacity(key.len() + value.len() + id.len() + 2);
    k.extend_from_slice(key.as_bytes());
    k.push(0);
    k.extend_from_slice(value.as_bytes());
    k.push(0);
    k.extend_from_slice(id.as_bytes());
    k
}

/// Creation time in big-endian nanoseconds (sign bit flipped so ordering
/// survives pre-epoch times), followed by the ID.
fn queue_key(creation_time: Option<DateTime<Utc>>, id: &str) -> Vec<u8> {
    let nanos = creation_time
        .and_then(|t| t.timestamp_nanos_opt())
        .unwrap_or_default();
    let ordered = (nanos as u64) ^ (1 << 63);
    let mut key = ordered.to_be_bytes().to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}
