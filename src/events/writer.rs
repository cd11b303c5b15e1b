//! Event sinks and the helpers that feed them.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Event;
use crate::error::Result;
use crate::model::{OutputFileLog, State};

/// A sink for task events.
///
/// Implementations include the databases, the compute-backend sink, the
/// HTTP event client and the log tailer's downstream writer.
#[async_trait]
pub trait EventWriter: Send + Sync {
    async fn write_event(&self, event: &Event) -> Result<()>;

    /// Release any resources held by the writer.
    async fn close(&self) {}
}

#[async_trait]
impl<W: EventWriter + ?Sized> EventWriter for Arc<W> {
    async fn write_event(&self, event: &Event) -> Result<()> {
        (**self).write_event(event).await
    }

    async fn close(&self) {
        (**self).close().await
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Writes each event to every inner writer, in order.
///
/// The first error stops delivery of that event to the remaining writers.
#[derive(Clone, Default)]
pub struct MultiWriter {
    writers: Vec<Arc<dyn EventWriter>>,
}

impl MultiWriter {
    pub fn new(writers: Vec<Arc<dyn EventWriter>>) -> Self {
        Self { writers }
    }

    pub fn push(&mut self, writer: Arc<dyn EventWriter>) {
        self.writers.push(writer);
    }
}

#[async_trait]
impl EventWriter for MultiWriter {
    async fn write_event(&self, event: &Event) -> Result<()> {
        for writer in &self.writers {
            writer.write_event(event).await?;
        }
        Ok(())
    }

    async fn close(&self) {
        for writer in &self.writers {
            writer.close().await;
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopWriter;

#[async_trait]
impl EventWriter for NoopWriter {
    async fn write_event(&self, _event: &Event) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Task-scoped helpers
// ---------------------------------------------------------------------------

/// Emits events for one attempt of one task.
#[derive(Clone)]
pub struct TaskWriter {
    id: String,
    attempt: u32,
    out: Arc<dyn EventWriter>,
}

impl TaskWriter {
    pub fn new(id: impl Into<String>, attempt: u32, out: Arc<dyn EventWriter>) -> Self {
        Self {
            id: id.into(),
            attempt,
            out,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn writer(&self) -> Arc<dyn EventWriter> {
        Arc::clone(&self.out)
    }

    /// Writer for the executor at `index` within this attempt.
    pub fn executor(&self, index: u32) -> ExecutorWriter {
        ExecutorWriter {
            id: self.id.clone(),
            attempt: self.attempt,
            index,
            out: Arc::clone(&self.out),
        }
    }

    pub async fn state(&self, state: State) -> Result<()> {
        self.out
            .write_event(&Event::state(&self.id, self.attempt, state))
            .await
    }

    pub async fn start_time(&self, t: DateTime<Utc>) -> Result<()> {
        self.out
            .write_event(&Event::start_time(&self.id, self.attempt, t))
            .await
    }

    pub async fn end_time(&self, t: DateTime<Utc>) -> Result<()> {
        self.out
            .write_event(&Event::end_time(&self.id, self.attempt, t))
            .await
    }

    pub async fn outputs(&self, outputs: Vec<OutputFileLog>) -> Result<()> {
        self.out
            .write_event(&Event::outputs(&self.id, self.attempt, outputs))
            .await
    }

    pub async fn metadata(&self, metadata: BTreeMap<String, String>) -> Result<()> {
        self.out
            .write_event(&Event::metadata(&self.id, self.attempt, metadata))
            .await
    }

    pub async fn info(&self, msg: &str, fields: BTreeMap<String, String>) -> Result<()> {
        self.log("info", msg, fields).await
    }

    pub async fn warn(&self, msg: &str, fields: BTreeMap<String, String>) -> Result<()> {
        self.log("warning", msg, fields).await
    }

    pub async fn error(&self, msg: &str, fields: BTreeMap<String, String>) -> Result<()> {
        self.log("error", msg, fields).await
    }

    pub async fn debug(&self, msg: &str, fields: BTreeMap<String, String>) -> Result<()> {
        self.log("debug", msg, fields).await
    }

    async fn log(&self, level: &str, msg: &str, fields: BTreeMap<String, String>) -> Result<()> {
        self.out
            .write_event(&Event::system_log(
                &self.id,
                self.attempt,
                0,
                level,
                msg,
                fields,
            ))
            .await
    }
}

/// Emits events for one executor of one attempt.
#[derive(Clone)]
pub struct ExecutorWriter {
    id: String,
    attempt: u32,
    index: u32,
    out: Arc<dyn EventWriter>,
}

impl ExecutorWriter {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn writer(&self) -> Arc<dyn EventWriter> {
        Arc::clone(&self.out)
    }

    pub async fn start_time(&self, t: DateTime<Utc>) -> Result<()> {
        self.out
            .write_event(&Event::executor_start_time(
                &self.id,
                self.attempt,
                self.index,
                t,
            ))
            .await
    }

    pub async fn end_time(&self, t: DateTime<Utc>) -> Result<()> {
        self.out
            .write_event(&Event::executor_end_time(
                &self.id,
                self.attempt,
                self.index,
                t,
            ))
            .await
    }

    pub async fn exit_code(&self, code: i32) -> Result<()> {
        self.out
            .write_event(&Event::exit_code(&self.id, self.attempt, self.index, code))
            .await
    }

    pub async fn stdout(&self, s: impl Into<String> + Send) -> Result<()> {
        self.out
            .write_event(&Event::stdout(&self.id, self.attempt, self.index, s))
            .await
    }

    pub async fn stderr(&self, s: impl Into<String> + Send) -> Result<()> {
        self.out
            .write_event(&Event::stderr(&self.id, self.attempt, self.index, s))
            .await
    }

    pub async fn error(&self, msg: &str, fields: BTreeMap<String, String>) -> Result<()> {
        self.out
            .write_event(&Event::system_log(
                &self.id,
                self.attempt,
                self.index,
                "error",
                msg,
                fields,
            ))
            .await
    }
}
