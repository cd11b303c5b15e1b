//! Task storage.
//!
//! A [`Database`] is both the query side of the API (get/list) and an
//! [`EventWriter`]: every event is applied through the reducer inside a
//! transaction, which serializes events per task. The embedded backend
//! also owns the queue of tasks waiting to be dispatched.

pub mod embedded;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{DatabaseBackend, DatabaseConfig};
use crate::error::{Error, Result};
use crate::events::EventWriter;
use crate::model::{ListTasksRequest, ListTasksResponse, Task, View};

pub use embedded::EmbeddedDb;
pub use postgres::PostgresDb;

/// Durable store for tasks.
#[async_trait]
pub trait Database: EventWriter {
    /// Fetch one task projected through `view`.
    async fn get_task(&self, id: &str, view: View) -> Result<Task>;

    /// List tasks newest first. The page token is opaque to callers.
    async fn list_tasks(&self, req: &ListTasksRequest) -> Result<ListTasksResponse>;

    /// Record which user created a task.
    async fn set_task_owner(&self, id: &str, owner: &str) -> Result<()>;

    /// The user who created a task, if recorded.
    async fn task_owner(&self, id: &str) -> Result<Option<String>>;

    /// The dispatch queue, for backends that keep one.
    fn queue(&self) -> Option<&dyn TaskQueue> {
        None
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// FIFO of queued task IDs.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Up to `n` queued task IDs, oldest first. Entries are not removed;
    /// a task leaves the queue when its state moves past `QUEUED`.
    async fn read_queue(&self, n: usize) -> Result<Vec<String>>;
}

/// Open the configured database backend. Stored stdout and stderr are
/// kept to the last `max_log_size` bytes.
pub async fn open(conf: &DatabaseConfig, max_log_size: usize) -> Result<Arc<dyn Database>> {
    match conf.backend {
        DatabaseBackend::Embedded => Ok(Arc::new(
            EmbeddedDb::open(&conf.embedded.path)?.with_max_log_size(max_log_size),
        )),
        DatabaseBackend::Postgres => {
            use secrecy::ExposeSecret;
            let url = conf
                .postgres
                .url
                .as_ref()
                .ok_or_else(|| Error::Config("TES_DATABASE_URL is not set".to_string()))?;
            let db = PostgresDb::connect(url.expose_secret(), conf.postgres.max_connections)
                .await?
                .with_max_log_size(max_log_size);
            db.migrate().await?;
            Ok(Arc::new(db))
        }
    }
}

/// Token for the page after `tasks`: the last ID when the page is full.
pub(crate) fn next_page_token(tasks: &[Task], page_size: usize) -> String {
    if tasks.len() == page_size {
        tasks.last().map(|t| t.id.clone()).unwrap_or_default()
    } else {
        String::new()
    }
}
