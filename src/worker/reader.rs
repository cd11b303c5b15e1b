//! Where a runner reads its task from.

use std::sync::Arc;

use async_trait::async_trait;

use crate::db::Database;
use crate::error::Result;
use crate::model::{State, Task, View};

#[async_trait]
pub trait TaskReader: Send + Sync {
    /// The full task document.
    async fn task(&self, id: &str) -> Result<Task>;

    /// The task's current state.
    async fn state(&self, id: &str) -> Result<State>;
}

/// Reads straight from a database, for workers inside the server process.
#[derive(Clone)]
pub struct DbTaskReader {
    db: Arc<dyn Database>,
}

impl DbTaskReader {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TaskReader for DbTaskReader {
    async fn task(&self, id: &str) -> Result<Task> {
        self.db.get_task(id, View::Full).await
    }

    async fn state(&self, id: &str) -> Result<State> {
        Ok(self.db.get_task(id, View::Minimal).await?.state)
    }
}
