//! Runs tasks inside the server process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, error, info};

use super::ComputeBackend;
use crate::db::Database;
use crate::error::Result;
use crate::events::{EventWriter, LogWriter, MultiWriter};
use crate::model::Task;
use crate::telemetry::task::start_task_span;
use crate::worker::{DbTaskReader, Runner, RunnerConfig};

/// Spawns a [`Runner`] per task on the server's runtime.
pub struct LocalBackend {
    conf: RunnerConfig,
    db: Arc<dyn Database>,
    /// Cancel handle of every runner still in flight, by task ID.
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl LocalBackend {
    pub fn new(conf: RunnerConfig, db: Arc<dyn Database>) -> Self {
        Self {
            conf,
            db,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.running.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Number of runners in flight.
    pub fn running(&self) -> usize {
        self.registry().len()
    }
}

#[async_trait]
impl ComputeBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn submit(&self, task: &Task) -> Result<()> {
        let cancel = CancellationToken::new();
        {
            let mut running = self.registry();
            if running.contains_key(&task.id) {
                return Ok(());
            }
            running.insert(task.id.clone(), cancel.clone());
        }

        let writers: Vec<Arc<dyn EventWriter>> = vec![
            Arc::new(self.db.clone()),
            Arc::new(LogWriter::new("worker")),
        ];
        let runner = Runner::new(
            self.conf.clone(),
            Arc::new(DbTaskReader::new(self.db.clone())),
            Arc::new(MultiWriter::new(writers)),
        );
        let id = task.id.clone();
        let running = self.running.clone();
        let span = start_task_span(&id, self.name());
        tokio::spawn(
            async move {
                match runner.run(&id, cancel).await {
                    Ok(state) => info!(task_id = %id, %state, "local runner finished"),
                    Err(e) => error!(task_id = %id, "local runner failed: {e}"),
                }
                if let Ok(mut running) = running.lock() {
                    running.remove(&id);
                }
            }
            .instrument(span),
        );
        Ok(())
    }

    async fn cancel(&self, id: &str) -> Result<()> {
        if let Some(token) = self.registry().get(id) {
            token.cancel();
        }
        Ok(())
    }

    async fn close(&self) {
        for token in self.registry().values() {
            token.cancel();
        }
    }
}
