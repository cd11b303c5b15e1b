//! Dispatcher: drains the queue into the compute backend.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use opentelemetry::KeyValue;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use super::{ComputeSink, Submission};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::model::{State, View};
use crate::telemetry::metrics;
use crate::telemetry::task::{record_state_transition, start_task_span};

/// Periodically reads up to `chunk` queued task IDs and submits each one.
///
/// A task stays in the queue until its state moves past `QUEUED`, so a
/// submission that fails with a retryable error is picked up again on a
/// later tick.
#[derive(Clone)]
pub struct Dispatcher {
    db: Arc<dyn Database>,
    sink: Arc<ComputeSink>,
    rate: Duration,
    chunk: usize,
}

impl Dispatcher {
    pub fn new(db: Arc<dyn Database>, sink: Arc<ComputeSink>, rate: Duration, chunk: usize) -> Self {
        Self {
            db,
            sink,
            rate,
            chunk,
        }
    }

    /// Run until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        if self.db.queue().is_none() {
            info!("database keeps no queue, dispatcher idle");
            return Ok(());
        }
        info!(rate = ?self.rate, chunk = self.chunk, "dispatcher started");

        let mut ticker = tokio::time::interval(self.rate);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("dispatcher shutting down");
                    return Ok(());
                }
                _ = ticker.tick() => {}
            }
            match AssertUnwindSafe(self.dispatch_once()).catch_unwind().await {
                Ok(Ok(n)) if n > 0 => debug!(submitted = n, "dispatch tick"),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!("dispatch tick failed: {e}"),
                Err(_) => error!("dispatch tick panicked"),
            }
        }
    }

    /// One tick. Returns how many tasks the backend accepted.
    pub async fn dispatch_once(&self) -> Result<usize> {
        let Some(queue) = self.db.queue() else {
            return Ok(0);
        };
        let ids = queue.read_queue(self.chunk).await?;
        let backend = self.sink.backend().name().to_string();
        let mut accepted = 0;

        for id in ids {
            let span = start_task_span(&id, &backend);
            let outcome = async {
                let task = self.db.get_task(&id, View::Full).await?;
                if task.state != State::Queued {
                    return Ok(None);
                }
                self.sink.submit(&task).await.map(Some)
            }
            .instrument(span.clone())
            .await;

            let result = match outcome {
                Ok(None) => continue,
                Ok(Some(Submission::Accepted)) => {
                    record_state_transition(&span, "QUEUED", "INITIALIZING");
                    accepted += 1;
                    "ok"
                }
                Ok(Some(Submission::Rejected)) => {
                    record_state_transition(&span, "QUEUED", "SYSTEM_ERROR");
                    "error"
                }
                Err(Error::NotFound(_)) => continue,
                Err(e) => {
                    warn!(task_id = %id, %backend, "submit failed, will retry: {e}");
                    "retry"
                }
            };
            metrics::dispatch_submissions().add(
                1,
                &[
                    KeyValue::new("backend", backend.clone()),
                    KeyValue::new("result", result),
                ],
            );
        }
        Ok(accepted)
    }
}
