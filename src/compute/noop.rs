use async_trait::async_trait;

use super::ComputeBackend;
use crate::error::Result;
use crate::model::Task;

/// Accepts every task and never runs anything. Tasks stay `INITIALIZING`
/// until something else writes their events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopBackend;

#[async_trait]
impl ComputeBackend for NoopBackend {
    fn name(&self) -> &str {
        "noop"
    }

    async fn submit(&self, _task: &Task) -> Result<()> {
        Ok(())
    }

    async fn cancel(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}
