//! The TES API operations, independent of the transport.

use std::sync::Arc;

use tracing::{debug, info};

use super::auth::Caller;
use crate::compute::ComputeSink;
use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, EventWriter, MultiWriter};
use crate::model::{
    CancelTaskResponse, CreateTaskResponse, ListTasksRequest, ListTasksResponse, Organization,
    ServiceInfo, ServiceType, State, Task, View, new_task_id, validate,
};
use crate::worker::storage::enabled_schemes;

/// Create, read, list and cancel tasks.
///
/// Writes go through an event chain: the database first, then the compute
/// sink, so a backend only ever sees tasks that were stored.
pub struct TaskService {
    db: Arc<dyn Database>,
    events: Arc<dyn EventWriter>,
    info: ServiceInfo,
}

impl TaskService {
    pub fn new(db: Arc<dyn Database>, compute: Option<Arc<ComputeSink>>, info: ServiceInfo) -> Self {
        let stored: Arc<dyn EventWriter> = Arc::new(db.clone());
        let mut chain = MultiWriter::new(vec![stored]);
        if let Some(sink) = compute {
            chain.push(sink);
        }
        Self {
            db,
            events: Arc::new(chain),
            info,
        }
    }

    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    pub fn service_info(&self) -> &ServiceInfo {
        &self.info
    }

    /// Validate and store a new task; returns its freshly assigned ID.
    pub async fn create_task(&self, mut task: Task, caller: &Caller) -> Result<CreateTaskResponse> {
        validate::validate(&task)?;
        task.id = new_task_id();
        let id = task.id.clone();

        self.events.write_event(&Event::task_created(task)).await?;
        if let Some(user) = &caller.user {
            self.db.set_task_owner(&id, user).await?;
        }
        info!(task_id = %id, "task created");
        Ok(CreateTaskResponse { id })
    }

    pub async fn get_task(&self, id: &str, view: View, caller: &Caller) -> Result<Task> {
        self.check_access(id, caller).await?;
        self.db.get_task(id, view).await
    }

    pub async fn list_tasks(
        &self,
        mut req: ListTasksRequest,
        caller: &Caller,
    ) -> Result<ListTasksResponse> {
        req.owner = caller.owner_filter();
        self.db.list_tasks(&req).await
    }

    /// Cancel a task. Cancelling a finished task succeeds and changes
    /// nothing.
    pub async fn cancel_task(&self, id: &str, caller: &Caller) -> Result<CancelTaskResponse> {
        self.check_access(id, caller).await?;
        let task = self.db.get_task(id, View::Minimal).await?;
        if task.state.is_terminal() {
            debug!(task_id = %id, state = %task.state, "cancel on finished task ignored");
            return Ok(CancelTaskResponse {});
        }
        self.events
            .write_event(&Event::state(id, 0, State::Canceled))
            .await?;
        info!(task_id = %id, "task canceled");
        Ok(CancelTaskResponse {})
    }

    /// Apply an event reported by a remote worker.
    pub async fn write_event(&self, event: &Event, caller: &Caller) -> Result<()> {
        if matches!(event.kind, EventKind::TaskCreated(_)) {
            return Err(Error::Validation(vec![
                "TASK_CREATED events must go through task creation".to_string(),
            ]));
        }
        self.check_access(&event.id, caller).await?;
        self.db.write_event(event).await
    }

    /// Hide tasks the caller does not own behind `NotFound`.
    async fn check_access(&self, id: &str, caller: &Caller) -> Result<()> {
        if caller.admin {
            return Ok(());
        }
        let owner = self.db.task_owner(id).await?;
        if caller.can_access(owner.as_deref()) {
            Ok(())
        } else {
            Err(Error::NotFound(id.to_string()))
        }
    }
}

/// Service description advertised at `/v1/service-info`.
pub fn service_info(conf: &Config) -> ServiceInfo {
    ServiceInfo {
        id: format!("org.ga4gh.tes.{}", conf.server.host_name),
        name: conf.server.service_name.clone(),
        service_type: ServiceType {
            group: "org.ga4gh".to_string(),
            artifact: "tes".to_string(),
            version: "1.1.0".to_string(),
        },
        description: "GA4GH Task Execution Service".to_string(),
        organization: Organization {
            name: conf.server.service_name.clone(),
            url: conf.server.http_address(),
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        storage: enabled_schemes(&conf.local_storage, &conf.http_storage),
    }
}
