//! Postgres task store.
//!
//! Each task is one row holding the reduced snapshot as JSONB. Events are
//! applied under `SELECT ... FOR UPDATE`, so concurrent writers for the
//! same task are serialized by the row lock. Postgres keeps no dispatch
//! queue: the compute sink submits tasks as they are created.

use async_trait::async_trait;
use opentelemetry::KeyValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::{debug, warn};

use super::{Database, next_page_token};
use crate::error::{Error, Result};
use crate::events::{Event, EventKind, EventWriter};
use crate::model::{ListTasksRequest, ListTasksResponse, State, Task, View};
use crate::reducer::Reducer;
use crate::telemetry::metrics;

pub struct PostgresDb {
    pool: PgPool,
    reducer: Reducer,
}

impl PostgresDb {
    /// Connect to Postgres and create a connection pool.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self {
            pool,
            reducer: Reducer::default(),
        })
    }

    pub fn with_max_log_size(mut self, max: usize) -> Self {
        self.reducer = Reducer::new(max);
        self
    }

    /// Run all pending migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))?;
        Ok(())
    }

    async fn create(&self, event: &Event) -> Result<()> {
        let task = self.reducer.reduce(Task::default(), event)?;
        let creation_time = task.creation_time.unwrap_or(event.timestamp);
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            "INSERT INTO tasks (id, state, name, creation_time, doc)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(&task.id)
        .bind(task.state.as_str())
        .bind(&task.name)
        .bind(creation_time)
        .bind(Json(&task))
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            return Err(Error::AlreadyExists(task.id));
        }

        for (key, value) in &task.tags {
            sqlx::query("INSERT INTO task_tags (task_id, key, value) VALUES ($1, $2, $3)")
                .bind(&task.id)
                .bind(key)
                .bind(value)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        metrics::tasks_created().add(1, &[]);
        Ok(())
    }

    /// Reduce `event` into the locked row. Returns the states before and
    /// after.
    async fn apply(&self, event: &Event) -> Result<(State, State)> {
        let mut tx = self.pool.begin().await?;
        let row: Option<(Json<Task>,)> =
            sqlx::query_as("SELECT doc FROM tasks WHERE id = $1 FOR UPDATE")
                .bind(&event.id)
                .fetch_optional(&mut *tx)
                .await?;
        let Some((Json(task),)) = row else {
            return Err(Error::NotFound(event.id.clone()));
        };
        let from = task.state;
        let next = self.reducer.reduce(task, event)?;
        let to = next.state;

        sqlx::query("UPDATE tasks SET state = $2, doc = $3 WHERE id = $1")
            .bind(&event.id)
            .bind(to.as_str())
            .bind(Json(&next))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok((from, to))
    }

    async fn update(&self, event: &Event) -> Result<()> {
        match self.apply(event).await {
            Ok((from, to)) => {
                if from != to {
                    debug!(task_id = %event.id, %from, %to, "task state changed");
                    metrics::task_state_transitions().add(
                        1,
                        &[
                            KeyValue::new("from", from.as_str()),
                            KeyValue::new("to", to.as_str()),
                        ],
                    );
                }
                Ok(())
            }
            Err(Error::InvalidTransition { from, to }) => {
                let log = Event::system_log(
                    &event.id,
                    event.attempt,
                    event.index,
                    "error",
                    "invalid state transition",
                    crate::events::fields([("from", from.as_str()), ("to", to.as_str())]),
                );
                if let Err(e) = self.apply(&log).await {
                    warn!(task_id = %event.id, "failed to record invalid transition: {e}");
                }
                Err(Error::InvalidTransition { from, to })
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl EventWriter for PostgresDb {
    async fn write_event(&self, event: &Event) -> Result<()> {
        metrics::events_written().add(1, &[KeyValue::new("type", event.kind.name())]);
        match &event.kind {
            EventKind::TaskCreated(_) => self.create(event).await,
            _ => self.update(event).await,
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl Database for PostgresDb {
    async fn get_task(&self, id: &str, view: View) -> Result<Task> {
        let row: Option<(Json<Task>,)> = sqlx::query_as("SELECT doc FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((Json(task),)) => Ok(view.apply(task)),
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    async fn list_tasks(&self, req: &ListTasksRequest) -> Result<ListTasksResponse> {
        let page_size = req.effective_page_size();
        let mut query: QueryBuilder<Postgres> = QueryBuilder::new("SELECT t.doc FROM tasks t");
        if req.owner.is_some() {
            query.push(" JOIN task_auth a ON a.task_id = t.id");
        }
        query.push(" WHERE TRUE");

        if let Some(owner) = &req.owner {
            query.push(" AND a.owner = ").push_bind(owner.clone());
        }
        if let Some(token) = req.page_token.as_deref().filter(|t| !t.is_empty()) {
            query.push(" AND t.id < ").push_bind(token.to_string());
        }
        if let Some(state) = req.state {
            query.push(" AND t.state = ").push_bind(state.as_str());
        }
        if !req.name_prefix.is_empty() {
            query
                .push(" AND starts_with(t.name, ")
                .push_bind(req.name_prefix.clone())
                .push(")");
        }
        for (key, value) in &req.tags {
            query
                .push(" AND EXISTS (SELECT 1 FROM task_tags g WHERE g.task_id = t.id AND g.key = ")
                .push_bind(key.clone());
            if !value.is_empty() {
                query.push(" AND g.value = ").push_bind(value.clone());
            }
            query.push(")");
        }
        query
            .push(" ORDER BY t.id DESC LIMIT ")
            .push_bind(page_size as i64);

        let rows: Vec<(Json<Task>,)> = query.build_query_as().fetch_all(&self.pool).await?;
        let tasks: Vec<Task> = rows
            .into_iter()
            .map(|(Json(task),)| req.view.apply(task))
            .collect();

        let next_page_token = next_page_token(&tasks, page_size);
        Ok(ListTasksResponse {
            tasks,
            next_page_token,
        })
    }

    async fn set_task_owner(&self, id: &str, owner: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_auth (task_id, owner) VALUES ($1, $2)
             ON CONFLICT (task_id) DO UPDATE SET owner = EXCLUDED.owner",
        )
        .bind(id)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn task_owner(&self, id: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT owner FROM task_auth WHERE task_id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(owner,)| owner))
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
