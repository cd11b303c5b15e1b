//! HTTP client for a TES server.
//!
//! [`TesClient`] covers the public API. A remote worker reads its task
//! through [`TesClient`] as a [`TaskReader`] and reports events with
//! [`HttpEventWriter`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::events::{Event, EventWriter};
use crate::model::{
    CancelTaskResponse, CreateTaskResponse, ListTasksRequest, ListTasksResponse, ServiceInfo,
    State, Task, View,
};
use crate::retry::Retrier;
use crate::server::auth::basic_header;
use crate::worker::TaskReader;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

/// Talks to a TES server over REST.
#[derive(Clone)]
pub struct TesClient {
    base: String,
    http: reqwest::Client,
    auth: Option<String>,
}

impl TesClient {
    pub fn new(address: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base: address.trim_end_matches('/').to_string(),
            http,
            auth: None,
        })
    }

    /// Send basic-auth credentials with every request.
    pub fn with_basic_auth(mut self, user: &str, password: &str) -> Self {
        self.auth = Some(basic_header(user, password));
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let req = self.http.request(method, format!("{}{path}", self.base));
        match &self.auth {
            Some(header) => req.header(reqwest::header::AUTHORIZATION, header),
            None => req,
        }
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp.json().await?);
        }
        let text = resp.text().await.unwrap_or_default();
        let msg = serde_json::from_str::<ErrorBody>(&text)
            .map(|b| b.error)
            .unwrap_or(text);
        Err(status_error(status, msg))
    }

    pub async fn create_task(&self, task: &Task) -> Result<CreateTaskResponse> {
        self.send(self.request(reqwest::Method::POST, "/v1/tasks").json(task))
            .await
    }

    pub async fn get_task(&self, id: &str, view: View) -> Result<Task> {
        let req = self
            .request(reqwest::Method::GET, &format!("/v1/tasks/{id}"))
            .query(&[("view", view.to_string())]);
        self.send(req).await
    }

    pub async fn list_tasks(&self, req: &ListTasksRequest) -> Result<ListTasksResponse> {
        let mut query = vec![
            ("name_prefix".to_string(), req.name_prefix.clone()),
            ("view".to_string(), req.view.to_string()),
        ];
        if let Some(state) = req.state {
            query.push(("state".into(), state.to_string()));
        }
        if let Some(size) = req.page_size {
            query.push(("page_size".into(), size.to_string()));
        }
        if let Some(token) = &req.page_token {
            query.push(("page_token".into(), token.clone()));
        }
        for (key, value) in &req.tags {
            query.push(("tag_key".into(), key.clone()));
            query.push(("tag_value".into(), value.clone()));
        }
        self.send(self.request(reqwest::Method::GET, "/v1/tasks").query(&query))
            .await
    }

    pub async fn cancel_task(&self, id: &str) -> Result<CancelTaskResponse> {
        self.send(self.request(reqwest::Method::POST, &format!("/v1/tasks/{id}:cancel")))
            .await
    }

    pub async fn service_info(&self) -> Result<ServiceInfo> {
        self.send(self.request(reqwest::Method::GET, "/v1/service-info"))
            .await
    }

    /// Post one event to the server's ingestion endpoint.
    pub async fn write_event(&self, event: &Event) -> Result<()> {
        let resp = self
            .request(reqwest::Method::POST, "/v1/events")
            .json(event)
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let text = resp.text().await.unwrap_or_default();
        Err(status_error(status, text))
    }

    /// Poll until every task in `ids` is terminal. Returns the tasks in
    /// the order given.
    pub async fn wait(&self, ids: &[String], every: Duration) -> Result<Vec<Task>> {
        let mut done = Vec::with_capacity(ids.len());
        for id in ids {
            loop {
                let task = self.get_task(id, View::Minimal).await?;
                if task.state.is_terminal() {
                    done.push(task);
                    break;
                }
                tokio::time::sleep(every).await;
            }
        }
        Ok(done)
    }
}

/// Map an error response onto the library's error kinds.
fn status_error(status: StatusCode, msg: String) -> Error {
    match status {
        StatusCode::BAD_REQUEST => Error::Validation(vec![msg]),
        StatusCode::NOT_FOUND => Error::NotFound(msg),
        StatusCode::UNAUTHORIZED => Error::Unauthorized,
        StatusCode::CONFLICT => Error::Permanent(msg),
        StatusCode::TOO_MANY_REQUESTS => Error::Transient(format!("{status}: {msg}")),
        s if s.is_server_error() => Error::Transient(format!("{status}: {msg}")),
        _ => Error::Other(format!("{status}: {msg}")),
    }
}

#[async_trait]
impl TaskReader for TesClient {
    async fn task(&self, id: &str) -> Result<Task> {
        self.get_task(id, View::Full).await
    }

    async fn state(&self, id: &str) -> Result<State> {
        Ok(self.get_task(id, View::Minimal).await?.state)
    }
}

/// Streams a worker's events to the server, retrying transient failures.
pub struct HttpEventWriter {
    client: TesClient,
    retrier: Retrier,
    cancel: CancellationToken,
}

impl HttpEventWriter {
    pub fn new(client: TesClient, retrier: Retrier, cancel: CancellationToken) -> Self {
        Self {
            client,
            retrier,
            cancel,
        }
    }
}

#[async_trait]
impl EventWriter for HttpEventWriter {
    async fn write_event(&self, event: &Event) -> Result<()> {
        self.retrier
            .retry(&self.cancel, || self.client.write_event(event))
            .await
    }
}
