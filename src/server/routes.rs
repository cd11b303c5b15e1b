//! REST handlers for the TES v1 API.

use axum::extract::{Path, Query, State};
use axum::http::header::WWW_AUTHENTICATE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use tracing::error;

use super::AppState;
use super::auth::Caller;
use crate::error::Error;
use crate::events::Event;
use crate::model::{
    CancelTaskResponse, CreateTaskResponse, ListTasksRequest, ListTasksResponse, ServiceInfo,
    State as TaskState, Task, View,
};

/// An [`Error`] on its way to becoming an HTTP response.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::AlreadyExists(_) | Error::InvalidTransition { .. } => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            Error::Validation(_) => "InvalidArgument",
            Error::NotFound(_) => "NotFound",
            Error::Unauthorized => "Unauthenticated",
            Error::AlreadyExists(_) => "AlreadyExists",
            Error::InvalidTransition { .. } => "FailedPrecondition",
            _ => "Internal",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Internal failures are logged here and never described to clients.
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("request failed: {}", self.0);
            "internal error".to_string()
        } else {
            self.0.to_string()
        };
        let body = Json(json!({ "error": message, "code": self.code() }));
        if status == StatusCode::UNAUTHORIZED {
            (status, [(WWW_AUTHENTICATE, "Basic realm=\"tes\"")], body).into_response()
        } else {
            (status, body).into_response()
        }
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Routes that require a [`Caller`] in the request extensions.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/v1/tasks", post(create_task).get(list_tasks))
        .route("/v1/tasks/:id", get(get_task).post(task_action))
        .route("/v1/service-info", get(service_info))
        .route("/v1/events", post(write_event))
}

/// Liveness plus database reachability; needs no credentials.
pub async fn healthz(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    state.service.db().health_check().await?;
    Ok("ok")
}

async fn create_task(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(task): Json<Task>,
) -> ApiResult<CreateTaskResponse> {
    Ok(Json(state.service.create_task(task, &caller).await?))
}

#[derive(Debug, Default, Deserialize)]
struct ViewQuery {
    #[serde(default)]
    view: Option<String>,
}

async fn get_task(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(id): Path<String>,
    Query(q): Query<ViewQuery>,
) -> ApiResult<Task> {
    let view: View = q.view.as_deref().unwrap_or_default().parse()?;
    Ok(Json(state.service.get_task(&id, view, &caller).await?))
}

/// `POST /v1/tasks/{id}:cancel`. The router sees `{id}:cancel` as one
/// path segment.
async fn task_action(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Path(segment): Path<String>,
) -> Result<Json<CancelTaskResponse>, ApiError> {
    let id = segment
        .strip_suffix(":cancel")
        .ok_or_else(|| Error::NotFound(segment.clone()))?;
    Ok(Json(state.service.cancel_task(id, &caller).await?))
}

async fn list_tasks(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Query(params): Query<Vec<(String, String)>>,
) -> ApiResult<ListTasksResponse> {
    let req = parse_list_query(&params)?;
    Ok(Json(state.service.list_tasks(req, &caller).await?))
}

async fn service_info(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(state.service.service_info().clone())
}

async fn write_event(
    State(state): State<AppState>,
    Extension(caller): Extension<Caller>,
    Json(event): Json<Event>,
) -> Result<StatusCode, ApiError> {
    state.service.write_event(&event, &caller).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Build a list request from query pairs.
///
/// `tag_key` and `tag_value` may repeat (with or without a `[]` suffix);
/// the i-th key pairs with the i-th value and missing values are empty.
pub fn parse_list_query(params: &[(String, String)]) -> Result<ListTasksRequest, Error> {
    let mut req = ListTasksRequest::default();
    let mut keys = Vec::new();
    let mut values = Vec::new();
    let mut errs = Vec::new();

    for (key, value) in params {
        match key.trim_end_matches("[]") {
            "name_prefix" => req.name_prefix = value.clone(),
            "state" if !value.is_empty() => match value.parse::<TaskState>() {
                Ok(state) => req.state = Some(state),
                Err(_) => errs.push(format!("unknown state: {value}")),
            },
            "tag_key" => keys.push(value.clone()),
            "tag_value" => values.push(value.clone()),
            "page_size" if !value.is_empty() => match value.parse() {
                Ok(n) => req.page_size = Some(n),
                Err(_) => errs.push(format!("invalid page_size: {value}")),
            },
            "page_token" if !value.is_empty() => req.page_token = Some(value.clone()),
            "view" => match value.parse() {
                Ok(view) => req.view = view,
                Err(e) => errs.push(e.to_string()),
            },
            _ => {}
        }
    }
    if !errs.is_empty() {
        return Err(Error::Validation(errs));
    }

    req.tags = keys
        .into_iter()
        .enumerate()
        .map(|(i, k)| (k, values.get(i).cloned().unwrap_or_default()))
        .collect();
    Ok(req)
}
