//! HTTP surface, driven through the router without a socket.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode, header};
use secrecy::SecretString;
use serde_json::{Value, json};
use tes_rs::config::{BasicCredential, Config};
use tes_rs::db::EmbeddedDb;
use tes_rs::server::auth::basic_header;
use tes_rs::server::service::service_info;
use tes_rs::server::{AppState, Authenticator, TaskService, router};
use tower::ServiceExt;

fn app(creds: Vec<BasicCredential>) -> Router {
    let db = Arc::new(EmbeddedDb::temporary().unwrap());
    let state = AppState {
        service: Arc::new(TaskService::new(db, None, service_info(&Config::default()))),
        auth: Arc::new(Authenticator::new(creds)),
    };
    router(state, true)
}

fn cred(user: &str, password: &str, admin: bool) -> BasicCredential {
    BasicCredential {
        user: user.into(),
        password: SecretString::from(password.to_string()),
        admin,
    }
}

async fn send(app: &Router, req: Request<Body>) -> (StatusCode, Value) {
    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::String(String::from_utf8_lossy(&bytes).into()))
    };
    (status, body)
}

fn get(uri: &str) -> Request<Body> {
    Request::get(uri).body(Body::empty()).unwrap()
}

fn post(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn hello_world() -> Value {
    json!({
        "name": "hello",
        "tags": {"env": "prod"},
        "executors": [{"image": "alpine", "command": ["echo", "hello world"]}]
    })
}

#[tokio::test]
async fn create_then_get_and_list() {
    let app = app(vec![]);

    let (status, body) = send(&app, post("/v1/tasks", hello_world())).await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, get(&format!("/v1/tasks/{id}"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], id.as_str());
    assert_eq!(body["state"], "QUEUED");
    // Minimal view by default.
    assert!(body.get("executors").is_none());

    let (_, body) = send(&app, get(&format!("/v1/tasks/{id}?view=BASIC"))).await;
    assert_eq!(body["name"], "hello");
    assert_eq!(body["executors"][0]["image"], "alpine");

    let (status, body) = send(&app, get("/v1/tasks?tag_key=env&tag_value=prod")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["tasks"].as_array().unwrap().len(), 1);
    let (_, body) = send(&app, get("/v1/tasks?tag_key=env&tag_value=dev")).await;
    assert!(body["tasks"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn cancel_action() {
    let app = app(vec![]);
    let (_, body) = send(&app, post("/v1/tasks", hello_world())).await;
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, post(&format!("/v1/tasks/{id}:cancel"), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));

    let (_, body) = send(&app, get(&format!("/v1/tasks/{id}"))).await;
    assert_eq!(body["state"], "CANCELED");

    let (status, _) = send(&app, post(&format!("/v1/tasks/{id}:pause"), json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalid_task_is_a_bad_request() {
    let app = app(vec![]);
    let (status, body) = send(&app, post("/v1/tasks", json!({"name": "empty", "executors": []}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "InvalidArgument");
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .contains("at least one executor is required")
    );

    let (status, body) = send(&app, get("/v1/tasks/missing")).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NotFound");

    let (status, _) = send(&app, get("/v1/tasks?state=SLEEPING")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn credentials_are_required_when_configured() {
    let app = app(vec![cred("alice", "wonderland", false), cred("bob", "builder", false)]);

    let resp = app.clone().oneshot(get("/v1/tasks")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        resp.headers().get(header::WWW_AUTHENTICATE).unwrap(),
        "Basic realm=\"tes\""
    );

    let mut req = get("/v1/tasks");
    req.headers_mut().insert(
        header::AUTHORIZATION,
        basic_header("alice", "wrong").parse().unwrap(),
    );
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let mut req = post("/v1/tasks", hello_world());
    req.headers_mut().insert(
        header::AUTHORIZATION,
        basic_header("alice", "wonderland").parse().unwrap(),
    );
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].as_str().unwrap().to_string();

    let mut req = get(&format!("/v1/tasks/{id}"));
    req.headers_mut().insert(
        header::AUTHORIZATION,
        basic_header("bob", "builder").parse().unwrap(),
    );
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Health checks stay open.
    let (status, _) = send(&app, get("/healthz")).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn service_info_and_cache_header() {
    let app = app(vec![]);
    let resp = app.clone().oneshot(get("/v1/service-info")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["type"]["artifact"], "tes");
    assert_eq!(body["storage"], json!(["file", "http", "https"]));
}

#[tokio::test]
async fn events_endpoint_applies_worker_updates() {
    let app = app(vec![]);
    let (_, body) = send(&app, post("/v1/tasks", hello_world())).await;
    let id = body["id"].as_str().unwrap().to_string();

    let event = tes_rs::events::Event::state(&id, 0, tes_rs::model::State::Initializing);
    let (status, _) = send(&app, post("/v1/events", serde_json::to_value(&event).unwrap())).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, body) = send(&app, get(&format!("/v1/tasks/{id}"))).await;
    assert_eq!(body["state"], "INITIALIZING");
}
