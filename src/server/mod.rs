//! HTTP front end and the background loops that run beside it.

pub mod auth;
pub mod routes;
pub mod service;

use std::path::Path;
use std::sync::Arc;

use axum::http::HeaderValue;
use axum::http::header::CACHE_CONTROL;
use axum::routing::get;
use axum::{Router, middleware};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::compute::{self, Dispatcher};
use crate::config::Config;
use crate::db;
use crate::error::Result;
use crate::events::EventWriter;

pub use auth::{Authenticator, Caller};
pub use service::TaskService;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<TaskService>,
    pub auth: Arc<Authenticator>,
}

/// The full router: authenticated API routes plus `/healthz`.
pub fn router(state: AppState, disable_http_cache: bool) -> Router {
    let api = routes::api_routes().route_layer(middleware::from_fn_with_state(
        state.clone(),
        auth::require_auth,
    ));
    let mut app = Router::new()
        .route("/healthz", get(routes::healthz))
        .merge(api)
        .with_state(state)
        .layer(TraceLayer::new_for_http());
    if disable_http_cache {
        app = app.layer(SetResponseHeaderLayer::if_not_present(
            CACHE_CONTROL,
            HeaderValue::from_static("no-store"),
        ));
    }
    app
}

/// Open the database, start the dispatcher and reconciler, and serve the
/// API until `shutdown` fires.
pub async fn run(mut conf: Config, config_path: Option<&Path>, shutdown: CancellationToken) -> Result<()> {
    let db = db::open(&conf.database, conf.worker.max_log_size).await?;
    let compute = compute::build(&conf, config_path, db.clone())?;
    info!(
        backend = compute.sink.backend().name(),
        database = ?conf.database.backend,
        "compute backend ready"
    );

    let mut loops = Vec::new();
    let dispatcher = Dispatcher::new(
        db.clone(),
        compute.sink.clone(),
        conf.scheduler.schedule_rate,
        conf.scheduler.schedule_chunk,
    );
    let cancel = shutdown.clone();
    loops.push(tokio::spawn(async move {
        if let Err(e) = dispatcher.run(cancel).await {
            error!("dispatcher stopped: {e}");
        }
    }));
    if let Some(reconciler) = compute.reconciler.clone() {
        let cancel = shutdown.clone();
        loops.push(tokio::spawn(async move { reconciler.run(cancel).await }));
    }

    let info = service::service_info(&conf);
    let creds = std::mem::take(&mut conf.server.basic_auth);
    let state = AppState {
        service: Arc::new(TaskService::new(db.clone(), Some(compute.sink.clone()), info)),
        auth: Arc::new(Authenticator::new(creds)),
    };
    let app = router(state, conf.server.disable_http_cache);

    let listener = TcpListener::bind(("0.0.0.0", conf.server.http_port)).await?;
    info!(addr = %listener.local_addr()?, "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.clone().cancelled_owned())
        .await?;

    shutdown.cancel();
    for handle in loops {
        let _ = handle.await;
    }
    compute.sink.close().await;
    db.close().await;
    info!("server stopped");
    Ok(())
}
