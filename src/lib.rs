pub mod batch;
pub mod config;
mod routes;
pub mod state;
pub mod store;
pub mod webhook;

use axum::{
    extract::{DefaultBodyLimit, Request},
    routing::get,
    Router, ServiceExt,
};
use routes::{process::process_routes, webhook::webhook_routes, ApiDoc};
use state::AppState;
use std::{net::SocketAddr, str::FromStr, sync::Arc};
use tower::{Layer, ServiceBuilder};
use tower_http::{
    cors::{Any, CorsLayer},
    normalize_path::{NormalizePath, NormalizePathLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use utoipa::OpenApi;
use utoipa_rapidoc::RapiDoc;

/// Build the full application, routes and middleware included.
pub fn app(app_state: AppState) -> NormalizePath<Router> {
    let config = app_state.config().clone();
    let served_dir = app_state.layout().served_dir();

    let api_routes = Router::new()
        .route("/ping", get(routes::ping))
        .nest("/process", process_routes())
        .nest("/webhook", webhook_routes());

    let app = Router::new()
        .nest("/api", api_routes)
        .nest_service("/output", ServeDir::new(served_dir))
        .merge(RapiDoc::with_openapi("/api-docs/openapi.json", ApiDoc::openapi()).path("/docs"))
        .route("/", get(routes::banner))
        .route("/health_check", get(routes::health_check))
        .layer(DefaultBodyLimit::max(config.max_upload_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .into_inner(),
        )
        .with_state(Arc::new(app_state));

    // local frontends run on another origin
    let app = if config.env == "dev" {
        app.layer(
            CorsLayer::new()
                .allow_headers(Any)
                .allow_origin(Any)
                .allow_methods(Any),
        )
    } else {
        app
    };

    NormalizePathLayer::trim_trailing_slash().layer(app)
}

pub async fn run(app_state: AppState) -> anyhow::Result<()> {
    let config = app_state.config().clone();
    let app = app(app_state);

    let addr = SocketAddr::from_str(format!("{}:{}", &config.host, &config.port).as_str())?;

    let listener = tokio::net::TcpListener::bind(addr).await?;

    tracing::info!("Listening on http://{}", listener.local_addr()?);

    axum::serve(listener, ServiceExt::<Request>::into_make_service(app))
        .with_graceful_shutdown(signal_shutdown())
        .await?;

    Ok(())
}

async fn signal_shutdown() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("signal shutdown");
}
