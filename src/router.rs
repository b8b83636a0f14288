//! Router setup: the BigQuery API plus the bundled front-end.

use crate::backend::Connector;
use crate::handlers::{self, AppState};
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use std::path::PathBuf;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

pub const API_PREFIX: &str = "/api/bigquery";

/// Settings that shape the HTTP surface.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub static_dir: PathBuf,
    pub body_limit_bytes: usize,
}

/// Routes mounted under [`API_PREFIX`].
pub fn api_router<C: Connector>(state: AppState<C>) -> Router {
    Router::new()
        .route("/status", get(handlers::status::<C>))
        .route("/connect", post(handlers::connect::<C>))
        .route("/disconnect", post(handlers::disconnect::<C>))
        .route("/datasets", get(handlers::list_datasets::<C>))
        .route("/tables/:dataset_id", get(handlers::list_tables::<C>))
        .route("/data/:dataset_id/:table_id", get(handlers::table_page::<C>))
        .route("/query", post(handlers::run_query::<C>))
        .with_state(state)
}

/// The full application: API, static files, CORS, body limit and tracing.
pub fn app_router<C: Connector>(state: AppState<C>, settings: &RouterSettings) -> Router {
    Router::new()
        .nest(API_PREFIX, api_router(state))
        .fallback_service(ServeDir::new(&settings.static_dir))
        .layer(DefaultBodyLimit::max(settings.body_limit_bytes))
        .layer(RequestBodyLimitLayer::new(settings.body_limit_bytes))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
