use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;

use crate::{app_state::AppState, auth::require_operator_auth};

#[derive(Debug, Serialize, utoipa::ToSchema)]
pub(crate) struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub git_sha: &'static str,
    pub built_at: &'static str,
    pub schema_version: Option<i64>,
    pub target_schema_version: Option<i64>,
    pub pending_migrations: usize,
    pub game_profiles: usize,
}

pub fn api_router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new()
        .route(
            "/metrics",
            get(metrics).route_layer(middleware::from_fn_with_state(state, require_operator_auth)),
        )
        .route("/health", get(healthz))
}

pub fn metrics_router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new().route(
        "/metrics",
        get(metrics).route_layer(middleware::from_fn_with_state(state, require_operator_auth)),
    )
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Health check", body = HealthResponse)),
    tag = "system"
)]
pub(crate) async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            version: crate::version::VERSION,
            git_sha: crate::version::GIT_SHA,
            built_at: crate::version::BUILD_TIMESTAMP,
            schema_version: state.schema.latest_applied,
            target_schema_version: state.schema.latest_available,
            pending_migrations: state.schema.pending.len(),
            game_profiles: state.profiles.len(),
        }),
    )
}

#[utoipa::path(
    get,
    path = "/metrics",
    responses((status = 200, description = "Prometheus metrics", content_type = "text/plain")),
    security(("operatorBearer" = [])),
    tag = "system"
)]
pub(crate) async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = state.metrics_handle.render();
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4",
        )],
        body,
    )
}
