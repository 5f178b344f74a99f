use axum::{Router, http::HeaderName, middleware};
use common::api;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
};

use crate::{
    app_state::AppState,
    auth::require_operator_auth,
    error::{ApiResult, AppError},
    metrics::HttpMetricsLayer,
    telemetry,
};

mod agents;
mod error_mapper;
mod jobs;
mod ports;
mod system;

pub(crate) use error_mapper::map_service_error;

const REQUEST_ID_HEADER: &str = "x-request-id";
pub const DEFAULT_PAGE_LIMIT: u32 = 50;
pub const MAX_PAGE_LIMIT: u32 = 500;

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub(crate) struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug, Default, Deserialize, utoipa::IntoParams, utoipa::ToSchema)]
pub(crate) struct ListParams {
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

pub fn parse_limit_offset(limit: Option<u32>, offset: Option<u32>) -> ApiResult<(u32, u32)> {
    let limit = limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    if limit == 0 || limit > MAX_PAGE_LIMIT {
        return Err(AppError::bad_request(format!(
            "limit must be between 1 and {MAX_PAGE_LIMIT}"
        )));
    }
    Ok((limit, offset.unwrap_or(0)))
}

pub fn build_router(state: AppState) -> Router<AppState> {
    let request_id = HeaderName::from_static(REQUEST_ID_HEADER);
    let middleware_stack = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(telemetry::make_request_span::<axum::body::Body>),
        )
        .layer(PropagateRequestIdLayer::new(request_id))
        .layer(HttpMetricsLayer);

    let operator = Router::<AppState>::new()
        .merge(jobs::router())
        .merge(ports::router())
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_operator_auth,
        ));

    Router::<AppState>::new()
        .merge(system::api_router(state.clone()))
        .merge(agents::router(state.clone()))
        .merge(operator)
        .layer(middleware_stack)
}

pub fn build_metrics_router(state: AppState) -> Router<AppState> {
    system::metrics_router(state)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        system::healthz,
        system::metrics,
        agents::poll_jobs,
        agents::start_job,
        agents::finish_job,
        agents::heartbeat,
        jobs::register_agent,
        jobs::get_agent,
        jobs::dispatch_job,
        jobs::list_agent_jobs,
        jobs::get_job,
        jobs::retry_job,
        ports::create_pool,
        ports::list_pools,
        ports::allocate_block,
        ports::allocate_block_range,
        ports::list_blocks,
        ports::create_instance,
        ports::instance_ports,
        ports::allocate_instance_ports,
        ports::release_instance_ports,
    ),
    components(schemas(
        api::JobStatus,
        api::PolledJob,
        api::JobPollResponse,
        api::JobStartResponse,
        api::JobFinishRequest,
        api::JobFinishResponse,
        api::JobView,
        api::DispatchJobRequest,
        api::PortCheck,
        api::PortCheckRequest,
        api::PortCheckResult,
        api::PortCheckResponse,
        api::AgentHeartbeatRequest,
        api::AgentRegistrationRequest,
        api::AgentRegistrationResponse,
        api::AgentSummary,
        api::PortPoolCreateRequest,
        api::PortPoolView,
        api::PortBlockRequest,
        api::PortBlockRangeRequest,
        api::PortBlockView,
        api::InstanceCreateRequest,
        api::PortAllocationView,
        api::InstancePortsResponse,
        system::HealthResponse,
        ErrorResponse,
        ListParams,
    )),
    tags(
        (name = "system", description = "Health and metrics"),
        (name = "agent", description = "Signed endpoints polled by agents"),
        (name = "agents", description = "Agent registry"),
        (name = "jobs", description = "Agent job dispatch and inspection"),
        (name = "ports", description = "Port pools, customer blocks and instance allocations"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.info.title = "Agent Control Plane API".to_string();
        openapi.info.version = crate::version::FULL_VERSION.to_string();

        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_schemes_from_iter([
            (
                "agentSignature",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::with_description(
                    common::signing::SIGNATURE_HEADER,
                    "Hex HMAC-SHA256 over agent id, method, path and timestamp, keyed by \
                     the agent secret. Sent with x-agent-id and x-agent-timestamp.",
                ))),
            ),
            (
                "operatorBearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("opaque")
                        .description(Some(
                            "Bearer operator token for operator APIs (header name configurable).",
                        ))
                        .build(),
                ),
            ),
        ]);
    }
}
