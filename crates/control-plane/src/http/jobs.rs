use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use common::api::{
    AgentRegistrationRequest, AgentRegistrationResponse, AgentSummary, DispatchJobRequest,
    JobStatus, JobView,
};
use serde::Deserialize;
use tracing::info;

use super::{map_service_error, parse_limit_offset};
use crate::{
    app_state::AppState,
    error::ApiResult,
    services::{self, jobs::JobRequest},
    validation,
};

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/v1/agents", post(register_agent))
        .route("/api/v1/agents/{agent_id}", get(get_agent))
        .route(
            "/api/v1/agents/{agent_id}/jobs",
            post(dispatch_job).get(list_agent_jobs),
        )
        .route("/api/v1/jobs/{job_id}", get(get_job))
        .route("/api/v1/jobs/{job_id}/retry", post(retry_job))
}

#[utoipa::path(
    post,
    path = "/api/v1/agents",
    request_body = AgentRegistrationRequest,
    responses(
        (status = 201, description = "Agent registered; the secret is shown only once", body = AgentRegistrationResponse),
        (status = 409, description = "Agent id already taken", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "agents"
)]
pub(crate) async fn register_agent(
    State(state): State<AppState>,
    Json(body): Json<AgentRegistrationRequest>,
) -> ApiResult<(StatusCode, Json<AgentRegistrationResponse>)> {
    let max_len = state.limits.max_field_len;
    let id = validation::normalize_opt_id("id", body.id, max_len)?;
    validation::validate_required_str("name", &body.name, max_len)?;
    let metadata = validation::normalize_metadata(body.metadata, &state.limits)?;

    let registration = services::agents::register_agent(
        &state.db,
        state.secrets.as_ref(),
        id,
        body.name.trim().to_string(),
        metadata,
    )
    .await
    .map_err(map_service_error)?;
    Ok((
        StatusCode::CREATED,
        Json(AgentRegistrationResponse {
            agent_id: registration.agent.id,
            secret: registration.secret,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/agents/{agent_id}",
    params(("agent_id" = String, Path, description = "Agent identifier")),
    responses(
        (status = 200, description = "Agent details", body = AgentSummary),
        (status = 404, description = "Unknown agent", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "agents"
)]
pub(crate) async fn get_agent(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<AgentSummary>> {
    let agent = services::agents::get_agent(&state.db, &agent_id)
        .await
        .map_err(map_service_error)?;
    Ok(Json(agent.summary()))
}

#[derive(Debug, Default, Deserialize, utoipa::IntoParams)]
pub(crate) struct DispatchParams {
    /// Block until the agent reports a terminal state.
    #[serde(default)]
    pub wait: bool,
}

#[utoipa::path(
    post,
    path = "/api/v1/agents/{agent_id}/jobs",
    params(
        ("agent_id" = String, Path, description = "Agent identifier"),
        DispatchParams
    ),
    request_body = DispatchJobRequest,
    responses(
        (status = 201, description = "Job queued", body = JobView),
        (status = 200, description = "In-flight job with the same idempotency key, or the finished job when waiting", body = JobView),
        (status = 404, description = "Unknown agent", body = super::ErrorResponse),
        (status = 409, description = "Job id already exists", body = super::ErrorResponse),
        (status = 422, description = "Agent reported failure while waiting", body = super::ErrorResponse),
        (status = 504, description = "Job did not finish in time", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "jobs"
)]
pub(crate) async fn dispatch_job(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(params): Query<DispatchParams>,
    Json(body): Json<DispatchJobRequest>,
) -> ApiResult<(StatusCode, Json<JobView>)> {
    let max_len = state.limits.max_field_len;
    validation::validate_job_type(&body.job_type, &state.limits)?;
    let id = validation::normalize_opt_id("id", body.id, max_len)?;
    let idempotency_key = validation::normalize_opt_id("idempotency_key", body.idempotency_key, max_len)?;

    let mut request = JobRequest::new(agent_id, body.job_type.trim(), body.payload);
    request.id = id;
    request.idempotency_key = idempotency_key;

    if params.wait {
        let job = state
            .jobs
            .dispatch_and_wait(request)
            .await
            .map_err(map_service_error)?;
        return Ok((StatusCode::OK, Json(job.to_view())));
    }

    let dispatched = state
        .jobs
        .dispatch_once(request)
        .await
        .map_err(map_service_error)?;
    let status = if dispatched.created {
        StatusCode::CREATED
    } else {
        info!(job_id = %dispatched.job.id, "dispatch matched an in-flight job");
        StatusCode::OK
    };
    Ok((status, Json(dispatched.job.to_view())))
}

#[derive(Debug, Default, Deserialize, utoipa::IntoParams)]
pub(crate) struct JobListParams {
    pub status: Option<JobStatus>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[utoipa::path(
    get,
    path = "/api/v1/agents/{agent_id}/jobs",
    params(
        ("agent_id" = String, Path, description = "Agent identifier"),
        JobListParams
    ),
    responses(
        (status = 200, description = "Jobs for the agent, newest first", body = [JobView]),
        (status = 404, description = "Unknown agent", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "jobs"
)]
pub(crate) async fn list_agent_jobs(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Query(params): Query<JobListParams>,
) -> ApiResult<Json<Vec<JobView>>> {
    let (limit, offset) = parse_limit_offset(params.limit, params.offset)?;
    services::agents::get_agent(&state.db, &agent_id)
        .await
        .map_err(map_service_error)?;
    let jobs = state
        .jobs
        .list_for_agent(&agent_id, params.status, limit, offset)
        .await
        .map_err(map_service_error)?;
    Ok(Json(jobs.iter().map(|job| job.to_view()).collect()))
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs/{job_id}",
    params(("job_id" = String, Path, description = "Job identifier")),
    responses(
        (status = 200, description = "Job details", body = JobView),
        (status = 404, description = "Unknown job", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "jobs"
)]
pub(crate) async fn get_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<Json<JobView>> {
    let job = state.jobs.get(&job_id).await.map_err(map_service_error)?;
    Ok(Json(job.to_view()))
}

#[utoipa::path(
    post,
    path = "/api/v1/jobs/{job_id}/retry",
    params(("job_id" = String, Path, description = "Failed job to re-dispatch")),
    responses(
        (status = 201, description = "Copy of the job queued under a new id", body = JobView),
        (status = 404, description = "Unknown job", body = super::ErrorResponse),
        (status = 409, description = "Job has not failed", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "jobs"
)]
pub(crate) async fn retry_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> ApiResult<(StatusCode, Json<JobView>)> {
    let job = state.jobs.retry(&job_id).await.map_err(map_service_error)?;
    Ok((StatusCode::CREATED, Json(job.to_view())))
}
