use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    middleware,
    routing::{get, post},
};
use chrono::Utc;
use common::api::{
    AgentHeartbeatRequest, AgentSummary, JobFinishRequest, JobFinishResponse, JobPollResponse,
    JobStartResponse,
};
use serde::Deserialize;
use tower_http::limit::RequestBodyLimitLayer;

use super::map_service_error;
use crate::{
    app_state::AppState,
    auth::{AuthenticatedAgent, require_agent_signature},
    error::ApiResult,
    services::{self, jobs::FinishReport},
    validation,
};

pub fn router(state: AppState) -> Router<AppState> {
    let body_limit = state.limits.agent_body_bytes as usize;

    Router::<AppState>::new()
        .route("/agent/{node_id}/jobs", get(poll_jobs))
        .route("/agent/{node_id}/jobs/{job_id}/start", post(start_job))
        .route("/agent/{node_id}/jobs/{job_id}/finish", post(finish_job))
        .route("/agent/{node_id}/heartbeat", post(heartbeat))
        .route_layer(middleware::from_fn_with_state(
            state,
            require_agent_signature,
        ))
        .layer(RequestBodyLimitLayer::new(body_limit))
}

#[derive(Debug, Deserialize, utoipa::IntoParams)]
pub(crate) struct PollParams {
    /// Maximum number of jobs; the configured default applies when absent or 0.
    pub limit: Option<u32>,
}

#[utoipa::path(
    get,
    path = "/agent/{node_id}/jobs",
    params(
        ("node_id" = String, Path, description = "Agent identifier"),
        PollParams
    ),
    responses(
        (status = 200, description = "Queued jobs, oldest first", body = JobPollResponse),
        (status = 401, description = "Signature rejected", body = super::ErrorResponse)
    ),
    security(("agentSignature" = [])),
    tag = "agent"
)]
pub(crate) async fn poll_jobs(
    State(state): State<AppState>,
    Extension(agent): Extension<AuthenticatedAgent>,
    Query(params): Query<PollParams>,
) -> ApiResult<Json<JobPollResponse>> {
    let jobs = state
        .jobs
        .poll(&agent.agent_id, params.limit)
        .await
        .map_err(map_service_error)?;
    Ok(Json(JobPollResponse {
        jobs: jobs.iter().map(|job| job.to_polled()).collect(),
    }))
}

#[utoipa::path(
    post,
    path = "/agent/{node_id}/jobs/{job_id}/start",
    params(
        ("node_id" = String, Path, description = "Agent identifier"),
        ("job_id" = String, Path, description = "Job identifier")
    ),
    responses(
        (status = 200, description = "Job claimed", body = JobStartResponse),
        (status = 404, description = "No such job for this agent", body = super::ErrorResponse),
        (status = 409, description = "Job is no longer queued", body = super::ErrorResponse)
    ),
    security(("agentSignature" = [])),
    tag = "agent"
)]
pub(crate) async fn start_job(
    State(state): State<AppState>,
    Extension(agent): Extension<AuthenticatedAgent>,
    Path((_node_id, job_id)): Path<(String, String)>,
) -> ApiResult<Json<JobStartResponse>> {
    let job = state
        .jobs
        .start(&agent.agent_id, &job_id)
        .await
        .map_err(map_service_error)?;
    Ok(Json(JobStartResponse {
        status: job.status(),
        started_at: job.started_at.unwrap_or(job.created_at),
        id: job.id,
    }))
}

#[utoipa::path(
    post,
    path = "/agent/{node_id}/jobs/{job_id}/finish",
    params(
        ("node_id" = String, Path, description = "Agent identifier"),
        ("job_id" = String, Path, description = "Job identifier")
    ),
    request_body = JobFinishRequest,
    responses(
        (status = 200, description = "Terminal state recorded", body = JobFinishResponse),
        (status = 400, description = "Unknown status value", body = super::ErrorResponse),
        (status = 404, description = "No such job for this agent", body = super::ErrorResponse),
        (status = 413, description = "Payload too large")
    ),
    security(("agentSignature" = [])),
    tag = "agent"
)]
pub(crate) async fn finish_job(
    State(state): State<AppState>,
    Extension(agent): Extension<AuthenticatedAgent>,
    Path((_node_id, job_id)): Path<(String, String)>,
    Json(body): Json<JobFinishRequest>,
) -> ApiResult<Json<JobFinishResponse>> {
    let report = FinishReport {
        status: body.status,
        log_text: body.log_text,
        error_text: body.error_text,
        result_payload: body.result_payload,
    };
    let job = state
        .jobs
        .finish(&agent.agent_id, &job_id, report)
        .await
        .map_err(map_service_error)?;
    Ok(Json(JobFinishResponse {
        status: job.status(),
        finished_at: job.finished_at,
        id: job.id,
    }))
}

#[utoipa::path(
    post,
    path = "/agent/{node_id}/heartbeat",
    params(("node_id" = String, Path, description = "Agent identifier")),
    request_body = AgentHeartbeatRequest,
    responses(
        (status = 200, description = "Heartbeat recorded", body = AgentSummary),
        (status = 401, description = "Signature rejected", body = super::ErrorResponse)
    ),
    security(("agentSignature" = [])),
    tag = "agent"
)]
pub(crate) async fn heartbeat(
    State(state): State<AppState>,
    Extension(agent): Extension<AuthenticatedAgent>,
    Json(body): Json<AgentHeartbeatRequest>,
) -> ApiResult<Json<AgentSummary>> {
    let metadata = validation::normalize_metadata(body.metadata, &state.limits)?;
    let address = validation::normalize_opt_id(
        "address",
        body.address,
        state.limits.max_field_len,
    )?
    .or_else(|| agent.remote_addr.map(|addr| addr.ip().to_string()));

    let record = services::agents::heartbeat(
        &state.db,
        &agent.agent_id,
        address.as_deref(),
        &metadata,
        Utc::now(),
    )
    .await
    .map_err(map_service_error)?;
    Ok(Json(record.summary()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::tests::send;
    use crate::persistence::jobs::{self as job_store, NewJob};
    use crate::services::test_support::{agent_secret, seed_agent, setup_state};
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use common::signing::{
        AGENT_ID_HEADER, SIGNATURE_HEADER, SigningInput, TIMESTAMP_HEADER, sign,
    };
    use serde_json::json;

    fn signed(
        agent_id: &str,
        secret: &str,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Request<Body> {
        let timestamp = Utc::now().timestamp();
        let signature = sign(
            secret.as_bytes(),
            &SigningInput {
                agent_id,
                customer_id: None,
                method,
                path,
                timestamp: Some(timestamp),
            },
        );
        let builder = Request::builder()
            .method(method)
            .uri(path)
            .header(AGENT_ID_HEADER, agent_id)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(SIGNATURE_HEADER, signature);
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        }
    }

    async fn queue(state: &AppState, id: &str, agent: &str) {
        job_store::insert_job(
            &state.db,
            &NewJob {
                id: id.into(),
                agent_id: agent.into(),
                job_type: "ts3.viewer_snapshot".into(),
                payload: json!({"instance_id": "i-1"}),
                idempotency_key: None,
                retry_count: 0,
                created_at: Utc::now(),
            },
        )
        .await
        .expect("job");
    }

    #[tokio::test]
    async fn signed_poll_start_finish_flow() {
        let state = setup_state().await;
        seed_agent(&state.db, "node-1").await;
        queue(&state, "job-1", "node-1").await;
        let secret = agent_secret("node-1");

        let (status, body) = send(
            &state,
            signed("node-1", &secret, "GET", "/agent/node-1/jobs", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["jobs"][0]["id"], "job-1");
        assert_eq!(body["jobs"][0]["type"], "ts3.viewer_snapshot");

        let (status, body) = send(
            &state,
            signed("node-1", &secret, "POST", "/agent/node-1/jobs/job-1/start", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "running");

        let (status, body) = send(
            &state,
            signed("node-1", &secret, "POST", "/agent/node-1/jobs/job-1/start", None),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");

        let (status, body) = send(
            &state,
            signed(
                "node-1",
                &secret,
                "POST",
                "/agent/node-1/jobs/job-1/finish",
                Some(json!({"status": "success", "result_payload": {"clients": 3}})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");

        let snapshot =
            crate::persistence::snapshots::get_viewer_snapshot(&state.db, "node-1", "i-1")
                .await
                .expect("snapshot")
                .expect("cached");
        assert_eq!(snapshot.snapshot.0, json!({"clients": 3}));
    }

    #[tokio::test]
    async fn bad_signatures_are_rejected() {
        let state = setup_state().await;
        seed_agent(&state.db, "node-1").await;
        seed_agent(&state.db, "node-2").await;

        let (status, body) = send(
            &state,
            signed("node-1", "wrong-secret", "GET", "/agent/node-1/jobs", None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["code"], "unauthorized");

        // Valid signature for node-2 used against node-1's queue.
        let (status, _) = send(
            &state,
            signed(
                "node-2",
                &agent_secret("node-2"),
                "GET",
                "/agent/node-1/jobs",
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (status, _) = send(
            &state,
            signed("ghost", "whatever", "GET", "/agent/ghost/jobs", None),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let unsigned = Request::builder()
            .uri("/agent/node-1/jobs")
            .body(Body::empty())
            .expect("request");
        let (status, _) = send(&state, unsigned).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn foreign_job_and_bad_status_are_reported() {
        let state = setup_state().await;
        seed_agent(&state.db, "node-1").await;
        seed_agent(&state.db, "node-2").await;
        queue(&state, "job-2", "node-2").await;
        queue(&state, "job-1", "node-1").await;
        let secret = agent_secret("node-1");

        let (status, _) = send(
            &state,
            signed("node-1", &secret, "POST", "/agent/node-1/jobs/job-2/start", None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = send(
            &state,
            signed(
                "node-1",
                &secret,
                "POST",
                "/agent/node-1/jobs/job-1/finish",
                Some(json!({"status": "done"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "bad_request");
    }

    #[tokio::test]
    async fn heartbeat_records_address_and_metadata() {
        let state = setup_state().await;
        seed_agent(&state.db, "node-1").await;
        let (status, body) = send(
            &state,
            signed(
                "node-1",
                &agent_secret("node-1"),
                "POST",
                "/agent/node-1/heartbeat",
                Some(json!({
                    "address": "10.0.0.5",
                    "metadata": {"service_url": "http://10.0.0.5:8443"}
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["last_heartbeat_addr"], "10.0.0.5");
        assert_eq!(body["metadata"]["service_url"], "http://10.0.0.5:8443");
    }

    #[tokio::test]
    async fn oversized_bodies_are_rejected() {
        let state = setup_state().await;
        seed_agent(&state.db, "node-1").await;
        queue(&state, "job-1", "node-1").await;
        let big = "x".repeat(state.limits.agent_body_bytes as usize + 1);
        let (status, _) = send(
            &state,
            signed(
                "node-1",
                &agent_secret("node-1"),
                "POST",
                "/agent/node-1/jobs/job-1/finish",
                Some(json!({"status": "success", "log_text": big})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    }
}
