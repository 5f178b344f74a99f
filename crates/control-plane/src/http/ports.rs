use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use common::api::{
    InstanceCreateRequest, InstancePortsResponse, PortBlockRangeRequest, PortBlockRequest,
    PortBlockView, PortPoolCreateRequest, PortPoolView,
};
use uuid::Uuid;

use super::map_service_error;
use crate::{
    app_state::AppState,
    error::ApiResult,
    persistence::{self as db, InstanceRecord, NewInstance, NewPortPool, PortAllocationRecord},
    profiles::GameProfile,
    services::{self, ports::AllocationError},
    validation,
};

pub fn router() -> Router<AppState> {
    Router::<AppState>::new()
        .route(
            "/api/v1/agents/{agent_id}/pools",
            post(create_pool).get(list_pools),
        )
        .route(
            "/api/v1/pools/{pool_id}/blocks",
            post(allocate_block).get(list_blocks),
        )
        .route("/api/v1/pools/{pool_id}/blocks/range", post(allocate_block_range))
        .route("/api/v1/instances", post(create_instance))
        .route(
            "/api/v1/instances/{instance_id}/ports",
            get(instance_ports)
                .post(allocate_instance_ports)
                .delete(release_instance_ports),
        )
}

#[utoipa::path(
    post,
    path = "/api/v1/agents/{agent_id}/pools",
    params(("agent_id" = String, Path, description = "Agent owning the pool")),
    request_body = PortPoolCreateRequest,
    responses(
        (status = 201, description = "Pool created", body = PortPoolView),
        (status = 400, description = "Invalid range or tag", body = super::ErrorResponse),
        (status = 404, description = "Unknown agent", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "ports"
)]
pub(crate) async fn create_pool(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
    Json(body): Json<PortPoolCreateRequest>,
) -> ApiResult<(StatusCode, Json<PortPoolView>)> {
    validation::validate_required_str("tag", &body.tag, state.limits.max_field_len)?;
    validation::validate_port_range(body.start_port, body.end_port)?;
    services::agents::get_agent(&state.db, &agent_id)
        .await
        .map_err(map_service_error)?;

    let pool = db::ports::create_pool(
        &state.db,
        &NewPortPool {
            id: Uuid::new_v4().to_string(),
            agent_id,
            tag: body.tag.trim().to_string(),
            start_port: body.start_port,
            end_port: body.end_port,
            enabled: body.enabled.unwrap_or(true),
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(pool.to_view())))
}

#[utoipa::path(
    get,
    path = "/api/v1/agents/{agent_id}/pools",
    params(("agent_id" = String, Path, description = "Agent owning the pools")),
    responses(
        (status = 200, description = "Pools ordered by tag and start port", body = [PortPoolView]),
        (status = 404, description = "Unknown agent", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "ports"
)]
pub(crate) async fn list_pools(
    State(state): State<AppState>,
    Path(agent_id): Path<String>,
) -> ApiResult<Json<Vec<PortPoolView>>> {
    services::agents::get_agent(&state.db, &agent_id)
        .await
        .map_err(map_service_error)?;
    let pools = db::ports::list_pools_for_agent(&state.db, &agent_id).await?;
    Ok(Json(pools.iter().map(|pool| pool.to_view()).collect()))
}

#[utoipa::path(
    post,
    path = "/api/v1/pools/{pool_id}/blocks",
    params(("pool_id" = String, Path, description = "Pool to carve from")),
    request_body = PortBlockRequest,
    responses(
        (status = 201, description = "Lowest free block leased", body = PortBlockView),
        (status = 404, description = "Unknown pool", body = super::ErrorResponse),
        (status = 409, description = "No free run of the requested size", body = super::ErrorResponse),
        (status = 503, description = "Concurrent leases kept overlapping", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "ports"
)]
pub(crate) async fn allocate_block(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
    Json(body): Json<PortBlockRequest>,
) -> ApiResult<(StatusCode, Json<PortBlockView>)> {
    validation::validate_required_str("customer_id", &body.customer_id, state.limits.max_field_len)?;
    let block =
        services::blocks::allocate_block(&state.db, &pool_id, body.customer_id.trim(), body.size)
            .await
            .map_err(map_service_error)?;
    Ok((StatusCode::CREATED, Json(block.to_view())))
}

#[utoipa::path(
    post,
    path = "/api/v1/pools/{pool_id}/blocks/range",
    params(("pool_id" = String, Path, description = "Pool to carve from")),
    request_body = PortBlockRangeRequest,
    responses(
        (status = 201, description = "Range partitioned into blocks", body = [PortBlockView]),
        (status = 400, description = "Range outside the pool or not a multiple of the block size", body = super::ErrorResponse),
        (status = 404, description = "Unknown pool", body = super::ErrorResponse),
        (status = 409, description = "Range overlaps an existing block", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "ports"
)]
pub(crate) async fn allocate_block_range(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
    Json(body): Json<PortBlockRangeRequest>,
) -> ApiResult<(StatusCode, Json<Vec<PortBlockView>>)> {
    validation::validate_required_str("customer_id", &body.customer_id, state.limits.max_field_len)?;
    let blocks = services::blocks::allocate_blocks_in_range(
        &state.db,
        &pool_id,
        body.customer_id.trim(),
        body.range_start,
        body.range_end,
        body.block_size,
    )
    .await
    .map_err(map_service_error)?;
    Ok((
        StatusCode::CREATED,
        Json(blocks.iter().map(|block| block.to_view()).collect()),
    ))
}

#[utoipa::path(
    get,
    path = "/api/v1/pools/{pool_id}/blocks",
    params(("pool_id" = String, Path, description = "Pool identifier")),
    responses(
        (status = 200, description = "Blocks ordered by start port", body = [PortBlockView]),
        (status = 404, description = "Unknown pool", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "ports"
)]
pub(crate) async fn list_blocks(
    State(state): State<AppState>,
    Path(pool_id): Path<String>,
) -> ApiResult<Json<Vec<PortBlockView>>> {
    let blocks = services::blocks::list_blocks(&state.db, &pool_id)
        .await
        .map_err(map_service_error)?;
    Ok(Json(blocks.iter().map(|block| block.to_view()).collect()))
}

#[utoipa::path(
    post,
    path = "/api/v1/instances",
    request_body = InstanceCreateRequest,
    responses(
        (status = 201, description = "Instance created and its ports allocated", body = InstancePortsResponse),
        (status = 404, description = "Unknown agent", body = super::ErrorResponse),
        (status = 409, description = "Instance id taken or allocation kept conflicting", body = super::ErrorResponse),
        (status = 422, description = "Unknown game profile or a required port could not be found", body = super::ErrorResponse),
        (status = 502, description = "Node port check failed", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "ports"
)]
pub(crate) async fn create_instance(
    State(state): State<AppState>,
    Json(body): Json<InstanceCreateRequest>,
) -> ApiResult<(StatusCode, Json<InstancePortsResponse>)> {
    let max_len = state.limits.max_field_len;
    let id = validation::normalize_opt_id("id", body.id, max_len)?;
    validation::validate_required_str("agent_id", &body.agent_id, max_len)?;
    validation::validate_required_str("game_key", &body.game_key, max_len)?;
    validation::validate_opt_str("customer_id", body.customer_id.as_deref(), max_len)?;

    let agent_id = body.agent_id.trim().to_string();
    services::agents::get_agent(&state.db, &agent_id)
        .await
        .map_err(map_service_error)?;
    let game_key = body.game_key.trim().to_string();
    let profile = profile(&state, &game_key)?.clone();

    // The instance row stays when allocation fails so ports can be retried.
    let instance = db::instances::create_instance(
        &state.db,
        &NewInstance {
            id: id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            agent_id,
            game_key,
            customer_id: body.customer_id.map(|c| c.trim().to_string()),
        },
    )
    .await?;

    let rows = state
        .allocator
        .allocate_ports(&instance, &profile)
        .await
        .map_err(map_service_error)?;
    Ok((StatusCode::CREATED, Json(ports_response(&instance, &rows))))
}

#[utoipa::path(
    get,
    path = "/api/v1/instances/{instance_id}/ports",
    params(("instance_id" = String, Path, description = "Instance identifier")),
    responses(
        (status = 200, description = "Current allocations in role order", body = InstancePortsResponse),
        (status = 404, description = "Unknown instance", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "ports"
)]
pub(crate) async fn instance_ports(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<InstancePortsResponse>> {
    let instance = load_instance(&state, &instance_id).await?;
    let rows = state
        .allocator
        .allocations(&instance.id)
        .await
        .map_err(map_service_error)?;
    Ok(Json(ports_response(&instance, &rows)))
}

#[utoipa::path(
    post,
    path = "/api/v1/instances/{instance_id}/ports",
    params(("instance_id" = String, Path, description = "Instance identifier")),
    responses(
        (status = 200, description = "Allocations, created if the instance had none", body = InstancePortsResponse),
        (status = 404, description = "Unknown instance", body = super::ErrorResponse),
        (status = 409, description = "Allocation kept conflicting", body = super::ErrorResponse),
        (status = 422, description = "A required port could not be found", body = super::ErrorResponse),
        (status = 502, description = "Node port check failed", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "ports"
)]
pub(crate) async fn allocate_instance_ports(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<Json<InstancePortsResponse>> {
    let instance = load_instance(&state, &instance_id).await?;
    let profile = profile(&state, &instance.game_key)?.clone();
    let rows = state
        .allocator
        .allocate_ports(&instance, &profile)
        .await
        .map_err(map_service_error)?;
    Ok(Json(ports_response(&instance, &rows)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/instances/{instance_id}/ports",
    params(("instance_id" = String, Path, description = "Instance identifier")),
    responses(
        (status = 204, description = "Allocations released"),
        (status = 404, description = "Unknown instance", body = super::ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "ports"
)]
pub(crate) async fn release_instance_ports(
    State(state): State<AppState>,
    Path(instance_id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .allocator
        .release_ports(&instance_id)
        .await
        .map_err(map_service_error)?;
    Ok(StatusCode::NO_CONTENT)
}

fn profile<'a>(state: &'a AppState, game_key: &str) -> ApiResult<&'a GameProfile> {
    state
        .profiles
        .get(game_key)
        .ok_or_else(|| map_service_error(AllocationError::UnknownProfile(game_key.to_string())))
}

async fn load_instance(state: &AppState, instance_id: &str) -> ApiResult<InstanceRecord> {
    db::instances::get_instance(&state.db, instance_id)
        .await?
        .ok_or_else(|| map_service_error(AllocationError::InstanceNotFound(instance_id.to_string())))
}

fn ports_response(instance: &InstanceRecord, rows: &[PortAllocationRecord]) -> InstancePortsResponse {
    InstancePortsResponse {
        instance_id: instance.id.clone(),
        agent_id: instance.agent_id.clone(),
        game_key: instance.game_key.clone(),
        ports: rows.iter().map(PortAllocationRecord::to_view).collect(),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::http::tests::{operator_request, send};
    use crate::services::test_support::{FakeLiveness, seed_agent, setup_state, setup_state_with};
    use serde_json::{Value, json};

    async fn pool(state: &AppState, start: u16, end: u16) -> Value {
        let (status, body) = send(
            state,
            operator_request(
                "POST",
                "/api/v1/agents/node-1/pools",
                Some(json!({"tag": "game", "start_port": start, "end_port": end})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{body}");
        body
    }

    fn port_of(body: &Value, role: &str) -> Option<u64> {
        body["ports"]
            .as_array()?
            .iter()
            .find(|p| p["role"] == role)
            .and_then(|p| p["port"].as_u64())
    }

    #[tokio::test]
    async fn pools_validate_range_and_agent() {
        let state = setup_state().await;
        seed_agent(&state.db, "node-1").await;

        let created = pool(&state, 9000, 9010).await;
        assert_eq!(created["enabled"], true);

        let (status, _) = send(
            &state,
            operator_request(
                "POST",
                "/api/v1/agents/node-1/pools",
                Some(json!({"tag": "game", "start_port": 9010, "end_port": 9000})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(
            &state,
            operator_request(
                "POST",
                "/api/v1/agents/ghost/pools",
                Some(json!({"tag": "game", "start_port": 1, "end_port": 2})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, pools) =
            send(&state, operator_request("GET", "/api/v1/agents/node-1/pools", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(pools.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn blocks_lease_lowest_gap_and_report_exhaustion() {
        let state = setup_state().await;
        seed_agent(&state.db, "node-1").await;
        let created = pool(&state, 30000, 30009).await;
        let pool_id = created["id"].as_str().expect("pool id").to_string();

        let (status, ranged) = send(
            &state,
            operator_request(
                "POST",
                &format!("/api/v1/pools/{pool_id}/blocks/range"),
                Some(json!({
                    "customer_id": "c-1",
                    "range_start": 30000,
                    "range_end": 30003,
                    "block_size": 2
                })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{ranged}");
        assert_eq!(ranged.as_array().map(Vec::len), Some(2));

        let (status, block) = send(
            &state,
            operator_request(
                "POST",
                &format!("/api/v1/pools/{pool_id}/blocks"),
                Some(json!({"customer_id": "c-2", "size": 5})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(block["start_port"], 30004);
        assert_eq!(block["end_port"], 30008);

        let (status, body) = send(
            &state,
            operator_request(
                "POST",
                &format!("/api/v1/pools/{pool_id}/blocks"),
                Some(json!({"customer_id": "c-3", "size": 2})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");

        let (status, listed) = send(
            &state,
            operator_request("GET", &format!("/api/v1/pools/{pool_id}/blocks"), None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().map(Vec::len), Some(3));

        let (status, _) = send(
            &state,
            operator_request("GET", "/api/v1/pools/missing/blocks", None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn instance_lifecycle_allocates_and_releases() {
        let state = setup_state().await;
        seed_agent(&state.db, "node-1").await;
        pool(&state, 9000, 9010).await;

        let (status, created) = send(
            &state,
            operator_request(
                "POST",
                "/api/v1/instances",
                Some(json!({"id": "i-1", "agent_id": "node-1", "game_key": "voice"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED, "{created}");
        assert_eq!(created["instance_id"], "i-1");
        assert_eq!(port_of(&created, "voice"), Some(9000));
        assert_eq!(port_of(&created, "query"), Some(9001));

        let (status, again) = send(
            &state,
            operator_request("POST", "/api/v1/instances/i-1/ports", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(again["ports"], created["ports"]);

        let (status, _) = send(
            &state,
            operator_request("DELETE", "/api/v1/instances/i-1/ports", None),
        )
        .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, listed) = send(
            &state,
            operator_request("GET", "/api/v1/instances/i-1/ports", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed["ports"], json!([]));

        let (status, _) = send(
            &state,
            operator_request("GET", "/api/v1/instances/missing/ports", None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn instance_creation_errors_map_to_statuses() {
        let state = setup_state().await;
        seed_agent(&state.db, "node-1").await;

        let (status, body) = send(
            &state,
            operator_request(
                "POST",
                "/api/v1/instances",
                Some(json!({"agent_id": "node-1", "game_key": "chess"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["code"], "unprocessable");

        let (status, _) = send(
            &state,
            operator_request(
                "POST",
                "/api/v1/instances",
                Some(json!({"agent_id": "ghost", "game_key": "voice"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        // No pool tagged "game" exists yet, so the required voice role fails.
        let (status, _) = send(
            &state,
            operator_request(
                "POST",
                "/api/v1/instances",
                Some(json!({"id": "i-2", "agent_id": "node-1", "game_key": "voice"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        pool(&state, 9000, 9010).await;
        let (status, retried) = send(
            &state,
            operator_request("POST", "/api/v1/instances/i-2/ports", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(port_of(&retried, "voice"), Some(9000));
    }

    #[tokio::test]
    async fn failed_node_check_is_bad_gateway() {
        let liveness = Arc::new(FakeLiveness::default());
        liveness.fail_checks();
        let state = setup_state_with(liveness).await;
        seed_agent(&state.db, "node-1").await;
        pool(&state, 9000, 9010).await;

        let (status, body) = send(
            &state,
            operator_request(
                "POST",
                "/api/v1/instances",
                Some(json!({"agent_id": "node-1", "game_key": "voice"})),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body["code"], "agent_unreachable");
    }
}
