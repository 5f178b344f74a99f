#![allow(dead_code)]

use std::{collections::HashMap, sync::Arc};

use agent_control_plane::{
    app_state::AppState,
    config::{self, AppConfig},
    metrics::init_metrics_recorder,
    persistence::{self as db, migrations},
    profiles::{GameProfileSpec, PortRoleSpec},
    routes::build_router,
    secrets::{AesGcmCipher, SecretCipher},
    services::liveness::{HttpLivenessChecker, PortLivenessChecker},
};
use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode},
};
use chrono::Utc;
use common::signing::{AGENT_ID_HEADER, SIGNATURE_HEADER, SigningInput, TIMESTAMP_HEADER, sign};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

pub const TEST_OPERATOR_TOKEN: &str = "test-operator-token";

pub struct TestApp {
    pub state: AppState,
    pub router: Router,
}

impl TestApp {
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("response");
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("body")
            .to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, body)
    }

    pub fn db(&self) -> &db::Db {
        &self.state.db
    }
}

pub fn test_config(profiles: Vec<GameProfileSpec>) -> AppConfig {
    let env: HashMap<String, String> = [
        ("AGENTCP__OPERATOR__TOKENS", TEST_OPERATOR_TOKEN),
        ("AGENTCP__JOBS__WAIT_POLL_INTERVAL_MS", "20"),
        ("AGENTCP__JOBS__WAIT_TIMEOUT_SECS", "5"),
        ("AGENTCP__JOBS__RUNNING_TIMEOUT_SECS", "60"),
        ("AGENTCP__LIVENESS__TIMEOUT_SECS", "2"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    let mut cfg = config::load_with_env(Some(env)).expect("config");
    cfg.profiles = profiles;
    cfg
}

/// App wired exactly as the server wires it, with an HTTP liveness checker.
pub async fn setup_app(profiles: Vec<GameProfileSpec>) -> TestApp {
    let cfg = test_config(profiles);
    let pool = migrations::init_pool("sqlite::memory:").await.expect("pool");
    let outcome = migrations::run_migrations(&pool).await.expect("migrations");
    let secrets: Arc<dyn SecretCipher> =
        Arc::new(AesGcmCipher::from_config(&cfg.secrets).expect("cipher"));
    let liveness: Arc<dyn PortLivenessChecker> = Arc::new(
        HttpLivenessChecker::new(cfg.liveness.clone(), secrets.clone()).expect("liveness"),
    );
    let state = AppState::from_config(
        &cfg,
        pool,
        secrets,
        liveness,
        init_metrics_recorder(),
        outcome.snapshot,
    )
    .expect("state");
    let router = build_router(state.clone()).with_state(state.clone());
    TestApp { state, router }
}

pub fn operator_request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("authorization", format!("Bearer {TEST_OPERATOR_TOKEN}"));
    with_body(builder, body)
}

/// Request signed the way an agent signs it. The query string is not signed.
pub fn agent_request(
    agent_id: &str,
    secret: &str,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> Request<Body> {
    let path = uri.split('?').next().unwrap_or(uri);
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
        .uri(uri)
        .header(AGENT_ID_HEADER, agent_id)
        .header(TIMESTAMP_HEADER, timestamp.to_string())
        .header(SIGNATURE_HEADER, signature);
    with_body(builder, body)
}

fn with_body(builder: axum::http::request::Builder, body: Option<Value>) -> Request<Body> {
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

/// Register an agent through the operator API and return its secret.
pub async fn register_agent(app: &TestApp, id: &str, metadata: Value) -> String {
    let (status, body) = app
        .send(operator_request(
            "POST",
            "/api/v1/agents",
            Some(json!({"id": id, "name": format!("{id} node"), "metadata": metadata})),
        ))
        .await;
    assert_eq!(status, StatusCode::CREATED, "{body}");
    body["secret"].as_str().expect("secret").to_string()
}

pub fn role(key: &str, protocol: &str, strategy: &str) -> PortRoleSpec {
    PortRoleSpec {
        key: key.into(),
        protocol: protocol.into(),
        purpose: None,
        required: true,
        strategy: strategy.into(),
        pool_tag: None,
        count: None,
        default_port: None,
        from_role: None,
        offset: None,
    }
}

/// Voice server profile: a pooled UDP voice port with a TCP query port one above it.
pub fn voice_profile() -> GameProfileSpec {
    GameProfileSpec {
        key: "ts3".into(),
        inherits: None,
        roles: vec![
            PortRoleSpec {
                pool_tag: Some("voice".into()),
                ..role("voice", "udp", "pool_single")
            },
            PortRoleSpec {
                from_role: Some("voice".into()),
                offset: Some(1),
                ..role("query", "tcp", "derived_offset")
            },
        ],
    }
}
