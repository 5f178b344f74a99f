//! Live port checks against the agent's own service endpoint.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use common::api::{PortCheck, PortCheckRequest, PortCheckResponse};
use common::signing::{AGENT_ID_HEADER, SIGNATURE_HEADER, SigningInput, TIMESTAMP_HEADER, sign};
use reqwest::{Client, Url};
use tracing::{debug, warn};

use crate::config::LivenessConfig;
use crate::metrics::record_liveness_check;
use crate::persistence::AgentRecord;
use crate::secrets::SecretCipher;

pub const CHECK_FREE_PATH: &str = "/ports/check-free";

#[derive(Debug, thiserror::Error)]
pub enum LivenessError {
    #[error("agent {0} has no reachable service endpoint")]
    NoEndpoint(String),
    #[error("agent service url {url:?} is invalid")]
    InvalidUrl { url: String },
    #[error("agent secret unavailable: {0}")]
    Secret(#[from] crate::secrets::SecretError),
    #[error("port check request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("agent answered port check with status {0}")]
    Status(u16),
    #[error("agent port check response is invalid: {0}")]
    InvalidResponse(String),
}

/// Free/busy verdict per requested check.
pub type LivenessReport = HashMap<PortCheck, bool>;

#[async_trait]
pub trait PortLivenessChecker: Send + Sync {
    /// Ask the node whether each port is unbound. The report answers every
    /// requested check or the call fails.
    async fn check_free(
        &self,
        agent: &AgentRecord,
        checks: &[PortCheck],
    ) -> Result<LivenessReport, LivenessError>;
}

pub struct HttpLivenessChecker {
    client: Client,
    cipher: Arc<dyn SecretCipher>,
    cfg: LivenessConfig,
}

impl HttpLivenessChecker {
    pub fn new(cfg: LivenessConfig, cipher: Arc<dyn SecretCipher>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            cipher,
            cfg,
        })
    }

    /// Service base URL from agent metadata, falling back to the last
    /// heartbeat address on the default port.
    pub fn base_url(&self, agent: &AgentRecord) -> Result<String, LivenessError> {
        if let Some(url) = agent
            .metadata
            .0
            .get(&self.cfg.service_url_key)
            .map(|u| u.trim())
            .filter(|u| !u.is_empty())
        {
            return Ok(url.trim_end_matches('/').to_string());
        }

        let addr = agent
            .last_heartbeat_addr
            .as_deref()
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| LivenessError::NoEndpoint(agent.id.clone()))?;
        let authority = if addr.parse::<SocketAddr>().is_ok() {
            addr.to_string()
        } else {
            match addr.parse::<IpAddr>() {
                Ok(IpAddr::V6(ip)) => format!("[{ip}]:{}", self.cfg.default_port),
                _ => format!("{addr}:{}", self.cfg.default_port),
            }
        };
        Ok(format!("{}://{authority}", self.cfg.scheme))
    }

    async fn request(
        &self,
        agent: &AgentRecord,
        checks: &[PortCheck],
    ) -> Result<LivenessReport, LivenessError> {
        let base = self.base_url(agent)?;
        let raw = format!("{base}{CHECK_FREE_PATH}");
        let url = Url::parse(&raw).map_err(|_| LivenessError::InvalidUrl { url: raw.clone() })?;

        let secret = self.cipher.decrypt(&agent.sealed_secret())?;
        let timestamp = Utc::now().timestamp();
        let signature = sign(
            &secret,
            &SigningInput {
                agent_id: &agent.id,
                customer_id: None,
                method: "POST",
                path: url.path(),
                timestamp: Some(timestamp),
            },
        );

        let response = self
            .client
            .post(url)
            .header(AGENT_ID_HEADER, &agent.id)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(SIGNATURE_HEADER, signature)
            .json(&PortCheckRequest {
                checks: checks.to_vec(),
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(LivenessError::Status(status.as_u16()));
        }
        let body: PortCheckResponse = response
            .json()
            .await
            .map_err(|err| LivenessError::InvalidResponse(err.to_string()))?;
        collect_report(checks, body)
    }
}

fn collect_report(
    checks: &[PortCheck],
    body: PortCheckResponse,
) -> Result<LivenessReport, LivenessError> {
    let answered: LivenessReport = body
        .results
        .into_iter()
        .map(|r| {
            (
                PortCheck {
                    proto: r.proto.to_ascii_lowercase(),
                    port: r.port,
                },
                r.free,
            )
        })
        .collect();
    let mut report = LivenessReport::with_capacity(checks.len());
    for check in checks {
        let free = answered.get(check).copied().ok_or_else(|| {
            LivenessError::InvalidResponse(format!("no result for {}/{}", check.proto, check.port))
        })?;
        report.insert(check.clone(), free);
    }
    Ok(report)
}

#[async_trait]
impl PortLivenessChecker for HttpLivenessChecker {
    async fn check_free(
        &self,
        agent: &AgentRecord,
        checks: &[PortCheck],
    ) -> Result<LivenessReport, LivenessError> {
        if checks.is_empty() {
            return Ok(LivenessReport::new());
        }
        match self.request(agent, checks).await {
            Ok(report) => {
                record_liveness_check("ok");
                debug!(
                    agent_id = %agent.id,
                    checks = checks.len(),
                    busy = report.values().filter(|free| !**free).count(),
                    "port liveness checked"
                );
                Ok(report)
            }
            Err(err) => {
                record_liveness_check("error");
                warn!(agent_id = %agent.id, error = %err, "port liveness check failed");
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::AesGcmCipher;
    use common::api::PortCheckResult;
    use httpmock::prelude::*;
    use serde_json::json;
    use sqlx::types::Json;

    const KEY: [u8; 32] = [7; 32];

    fn cipher() -> Arc<dyn SecretCipher> {
        Arc::new(AesGcmCipher::new("k1", &KEY))
    }

    fn agent(metadata: &[(&str, &str)], addr: Option<&str>) -> AgentRecord {
        let sealed = cipher().encrypt(b"node-secret").expect("encrypt");
        let now = Utc::now();
        AgentRecord {
            id: "node-1".into(),
            name: "node-1".into(),
            secret_key_id: sealed.key_id,
            secret_nonce: sealed.nonce,
            secret_ciphertext: sealed.ciphertext,
            metadata: Json(
                metadata
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            ),
            last_heartbeat_addr: addr.map(str::to_string),
            last_heartbeat_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn checker() -> HttpLivenessChecker {
        HttpLivenessChecker::new(LivenessConfig::default(), cipher()).expect("client")
    }

    fn udp(port: u16) -> PortCheck {
        PortCheck {
            proto: "udp".into(),
            port,
        }
    }

    #[test]
    fn base_url_prefers_metadata_then_heartbeat_address() {
        let checker = checker();
        assert_eq!(
            checker
                .base_url(&agent(&[("service_url", "https://n1.example:9443/")], Some("10.0.0.1")))
                .expect("url"),
            "https://n1.example:9443"
        );
        assert_eq!(
            checker.base_url(&agent(&[], Some("10.0.0.1"))).expect("url"),
            "http://10.0.0.1:8443"
        );
        assert_eq!(
            checker.base_url(&agent(&[], Some("10.0.0.1:7000"))).expect("url"),
            "http://10.0.0.1:7000"
        );
        assert_eq!(
            checker.base_url(&agent(&[], Some("::1"))).expect("url"),
            "http://[::1]:8443"
        );
        assert!(matches!(
            checker.base_url(&agent(&[], None)),
            Err(LivenessError::NoEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn signed_request_returns_report() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path(CHECK_FREE_PATH)
                    .header(AGENT_ID_HEADER, "node-1")
                    .header_exists(SIGNATURE_HEADER)
                    .header_exists(TIMESTAMP_HEADER)
                    .json_body(json!({"checks": [{"proto": "udp", "port": 9987}, {"proto": "udp", "port": 9988}]}));
                then.status(200).json_body(json!({
                    "results": [
                        {"proto": "udp", "port": 9988, "free": false},
                        {"proto": "udp", "port": 9987, "free": true}
                    ]
                }));
            })
            .await;

        let node = agent(&[("service_url", &server.base_url())], None);
        let report = checker()
            .check_free(&node, &[udp(9987), udp(9988)])
            .await
            .expect("report");
        mock.assert_async().await;
        assert_eq!(report.get(&udp(9987)), Some(&true));
        assert_eq!(report.get(&udp(9988)), Some(&false));
    }

    #[tokio::test]
    async fn unanswered_check_and_error_status_fail() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path(CHECK_FREE_PATH);
                then.status(200).json_body(json!({"results": [
                    {"proto": "udp", "port": 9987, "free": true}
                ]}));
            })
            .await;
        let node = agent(&[("service_url", &server.base_url())], None);
        let err = checker()
            .check_free(&node, &[udp(9987), udp(9988)])
            .await
            .expect_err("missing result");
        assert!(matches!(err, LivenessError::InvalidResponse(_)));

        let failing = MockServer::start_async().await;
        failing
            .mock_async(|when, then| {
                when.method(POST).path(CHECK_FREE_PATH);
                then.status(401);
            })
            .await;
        let node = agent(&[("service_url", &failing.base_url())], None);
        let err = checker()
            .check_free(&node, &[udp(9987)])
            .await
            .expect_err("status");
        assert!(matches!(err, LivenessError::Status(401)));
    }

    #[test]
    fn report_normalizes_protocol_case() {
        let report = collect_report(
            &[udp(27015)],
            PortCheckResponse {
                results: vec![PortCheckResult {
                    proto: "UDP".into(),
                    port: 27015,
                    free: true,
                }],
            },
        )
        .expect("report");
        assert_eq!(report.get(&udp(27015)), Some(&true));
    }
}
