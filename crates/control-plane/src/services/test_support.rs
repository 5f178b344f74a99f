use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::HeaderName;
use common::api::PortCheck;

use crate::app_state::{AppState, OperatorAuth};
use crate::config::{JobsConfig, LimitsConfig};
use crate::persistence::{self as db, AgentRecord, Db};
use crate::profiles::{GameProfileCatalog, GameProfileSpec, PortRoleSpec};
use crate::secrets::{AesGcmCipher, SecretCipher};
use crate::services::jobs::JobQueue;
use crate::services::liveness::{LivenessError, LivenessReport, PortLivenessChecker};
use crate::services::ports::PortAllocator;
use crate::services::results::ResultApplierRegistry;
use crate::signing::SignatureVerifier;

pub(crate) const TEST_KEY: [u8; 32] = [7; 32];
pub(crate) const OPERATOR_TOKEN: &str = "op-token";

pub(crate) async fn test_db() -> Db {
    let db = db::migrations::init_pool("sqlite::memory:")
        .await
        .expect("pool");
    db::migrations::run_migrations(&db)
        .await
        .expect("migrations");
    db
}

pub(crate) fn test_cipher() -> AesGcmCipher {
    AesGcmCipher::new("k1", &TEST_KEY)
}

/// The plaintext secret [`seed_agent`] stores for `id`.
pub(crate) fn agent_secret(id: &str) -> String {
    format!("secret-{id}")
}

pub(crate) async fn seed_agent(db: &Db, id: &str) -> AgentRecord {
    let sealed = test_cipher()
        .encrypt(agent_secret(id).as_bytes())
        .expect("encrypt");
    db::agents::create_agent(
        db,
        db::NewAgent {
            id: id.to_string(),
            name: id.to_string(),
            secret: sealed,
            metadata: HashMap::new(),
        },
    )
    .await
    .expect("agent")
}

type CheckHook = Arc<dyn Fn(Vec<PortCheck>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// In-memory stand-in for the node's port check endpoint. Every port is free
/// unless marked busy.
#[derive(Default)]
pub(crate) struct FakeLiveness {
    busy: Mutex<HashSet<PortCheck>>,
    round_trips: AtomicUsize,
    failing: AtomicBool,
    first_hook: Mutex<Option<CheckHook>>,
    every_hook: Mutex<Option<CheckHook>>,
}

impl FakeLiveness {
    pub(crate) fn mark_busy(&self, proto: &str, port: u16) {
        self.busy.lock().expect("busy lock").insert(PortCheck {
            proto: proto.to_string(),
            port,
        });
    }

    pub(crate) fn mark_free(&self, proto: &str, port: u16) {
        self.busy.lock().expect("busy lock").remove(&PortCheck {
            proto: proto.to_string(),
            port,
        });
    }

    pub(crate) fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    pub(crate) fn fail_checks(&self) {
        self.failing.store(true, Ordering::SeqCst);
    }

    /// Run `hook` once, after the first check is answered.
    pub(crate) fn on_first_check<F>(&self, hook: F)
    where
        F: Fn(Vec<PortCheck>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        *self.first_hook.lock().expect("hook lock") = Some(Arc::new(hook));
    }

    /// Run `hook` after every answered check.
    pub(crate) fn on_every_check<F>(&self, hook: F)
    where
        F: Fn(Vec<PortCheck>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync + 'static,
    {
        *self.every_hook.lock().expect("hook lock") = Some(Arc::new(hook));
    }
}

#[async_trait]
impl PortLivenessChecker for FakeLiveness {
    async fn check_free(
        &self,
        _agent: &AgentRecord,
        checks: &[PortCheck],
    ) -> Result<LivenessReport, LivenessError> {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(LivenessError::Status(503));
        }
        let report: LivenessReport = {
            let busy = self.busy.lock().expect("busy lock");
            checks
                .iter()
                .map(|c| (c.clone(), !busy.contains(c)))
                .collect()
        };

        let first = self.first_hook.lock().expect("hook lock").take();
        if let Some(hook) = first {
            hook(checks.to_vec()).await;
        }
        let every = self.every_hook.lock().expect("hook lock").clone();
        if let Some(hook) = every {
            hook(checks.to_vec()).await;
        }
        Ok(report)
    }
}

/// Profile used by the HTTP tests: a voice port, a query port one above it
/// and an optional consecutive file transfer pair.
pub(crate) fn voice_profile() -> GameProfileSpec {
    let role = |key: &str, strategy: &str| PortRoleSpec {
        key: key.into(),
        protocol: "udp".into(),
        purpose: None,
        required: true,
        strategy: strategy.into(),
        pool_tag: Some("game".into()),
        count: None,
        default_port: None,
        from_role: None,
        offset: None,
    };
    GameProfileSpec {
        key: "voice".into(),
        inherits: None,
        roles: vec![
            role("voice", "pool_single"),
            PortRoleSpec {
                protocol: "tcp".into(),
                pool_tag: None,
                from_role: Some("voice".into()),
                offset: Some(1),
                ..role("query", "derived_offset")
            },
            PortRoleSpec {
                protocol: "tcp".into(),
                required: false,
                count: Some(2),
                ..role("files", "pool_consecutive")
            },
        ],
    }
}

pub(crate) async fn setup_state_with(liveness: Arc<FakeLiveness>) -> AppState {
    let db = test_db().await;
    let snapshot = db::migrations::migration_snapshot(&db)
        .await
        .expect("snapshot");
    let metrics_handle = crate::metrics::init_metrics_recorder();
    let jobs = JobsConfig {
        wait_poll_interval_ms: 10,
        wait_timeout_secs: 2,
        ..JobsConfig::default()
    };
    let profiles = GameProfileCatalog::from_specs(vec![voice_profile()]).expect("profiles");
    let secrets: Arc<dyn SecretCipher> = Arc::new(test_cipher());

    AppState {
        operator_auth: OperatorAuth {
            tokens: vec![OPERATOR_TOKEN.into()],
            header_name: HeaderName::from_static("authorization"),
        },
        signature_verifier: SignatureVerifier::new(300, true),
        secrets,
        jobs: JobQueue::new(db.clone(), ResultApplierRegistry::with_defaults(), jobs),
        allocator: PortAllocator::new(db.clone(), liveness, 5),
        profiles: Arc::new(profiles),
        limits: LimitsConfig {
            agent_body_bytes: 4096,
            max_field_len: 255,
        },
        metrics_handle,
        schema: snapshot,
        db,
    }
}

pub(crate) async fn setup_state() -> AppState {
    setup_state_with(Arc::new(FakeLiveness::default())).await
}
