use serde::{Deserialize, Deserializer};

use crate::profiles::GameProfileSpec;

pub const ENV_PREFIX: &str = "AGENTCP";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub database: DatabaseConfig,
    pub operator: OperatorAuthConfig,
    pub secrets: SecretsConfig,
    pub signing: SigningConfig,
    pub jobs: JobsConfig,
    pub liveness: LivenessConfig,
    pub ports: PortsConfig,
    pub limits: LimitsConfig,
    #[serde(default)]
    pub profiles: Vec<GameProfileSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorAuthConfig {
    #[serde(deserialize_with = "deserialize_string_or_vec")]
    pub tokens: Vec<String>,
    pub header_name: String,
}

fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(value) => Ok(value.split(',').map(|s| s.to_string()).collect()),
        StringOrVec::Vec(values) => Ok(values),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecretsConfig {
    /// Identifier stored next to every ciphertext so keys can rotate.
    pub key_id: String,
    /// Base64 encoded 32-byte AES-256-GCM key.
    pub master_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SigningConfig {
    /// Maximum distance between the signed timestamp and the server clock.
    pub max_skew_secs: u64,
    /// Reject agent requests that do not carry a timestamp header.
    pub require_timestamp: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobsConfig {
    pub poll_limit_default: u32,
    pub poll_limit_max: u32,
    /// Running jobs older than this are failed by the reaper; 0 disables it.
    pub running_timeout_secs: u64,
    pub reaper_interval_secs: u64,
    /// Terminal jobs older than this are deleted; 0 keeps them forever.
    pub retention_secs: u64,
    pub retention_interval_secs: u64,
    pub wait_poll_interval_ms: u64,
    pub wait_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LivenessConfig {
    pub timeout_secs: u64,
    /// Agent metadata key holding the agent's service base URL.
    pub service_url_key: String,
    /// Port used with the last heartbeat address when no service URL is set.
    pub default_port: u16,
    pub scheme: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PortsConfig {
    /// Allocation attempts before a uniqueness conflict becomes terminal.
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub agent_body_bytes: u64,
    pub max_field_len: usize,
}

impl SecretsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.key_id.trim().is_empty() {
            anyhow::bail!("secrets.key_id cannot be empty");
        }
        crate::secrets::decode_master_key(&self.master_key)?;
        Ok(())
    }
}

impl SigningConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_skew_secs == 0 {
            anyhow::bail!("signing.max_skew_secs must be > 0");
        }
        Ok(())
    }
}

impl JobsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll_limit_default == 0 || self.poll_limit_max == 0 {
            anyhow::bail!("jobs.poll_limit_default and jobs.poll_limit_max must be > 0");
        }
        if self.poll_limit_default > self.poll_limit_max {
            anyhow::bail!("jobs.poll_limit_default must be <= jobs.poll_limit_max");
        }
        if self.wait_poll_interval_ms == 0 {
            anyhow::bail!("jobs.wait_poll_interval_ms must be > 0");
        }
        Ok(())
    }
}

impl LivenessConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.timeout_secs == 0 {
            anyhow::bail!("liveness.timeout_secs must be > 0");
        }
        if self.service_url_key.trim().is_empty() {
            anyhow::bail!("liveness.service_url_key cannot be empty");
        }
        if !matches!(self.scheme.as_str(), "http" | "https") {
            anyhow::bail!("liveness.scheme must be http or https");
        }
        Ok(())
    }
}

impl PortsConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_attempts == 0 {
            anyhow::bail!("ports.max_attempts must be >= 1");
        }
        Ok(())
    }
}

impl Default for SigningConfig {
    fn default() -> Self {
        Self {
            max_skew_secs: 300,
            require_timestamp: true,
        }
    }
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            poll_limit_default: 10,
            poll_limit_max: 100,
            running_timeout_secs: 60 * 60,
            reaper_interval_secs: 60,
            retention_secs: 30 * 24 * 60 * 60,
            retention_interval_secs: 60 * 60,
            wait_poll_interval_ms: 500,
            wait_timeout_secs: 600,
        }
    }
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 10,
            service_url_key: "service_url".into(),
            default_port: 8443,
            scheme: "http".into(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self { max_attempts: 5 }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            agent_body_bytes: 256 * 1024,
            max_field_len: 255,
        }
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    load_with_env(None)
}

/// Load configuration, optionally replacing the process environment with
/// `env_overrides` (keys use the `AGENTCP__SECTION__FIELD` form).
pub fn load_with_env(
    env_overrides: Option<std::collections::HashMap<String, String>>,
) -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        // Keep try_parsing disabled so numeric tokens and keys are not coerced.
        .try_parsing(false)
        .source(env_overrides);

    let jobs = JobsConfig::default();
    let liveness = LivenessConfig::default();
    let limits = LimitsConfig::default();
    let signing = SigningConfig::default();

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("metrics.host", "0.0.0.0")?
        .set_default("metrics.port", 9102)?
        .set_default("database.url", "sqlite://data/control-plane.db")?
        .set_default("operator.tokens", vec!["dev-operator-token"])?
        .set_default("operator.header_name", "authorization")?
        .set_default("secrets.key_id", "k1")?
        // 32 zero bytes; every real deployment must override this.
        .set_default(
            "secrets.master_key",
            "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
        )?
        .set_default("signing.max_skew_secs", signing.max_skew_secs)?
        .set_default("signing.require_timestamp", signing.require_timestamp)?
        .set_default("jobs.poll_limit_default", jobs.poll_limit_default)?
        .set_default("jobs.poll_limit_max", jobs.poll_limit_max)?
        .set_default("jobs.running_timeout_secs", jobs.running_timeout_secs)?
        .set_default("jobs.reaper_interval_secs", jobs.reaper_interval_secs)?
        .set_default("jobs.retention_secs", jobs.retention_secs)?
        .set_default("jobs.retention_interval_secs", jobs.retention_interval_secs)?
        .set_default("jobs.wait_poll_interval_ms", jobs.wait_poll_interval_ms)?
        .set_default("jobs.wait_timeout_secs", jobs.wait_timeout_secs)?
        .set_default("liveness.timeout_secs", liveness.timeout_secs)?
        .set_default("liveness.service_url_key", liveness.service_url_key)?
        .set_default("liveness.default_port", liveness.default_port)?
        .set_default("liveness.scheme", liveness.scheme)?
        .set_default("ports.max_attempts", PortsConfig::default().max_attempts)?
        .set_default("limits.agent_body_bytes", limits.agent_body_bytes)?
        .set_default("limits.max_field_len", limits.max_field_len as u64)?;

    let cfg = builder.build()?;
    let mut app: AppConfig = cfg.try_deserialize()?;
    app.operator.tokens = app
        .operator
        .tokens
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();
    app.secrets.validate()?;
    app.signing.validate()?;
    app.jobs.validate()?;
    app.liveness.validate()?;
    app.ports.validate()?;
    crate::profiles::GameProfileCatalog::from_specs(app.profiles.clone())?;
    Ok(app)
}
