#[tokio::main]
async fn main() -> agent_control_plane::Result<()> {
    agent_control_plane::telemetry::init_tracing();
    let mode = agent_control_plane::parse_command()?;
    tracing::info!(
        version = agent_control_plane::version::VERSION,
        git_sha = agent_control_plane::version::GIT_SHA,
        dirty = agent_control_plane::version::GIT_DIRTY,
        built_at = agent_control_plane::version::BUILD_TIMESTAMP,
        mode = ?mode,
        "agent control plane starting"
    );
    agent_control_plane::run(mode).await
}
