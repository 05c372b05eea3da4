//! Tunnel readiness checks.

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

/// Answers whether a named tunnel is up and usable.
#[async_trait]
pub trait TunnelService: Send + Sync {
    /// Resolves once the tunnel is ready, or errors after `wait`.
    async fn is_tunnel_ready(&self, name: &str, owner: &str, wait: Duration)
    -> anyhow::Result<()>;
}

/// Verifies tunnel readiness before any suite starts. A project without a
/// tunnel passes trivially; an unready tunnel is a fatal setup error.
pub async fn validate_tunnel(
    service: &dyn TunnelService,
    name: &str,
    owner: &str,
) -> anyhow::Result<()> {
    if name.is_empty() {
        return Ok(());
    }

    // This wait is deliberately not configurable.
    let wait = Duration::from_secs(30);
    info!(tunnel = name, timeout = ?wait, "performing tunnel readiness check");
    service.is_tunnel_ready(name, owner, wait).await?;

    info!("tunnel is ready");
    Ok(())
}
