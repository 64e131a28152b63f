use mesh_controller_agent::{Error, Proxy};
use mesh_controller_core::MeshConfig;
use mesh_controller_discovery::ProxyConfig;
use std::{path::PathBuf, sync::Arc};
use tokio::process::Command;
use tracing::{debug, warn};

/// Launches the sidecar proxy binary, one process per restart epoch.
///
/// The configuration is written to `{config_dir}/envoy-rev{epoch}.json`
/// before the child starts; the epoch number in the arguments lets the
/// proxy pair hand off listeners during a hot restart. Superseded children
/// exit on their own after the parent-shutdown window.
pub struct Envoy {
    mesh: Arc<MeshConfig>,
    /// Presented as `--service-node`; the proxy's IP address.
    node: String,
    binary_path: PathBuf,
    config_dir: PathBuf,
}

// === impl Envoy ===

impl Envoy {
    pub fn new(
        mesh: Arc<MeshConfig>,
        node: impl Into<String>,
        binary_path: impl Into<PathBuf>,
        config_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            mesh,
            node: node.into(),
            binary_path: binary_path.into(),
            config_dir: config_dir.into(),
        }
    }

    fn config_file(&self, epoch: u32) -> PathBuf {
        self.config_dir.join(format!("envoy-rev{}.json", epoch))
    }
}

#[async_trait::async_trait]
impl Proxy for Envoy {
    type Config = ProxyConfig;

    async fn run(&self, config: &ProxyConfig, epoch: u32) -> Result<(), Error> {
        let path = self.config_file(epoch);
        config.write_file(&path).await.map_err(Error::Config)?;

        let mut cmd = Command::new(&self.binary_path);
        cmd.arg("-c")
            .arg(&path)
            .arg("--restart-epoch")
            .arg(epoch.to_string())
            .arg("--drain-time-s")
            .arg(self.mesh.drain_duration.as_secs().to_string())
            .arg("--parent-shutdown-time-s")
            .arg(self.mesh.parent_shutdown_duration.as_secs().to_string())
            .arg("--service-cluster")
            .arg(&self.mesh.service_cluster)
            .arg("--service-node")
            .arg(&self.node);
        if tracing::enabled!(tracing::Level::TRACE) {
            cmd.arg("-l").arg("trace");
        } else if tracing::enabled!(tracing::Level::DEBUG) {
            cmd.arg("-l").arg("debug");
        }
        cmd.kill_on_drop(true);
        debug!(epoch, path = %path.display(), "launching proxy process");

        let status = cmd.status().await.map_err(Error::Spawn)?;
        if !status.success() {
            return Err(Error::Exited(status));
        }
        Ok(())
    }

    fn cleanup(&self, epoch: u32) {
        let path = self.config_file(epoch);
        if let Err(error) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), epoch, %error, "failed to remove stale proxy config");
        }
    }
}
