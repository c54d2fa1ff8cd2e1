use crate::{Abort, Bootstrap, Proxy};
use anyhow::{bail, Context};
use pilot_model::MeshConfig;
use pilot_xds::Node;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Runs Envoy with hot restarts.
#[derive(Clone, Debug)]
pub struct Envoy {
    binary: PathBuf,
    config_dir: PathBuf,
    service_cluster: String,
    service_node: String,
    drain_secs: u64,
    parent_shutdown_secs: u64,
    log_level: Option<String>,
}

// === impl Envoy ===

impl Envoy {
    pub fn new(
        mesh: &MeshConfig,
        node: &Node,
        binary: impl Into<PathBuf>,
        config_dir: impl Into<PathBuf>,
        log_level: Option<String>,
    ) -> Self {
        Self {
            binary: binary.into(),
            config_dir: config_dir.into(),
            service_cluster: mesh.istio_service_cluster.clone(),
            service_node: node.to_string(),
            drain_secs: mesh.drain_duration.as_secs_ceil(),
            parent_shutdown_secs: mesh.parent_shutdown_duration.as_secs_ceil(),
            log_level,
        }
    }

    fn config_file(&self, epoch: u32) -> PathBuf {
        self.config_dir.join(format!("envoy-rev{epoch}.json"))
    }

    fn args(&self, config: &Path, epoch: u32) -> Vec<String> {
        let mut args = vec![
            "-c".to_string(),
            config.display().to_string(),
            "--restart-epoch".to_string(),
            epoch.to_string(),
            "--drain-time-s".to_string(),
            self.drain_secs.to_string(),
            "--parent-shutdown-time-s".to_string(),
            self.parent_shutdown_secs.to_string(),
            "--service-cluster".to_string(),
            self.service_cluster.clone(),
            "--service-node".to_string(),
            self.service_node.clone(),
        ];
        if let Some(level) = &self.log_level {
            args.push("-l".to_string());
            args.push(level.clone());
        }
        args
    }
}

#[async_trait::async_trait]
impl Proxy for Envoy {
    type Config = Bootstrap;

    async fn run(&self, config: Bootstrap, epoch: u32, abort: Abort) -> anyhow::Result<()> {
        let path = self.config_file(epoch);
        let json = serde_json::to_vec_pretty(&config)?;
        tokio::fs::create_dir_all(&self.config_dir)
            .await
            .with_context(|| format!("failed to create {}", self.config_dir.display()))?;
        tokio::fs::write(&path, json)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        let mut child = Command::new(&self.binary)
            .args(self.args(&path, epoch))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to start {}", self.binary.display()))?;
        debug!(pid = ?child.id(), config = %path.display(), "Proxy started");

        tokio::select! {
            status = child.wait() => {
                let status = status.context("failed to wait for proxy")?;
                if !status.success() {
                    bail!("proxy exited with {status}");
                }
                Ok(())
            }
            _ = abort => {
                info!("Killing proxy");
                child.kill().await.context("failed to kill proxy")
            }
        }
    }

    fn cleanup(&self, epoch: u32) {
        let path = self.config_file(epoch);
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed proxy config"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => warn!(%error, path = %path.display(), "Failed to remove proxy config"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::sync::oneshot;

    fn envoy(binary: &str, dir: &Path, log_level: Option<&str>) -> Envoy {
        let node = "sidecar~10.1.1.10~productpage-v1.default~default.svc.cluster.local"
            .parse::<Node>()
            .unwrap();
        Envoy::new(
            &MeshConfig::default(),
            &node,
            binary,
            dir,
            log_level.map(ToString::to_string),
        )
    }

    #[test]
    fn hot_restart_args() {
        let envoy = envoy("/usr/local/bin/envoy", Path::new("/etc/envoy"), Some("debug"));
        let path = envoy.config_file(3);
        assert_eq!(path, Path::new("/etc/envoy/envoy-rev3.json"));
        assert_eq!(
            envoy.args(&path, 3),
            [
                "-c",
                "/etc/envoy/envoy-rev3.json",
                "--restart-epoch",
                "3",
                "--drain-time-s",
                "2",
                "--parent-shutdown-time-s",
                "3",
                "--service-cluster",
                "istio-proxy",
                "--service-node",
                "sidecar~10.1.1.10~productpage-v1.default~default.svc.cluster.local",
                "-l",
                "debug",
            ]
        );
    }

    #[tokio::test]
    async fn writes_config_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let envoy = envoy("true", dir.path(), None);
        let (_abort_tx, abort) = oneshot::channel();

        envoy
            .run(Bootstrap::new(&MeshConfig::default()), 0, abort)
            .await
            .unwrap();
        let path = dir.path().join("envoy-rev0.json");
        let written = std::fs::read(&path).unwrap();
        let json = serde_json::from_slice::<serde_json::Value>(&written).unwrap();
        assert_eq!(json["lds"]["cluster"], "lds");

        envoy.cleanup(0);
        assert!(!path.exists());
        // Cleaning up twice is harmless.
        envoy.cleanup(0);
    }

    #[tokio::test]
    async fn failed_exit_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let envoy = envoy("false", dir.path(), None);
        let (_abort_tx, abort) = oneshot::channel();

        let err = envoy
            .run(Bootstrap::new(&MeshConfig::default()), 1, abort)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited with"), "{err}");
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let envoy = envoy("/nonexistent/envoy", dir.path(), None);
        let (_abort_tx, abort) = oneshot::channel();

        let err = envoy
            .run(Bootstrap::new(&MeshConfig::default()), 0, abort)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("failed to start"), "{err}");
    }
}
