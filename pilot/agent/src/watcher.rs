use crate::{Bootstrap, Handle};
use pilot_model::{
    mesh::{
        CERT_CHAIN_FILENAME, INGRESS_CERTS_PATH, INGRESS_CERT_FILENAME, INGRESS_KEY_FILENAME,
        KEY_FILENAME, ROOT_CERT_FILENAME,
    },
    MeshConfig,
};
use pilot_xds::Role;
use sha2::{Digest, Sha256};
use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::time;
use tracing::{debug, info, trace, warn};

/// Keeps the agent's desired bootstrap current, restarting the proxy when
/// its certificates rotate.
pub struct Watcher {
    mesh: Arc<MeshConfig>,
    role: Role,
    interval: Duration,
    handle: Handle<Bootstrap>,
}

// === impl Watcher ===

impl Watcher {
    pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(10);

    pub fn new(mesh: Arc<MeshConfig>, role: Role, handle: Handle<Bootstrap>) -> Self {
        Self {
            mesh,
            role,
            interval: Self::DEFAULT_INTERVAL,
            handle,
        }
    }

    pub fn with_interval(self, interval: Duration) -> Self {
        Self { interval, ..self }
    }

    pub async fn run(self, shutdown: drain::Watch) {
        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
        let shutdown = shutdown.signaled();
        tokio::pin!(shutdown);

        let mut last = None;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let bootstrap = self.bootstrap().await;
                    if last.as_ref() == Some(&bootstrap) {
                        trace!("Bootstrap unchanged");
                        continue;
                    }
                    debug!(certs_hash = ?bootstrap.certs_hash, "Bootstrap changed");
                    last = Some(bootstrap.clone());
                    self.handle.schedule(bootstrap);
                }
                _ = &mut shutdown => {
                    info!("Watcher stopped");
                    return;
                }
            }
        }
    }

    /// Builds the bootstrap for the current state of the certificates.
    pub async fn bootstrap(&self) -> Bootstrap {
        let mut bootstrap = Bootstrap::new(&self.mesh);
        if let Some((dir, files)) = self.certs() {
            match hash_files(&dir, files).await {
                Ok(hash) => {
                    trace!(%hash, dir = %dir.display(), "Hashed certificates");
                    bootstrap.certs_hash = Some(hash);
                }
                Err(error) => warn!(%error, dir = %dir.display(), "Failed to read certificates"),
            }
        }
        bootstrap
    }

    /// Ingress proxies always watch their TLS secret; other proxies watch
    /// their workload certificates under mutual TLS.
    fn certs(&self) -> Option<(PathBuf, &'static [&'static str])> {
        if self.role == Role::Ingress {
            return Some((
                PathBuf::from(INGRESS_CERTS_PATH),
                &[INGRESS_CERT_FILENAME, INGRESS_KEY_FILENAME],
            ));
        }
        if self.mesh.is_mtls() {
            return Some((
                PathBuf::from(&self.mesh.auth_certs_path),
                &[CERT_CHAIN_FILENAME, KEY_FILENAME, ROOT_CERT_FILENAME],
            ));
        }
        None
    }
}

/// Digests the named files in `dir`. Missing files are skipped.
async fn hash_files(dir: &Path, names: &[&str]) -> io::Result<String> {
    let mut hasher = Sha256::new();
    for name in names {
        match tokio::fs::read(dir.join(name)).await {
            Ok(contents) => hasher.update(&contents),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                debug!(file = %name, "Certificate file not found");
            }
            Err(error) => return Err(error),
        }
    }
    Ok(hex::encode(hasher.finalize()))
}
