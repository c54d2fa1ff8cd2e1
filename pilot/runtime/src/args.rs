use crate::{admin, api, seed};
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures::Future;
use pilot_agent::{Agent, Envoy, Retry, Watcher};
use pilot_config::{Controller as ConfigController, MemoryStore};
use pilot_core::{ConfigStore, ConfigStoreCache, Controller};
use pilot_model::{descriptors, IstioConfigStore, MeshConfig};
use pilot_registry::MemoryRegistry;
use pilot_xds::{Context as XdsContext, DiscoveryMetrics, DiscoveryService, Node, Role};
use prometheus_client::registry::Registry;
use std::{
    io,
    net::{IpAddr, SocketAddr},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{info, info_span, warn, Instrument};

#[derive(Debug, Parser)]
#[clap(name = "pilot", about = "Service mesh control plane and proxy agent", version)]
pub struct Args {
    #[clap(long, default_value = "pilot=info,warn", env = "PILOT_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serves proxy configuration over the discovery API.
    Discovery(DiscoveryArgs),

    /// Runs a proxy and keeps its bootstrap configuration current.
    Proxy(ProxyArgs),
}

#[derive(Debug, clap::Args)]
struct DiscoveryArgs {
    /// Mesh configuration file. The defaults apply when it does not exist.
    #[clap(long, default_value = "/etc/istio/config/mesh")]
    mesh_config: PathBuf,

    #[clap(long, default_value = "0.0.0.0:8080")]
    discovery_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:8081")]
    api_addr: SocketAddr,

    #[clap(long, default_value = "0.0.0.0:9990")]
    admin_addr: SocketAddr,

    /// Computes every discovery response afresh.
    #[clap(long)]
    disable_cache: bool,

    #[clap(long, default_value = "1s")]
    resync_period: pilot_model::Duration,

    /// Static service registry, in YAML.
    #[clap(long)]
    services: Option<PathBuf>,

    /// Configuration documents to store at start-up, in multi-document YAML.
    #[clap(long)]
    config: Option<PathBuf>,
}

#[derive(Debug, clap::Args)]
struct ProxyArgs {
    /// One of `sidecar`, `ingress` or `egress`.
    role: Role,

    #[clap(long, env = "INSTANCE_IP")]
    ip_address: IpAddr,

    #[clap(long, env = "POD_NAME", default_value = "")]
    id: String,

    #[clap(long, env = "POD_NAMESPACE", default_value = "")]
    domain: String,

    #[clap(long, default_value = "/etc/istio/config/mesh")]
    mesh_config: PathBuf,

    /// Directory for the generated proxy configuration files.
    #[clap(long, default_value = "/etc/istio/proxy")]
    config_path: PathBuf,

    #[clap(long, default_value = "/usr/local/bin/envoy")]
    binary_path: PathBuf,

    #[clap(long, value_parser = ["trace", "debug"])]
    proxy_log_level: Option<String>,

    /// Restarts attempted for one configuration before the agent gives up.
    #[clap(long, default_value = "10")]
    retry_budget: u32,

    /// The first restart delay. Each further attempt doubles it.
    #[clap(long, default_value = "200ms")]
    retry_delay: pilot_model::Duration,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            command,
        } = self;
        log_format.try_init(log_level)?;

        let (shutdown, _) = kubert::shutdown::sigint_or_sigterm()?;
        let (drain_tx, drain_rx) = drain::channel();

        let res = match command {
            Command::Discovery(args) => args.run(shutdown.signaled(), drain_rx).await,
            Command::Proxy(args) => args.run(shutdown.signaled(), drain_rx).await,
        };

        // Wait for the background tasks to finish before exiting.
        drain_tx.drain().await;
        res
    }
}

// === impl DiscoveryArgs ===

impl DiscoveryArgs {
    /// Runs until `shutdown` completes, failing if it completes with an error
    /// or if a server stops on its own.
    async fn run<E>(
        self,
        shutdown: impl Future<Output = Result<(), E>>,
        drain: drain::Watch,
    ) -> Result<()> {
        let Self {
            mesh_config,
            discovery_addr,
            api_addr,
            admin_addr,
            disable_cache,
            resync_period,
            services,
            config,
        } = self;

        let mesh = Arc::new(load_mesh(&mesh_config)?);

        let registry = Arc::new(MemoryRegistry::default());
        if let Some(path) = services {
            let yaml = read(&path)?;
            registry
                .load_yaml(&yaml)
                .with_context(|| format!("failed to load services from {}", path.display()))?;
        }

        let store = Arc::new(MemoryStore::new(descriptors()));
        if let Some(path) = config {
            let yaml = read(&path)?;
            let count = seed::load(&*store, &yaml)
                .with_context(|| format!("failed to load config from {}", path.display()))?;
            info!(count, path = %path.display(), "Loaded config");
        }
        let controller = Arc::new(ConfigController::new(store, resync_period.into()));

        let mut prom = <Registry>::default();
        let metrics = DiscoveryMetrics::register(prom.sub_registry_with_prefix("discovery"));

        let ctx = XdsContext {
            mesh,
            discovery: registry.clone(),
            accounts: registry.clone(),
            config: IstioConfigStore::new(controller.clone()),
        };
        let discovery = DiscoveryService::new(ctx, !disable_cache, metrics);
        discovery.register_handlers(&*registry, &*controller);

        tokio::spawn({
            let controller = controller.clone();
            let drain = drain.clone();
            async move { controller.run(drain).await }.instrument(info_span!("config"))
        });
        tokio::spawn({
            let registry = registry.clone();
            let drain = drain.clone();
            async move { registry.run(drain).await }.instrument(info_span!("registry"))
        });
        let api = tokio::spawn(
            api::serve(api_addr, controller.clone() as Arc<dyn ConfigStore>, drain.clone())
                .instrument(info_span!("api")),
        );
        let ready = {
            let controller = controller.clone();
            Arc::new(move || controller.has_synced()) as admin::Readiness
        };
        let admin = tokio::spawn(
            admin::serve(admin_addr, ready, Arc::new(prom), drain.clone())
                .instrument(info_span!("admin")),
        );
        let server = tokio::spawn(
            discovery
                .serve(discovery_addr, drain)
                .instrument(info_span!("discovery")),
        );

        tokio::select! {
            res = shutdown => {
                if res.is_err() {
                    bail!("Aborted");
                }
                Ok(())
            }
            res = server => {
                res.context("discovery server panicked")?
                    .context("discovery server failed")?;
                bail!("discovery server exited unexpectedly")
            }
            res = api => {
                res.context("config API server panicked")?
                    .context("config API server failed")?;
                bail!("config API server exited unexpectedly")
            }
            res = admin => {
                res.context("admin server panicked")?
                    .context("admin server failed")?;
                bail!("admin server exited unexpectedly")
            }
        }
    }
}

// === impl ProxyArgs ===

impl ProxyArgs {
    /// Runs until `shutdown` completes, failing if it completes with an error
    /// or if the agent gives up.
    async fn run<E>(
        self,
        shutdown: impl Future<Output = Result<(), E>>,
        drain: drain::Watch,
    ) -> Result<()> {
        let Self {
            role,
            ip_address,
            id,
            domain,
            mesh_config,
            config_path,
            binary_path,
            proxy_log_level,
            retry_budget,
            retry_delay,
        } = self;

        let mesh = Arc::new(load_mesh(&mesh_config)?);
        let node = Node {
            role,
            ip: ip_address,
            id,
            domain,
        };
        info!(%node, "Starting proxy agent");

        let envoy = Envoy::new(&mesh, &node, binary_path, config_path, proxy_log_level);
        let (handle, updates) = pilot_agent::channel();
        let retry = Retry {
            budget: retry_budget,
            initial_delay: retry_delay.into(),
        };
        let agent = tokio::spawn(
            Agent::new(envoy, retry, updates)
                .run(drain.clone())
                .instrument(info_span!("agent")),
        );
        tokio::spawn(
            Watcher::new(mesh, role, handle)
                .run(drain)
                .instrument(info_span!("watcher")),
        );

        tokio::select! {
            res = shutdown => {
                if res.is_err() {
                    bail!("Aborted");
                }
                Ok(())
            }
            res = agent => {
                res.context("agent panicked")??;
                bail!("agent exited unexpectedly")
            }
        }
    }
}

/// Reads the mesh config, falling back to the defaults when the file does
/// not exist.
fn load_mesh(path: &Path) -> Result<MeshConfig> {
    match std::fs::read_to_string(path) {
        Ok(yaml) => MeshConfig::from_yaml(&yaml)
            .with_context(|| format!("invalid mesh config {}", path.display())),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Mesh config not found; using defaults");
            Ok(MeshConfig::default())
        }
        Err(error) => {
            Err(error).with_context(|| format!("failed to read mesh config {}", path.display()))
        }
    }
}

fn read(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
}
