#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! Translates the mesh model into proxy configuration and serves it over the
//! v1 discovery API.

mod auth;
mod discovery;
mod egress;
mod ingress;
pub mod metrics;
mod mixer;
mod node;
mod policy;
pub mod resources;
mod route;
mod sidecar;

#[cfg(test)]
mod testutil;
#[cfg(test)]
mod tests;

pub use self::{
    discovery::DiscoveryService,
    metrics::DiscoveryMetrics,
    node::{InvalidNode, Node, Role},
};
use self::resources::{normalize_clusters, Cluster, HttpRouteConfig, Listener};
use pilot_core::{ServiceAccounts, ServiceDiscovery};
use pilot_model::{IstioConfigStore, MeshConfig};
use std::{collections::BTreeMap, sync::Arc};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cluster {0:?} is defined more than once with different settings")]
    ConflictingCluster(String),

    #[error(transparent)]
    Registry(#[from] pilot_core::Error),
}

/// Everything the translator reads.
#[derive(Clone)]
pub struct Context {
    pub mesh: Arc<MeshConfig>,
    pub discovery: Arc<dyn ServiceDiscovery>,
    pub accounts: Arc<dyn ServiceAccounts>,
    pub config: IstioConfigStore,
}

/// The complete configuration of one proxy.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProxyConfig {
    pub listeners: Vec<Listener>,
    pub clusters: Vec<Cluster>,

    /// Route configurations served over RDS, by listener port.
    pub routes: BTreeMap<u16, HttpRouteConfig>,
}

// === impl Context ===

impl Context {
    pub fn build(&self, node: &Node) -> Result<ProxyConfig, Error> {
        match node.role {
            Role::Sidecar => sidecar::build(self, node),
            Role::Ingress => ingress::build(self, node),
            Role::Egress => egress::build(self),
        }
    }
}

/// Collects the clusters referenced by `routes` together with `extra`,
/// deduplicated and sorted by name, and applies destination policies and
/// client TLS to them.
pub(crate) fn finish_clusters(
    ctx: &Context,
    routes: &BTreeMap<u16, HttpRouteConfig>,
    extra: &[Cluster],
) -> Result<Vec<Cluster>, Error> {
    let mut clusters = normalize_clusters(
        routes
            .values()
            .flat_map(|rc| rc.clusters())
            .chain(extra.iter()),
    )?;
    for cluster in &mut clusters {
        policy::apply_destination_policy(&ctx.config, cluster);
        if ctx.mesh.is_mtls() {
            auth::apply_client_tls(&ctx.mesh, &*ctx.accounts, cluster);
        }
    }
    Ok(clusters)
}
