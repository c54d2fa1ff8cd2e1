//! External services.
//!
//! Sidecars send requests for services declared with an external name to
//! the egress proxy, keeping the original `Host`. The egress proxy resolves
//! the external name and rewrites the host on the way out.

use crate::{
    resources::{
        Cluster, ClusterType, Host, HttpConnectionManager, HttpRoute, HttpRouteConfig, Listener,
        NetworkFilter, VirtualHost, OUTBOUND_CLUSTER_PREFIX, WILDCARD_ADDRESS,
    },
    route::http2_feature,
    Context, Error, ProxyConfig,
};
use pilot_core::{Port, Service};
use pilot_model::MeshConfig;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// The port the egress proxy listens on.
const EGRESS_PORT: u16 = 80;

/// A route from a sidecar to the egress proxy for an external service port.
pub(crate) fn sidecar_route(mesh: &MeshConfig, service: &Service, port: &Port) -> Option<HttpRoute> {
    let Some(egress) = &mesh.egress_proxy_address else {
        warn!(service = %service.hostname, "No egress proxy configured for external service");
        return None;
    };
    let cluster = Cluster {
        name: format!("{OUTBOUND_CLUSTER_PREFIX}{}|{}", service.hostname, port.name),
        connect_timeout_ms: mesh.connect_timeout.as_millis(),
        ty: ClusterType::StrictDns,
        hosts: vec![Host {
            url: format!("tcp://{egress}"),
        }],
        features: http2_feature(port),
        ..Default::default()
    };
    Some(HttpRoute::prefix(cluster))
}

pub(crate) fn build(ctx: &Context) -> Result<ProxyConfig, Error> {
    let mesh = &*ctx.mesh;
    let mut virtual_hosts = Vec::new();
    for service in ctx.discovery.services()? {
        let Some(external_name) = &service.external_name else {
            continue;
        };
        for port in service.ports.iter() {
            if !port.protocol.is_http() {
                debug!(service = %service.hostname, protocol = %port.protocol, "Skipping non-HTTP external port");
                continue;
            }
            let cluster = Cluster {
                name: format!("{OUTBOUND_CLUSTER_PREFIX}{external_name}:{}", port.port),
                connect_timeout_ms: mesh.connect_timeout.as_millis(),
                ty: ClusterType::StrictDns,
                hosts: vec![Host {
                    url: format!("tcp://{external_name}:{}", port.port),
                }],
                features: http2_feature(port),
                ..Default::default()
            };
            let mut route = HttpRoute::prefix(cluster);
            route.auto_host_rewrite = true;

            let mut domains = vec![format!("{}:{}", service.hostname, port.port)];
            if port.port == 80 {
                domains.push(service.hostname.clone());
            }
            virtual_hosts.push(VirtualHost {
                name: format!("{}:{}", service.hostname, port.port),
                domains,
                routes: vec![route],
            });
        }
    }

    let rc = HttpRouteConfig { virtual_hosts }.normalize();
    let clusters = crate::resources::normalize_clusters(rc.clusters())?;
    let mut listener = Listener::new(
        "http",
        WILDCARD_ADDRESS,
        EGRESS_PORT,
        NetworkFilter::Http(HttpConnectionManager::new(Some(rc), None)),
    );
    listener.bind_to_port = true;

    Ok(ProxyConfig {
        listeners: vec![listener],
        clusters,
        routes: BTreeMap::new(),
    })
}
