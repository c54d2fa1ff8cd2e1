//! Configuration of the proxy running next to a workload.
//!
//! Traffic is redirected to the proxy's virtual listener, which hands each
//! connection to the listener matching its original destination:
//!
//! * inbound listeners on the workload's own `ip:port`s forward to localhost;
//! * outbound HTTP listeners on `0.0.0.0:port` route by virtual host;
//! * outbound TCP listeners on `serviceIP:port` proxy straight to a cluster.

use crate::{
    auth, egress, mixer, policy,
    resources::{
        Cluster, ClusterType, Host, HttpConnectionManager, HttpRoute, HttpRouteConfig, Listener,
        NetworkFilter, Rds, TcpProxy, TcpRoute, TcpRouteConfig, VirtualHost,
        INBOUND_CLUSTER_PREFIX, LOCALHOST, RDS_CLUSTER, WILDCARD_ADDRESS,
    },
    route, Context, Error, Node, ProxyConfig,
};
use ahash::AHashSet as HashSet;
use pilot_core::{Protocol, Service, ServiceInstance, Tags};
use pilot_model::MeshConfig;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub(crate) fn build(ctx: &Context, node: &Node) -> Result<ProxyConfig, Error> {
    let mesh = &*ctx.mesh;
    let ip = node.ip.to_string();

    let mut addrs = HashSet::new();
    addrs.insert(ip.clone());
    let instances = ctx.discovery.host_instances(&addrs)?;
    let services = ctx.discovery.services()?;

    let routes = outbound_http_routes(ctx, &instances, &services);

    let mut listeners = Vec::new();
    let mut clusters = Vec::new();

    for instance in &instances {
        let endpoint = &instance.endpoint;
        let protocol = endpoint.service_port.protocol;
        let Some((mut listener, cluster)) =
            inbound_listener(mesh, &endpoint.address, endpoint.port, protocol, true)
        else {
            continue;
        };
        if mesh.is_mtls() {
            listener.ssl_context = Some(auth::listener_tls(mesh));
        }
        listeners.push(listener);
        clusters.push(cluster);
    }

    for &port in routes.keys() {
        let rds = Rds {
            cluster: RDS_CLUSTER,
            route_config_name: port.to_string(),
            refresh_delay_ms: mesh.discovery_refresh_delay.as_millis(),
        };
        listeners.push(Listener::new(
            "http",
            WILDCARD_ADDRESS,
            port,
            NetworkFilter::Http(HttpConnectionManager::new(None, Some(rds))),
        ));
    }

    let (tcp_listeners, tcp_clusters) = outbound_tcp_listeners(mesh, &services);
    listeners.extend(tcp_listeners);
    clusters.extend(tcp_clusters);

    policy::insert_fault_filters(&mut listeners, &routes);
    if let Some(address) = &mesh.mixer_address {
        mixer::insert_filter(&mut listeners, node);
        clusters.push(mixer::cluster(mesh, address));
    }

    // Health checks bypass TLS and policy.
    if let Some(ports) = ctx.discovery.management_ports(&ip) {
        for port in ports.iter() {
            if instances.iter().any(|i| i.endpoint.port == port.port) {
                debug!(port = port.port, "Management port collides with a service port");
                continue;
            }
            if let Some((listener, cluster)) =
                inbound_listener(mesh, &ip, port.port, port.protocol, false)
            {
                listeners.push(listener);
                clusters.push(cluster);
            }
        }
    }

    let mut listeners = dedup_listeners(listeners);
    listeners.push(Listener {
        name: "virtual".to_string(),
        address: format!("tcp://{WILDCARD_ADDRESS}:{}", mesh.proxy_listen_port),
        filters: Vec::new(),
        ssl_context: None,
        bind_to_port: true,
        use_original_dst: true,
    });

    let clusters = crate::finish_clusters(ctx, &routes, &clusters)?;
    Ok(ProxyConfig {
        listeners,
        clusters,
        routes,
    })
}

/// A listener on a workload port forwarding to localhost.
fn inbound_listener(
    mesh: &MeshConfig,
    address: &str,
    port: u16,
    protocol: Protocol,
    policy_checks: bool,
) -> Option<(Listener, Cluster)> {
    let cluster = Cluster {
        name: format!("{INBOUND_CLUSTER_PREFIX}{port}"),
        connect_timeout_ms: mesh.connect_timeout.as_millis(),
        ty: ClusterType::Static,
        hosts: vec![Host {
            url: format!("tcp://{LOCALHOST}:{port}"),
        }],
        features: protocol.is_http2().then_some("http2"),
        ..Default::default()
    };

    let (kind, filter) = if protocol.is_http() {
        let mut route = HttpRoute::prefix(cluster.clone());
        if policy_checks && mesh.mixer_address.is_some() {
            route.opaque_config = mixer::inbound_opaque_config();
        }
        let mut domains = vec![format!("{address}:{port}")];
        if port == 80 {
            domains.push(address.to_string());
        }
        let vhost = VirtualHost {
            name: format!("inbound|{port}"),
            domains,
            routes: vec![route],
        };
        let rc = HttpRouteConfig {
            virtual_hosts: vec![vhost],
        };
        ("http", NetworkFilter::Http(HttpConnectionManager::new(Some(rc), None)))
    } else if protocol.is_tcp() {
        let route = TcpRoute {
            cluster: cluster.name.clone(),
            destination_ip_list: vec![format!("{address}/32")],
            ..Default::default()
        };
        ("tcp", NetworkFilter::Tcp(tcp_proxy(vec![route])))
    } else {
        warn!(%protocol, port, "Unsupported inbound protocol");
        return None;
    };

    Some((Listener::new(kind, address, port, filter), cluster))
}

/// Route configurations for every HTTP port of every known service, keyed
/// by port.
fn outbound_http_routes(
    ctx: &Context,
    instances: &[ServiceInstance],
    services: &[Service],
) -> BTreeMap<u16, HttpRouteConfig> {
    let mesh = &*ctx.mesh;
    let rules = ctx.config.route_rules_by_source(instances);
    let suffix = route::shared_suffix(instances.iter().map(|i| i.service.hostname.as_str()));

    let mut configs = BTreeMap::<u16, HttpRouteConfig>::new();
    for service in services {
        for port in service.ports.iter().filter(|p| p.protocol.is_http()) {
            let routes = if service.is_external() {
                match egress::sidecar_route(mesh, service, port) {
                    Some(route) => vec![route],
                    None => continue,
                }
            } else {
                route::destination_routes(mesh, service, port, &rules)
            };
            let mut vhost = route::virtual_host(service, port, &suffix);
            vhost.routes = routes;
            configs.entry(port.port).or_default().virtual_hosts.push(vhost);
        }
    }

    configs
        .into_iter()
        .map(|(port, rc)| (port, rc.normalize()))
        .collect()
}

/// One listener per service address and TCP port. Services without an
/// address share a wildcard listener for the port.
fn outbound_tcp_listeners(mesh: &MeshConfig, services: &[Service]) -> (Vec<Listener>, Vec<Cluster>) {
    let mut by_address = BTreeMap::<(String, u16), Vec<TcpRoute>>::new();
    let mut clusters = Vec::new();
    for service in services.iter().filter(|s| !s.is_external()) {
        for port in service.ports.iter().filter(|p| p.protocol.is_tcp()) {
            let cluster = route::outbound_cluster(mesh, &service.hostname, port, &Tags::default());
            let (ip, destination_ip_list) = match &service.address {
                Some(address) => (address.clone(), vec![format!("{address}/32")]),
                None => (WILDCARD_ADDRESS.to_string(), Vec::new()),
            };
            by_address
                .entry((ip, port.port))
                .or_default()
                .push(TcpRoute {
                    cluster: cluster.name.clone(),
                    destination_ip_list,
                    destination_ports: Some(port.port.to_string()),
                    ..Default::default()
                });
            clusters.push(cluster);
        }
    }

    let listeners = by_address
        .into_iter()
        .map(|((ip, port), mut routes)| {
            routes.sort();
            Listener::new("tcp", &ip, port, NetworkFilter::Tcp(tcp_proxy(routes)))
        })
        .collect();
    (listeners, clusters)
}

fn tcp_proxy(routes: Vec<TcpRoute>) -> TcpProxy {
    TcpProxy {
        stat_prefix: "tcp",
        route_config: TcpRouteConfig { routes },
    }
}

/// Keeps the first listener for each address and sorts by name.
fn dedup_listeners(listeners: Vec<Listener>) -> Vec<Listener> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(listeners.len());
    for listener in listeners {
        if seen.contains(&listener.address) {
            warn!(address = %listener.address, name = %listener.name, "Skipping listener on an occupied address");
            continue;
        }
        seen.insert(listener.address.clone());
        out.push(listener);
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    out
}
