use crate::resources::{
    AbortConfig, Cluster, DelayConfig, FaultConfig, Header, HttpRoute, RetryPolicy, Upstream,
    VirtualHost, WeightedCluster, WeightedClusters, OUTBOUND_CLUSTER_PREFIX, RETRY_ON,
};
use pilot_core::{service_key, Port, Service, Tags};
use pilot_model::{
    DestinationWeight, HttpFaultInjection, MeshConfig, RouteRule, StringMatch, HEADER_URI,
};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// The cluster for one port and tag subset of a mesh service. Instances are
/// discovered over SDS under the service key.
pub(crate) fn outbound_cluster(
    mesh: &MeshConfig,
    hostname: &str,
    port: &Port,
    tags: &Tags,
) -> Cluster {
    let mut name = format!("{OUTBOUND_CLUSTER_PREFIX}{hostname}|{}", port.name);
    if !tags.is_empty() {
        name.push('|');
        name.push_str(&tags.to_string());
    }
    Cluster {
        name,
        service_name: Some(service_key(
            hostname,
            [port.name.as_str()],
            std::slice::from_ref(tags),
        )),
        connect_timeout_ms: mesh.connect_timeout.as_millis(),
        features: http2_feature(port),
        upstream: Some(Upstream {
            hostname: hostname.to_string(),
            port: port.clone(),
            tags: tags.clone(),
        }),
        ..Default::default()
    }
}

pub(crate) fn http2_feature(port: &Port) -> Option<&'static str> {
    port.protocol.is_http2().then_some("http2")
}

/// Builds the routes of one destination service port: a route per
/// applicable rule, in the order given, followed by a default route unless
/// a rule already matches every request.
pub(crate) fn destination_routes(
    mesh: &MeshConfig,
    service: &Service,
    port: &Port,
    rules: &[RouteRule],
) -> Vec<HttpRoute> {
    let mut routes = Vec::new();
    for rule in rules.iter().filter(|r| r.destination == service.hostname) {
        let Some(route) = rule_route(mesh, rule, port) else {
            continue;
        };
        let catch_all = route.is_catch_all();
        routes.push(route);
        if catch_all {
            debug!(rule = %rule.name, "Route matches all requests; skipping lower-precedence rules");
            return routes;
        }
    }

    routes.push(HttpRoute::prefix(outbound_cluster(
        mesh,
        &service.hostname,
        port,
        &Tags::default(),
    )));
    routes
}

/// Translates a route rule for a destination port. Returns `None` when the
/// rule cannot be expressed as a route.
pub(crate) fn rule_route(mesh: &MeshConfig, rule: &RouteRule, port: &Port) -> Option<HttpRoute> {
    let mut route = match &rule.match_ {
        Some(m) => match_route(&m.http_headers)?,
        None => HttpRoute {
            prefix: Some("/".to_string()),
            ..Default::default()
        },
    };

    match rule.route.as_slice() {
        [] => {
            let cluster = outbound_cluster(mesh, &rule.destination, port, &Tags::default());
            route.cluster = Some(cluster.name.clone());
            route.clusters.push(cluster);
        }
        [only] => {
            let cluster = destination_cluster(mesh, rule, only, port);
            route.cluster = Some(cluster.name.clone());
            route.clusters.push(cluster);
        }
        weighted => {
            let mut entries = Vec::with_capacity(weighted.len());
            for dst in weighted {
                let cluster = destination_cluster(mesh, rule, dst, port);
                entries.push(WeightedCluster {
                    name: cluster.name.clone(),
                    weight: dst.effective_weight(weighted.len()),
                });
                route.clusters.push(cluster);
            }
            route.weighted_clusters = Some(WeightedClusters { clusters: entries });
        }
    }

    if let Some(timeout) = rule
        .http_req_timeout
        .as_ref()
        .and_then(|t| t.simple_timeout.as_ref())
        .filter(|t| t.timeout_seconds > 0.0)
    {
        route.timeout_ms = Some(secs_to_millis(timeout.timeout_seconds));
    }

    if let Some(retry) = rule
        .http_req_retries
        .as_ref()
        .and_then(|r| r.simple_retry.as_ref())
    {
        route.retry_policy = Some(RetryPolicy {
            retry_on: RETRY_ON,
            num_retries: retry.attempts,
            per_try_timeout_ms: (retry.per_try_timeout_seconds > 0.0)
                .then(|| secs_to_millis(retry.per_try_timeout_seconds)),
        });
    }

    if let Some(fault) = &rule.http_fault {
        route.faults = route
            .clusters
            .iter()
            .map(|c| fault_config(&c.name, fault))
            .collect();
    }

    if rule.l4_fault.is_some() {
        debug!(rule = %rule.name, "Ignoring L4 fault injection on an HTTP route");
    }

    Some(route)
}

fn destination_cluster(
    mesh: &MeshConfig,
    rule: &RouteRule,
    dst: &DestinationWeight,
    port: &Port,
) -> Cluster {
    let hostname = dst.destination.as_deref().unwrap_or(&rule.destination);
    outbound_cluster(mesh, hostname, port, &dst.tags)
}

/// Builds the request predicate of a route from header matches. The `uri`
/// pseudo-header selects the path; a regex on it is not supported.
pub(crate) fn match_route(matches: &BTreeMap<String, StringMatch>) -> Option<HttpRoute> {
    let mut route = HttpRoute {
        prefix: Some("/".to_string()),
        headers: headers(matches),
        ..Default::default()
    };
    match matches.get(HEADER_URI) {
        Some(StringMatch::Exact(path)) => {
            route.path = Some(path.clone());
            route.prefix = None;
        }
        Some(StringMatch::Prefix(prefix)) => route.prefix = Some(prefix.clone()),
        Some(StringMatch::Regex(regex)) => {
            warn!(%regex, "Unsupported route match condition: regex on uri");
            return None;
        }
        None => {}
    }
    Some(route)
}

/// Header matchers for everything but the `uri`, sorted by name.
fn headers(matches: &BTreeMap<String, StringMatch>) -> Vec<Header> {
    matches
        .iter()
        .filter(|(name, _)| *name != HEADER_URI)
        .map(|(name, m)| {
            let (value, regex) = match m {
                StringMatch::Exact(v) => (v.clone(), false),
                StringMatch::Prefix(p) => (format!("^{p}.*"), true),
                StringMatch::Regex(r) => (r.clone(), true),
            };
            Header {
                name: name.clone(),
                value,
                regex,
            }
        })
        .collect()
}

fn fault_config(cluster: &str, fault: &HttpFaultInjection) -> FaultConfig {
    FaultConfig {
        upstream_cluster: cluster.to_string(),
        headers: headers(&fault.headers),
        abort: fault
            .abort
            .as_ref()
            .filter(|a| a.http_status != 0)
            .map(|a| AbortConfig {
                abort_percent: a.percent as u32,
                http_status: a.http_status,
            }),
        delay: fault
            .delay
            .as_ref()
            .filter(|d| d.fixed_delay_seconds > 0.0)
            .map(|d| DelayConfig {
                ty: "fixed",
                fixed_delay_percent: d.percent as u32,
                fixed_duration_ms: secs_to_millis(d.fixed_delay_seconds),
            }),
    }
}

pub(crate) fn secs_to_millis(secs: f64) -> u64 {
    (secs * 1000.0).round() as u64
}

/// The longest common suffix of the hostnames' labels.
pub(crate) fn shared_suffix<'h>(hostnames: impl IntoIterator<Item = &'h str>) -> Vec<&'h str> {
    let mut hostnames = hostnames.into_iter().map(|h| h.split('.').collect::<Vec<_>>());
    let Some(first) = hostnames.next() else {
        return Vec::new();
    };
    hostnames.fold(first, |shared, labels| {
        let n = common_suffix_len(&shared, &labels);
        shared[shared.len() - n..].to_vec()
    })
}

fn common_suffix_len(a: &[&str], b: &[&str]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(a, b)| a == b)
        .count()
}

/// A virtual host for one service port.
///
/// Besides the full hostname, the domains include every shorter name that
/// resolves from the proxy's own domain: with a shared suffix of
/// `default.svc.cluster.local`, `reviews.default.svc.cluster.local` is also
/// reachable as `reviews` and `reviews.default`. Each name is listed with
/// the port, and bare as well on port 80.
pub(crate) fn virtual_host(service: &Service, port: &Port, suffix: &[&str]) -> VirtualHost {
    let labels = service.hostname.split('.').collect::<Vec<_>>();
    let shared = common_suffix_len(suffix, &labels);
    let (head, tail) = labels.split_at(labels.len() - shared);

    let mut hosts = Vec::new();
    let mut host = head.join(".");
    if !host.is_empty() {
        hosts.push(host.clone());
    }
    for label in tail {
        if !host.is_empty() {
            host.push('.');
        }
        host.push_str(label);
        hosts.push(host.clone());
    }
    if let Some(address) = &service.address {
        hosts.push(address.clone());
    }

    let mut domains = Vec::with_capacity(hosts.len() * 2);
    for host in hosts {
        domains.push(format!("{host}:{}", port.port));
        if port.port == 80 {
            domains.push(host);
        }
    }

    VirtualHost {
        name: service.key(port, &Tags::default()),
        domains,
        routes: Vec::new(),
    }
}
