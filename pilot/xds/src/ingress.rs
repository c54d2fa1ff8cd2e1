//! Configuration of the edge proxy.
//!
//! Ingress rules expose mesh service ports to external clients. Each rule's
//! `authority` selects a virtual host; rules naming a TLS secret are served
//! on 443 and the rest on 80.

use crate::{
    auth::cert_path,
    mixer, policy,
    resources::{
        sort_routes_by_path, Header, HttpConnectionManager, HttpRoute, HttpRouteConfig, Listener,
        ListenerSslContext, NetworkFilter, Rds, VirtualHost, RDS_CLUSTER, WILDCARD_ADDRESS,
    },
    route, Context, Error, Node, ProxyConfig,
};
use pilot_model::{
    mesh::{INGRESS_CERTS_PATH, INGRESS_CERT_FILENAME, INGRESS_KEY_FILENAME},
    IngressRule, MeshConfig, RouteRule, StringMatch, HEADER_AUTHORITY,
};
use std::{cmp::Reverse, collections::BTreeMap};
use tracing::{debug, warn};

const HTTP_PORT: u16 = 80;
const HTTPS_PORT: u16 = 443;

/// The virtual host of rules without an exact `authority`.
const ANY_HOST: &str = "*";

pub(crate) fn build(ctx: &Context, node: &Node) -> Result<ProxyConfig, Error> {
    let mesh = &*ctx.mesh;
    let routes = routes(ctx)?;

    let mut listeners = vec![listener(mesh, HTTP_PORT)];
    if routes
        .get(&HTTPS_PORT)
        .is_some_and(|rc| !rc.virtual_hosts.is_empty())
    {
        let mut tls = listener(mesh, HTTPS_PORT);
        tls.ssl_context = Some(ListenerSslContext {
            cert_chain_file: cert_path(INGRESS_CERTS_PATH, INGRESS_CERT_FILENAME),
            private_key_file: cert_path(INGRESS_CERTS_PATH, INGRESS_KEY_FILENAME),
            ca_cert_file: None,
            require_client_certificate: false,
        });
        listeners.push(tls);
    }

    policy::insert_fault_filters(&mut listeners, &routes);
    let mut clusters = Vec::new();
    if let Some(address) = &mesh.mixer_address {
        mixer::insert_filter(&mut listeners, node);
        clusters.push(mixer::cluster(mesh, address));
    }

    let clusters = crate::finish_clusters(ctx, &routes, &clusters)?;
    Ok(ProxyConfig {
        listeners,
        clusters,
        routes,
    })
}

fn listener(mesh: &MeshConfig, port: u16) -> Listener {
    let rds = Rds {
        cluster: RDS_CLUSTER,
        route_config_name: port.to_string(),
        refresh_delay_ms: mesh.discovery_refresh_delay.as_millis(),
    };
    let mut listener = Listener::new(
        "http",
        WILDCARD_ADDRESS,
        port,
        NetworkFilter::Http(HttpConnectionManager::new(None, Some(rds))),
    );
    listener.bind_to_port = true;
    listener
}

/// Route configurations for both ingress ports.
pub(crate) fn routes(ctx: &Context) -> Result<BTreeMap<u16, HttpRouteConfig>, Error> {
    // Requests arrive from outside the mesh, so rules selecting a source
    // never apply.
    let mut rules = ctx
        .config
        .route_rules()
        .into_iter()
        .filter(|r| {
            r.match_
                .as_ref()
                .map_or(true, |m| m.source.is_none() && m.source_tags.is_empty())
        })
        .collect::<Vec<_>>();
    rules.sort_by_key(|r| Reverse(r.precedence));

    let mut plain = BTreeMap::<String, Vec<HttpRoute>>::new();
    let mut tls = BTreeMap::<String, Vec<HttpRoute>>::new();
    for ingress in ctx.config.ingress_rules() {
        let Some(routes) = ingress_routes(ctx, &ingress, &rules)? else {
            continue;
        };
        let vhosts = if ingress.tls_secret.is_some() {
            &mut tls
        } else {
            &mut plain
        };
        vhosts
            .entry(authority(&ingress.rule))
            .or_default()
            .extend(routes);
    }

    Ok([(HTTP_PORT, plain), (HTTPS_PORT, tls)]
        .into_iter()
        .map(|(port, vhosts)| (port, route_config(vhosts)))
        .collect())
}

fn route_config(vhosts: BTreeMap<String, Vec<HttpRoute>>) -> HttpRouteConfig {
    let virtual_hosts = vhosts
        .into_iter()
        .map(|(host, mut routes)| {
            sort_routes_by_path(&mut routes);
            VirtualHost {
                name: host.clone(),
                domains: vec![host],
                routes,
            }
        })
        .collect();
    HttpRouteConfig { virtual_hosts }.normalize()
}

/// The routes an ingress rule contributes to its virtual host.
///
/// The highest-precedence route rule for the destination port whose request
/// predicate equals the ingress rule's is reused, so that its weights,
/// timeouts and faults apply at the edge too. Without one, the ingress rule
/// routes by itself.
/// Returns `None` when the rule cannot be served.
fn ingress_routes(
    ctx: &Context,
    ingress: &IngressRule,
    rules: &[RouteRule],
) -> Result<Option<Vec<HttpRoute>>, Error> {
    let mesh = &*ctx.mesh;
    let rule = &ingress.rule;
    let Some(service) = ctx.discovery.get_service(&rule.destination)? else {
        warn!(rule = %rule.name, destination = %rule.destination, "Ingress destination not found");
        return Ok(None);
    };
    let Some(port) = ingress
        .service_port()
        .and_then(|p| p.find(&service.ports))
    else {
        warn!(rule = %rule.name, destination = %rule.destination, "Ingress port not found");
        return Ok(None);
    };
    if !port.protocol.is_http() {
        warn!(rule = %rule.name, protocol = %port.protocol, "Unsupported ingress protocol");
        return Ok(None);
    }

    let headers = rule
        .match_
        .as_ref()
        .map(|m| m.http_headers.clone())
        .unwrap_or_default();
    let Some(predicate) = route::match_route(&headers) else {
        return Ok(None);
    };
    let host = authority(rule);

    // Only routes built from a route rule are reused. The default route of
    // the destination matches everything and would hide the ingress rule's
    // own routes.
    let reused = rules
        .iter()
        .filter(|r| r.destination == service.hostname)
        .filter_map(|r| route::rule_route(mesh, r, port))
        .find(|r| same_predicate(r, &predicate, &host));
    let route = match reused {
        Some(route) => route,
        None => {
            debug!(rule = %rule.name, "No route rule matches the ingress predicate");
            match route::rule_route(mesh, rule, port) {
                Some(route) => route,
                None => return Ok(None),
            }
        }
    };
    let mut routes = vec![route];

    for route in &mut routes {
        // The virtual host already selects the authority.
        route.headers.retain(|h| h.name != HEADER_AUTHORITY);
        if mesh.mixer_address.is_some() {
            route.opaque_config = mixer::inbound_opaque_config();
        }
    }
    Ok(Some(routes))
}

/// Compares request predicates, ignoring the authority when the route rule
/// does not constrain it.
fn same_predicate(route: &HttpRoute, predicate: &HttpRoute, host: &str) -> bool {
    let authority = |h: &&Header| h.name == HEADER_AUTHORITY;
    let others = |r: &HttpRoute| {
        r.headers
            .iter()
            .filter(|h| !authority(h))
            .cloned()
            .collect::<Vec<_>>()
    };
    let host_matches = route
        .headers
        .iter()
        .find(authority)
        .map_or(true, |h| !h.regex && h.value == host);
    route.path == predicate.path
        && route.prefix == predicate.prefix
        && others(route) == others(predicate)
        && host_matches
}

fn authority(rule: &RouteRule) -> String {
    match rule
        .match_
        .as_ref()
        .and_then(|m| m.http_headers.get(HEADER_AUTHORITY))
    {
        Some(StringMatch::Exact(host)) => host.clone(),
        Some(other) => {
            warn!(rule = %rule.name, ?other, "Unsupported authority match; serving on any host");
            ANY_HOST.to_string()
        }
        None => ANY_HOST.to_string(),
    }
}
