use crate::{
    resources::{
        CircuitBreakerLimits, CircuitBreakers, ClusterType, HttpFilter, HttpRoute, ListenerSslContext,
        NetworkFilter, OutlierDetection, VirtualHost,
    },
    testutil::*,
    ProxyConfig,
};
use pilot_core::{PortList, Service};
use pilot_model::{AuthPolicy, DestinationPolicy, IngressRule, RouteRule};
use pretty_assertions::assert_eq;
use serde_json::json;

const REVIEWS_VHOST: &str = "reviews.default.svc.cluster.local:http";
const REVIEWS_CLUSTER: &str = "outbound:reviews.default.svc.cluster.local|http";
const REVIEWS_V1: &str = "outbound:reviews.default.svc.cluster.local|http|version=v1";
const REVIEWS_V2: &str = "outbound:reviews.default.svc.cluster.local|http|version=v2";

fn vhost<'c>(config: &'c ProxyConfig, port: u16, name: &str) -> &'c VirtualHost {
    config.routes[&port]
        .virtual_hosts
        .iter()
        .find(|vh| vh.name == name)
        .unwrap_or_else(|| panic!("missing virtual host {name}"))
}

fn predicates(routes: &[HttpRoute]) -> Vec<(Option<&str>, Option<&str>, Option<&str>)> {
    routes
        .iter()
        .map(|r| (r.path.as_deref(), r.prefix.as_deref(), r.cluster.as_deref()))
        .collect()
}

fn listener_names(config: &ProxyConfig) -> Vec<&str> {
    config.listeners.iter().map(|l| l.name.as_str()).collect()
}

fn cluster_names(config: &ProxyConfig) -> Vec<&str> {
    config.clusters.iter().map(|c| c.name.as_str()).collect()
}

fn http_filters<'c>(config: &'c ProxyConfig, listener: &str) -> &'c [HttpFilter] {
    let listener = config
        .listeners
        .iter()
        .find(|l| l.name == listener)
        .unwrap_or_else(|| panic!("missing listener {listener}"));
    match &listener.filters[..] {
        [NetworkFilter::Http(hcm)] => &hcm.filters,
        filters => panic!("expected one HTTP connection manager, got {filters:?}"),
    }
}

#[test]
fn sidecar_default_routes() {
    let f = Fixture::new();
    let config = f.ctx().build(&sidecar()).unwrap();

    assert_eq!(
        listener_names(&config),
        [
            "http_0.0.0.0_9080",
            "http_10.1.1.10_9080",
            "tcp_10.0.0.3_3306",
            "virtual"
        ]
    );
    let virtual_ = config.listeners.last().unwrap();
    assert_eq!(virtual_.address, "tcp://0.0.0.0:15001");
    assert!(virtual_.bind_to_port && virtual_.use_original_dst);

    assert_eq!(
        cluster_names(&config),
        [
            "inbound:9080",
            "outbound:mysql.default.svc.cluster.local|mysql",
            "outbound:productpage.default.svc.cluster.local|http",
            REVIEWS_CLUSTER,
        ]
    );

    let reviews = vhost(&config, 9080, REVIEWS_VHOST);
    assert_eq!(
        reviews.domains,
        [
            "reviews:9080",
            "reviews.default:9080",
            "reviews.default.svc:9080",
            "reviews.default.svc.cluster:9080",
            "reviews.default.svc.cluster.local:9080",
            "10.0.0.2:9080",
        ]
    );
    assert_eq!(
        predicates(&reviews.routes),
        [(None, Some("/"), Some(REVIEWS_CLUSTER))]
    );

    let cluster = config
        .clusters
        .iter()
        .find(|c| c.name == REVIEWS_CLUSTER)
        .unwrap();
    assert_eq!(cluster.ty, ClusterType::Sds);
    assert_eq!(
        cluster.service_name.as_deref(),
        Some("reviews.default.svc.cluster.local:http")
    );
}

#[test]
fn weighted_split() {
    let f = Fixture::new();
    f.add::<RouteRule>(json!({
        "name": "reviews-split",
        "destination": REVIEWS,
        "precedence": 1,
        "route": [
            {"tags": {"version": "v1"}, "weight": 75},
            {"tags": {"version": "v2"}, "weight": 25},
        ],
    }));
    let config = f.ctx().build(&sidecar()).unwrap();

    let routes = &vhost(&config, 9080, REVIEWS_VHOST).routes;
    assert_eq!(routes.len(), 1, "a rule without a match hides the default route");
    let weighted = routes[0]
        .weighted_clusters
        .as_ref()
        .unwrap()
        .clusters
        .iter()
        .map(|c| (c.name.as_str(), c.weight))
        .collect::<Vec<_>>();
    assert_eq!(weighted, [(REVIEWS_V1, 75), (REVIEWS_V2, 25)]);
    assert_eq!(weighted.iter().map(|(_, w)| w).sum::<i32>(), 100);

    let names = cluster_names(&config);
    assert!(names.contains(&REVIEWS_V1));
    assert!(names.contains(&REVIEWS_V2));
    assert!(!names.contains(&REVIEWS_CLUSTER));

    let v1 = config.clusters.iter().find(|c| c.name == REVIEWS_V1).unwrap();
    assert_eq!(
        v1.service_name.as_deref(),
        Some("reviews.default.svc.cluster.local:http:version=v1")
    );
}

#[test]
fn exact_path_precedes_default() {
    let f = Fixture::new();
    f.add::<RouteRule>(json!({
        "name": "reviews-foo",
        "destination": REVIEWS,
        "match": {"httpHeaders": {"uri": {"exact": "/foo"}}},
        "route": [{"tags": {"version": "v2"}, "weight": 100}],
    }));
    let config = f.ctx().build(&sidecar()).unwrap();

    assert_eq!(
        predicates(&vhost(&config, 9080, REVIEWS_VHOST).routes),
        [
            (Some("/foo"), None, Some(REVIEWS_V2)),
            (None, Some("/"), Some(REVIEWS_CLUSTER)),
        ]
    );
}

#[test]
fn precedence_orders_rules() {
    let f = Fixture::new();
    f.add::<RouteRule>(json!({
        "name": "a-low",
        "destination": REVIEWS,
        "precedence": 1,
        "match": {"httpHeaders": {"uri": {"prefix": "/a"}}},
        "route": [{"tags": {"version": "v1"}}],
    }));
    f.add::<RouteRule>(json!({
        "name": "b-high",
        "destination": REVIEWS,
        "precedence": 2,
        "match": {"httpHeaders": {"uri": {"prefix": "/b"}}},
        "route": [{"tags": {"version": "v2"}}],
    }));
    let config = f.ctx().build(&sidecar()).unwrap();

    assert_eq!(
        predicates(&vhost(&config, 9080, REVIEWS_VHOST).routes),
        [
            (None, Some("/b"), Some(REVIEWS_V2)),
            (None, Some("/a"), Some(REVIEWS_V1)),
            (None, Some("/"), Some(REVIEWS_CLUSTER)),
        ]
    );
}

#[test]
fn source_restricted_rules() {
    let f = Fixture::new();
    f.add::<RouteRule>(json!({
        "name": "from-ratings",
        "destination": REVIEWS,
        "match": {"source": "ratings.default.svc.cluster.local"},
        "route": [{"tags": {"version": "v2"}}],
    }));
    let config = f.ctx().build(&sidecar()).unwrap();
    assert_eq!(
        predicates(&vhost(&config, 9080, REVIEWS_VHOST).routes),
        [(None, Some("/"), Some(REVIEWS_CLUSTER))],
        "rules for other sources do not apply"
    );

    f.add::<RouteRule>(json!({
        "name": "from-productpage",
        "destination": REVIEWS,
        "match": {"source": PRODUCTPAGE, "sourceTags": {"version": "v1"}},
        "route": [{"tags": {"version": "v1"}}],
    }));
    let config = f.ctx().build(&sidecar()).unwrap();
    assert_eq!(
        predicates(&vhost(&config, 9080, REVIEWS_VHOST).routes),
        [(None, Some("/"), Some(REVIEWS_V1))]
    );
}

#[test]
fn request_timeout() {
    let f = Fixture::new();
    f.add::<RouteRule>(json!({
        "name": "reviews-timeout",
        "destination": REVIEWS,
        "httpReqTimeout": {"simpleTimeout": {"timeoutSeconds": 5}},
    }));
    let config = f.ctx().build(&sidecar()).unwrap();

    let routes = &vhost(&config, 9080, REVIEWS_VHOST).routes;
    assert_eq!(routes.len(), 1);
    assert_eq!(routes[0].timeout_ms, Some(5000));
    assert_eq!(routes[0].cluster.as_deref(), Some(REVIEWS_CLUSTER));
}

#[test]
fn destination_policy_circuit_breaker() {
    let f = Fixture::new();
    f.add::<DestinationPolicy>(json!({
        "destination": REVIEWS,
        "policy": [{
            "circuitBreaker": {"simpleCb": {
                "maxConnections": 100,
                "httpMaxPendingRequests": 10,
                "sleepWindowSeconds": 30,
                "httpConsecutiveErrors": 5,
            }},
        }],
    }));
    let config = f.ctx().build(&sidecar()).unwrap();

    let cluster = config
        .clusters
        .iter()
        .find(|c| c.name == REVIEWS_CLUSTER)
        .unwrap();
    assert_eq!(
        cluster.circuit_breaker,
        Some(CircuitBreakers {
            default: CircuitBreakerLimits {
                max_connections: Some(100),
                max_pending_requests: Some(10),
                max_requests: None,
            },
        })
    );
    assert_eq!(
        cluster.outlier_detection,
        Some(OutlierDetection {
            consecutive_5xx: Some(5),
            interval_ms: None,
            base_ejection_time_ms: Some(30_000),
            max_ejection_percent: 10,
        })
    );

    let encoded = serde_json::to_value(cluster).unwrap();
    assert_eq!(encoded["circuit_breakers"]["default"]["max_connections"], 100);

    let productpage = config
        .clusters
        .iter()
        .find(|c| c.name == "outbound:productpage.default.svc.cluster.local|http")
        .unwrap();
    assert_eq!(productpage.circuit_breaker, None);
}

#[test]
fn mutual_tls() {
    let mut f = Fixture::new();
    f.mesh.auth_policy = AuthPolicy::MutualTls;
    f.mesh.auth_certs_path = "/etc/certs".to_string();
    let config = f.ctx().build(&sidecar()).unwrap();

    let inbound = config
        .listeners
        .iter()
        .find(|l| l.name == "http_10.1.1.10_9080")
        .unwrap();
    assert_eq!(
        inbound.ssl_context,
        Some(ListenerSslContext {
            cert_chain_file: "/etc/certs/cert-chain.pem".to_string(),
            private_key_file: "/etc/certs/key.pem".to_string(),
            ca_cert_file: Some("/etc/certs/root-cert.pem".to_string()),
            require_client_certificate: true,
        })
    );
    let outbound = config
        .listeners
        .iter()
        .find(|l| l.name == "http_0.0.0.0_9080")
        .unwrap();
    assert_eq!(outbound.ssl_context, None);

    let reviews = config
        .clusters
        .iter()
        .find(|c| c.name == REVIEWS_CLUSTER)
        .unwrap();
    let ssl = reviews.ssl_context.as_ref().unwrap();
    assert_eq!(ssl.ca_cert_file, "/etc/certs/root-cert.pem");
    assert_eq!(
        ssl.verify_subject_alt_name,
        [
            "spiffe://cluster.local/ns/default/sa/reviews",
            "spiffe://cluster.local/ns/default/sa/reviews-v2",
        ]
    );

    let inbound = config
        .clusters
        .iter()
        .find(|c| c.name == "inbound:9080")
        .unwrap();
    assert_eq!(inbound.ssl_context, None, "local traffic is plaintext");
}

#[test]
fn tcp_services() {
    let f = Fixture::new();
    let config = f.ctx().build(&sidecar()).unwrap();

    let listener = config
        .listeners
        .iter()
        .find(|l| l.name == "tcp_10.0.0.3_3306")
        .unwrap();
    assert_eq!(listener.address, "tcp://10.0.0.3:3306");
    let [NetworkFilter::Tcp(proxy)] = &listener.filters[..] else {
        panic!("expected a TCP proxy: {:?}", listener.filters);
    };
    let route = &proxy.route_config.routes[0];
    assert_eq!(route.cluster, "outbound:mysql.default.svc.cluster.local|mysql");
    assert_eq!(route.destination_ip_list, ["10.0.0.3/32"]);
    assert_eq!(route.destination_ports.as_deref(), Some("3306"));
}

#[test]
fn fault_injection() {
    let f = Fixture::new();
    f.add::<RouteRule>(json!({
        "name": "reviews-abort",
        "destination": REVIEWS,
        "httpFault": {"abort": {"percent": 10, "httpStatus": 503}},
    }));
    let config = f.ctx().build(&sidecar()).unwrap();

    let filters = http_filters(&config, "http_0.0.0.0_9080");
    let [HttpFilter::Fault(fault), HttpFilter::Router] = filters else {
        panic!("expected a fault filter before the router: {filters:?}");
    };
    assert_eq!(fault.upstream_cluster, REVIEWS_CLUSTER);
    let abort = fault.abort.as_ref().unwrap();
    assert_eq!((abort.abort_percent, abort.http_status), (10, 503));

    assert!(
        matches!(http_filters(&config, "http_10.1.1.10_9080"), [HttpFilter::Router]),
        "inbound listeners carry no faults"
    );
}

#[test]
fn mixer_and_management_ports() {
    let mut f = Fixture::new();
    f.mesh.mixer_address = Some("istio-mixer:9091".to_string());
    f.registry.set_management_ports(
        PRODUCTPAGE_IP,
        [http("health", 8080), http("http", 9080)]
            .into_iter()
            .collect::<PortList>(),
    );
    let node = node("sidecar~10.1.1.10~productpage-v1.default~default.svc.cluster.local");
    let config = f.ctx().build(&node).unwrap();

    assert_eq!(
        listener_names(&config),
        [
            "http_0.0.0.0_9080",
            "http_10.1.1.10_8080",
            "http_10.1.1.10_9080",
            "tcp_10.0.0.3_3306",
            "virtual"
        ]
    );

    for name in ["http_0.0.0.0_9080", "http_10.1.1.10_9080"] {
        let [HttpFilter::Mixer(mixer), .., HttpFilter::Router] = http_filters(&config, name) else {
            panic!("expected the mixer filter first on {name}");
        };
        assert_eq!(mixer.mixer_attributes["target.ip"], "10.1.1.10");
        assert_eq!(
            mixer.forward_attributes["target.uid"],
            "kubernetes://productpage-v1.default"
        );
        assert_eq!(mixer.quota_name, "RequestCount");
    }
    assert!(
        matches!(http_filters(&config, "http_10.1.1.10_8080"), [HttpFilter::Router]),
        "health checks bypass policy"
    );

    let mixer = config
        .clusters
        .iter()
        .find(|c| c.name == "mixer_server")
        .unwrap();
    assert_eq!(mixer.ty, ClusterType::StrictDns);
    assert_eq!(mixer.hosts[0].url, "tcp://istio-mixer:9091");
    assert_eq!(mixer.features, Some("http2"));

    let inbound = config
        .listeners
        .iter()
        .find(|l| l.name == "http_10.1.1.10_9080")
        .unwrap();
    let [NetworkFilter::Http(hcm)] = &inbound.filters[..] else {
        panic!("expected an HTTP connection manager");
    };
    let route = &hcm.route_config.as_ref().unwrap().virtual_hosts[0].routes[0];
    assert_eq!(route.opaque_config["mixer_control"], "on");
    assert_eq!(route.opaque_config["mixer_forward"], "off");
}

#[test]
fn ingress_rules() {
    let f = Fixture::new();
    f.add::<RouteRule>(json!({
        "name": "reviews-prefix",
        "destination": REVIEWS,
        "match": {"httpHeaders": {"uri": {"prefix": "/reviews"}}},
        "route": [{"tags": {"version": "v2"}}],
    }));
    f.add::<IngressRule>(json!({
        "name": "reviews-ingress",
        "destination": REVIEWS,
        "match": {"httpHeaders": {"uri": {"prefix": "/reviews"}}},
        "destinationServicePortName": "http",
    }));
    f.add::<IngressRule>(json!({
        "name": "productpage-ingress",
        "destination": PRODUCTPAGE,
        "match": {"httpHeaders": {
            "uri": {"exact": "/productpage"},
            "authority": {"exact": "bookinfo.example.com"},
        }},
        "destinationServicePort": 9080,
        "tlsSecret": "bookinfo-tls",
    }));
    let node = node("ingress~10.2.0.1~istio-ingress-1.istio-system~istio-system.svc.cluster.local");
    let config = f.ctx().build(&node).unwrap();

    assert_eq!(listener_names(&config), ["http_0.0.0.0_80", "http_0.0.0.0_443"]);
    assert!(config.listeners.iter().all(|l| l.bind_to_port));
    let tls = config.listeners[1].ssl_context.as_ref().unwrap();
    assert_eq!(tls.cert_chain_file, "/etc/istio/ingress-certs/tls.crt");
    assert_eq!(tls.private_key_file, "/etc/istio/ingress-certs/tls.key");

    let any = vhost(&config, 80, "*");
    assert_eq!(any.domains, ["*"]);
    assert_eq!(
        predicates(&any.routes),
        [(None, Some("/reviews"), Some(REVIEWS_V2))],
        "the matching route rule is reused"
    );

    let bookinfo = vhost(&config, 443, "bookinfo.example.com");
    assert_eq!(bookinfo.domains, ["bookinfo.example.com"]);
    assert_eq!(
        predicates(&bookinfo.routes),
        [(
            Some("/productpage"),
            None,
            Some("outbound:productpage.default.svc.cluster.local|http")
        )]
    );
    assert!(
        bookinfo.routes[0].headers.is_empty(),
        "the authority is matched by the virtual host"
    );

    assert_eq!(
        cluster_names(&config),
        [
            "outbound:productpage.default.svc.cluster.local|http",
            REVIEWS_V2
        ]
    );
}

#[test]
fn ingress_without_tls() {
    let f = Fixture::new();
    f.add::<IngressRule>(json!({
        "name": "reviews-ingress",
        "destination": REVIEWS,
        "destinationServicePortName": "http",
    }));
    f.add::<IngressRule>(json!({
        "name": "missing-ingress",
        "destination": "ratings.default.svc.cluster.local",
        "destinationServicePortName": "http",
    }));
    let node = node("ingress~10.2.0.1~istio-ingress-1.istio-system~istio-system.svc.cluster.local");
    let config = f.ctx().build(&node).unwrap();

    assert_eq!(listener_names(&config), ["http_0.0.0.0_80"]);
    assert_eq!(
        predicates(&vhost(&config, 80, "*").routes),
        [(None, Some("/"), Some(REVIEWS_CLUSTER))]
    );
    assert!(config.routes[&443].virtual_hosts.is_empty());
}

#[test]
fn ingress_rule_routes_by_itself() {
    let f = Fixture::new();
    // Same path, but it also selects on a header the ingress rule ignores.
    f.add::<RouteRule>(json!({
        "name": "reviews-testers",
        "destination": REVIEWS,
        "precedence": 2,
        "match": {"httpHeaders": {"cookie": {"regex": "^(.*?;)?(user=tester)(;.*)?$"}}},
        "route": [{"tags": {"version": "v2"}}],
    }));
    f.add::<IngressRule>(json!({
        "name": "reviews-ingress",
        "destination": REVIEWS,
        "route": [
            {"tags": {"version": "v1"}, "weight": 80},
            {"tags": {"version": "v2"}, "weight": 20},
        ],
        "httpReqTimeout": {"simpleTimeout": {"timeoutSeconds": 5}},
        "destinationServicePortName": "http",
    }));
    let node = node("ingress~10.2.0.1~istio-ingress-1.istio-system~istio-system.svc.cluster.local");
    let config = f.ctx().build(&node).unwrap();

    let routes = &vhost(&config, 80, "*").routes;
    assert_eq!(routes.len(), 1);
    let route = &routes[0];
    assert_eq!(route.prefix.as_deref(), Some("/"));
    assert!(route.headers.is_empty());
    assert_eq!(route.timeout_ms, Some(5000));
    let weights = route
        .weighted_clusters
        .as_ref()
        .expect("the ingress rule's weights apply")
        .clusters
        .iter()
        .map(|c| (c.name.as_str(), c.weight))
        .collect::<Vec<_>>();
    assert_eq!(weights, [(REVIEWS_V1, 80), (REVIEWS_V2, 20)]);
    assert_eq!(cluster_names(&config), [REVIEWS_V1, REVIEWS_V2]);
}

#[test]
fn external_services() {
    let f = Fixture::new();
    f.registry
        .add_service(Service {
            external_name: Some("httpbin.org".to_string()),
            ..service(HTTPBIN, None, vec![http("http", 80)])
        })
        .unwrap();

    // Sidecars send external traffic to the egress proxy.
    let config = f.ctx().build(&sidecar()).unwrap();
    let httpbin = vhost(&config, 80, "httpbin.default.svc.cluster.local:http");
    assert!(httpbin.domains.contains(&"httpbin".to_string()));
    assert_eq!(
        predicates(&httpbin.routes),
        [(None, Some("/"), Some("outbound:httpbin.default.svc.cluster.local|http"))]
    );
    let cluster = config
        .clusters
        .iter()
        .find(|c| c.name == "outbound:httpbin.default.svc.cluster.local|http")
        .unwrap();
    assert_eq!(cluster.ty, ClusterType::StrictDns);
    assert_eq!(cluster.hosts[0].url, "tcp://istio-egress:80");

    // The egress proxy resolves the external name.
    let node = node("egress~10.3.0.1~istio-egress-1.istio-system~istio-system.svc.cluster.local");
    let config = f.ctx().build(&node).unwrap();
    assert_eq!(listener_names(&config), ["http_0.0.0.0_80"]);
    assert!(config.routes.is_empty());
    let [NetworkFilter::Http(hcm)] = &config.listeners[0].filters[..] else {
        panic!("expected an HTTP connection manager");
    };
    let vhosts = &hcm.route_config.as_ref().unwrap().virtual_hosts;
    assert_eq!(vhosts.len(), 1);
    assert_eq!(
        vhosts[0].domains,
        [
            "httpbin.default.svc.cluster.local:80",
            "httpbin.default.svc.cluster.local"
        ]
    );
    assert!(vhosts[0].routes[0].auto_host_rewrite);
    assert_eq!(cluster_names(&config), ["outbound:httpbin.org:80"]);
    assert_eq!(config.clusters[0].hosts[0].url, "tcp://httpbin.org:80");
}

#[test]
fn listener_encoding() {
    let f = Fixture::new();
    let config = f.ctx().build(&sidecar()).unwrap();
    let encoded = serde_json::to_value(&config.listeners[0]).unwrap();
    assert_eq!(
        encoded,
        json!({
            "name": "http_0.0.0.0_9080",
            "address": "tcp://0.0.0.0:9080",
            "filters": [{
                "type": "read",
                "name": "http_connection_manager",
                "config": {
                    "codec_type": "auto",
                    "stat_prefix": "http",
                    "access_log": [{"path": "/dev/stdout"}],
                    "rds": {
                        "cluster": "rds",
                        "route_config_name": "9080",
                        "refresh_delay_ms": 1000,
                    },
                    "filters": [{"type": "decoder", "name": "router", "config": {}}],
                },
            }],
            "bind_to_port": false,
        })
    );
}
