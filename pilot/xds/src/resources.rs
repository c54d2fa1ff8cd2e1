//! The JSON documents served to proxies over the v1 discovery API.

use crate::Error;
use pilot_core::{Port, Tags};
use serde::{ser::SerializeStruct, Serialize, Serializer};
use std::collections::{btree_map::Entry, BTreeMap};

pub const HTTP_CONNECTION_MANAGER: &str = "http_connection_manager";
pub const TCP_PROXY: &str = "tcp_proxy";

pub const OUTBOUND_CLUSTER_PREFIX: &str = "outbound:";
pub const INBOUND_CLUSTER_PREFIX: &str = "inbound:";

/// The cluster the proxy's bootstrap uses for route discovery.
pub const RDS_CLUSTER: &str = "rds";

pub const WILDCARD_ADDRESS: &str = "0.0.0.0";
pub const LOCALHOST: &str = "127.0.0.1";
pub const ACCESS_LOG: &str = "/dev/stdout";

/// The set of conditions a proxy retries on.
pub const RETRY_ON: &str = "5xx,connect-failure,refused-stream";

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Listener {
    pub name: String,
    pub address: String,
    pub filters: Vec<NetworkFilter>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_context: Option<ListenerSslContext>,

    pub bind_to_port: bool,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub use_original_dst: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NetworkFilter {
    Http(HttpConnectionManager),
    Tcp(TcpProxy),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HttpConnectionManager {
    pub codec_type: &'static str,
    pub stat_prefix: &'static str,
    pub access_log: Vec<AccessLog>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_config: Option<HttpRouteConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub rds: Option<Rds>,

    pub filters: Vec<HttpFilter>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AccessLog {
    pub path: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Rds {
    pub cluster: &'static str,
    pub route_config_name: String,
    pub refresh_delay_ms: u64,
}

#[derive(Clone, Debug, PartialEq)]
pub enum HttpFilter {
    Mixer(MixerConfig),
    Fault(FaultConfig),
    Router,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct MixerConfig {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub mixer_attributes: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub forward_attributes: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "str::is_empty")]
    pub quota_name: &'static str,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FaultConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort: Option<AbortConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<DelayConfig>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,

    pub upstream_cluster: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AbortConfig {
    pub abort_percent: u32,
    pub http_status: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DelayConfig {
    #[serde(rename = "type")]
    pub ty: &'static str,
    pub fixed_delay_percent: u32,
    pub fixed_duration_ms: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HttpRouteConfig {
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<HttpRoute>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HttpRoute {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub weighted_clusters: Option<WeightedClusters>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<Header>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub opaque_config: BTreeMap<String, String>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub auto_host_rewrite: bool,

    /// Clusters this route sends traffic to.
    #[serde(skip)]
    pub(crate) clusters: Vec<Cluster>,

    /// Fault filters to install for this route's clusters.
    #[serde(skip)]
    pub(crate) faults: Vec<FaultConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeightedClusters {
    pub clusters: Vec<WeightedCluster>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeightedCluster {
    pub name: String,
    pub weight: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Header {
    pub name: String,
    pub value: String,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub regex: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub retry_on: &'static str,
    pub num_retries: i32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_try_timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TcpProxy {
    pub stat_prefix: &'static str,
    pub route_config: TcpRouteConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct TcpRouteConfig {
    pub routes: Vec<TcpRoute>,
}

/// Field order is the sort order.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct TcpRoute {
    pub cluster: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub destination_ip_list: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination_ports: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub source_ip_list: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_ports: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ListenerSslContext {
    pub cert_chain_file: String,
    pub private_key_file: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_cert_file: Option<String>,

    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub require_client_certificate: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Cluster {
    pub name: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    pub connect_timeout_ms: u64,

    #[serde(rename = "type")]
    pub ty: ClusterType,

    pub lb_type: LbType,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<Host>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_context: Option<ClusterSslContext>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub features: Option<&'static str>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests_per_connection: Option<i32>,

    #[serde(rename = "circuit_breakers", skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakers>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outlier_detection: Option<OutlierDetection>,

    /// Set on clusters of mesh services; policies and client TLS apply to
    /// these only.
    #[serde(skip)]
    pub(crate) upstream: Option<Upstream>,
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Upstream {
    pub hostname: String,
    pub port: Port,
    pub tags: Tags,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    #[default]
    Sds,
    Static,
    StrictDns,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LbType {
    #[default]
    RoundRobin,
    LeastRequest,
    Random,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Host {
    pub url: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterSslContext {
    pub cert_chain_file: String,
    pub private_key_file: String,
    pub ca_cert_file: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub verify_subject_alt_name: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CircuitBreakers {
    pub default: CircuitBreakerLimits,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CircuitBreakerLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pending_requests: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OutlierDetection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consecutive_5xx: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_ejection_time_ms: Option<u64>,

    pub max_ejection_percent: i32,
}

/// The SDS response body.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Hosts {
    pub hosts: Vec<SdsHost>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SdsHost {
    pub ip_address: String,
    pub port: u16,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<SdsHostTags>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SdsHostTags {
    pub az: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Clusters {
    pub clusters: Vec<Cluster>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Listeners {
    pub listeners: Vec<Listener>,
}

// === impl Listener ===

impl Listener {
    pub(crate) fn new(kind: &str, ip: &str, port: u16, filter: NetworkFilter) -> Self {
        Self {
            name: format!("{kind}_{ip}_{port}"),
            address: format!("tcp://{ip}:{port}"),
            filters: vec![filter],
            ..Default::default()
        }
    }

    pub(crate) fn http_connection_managers(
        &mut self,
    ) -> impl Iterator<Item = &mut HttpConnectionManager> {
        self.filters.iter_mut().filter_map(|f| match f {
            NetworkFilter::Http(hcm) => Some(hcm),
            NetworkFilter::Tcp(_) => None,
        })
    }
}

// === impl NetworkFilter ===

impl Serialize for NetworkFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("NetworkFilter", 3)?;
        s.serialize_field("type", "read")?;
        match self {
            Self::Http(config) => {
                s.serialize_field("name", HTTP_CONNECTION_MANAGER)?;
                s.serialize_field("config", config)?;
            }
            Self::Tcp(config) => {
                s.serialize_field("name", TCP_PROXY)?;
                s.serialize_field("config", config)?;
            }
        }
        s.end()
    }
}

// === impl HttpConnectionManager ===

impl HttpConnectionManager {
    /// A connection manager with only the router filter installed.
    pub(crate) fn new(route_config: Option<HttpRouteConfig>, rds: Option<Rds>) -> Self {
        Self {
            codec_type: "auto",
            stat_prefix: "http",
            access_log: vec![AccessLog { path: ACCESS_LOG }],
            route_config,
            rds,
            filters: vec![HttpFilter::Router],
        }
    }
}

// === impl HttpFilter ===

impl Serialize for HttpFilter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("HttpFilter", 3)?;
        s.serialize_field("type", "decoder")?;
        match self {
            Self::Mixer(config) => {
                s.serialize_field("name", "mixer")?;
                s.serialize_field("config", config)?;
            }
            Self::Fault(config) => {
                s.serialize_field("name", "fault")?;
                s.serialize_field("config", config)?;
            }
            Self::Router => {
                s.serialize_field("name", "router")?;
                s.serialize_field("config", &BTreeMap::<String, String>::new())?;
            }
        }
        s.end()
    }
}

// === impl HttpRouteConfig ===

impl HttpRouteConfig {
    /// Sorts virtual hosts by name.
    pub(crate) fn normalize(mut self) -> Self {
        self.virtual_hosts.sort_by(|a, b| a.name.cmp(&b.name));
        self
    }

    pub(crate) fn clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.virtual_hosts
            .iter()
            .flat_map(|vh| vh.routes.iter())
            .flat_map(|r| r.clusters.iter())
    }

    pub(crate) fn faults(&self) -> impl Iterator<Item = &FaultConfig> {
        self.virtual_hosts
            .iter()
            .flat_map(|vh| vh.routes.iter())
            .flat_map(|r| r.faults.iter())
    }
}

// === impl HttpRoute ===

impl HttpRoute {
    /// A route matching every request.
    pub(crate) fn prefix(cluster: Cluster) -> Self {
        Self {
            prefix: Some("/".to_string()),
            cluster: Some(cluster.name.clone()),
            clusters: vec![cluster],
            ..Default::default()
        }
    }

    /// True if the route has no request predicate, so routes after it are
    /// unreachable.
    pub fn is_catch_all(&self) -> bool {
        self.path.is_none() && self.headers.is_empty() && self.prefix.as_deref() == Some("/")
    }
}

/// Orders exact paths before prefixes and longer prefixes before shorter
/// ones. The sort is stable, so routes with equal predicates keep their
/// relative order.
pub(crate) fn sort_routes_by_path(routes: &mut [HttpRoute]) {
    routes.sort_by(|a, b| match (&a.path, &b.path) {
        (Some(a), Some(b)) => a.cmp(b),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => {
            let a = a.prefix.as_deref().unwrap_or_default();
            let b = b.prefix.as_deref().unwrap_or_default();
            b.len().cmp(&a.len()).then_with(|| a.cmp(b))
        }
    });
}

/// Deduplicates clusters by name and sorts them. Two clusters sharing a
/// name must be identical.
pub(crate) fn normalize_clusters<'c>(
    clusters: impl IntoIterator<Item = &'c Cluster>,
) -> Result<Vec<Cluster>, Error> {
    let mut by_name = BTreeMap::<&str, &Cluster>::new();
    for cluster in clusters {
        match by_name.entry(cluster.name.as_str()) {
            Entry::Vacant(e) => {
                e.insert(cluster);
            }
            Entry::Occupied(e) => {
                if *e.get() != cluster {
                    return Err(Error::ConflictingCluster(cluster.name.clone()));
                }
            }
        }
    }
    Ok(by_name.into_values().cloned().collect())
}
