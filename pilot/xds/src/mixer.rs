use crate::{
    resources::{
        CircuitBreakerLimits, CircuitBreakers, Cluster, ClusterType, Host, HttpFilter, Listener,
        MixerConfig,
    },
    Node,
};
use pilot_model::MeshConfig;
use std::collections::BTreeMap;

pub(crate) const MIXER_CLUSTER: &str = "mixer_server";

const ATTR_TARGET_IP: &str = "target.ip";
const ATTR_TARGET_UID: &str = "target.uid";
const QUOTA_REQUEST_COUNT: &str = "RequestCount";

pub(crate) fn cluster(mesh: &MeshConfig, address: &str) -> Cluster {
    Cluster {
        name: MIXER_CLUSTER.to_string(),
        connect_timeout_ms: mesh.connect_timeout.as_millis(),
        ty: ClusterType::StrictDns,
        hosts: vec![Host {
            url: format!("tcp://{address}"),
        }],
        features: Some("http2"),
        circuit_breaker: Some(CircuitBreakers {
            default: CircuitBreakerLimits {
                max_pending_requests: Some(10000),
                max_requests: Some(10000),
                ..Default::default()
            },
        }),
        ..Default::default()
    }
}

/// Route metadata enabling policy checks on traffic into the workload.
pub(crate) fn inbound_opaque_config() -> BTreeMap<String, String> {
    [("mixer_control", "on"), ("mixer_forward", "off")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Prepends the mixer filter to every HTTP connection manager.
pub(crate) fn insert_filter(listeners: &mut [Listener], node: &Node) {
    let attributes = [
        (ATTR_TARGET_IP.to_string(), node.ip.to_string()),
        (ATTR_TARGET_UID.to_string(), format!("kubernetes://{}", node.id)),
    ]
    .into_iter()
    .collect::<BTreeMap<_, _>>();
    let config = MixerConfig {
        mixer_attributes: attributes.clone(),
        forward_attributes: attributes,
        quota_name: QUOTA_REQUEST_COUNT,
    };

    for listener in listeners {
        for hcm in listener.http_connection_managers() {
            hcm.filters.insert(0, HttpFilter::Mixer(config.clone()));
        }
    }
}
