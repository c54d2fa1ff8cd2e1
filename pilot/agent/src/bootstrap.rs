//! The static configuration a proxy starts from. Everything else is fetched
//! over the discovery API.

use pilot_model::MeshConfig;
use serde::Serialize;

pub const LDS: &str = "lds";
pub const RDS: &str = "rds";
pub const CDS: &str = "cds";
pub const SDS: &str = "sds";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Bootstrap {
    pub listeners: Vec<serde_json::Value>,
    pub lds: Discovery,
    pub admin: Admin,
    pub cluster_manager: ClusterManager,

    /// A digest of the proxy's certificates. It is not written to the file,
    /// but a change in it makes the bootstrap differ and so forces a restart.
    #[serde(skip)]
    pub certs_hash: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Discovery {
    pub cluster: String,
    pub refresh_delay_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Admin {
    pub access_log_path: String,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterManager {
    pub clusters: Vec<Cluster>,
    pub sds: DiscoveryCluster,
    pub cds: DiscoveryCluster,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DiscoveryCluster {
    pub cluster: Cluster,
    pub refresh_delay_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Cluster {
    pub name: String,
    pub connect_timeout_ms: u64,
    #[serde(rename = "type")]
    pub ty: &'static str,
    pub lb_type: &'static str,
    pub hosts: Vec<Host>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Host {
    pub url: String,
}

// === impl Bootstrap ===

impl Bootstrap {
    pub fn new(mesh: &MeshConfig) -> Self {
        let refresh_delay_ms = mesh.discovery_refresh_delay.as_millis();
        let discovery = |name: &str| Cluster {
            name: name.to_string(),
            connect_timeout_ms: mesh.connect_timeout.as_millis(),
            ty: "strict_dns",
            lb_type: "round_robin",
            hosts: vec![Host {
                url: format!("tcp://{}", mesh.discovery_address),
            }],
        };

        Self {
            listeners: Vec::new(),
            lds: Discovery {
                cluster: LDS.to_string(),
                refresh_delay_ms,
            },
            admin: Admin {
                access_log_path: "/dev/stdout".to_string(),
                address: format!("tcp://127.0.0.1:{}", mesh.proxy_admin_port),
            },
            cluster_manager: ClusterManager {
                clusters: vec![discovery(RDS), discovery(LDS)],
                sds: DiscoveryCluster {
                    cluster: discovery(SDS),
                    refresh_delay_ms,
                },
                cds: DiscoveryCluster {
                    cluster: discovery(CDS),
                    refresh_delay_ms,
                },
            },
            certs_hash: None,
        }
    }
}
