//! A small mesh: `productpage` calls `reviews`, which has two versions, and
//! everything may reach a `mysql` TCP service.

use crate::{Context, Node};
use pilot_config::MemoryStore;
use pilot_core::{ConfigStore, Message, MessageType, Port, PortList, Protocol, Service};
use pilot_model::{descriptors, IstioConfigStore, MeshConfig};
use pilot_registry::{InstanceSpec, MemoryRegistry};
use std::sync::Arc;

pub(crate) const PRODUCTPAGE: &str = "productpage.default.svc.cluster.local";
pub(crate) const REVIEWS: &str = "reviews.default.svc.cluster.local";
pub(crate) const MYSQL: &str = "mysql.default.svc.cluster.local";
pub(crate) const HTTPBIN: &str = "httpbin.default.svc.cluster.local";

pub(crate) const PRODUCTPAGE_IP: &str = "10.1.1.10";
pub(crate) const REVIEWS_V1_IP: &str = "10.1.2.10";
pub(crate) const REVIEWS_V2_IP: &str = "10.1.2.11";

pub(crate) struct Fixture {
    pub registry: Arc<MemoryRegistry>,
    pub store: Arc<MemoryStore>,
    pub mesh: MeshConfig,
}

pub(crate) fn http(name: &str, port: u16) -> Port {
    Port {
        name: name.to_string(),
        port,
        protocol: Protocol::Http,
    }
}

pub(crate) fn tcp(name: &str, port: u16) -> Port {
    Port {
        name: name.to_string(),
        port,
        protocol: Protocol::Tcp,
    }
}

pub(crate) fn service(hostname: &str, address: Option<&str>, ports: Vec<Port>) -> Service {
    Service {
        hostname: hostname.to_string(),
        address: address.map(ToString::to_string),
        ports: ports.into_iter().collect::<PortList>(),
        external_name: None,
    }
}

pub(crate) fn sidecar() -> Node {
    Node::sidecar(PRODUCTPAGE_IP.parse().unwrap())
}

pub(crate) fn node(s: &str) -> Node {
    s.parse().unwrap()
}

// === impl Fixture ===

impl Fixture {
    pub fn new() -> Self {
        let registry = Arc::new(MemoryRegistry::default());
        registry
            .add_service(service(PRODUCTPAGE, Some("10.0.0.1"), vec![http("http", 9080)]))
            .unwrap();
        registry
            .add_service(service(REVIEWS, Some("10.0.0.2"), vec![http("http", 9080)]))
            .unwrap();
        registry
            .add_service(service(MYSQL, Some("10.0.0.3"), vec![tcp("mysql", 3306)]))
            .unwrap();

        let instance = |address: &str, version: &str, account: &str| InstanceSpec {
            address: address.to_string(),
            port: 9080,
            port_name: "http".to_string(),
            tags: format!("version={version}").parse().unwrap(),
            availability_zone: None,
            service_account: Some(format!("spiffe://cluster.local/ns/default/sa/{account}")),
        };
        registry
            .add_instance(PRODUCTPAGE, instance(PRODUCTPAGE_IP, "v1", "productpage"))
            .unwrap();
        registry
            .add_instance(REVIEWS, instance(REVIEWS_V1_IP, "v1", "reviews"))
            .unwrap();
        registry
            .add_instance(REVIEWS, instance(REVIEWS_V2_IP, "v2", "reviews-v2"))
            .unwrap();

        Self {
            registry,
            store: Arc::new(MemoryStore::new(descriptors())),
            mesh: MeshConfig::default(),
        }
    }

    pub fn ctx(&self) -> Context {
        Context {
            mesh: Arc::new(self.mesh.clone()),
            discovery: self.registry.clone(),
            accounts: self.registry.clone(),
            config: IstioConfigStore::new(self.store.clone()),
        }
    }

    /// Stores a config object given as JSON.
    pub fn add<T: MessageType>(&self, spec: serde_json::Value) {
        let spec = serde_json::from_value::<T>(spec).unwrap();
        self.store.post(Message::encode(&spec).unwrap()).unwrap();
    }
}
