use crate::{
    config::Event,
    error::Result,
    service::{PortList, Service, ServiceInstance},
    tags::TagsList,
};
use ahash::AHashSet as HashSet;
use std::sync::Arc;

pub type ServiceHandler = Arc<dyn Fn(&Service, Event) + Send + Sync>;
pub type InstanceHandler = Arc<dyn Fn(&ServiceInstance, Event) + Send + Sync>;

/// Enumerates services and their instances.
pub trait ServiceDiscovery: Send + Sync {
    fn services(&self) -> Result<Vec<Service>>;

    fn get_service(&self, hostname: &str) -> Result<Option<Service>>;

    /// Instances of a service whose port name is in `ports` and whose tags
    /// are a superset of any set in `tags`. Empty filters match everything.
    fn instances(
        &self,
        hostname: &str,
        ports: &[String],
        tags: &TagsList,
    ) -> Result<Vec<ServiceInstance>>;

    /// Instances running on any of the given IP addresses.
    fn host_instances(&self, addrs: &HashSet<String>) -> Result<Vec<ServiceInstance>>;

    /// Health-check ports declared for a workload address.
    fn management_ports(&self, addr: &str) -> Option<PortList>;
}

/// Resolves the identities allowed to serve a service.
pub trait ServiceAccounts: Send + Sync {
    /// Principal URIs of the workloads serving any of `ports` of a service.
    /// The list is sorted and has no duplicates.
    fn get_istio_service_accounts(&self, hostname: &str, ports: &[String]) -> Vec<String>;
}

/// Notifies handlers of registry changes.
#[async_trait::async_trait]
pub trait Controller: Send + Sync {
    fn append_service_handler(&self, handler: ServiceHandler);

    fn append_instance_handler(&self, handler: InstanceHandler);

    async fn run(&self, shutdown: drain::Watch);
}

/// A complete service registry.
pub trait Registry: ServiceDiscovery + ServiceAccounts + Controller {}

impl<T: ServiceDiscovery + ServiceAccounts + Controller> Registry for T {}
