use ahash::AHashSet as HashSet;
use pilot_core::{
    Controller, InstanceHandler, PortList, Registry, Result, Service, ServiceAccounts,
    ServiceDiscovery, ServiceHandler, ServiceInstance, TagsList,
};
use std::sync::Arc;
use tracing::warn;

/// Fans queries out over several registries in order.
///
/// List results are concatenated. A query fails only when every member
/// fails, so one unreachable back-end does not hide the others.
#[derive(Clone, Default)]
pub struct Aggregate {
    registries: Vec<Arc<dyn Registry>>,
}

// === impl Aggregate ===

impl Aggregate {
    pub fn new(registries: impl IntoIterator<Item = Arc<dyn Registry>>) -> Self {
        Self {
            registries: registries.into_iter().collect(),
        }
    }

    pub fn push(&mut self, registry: Arc<dyn Registry>) {
        self.registries.push(registry);
    }

    fn concat<T>(
        &self,
        what: &'static str,
        f: impl Fn(&dyn Registry) -> Result<Vec<T>>,
    ) -> Result<Vec<T>> {
        let mut out = Vec::new();
        let mut last_error = None;
        let mut succeeded = self.registries.is_empty();
        for registry in &self.registries {
            match f(registry.as_ref()) {
                Ok(items) => {
                    succeeded = true;
                    out.extend(items);
                }
                Err(error) => {
                    warn!(%error, "Registry failed to list {what}");
                    last_error = Some(error);
                }
            }
        }
        match last_error {
            Some(error) if !succeeded => Err(error),
            _ => Ok(out),
        }
    }
}

impl ServiceDiscovery for Aggregate {
    fn services(&self) -> Result<Vec<Service>> {
        self.concat("services", |r| r.services())
    }

    fn get_service(&self, hostname: &str) -> Result<Option<Service>> {
        let mut failures = 0;
        let mut last_error = None;
        for registry in &self.registries {
            match registry.get_service(hostname) {
                Ok(Some(service)) => return Ok(Some(service)),
                Ok(None) => {}
                Err(error) => {
                    warn!(%error, %hostname, "Registry failed to get service");
                    failures += 1;
                    last_error = Some(error);
                }
            }
        }
        match last_error {
            Some(error) if failures == self.registries.len() => Err(error),
            _ => Ok(None),
        }
    }

    fn instances(
        &self,
        hostname: &str,
        ports: &[String],
        tags: &TagsList,
    ) -> Result<Vec<ServiceInstance>> {
        self.concat("instances", |r| r.instances(hostname, ports, tags))
    }

    fn host_instances(&self, addrs: &HashSet<String>) -> Result<Vec<ServiceInstance>> {
        self.concat("host instances", |r| r.host_instances(addrs))
    }

    fn management_ports(&self, addr: &str) -> Option<PortList> {
        self.registries.iter().find_map(|r| r.management_ports(addr))
    }
}

impl ServiceAccounts for Aggregate {
    fn get_istio_service_accounts(&self, hostname: &str, ports: &[String]) -> Vec<String> {
        let mut accounts = self
            .registries
            .iter()
            .flat_map(|r| r.get_istio_service_accounts(hostname, ports))
            .collect::<Vec<_>>();
        accounts.sort();
        accounts.dedup();
        accounts
    }
}

#[async_trait::async_trait]
impl Controller for Aggregate {
    fn append_service_handler(&self, handler: ServiceHandler) {
        for registry in &self.registries {
            registry.append_service_handler(handler.clone());
        }
    }

    fn append_instance_handler(&self, handler: InstanceHandler) {
        for registry in &self.registries {
            registry.append_instance_handler(handler.clone());
        }
    }

    async fn run(&self, shutdown: drain::Watch) {
        futures::future::join_all(self.registries.iter().map(|r| r.run(shutdown.clone()))).await;
    }
}
