use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::RwLock;
use pilot_core::{
    Controller, Error, Event, InstanceHandler, NetworkEndpoint, PortList, Result, Service,
    ServiceAccounts, ServiceDiscovery, ServiceHandler, ServiceInstance, Tags, TagsList,
};
use serde::Deserialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// An in-process service registry.
///
/// Mutations notify the registered handlers synchronously, after the
/// registry's lock is released.
#[derive(Default)]
pub struct MemoryRegistry {
    state: RwLock<State>,
    service_handlers: RwLock<Vec<ServiceHandler>>,
    instance_handlers: RwLock<Vec<InstanceHandler>>,
}

#[derive(Debug, Default)]
struct State {
    services: BTreeMap<String, Arc<Service>>,
    instances: Vec<ServiceInstance>,
    management_ports: HashMap<String, PortList>,
}

/// An instance to add to a registered service.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSpec {
    pub address: String,
    pub port: u16,

    /// The service port the instance serves. May be empty when the service
    /// has a single unnamed port.
    #[serde(default)]
    pub port_name: String,

    #[serde(default)]
    pub tags: Tags,

    #[serde(default)]
    pub availability_zone: Option<String>,

    #[serde(default)]
    pub service_account: Option<String>,
}

// === impl MemoryRegistry ===

impl MemoryRegistry {
    /// Adds or replaces a service. Instances of a replaced service keep
    /// referring to the old definition until they are re-added.
    pub fn add_service(&self, service: Service) -> Result<()> {
        service
            .validate()
            .map_err(|e| Error::validation("service", e))?;

        let service = Arc::new(service);
        let prior = self
            .state
            .write()
            .services
            .insert(service.hostname.clone(), service.clone());
        let event = if prior.is_some() {
            Event::Updated
        } else {
            Event::Added
        };
        debug!(hostname = %service.hostname, %event, "Service");
        self.notify_service(&service, event);
        Ok(())
    }

    /// Removes a service and all of its instances.
    pub fn remove_service(&self, hostname: &str) -> Result<()> {
        let (service, removed) = {
            let mut state = self.state.write();
            let service = state
                .services
                .remove(hostname)
                .ok_or_else(|| Error::not_found("service", hostname))?;
            let (removed, kept) = std::mem::take(&mut state.instances)
                .into_iter()
                .partition::<Vec<_>, _>(|i| i.service.hostname == hostname);
            state.instances = kept;
            (service, removed)
        };
        for instance in &removed {
            self.notify_instance(instance, Event::Deleted);
        }
        debug!(%hostname, "Service removed");
        self.notify_service(&service, Event::Deleted);
        Ok(())
    }

    /// Adds an instance of a registered service, replacing any instance of
    /// the same service at the same address and port.
    pub fn add_instance(&self, hostname: &str, spec: InstanceSpec) -> Result<ServiceInstance> {
        let instance = {
            let mut state = self.state.write();
            let service = state
                .services
                .get(hostname)
                .cloned()
                .ok_or_else(|| Error::not_found("service", hostname))?;
            let service_port = service.ports.get(&spec.port_name).cloned().ok_or_else(|| {
                Error::validation(
                    "instance",
                    format!("service {hostname} has no port {:?}", spec.port_name).into(),
                )
            })?;
            if spec.address.is_empty() || spec.port == 0 {
                return Err(Error::validation(
                    "instance",
                    "instance address and port are required".into(),
                ));
            }
            spec.tags
                .validate()
                .map_err(|e| Error::validation("instance", e))?;

            let instance = ServiceInstance {
                endpoint: NetworkEndpoint {
                    address: spec.address,
                    port: spec.port,
                    service_port,
                },
                service,
                tags: spec.tags,
                availability_zone: spec.availability_zone,
                service_account: spec.service_account,
            };
            state.instances.retain(|i| !same_endpoint(i, &instance));
            state.instances.push(instance.clone());
            instance
        };
        debug!(%hostname, address = %instance.endpoint.address, port = instance.endpoint.port, "Instance added");
        self.notify_instance(&instance, Event::Added);
        Ok(instance)
    }

    pub fn remove_instance(&self, hostname: &str, address: &str, port: u16) -> Result<()> {
        let removed = {
            let mut state = self.state.write();
            let idx = state
                .instances
                .iter()
                .position(|i| {
                    i.service.hostname == hostname
                        && i.endpoint.address == address
                        && i.endpoint.port == port
                })
                .ok_or_else(|| Error::not_found("instance", format!("{hostname}/{address}:{port}")))?;
            state.instances.remove(idx)
        };
        self.notify_instance(&removed, Event::Deleted);
        Ok(())
    }

    /// Declares the health-check ports of the workload at `address`.
    pub fn set_management_ports(&self, address: impl ToString, ports: PortList) {
        self.state
            .write()
            .management_ports
            .insert(address.to_string(), ports);
    }

    fn notify_service(&self, service: &Service, event: Event) {
        let handlers = self.service_handlers.read().clone();
        for handler in &handlers {
            handler(service, event);
        }
    }

    fn notify_instance(&self, instance: &ServiceInstance, event: Event) {
        let handlers = self.instance_handlers.read().clone();
        for handler in &handlers {
            handler(instance, event);
        }
    }
}

fn same_endpoint(a: &ServiceInstance, b: &ServiceInstance) -> bool {
    a.service.hostname == b.service.hostname
        && a.endpoint.address == b.endpoint.address
        && a.endpoint.port == b.endpoint.port
}

impl ServiceDiscovery for MemoryRegistry {
    fn services(&self) -> Result<Vec<Service>> {
        Ok(self
            .state
            .read()
            .services
            .values()
            .map(|s| (**s).clone())
            .collect())
    }

    fn get_service(&self, hostname: &str) -> Result<Option<Service>> {
        Ok(self
            .state
            .read()
            .services
            .get(hostname)
            .map(|s| (**s).clone()))
    }

    fn instances(
        &self,
        hostname: &str,
        ports: &[String],
        tags: &TagsList,
    ) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .state
            .read()
            .instances
            .iter()
            .filter(|i| {
                i.service.hostname == hostname
                    && (ports.is_empty() || ports.contains(&i.endpoint.service_port.name))
                    && tags.has_subset_of(&i.tags)
            })
            .cloned()
            .collect())
    }

    fn host_instances(&self, addrs: &HashSet<String>) -> Result<Vec<ServiceInstance>> {
        Ok(self
            .state
            .read()
            .instances
            .iter()
            .filter(|i| addrs.contains(&i.endpoint.address))
            .cloned()
            .collect())
    }

    fn management_ports(&self, addr: &str) -> Option<PortList> {
        self.state.read().management_ports.get(addr).cloned()
    }
}

impl ServiceAccounts for MemoryRegistry {
    fn get_istio_service_accounts(&self, hostname: &str, ports: &[String]) -> Vec<String> {
        let mut accounts = self
            .instances(hostname, ports, &TagsList::default())
            .unwrap_or_default()
            .into_iter()
            .filter_map(|i| i.service_account)
            .collect::<Vec<_>>();
        accounts.sort();
        accounts.dedup();
        accounts
    }
}

#[async_trait::async_trait]
impl Controller for MemoryRegistry {
    fn append_service_handler(&self, handler: ServiceHandler) {
        self.service_handlers.write().push(handler);
    }

    fn append_instance_handler(&self, handler: InstanceHandler) {
        self.instance_handlers.write().push(handler);
    }

    async fn run(&self, shutdown: drain::Watch) {
        // Changes are pushed by callers; there is nothing to poll.
        let _ = shutdown.signaled().await;
        debug!("Stopping");
    }
}
