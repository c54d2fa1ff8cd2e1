use crate::{InstanceSpec, MemoryRegistry};
use pilot_core::{PortList, Service};
use serde::Deserialize;
use std::collections::BTreeMap;

/// A static registry document:
///
/// ```yaml
/// services:
///   - hostname: reviews.default.svc.cluster.local
///     ports: [{name: http, port: 80, protocol: HTTP}]
///     instances:
///       - {address: 10.1.1.1, port: 9080, portName: http, tags: {version: v1}}
/// managementPorts:
///   10.1.1.1: [{name: health, port: 3333, protocol: HTTP}]
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryFile {
    #[serde(default)]
    pub services: Vec<ServiceEntry>,

    #[serde(default)]
    pub management_ports: BTreeMap<String, PortList>,
}

#[derive(Debug, Deserialize)]
pub struct ServiceEntry {
    #[serde(flatten)]
    pub service: Service,

    #[serde(default)]
    pub instances: Vec<InstanceSpec>,
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to parse registry: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Registry(#[from] pilot_core::Error),
}

// === impl MemoryRegistry ===

impl MemoryRegistry {
    /// Adds the services, instances and management ports of a YAML registry
    /// document.
    pub fn load_yaml(&self, yaml: &str) -> Result<(), LoadError> {
        let file = serde_yaml::from_str::<RegistryFile>(yaml)?;
        for ServiceEntry { service, instances } in file.services {
            let hostname = service.hostname.clone();
            self.add_service(service)?;
            for instance in instances {
                self.add_instance(&hostname, instance)?;
            }
        }
        for (address, ports) in file.management_ports {
            self.set_management_ports(address, ports);
        }
        Ok(())
    }
}
