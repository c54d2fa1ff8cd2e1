use crate::{
    error::ValidationError,
    tags::{Tags, TagsList},
    validation::{is_dns1123_label, validate_fqdn},
};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr, sync::Arc};

/// A mesh service: a hostname with the ports it serves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Fully-qualified domain name, unique within the mesh.
    pub hostname: String,

    /// Virtual IP of the service, if it has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    #[serde(default)]
    pub ports: PortList,

    /// Set for services that live outside the mesh. The value is the DNS
    /// name proxies should resolve to reach them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Port {
    /// May be empty only when the service declares a single port.
    #[serde(default)]
    pub name: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PortList(Vec<Port>);

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE", from = "String")]
pub enum Protocol {
    Grpc,
    Https,
    Http2,
    #[default]
    Http,
    Tcp,
    Udp,
}

/// The network address of one service instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkEndpoint {
    pub address: String,

    /// The instance port; may differ from the service port number.
    pub port: u16,

    /// The service port this endpoint serves.
    pub service_port: Port,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInstance {
    pub endpoint: NetworkEndpoint,
    pub service: Arc<Service>,
    pub tags: Tags,
    pub availability_zone: Option<String>,

    /// Principal URI of the workload, used as a TLS SAN.
    pub service_account: Option<String>,
}

// === impl Service ===

impl Service {
    pub fn is_external(&self) -> bool {
        self.external_name.is_some()
    }

    /// The discovery key for one port and tag set of this service.
    pub fn key(&self, port: &Port, tags: &Tags) -> String {
        service_key(
            &self.hostname,
            [port.name.as_str()],
            std::slice::from_ref(tags),
        )
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errs = ValidationError::default();
        errs.merge(validate_fqdn(&self.hostname));

        if self.ports.is_empty() {
            errs.push("service must have at least one declared port");
        }

        let multiple = self.ports.len() > 1;
        let mut names = Vec::with_capacity(self.ports.len());
        for port in self.ports.iter() {
            if port.name.is_empty() {
                if multiple {
                    errs.push("empty port names are not allowed for services with multiple ports");
                }
            } else if !is_dns1123_label(&port.name) {
                errs.push(format!("invalid port name: {:?}", port.name));
            } else if names.contains(&port.name.as_str()) {
                errs.push(format!("duplicate port name: {:?}", port.name));
            } else {
                names.push(port.name.as_str());
            }
            if port.port == 0 {
                errs.push(format!("invalid service port value 0 for {:?}", port.name));
            }
        }

        errs.into_result()
    }
}

// === impl PortList ===

impl PortList {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Port> {
        self.0.iter()
    }

    pub fn names(&self) -> Vec<String> {
        self.0.iter().map(|p| p.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<&Port> {
        self.0.iter().find(|p| p.name == name)
    }

    pub fn get_by_port(&self, num: u16) -> Option<&Port> {
        self.0.iter().find(|p| p.port == num)
    }
}

impl From<Vec<Port>> for PortList {
    fn from(ports: Vec<Port>) -> Self {
        Self(ports)
    }
}

impl FromIterator<Port> for PortList {
    fn from_iter<T: IntoIterator<Item = Port>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PortList {
    type Item = &'a Port;
    type IntoIter = std::slice::Iter<'a, Port>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

// === impl Protocol ===

impl Protocol {
    pub fn is_http(&self) -> bool {
        matches!(self, Self::Http | Self::Http2 | Self::Grpc)
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp | Self::Https)
    }

    pub fn is_http2(&self) -> bool {
        matches!(self, Self::Http2 | Self::Grpc)
    }
}

impl FromStr for Protocol {
    type Err = UnknownProtocol;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GRPC" => Ok(Self::Grpc),
            "HTTPS" => Ok(Self::Https),
            "HTTP2" => Ok(Self::Http2),
            "HTTP" => Ok(Self::Http),
            "TCP" => Ok(Self::Tcp),
            "UDP" => Ok(Self::Udp),
            _ => Err(UnknownProtocol(s.to_string())),
        }
    }
}

impl From<String> for Protocol {
    fn from(s: String) -> Self {
        s.parse().unwrap_or_else(|error: UnknownProtocol| {
            tracing::warn!(%error, "defaulting to TCP");
            Self::Tcp
        })
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Grpc => "GRPC",
            Self::Https => "HTTPS",
            Self::Http2 => "HTTP2",
            Self::Http => "HTTP",
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown protocol {0:?}")]
pub struct UnknownProtocol(String);

/// Builds the discovery key `host[:port,port...[:tags;tags...]]`. Port names
/// and tag sets are sorted. A single unnamed port without tags yields the
/// bare hostname.
pub fn service_key<'a>(
    hostname: &str,
    ports: impl IntoIterator<Item = &'a str>,
    tags: &[Tags],
) -> String {
    let mut ports = ports.into_iter().collect::<Vec<_>>();
    let tags: &[Tags] = match tags {
        [only] if only.is_empty() => &[],
        tags => tags,
    };

    if tags.is_empty() && (ports.is_empty() || (ports.len() == 1 && ports[0].is_empty())) {
        return hostname.to_string();
    }

    ports.sort_unstable();
    let mut key = format!("{hostname}:{}", ports.join(","));
    if !tags.is_empty() {
        let mut tags = tags.iter().map(ToString::to_string).collect::<Vec<_>>();
        tags.sort();
        key.push(':');
        key.push_str(&tags.join(";"));
    }
    key
}

/// The inverse of [`service_key`]. A key without a port part yields a single
/// unnamed port.
pub fn parse_service_key(key: &str) -> (String, Vec<String>, TagsList) {
    let mut parts = key.splitn(3, ':');
    let hostname = parts.next().unwrap_or_default().to_string();
    let ports = match parts.next() {
        Some(names) => names.split(',').map(ToString::to_string).collect(),
        None => vec![String::new()],
    };
    let tags = match parts.next() {
        Some(tags) if !tags.is_empty() => tags
            .split(';')
            .map(|t| t.parse::<Tags>().unwrap_or_default())
            .collect(),
        _ => TagsList::default(),
    };
    (hostname, ports, tags)
}
