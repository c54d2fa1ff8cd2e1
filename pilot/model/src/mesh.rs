use crate::duration::Duration;
use pilot_core::ValidationError;
use serde::{Deserialize, Serialize};

/// Mesh-wide settings shared by the discovery service and proxy agents.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MeshConfig {
    /// `host:port` of the egress proxy, used for external services.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub egress_proxy_address: Option<String>,

    /// `host:port` of the discovery service.
    pub discovery_address: String,

    /// `host:port` of the mixer. Mixer filters are only emitted when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mixer_address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub statsd_udp_address: Option<String>,

    /// Port the sidecar's virtual listener binds to.
    pub proxy_listen_port: u16,
    pub proxy_admin_port: u16,

    pub drain_duration: Duration,
    pub parent_shutdown_duration: Duration,
    pub discovery_refresh_delay: Duration,
    pub connect_timeout: Duration,

    /// The service cluster proxies identify as when calling discovery.
    pub istio_service_cluster: String,

    pub ingress_class: String,
    pub ingress_service: String,
    pub ingress_controller_mode: IngressControllerMode,

    pub auth_policy: AuthPolicy,

    /// Directory holding the workload's certificate chain, key and root
    /// certificate.
    pub auth_certs_path: String,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IngressControllerMode {
    Off,
    Default,
    #[default]
    Strict,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthPolicy {
    #[default]
    None,
    MutualTls,
}

#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("failed to parse mesh config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid mesh config: {0}")]
    Invalid(#[from] ValidationError),
}

pub const CERT_CHAIN_FILENAME: &str = "cert-chain.pem";
pub const KEY_FILENAME: &str = "key.pem";
pub const ROOT_CERT_FILENAME: &str = "root-cert.pem";

/// Where the ingress proxy finds the key pair named by ingress rules'
/// `tlsSecret`.
pub const INGRESS_CERTS_PATH: &str = "/etc/istio/ingress-certs";
pub const INGRESS_CERT_FILENAME: &str = "tls.crt";
pub const INGRESS_KEY_FILENAME: &str = "tls.key";

// === impl MeshConfig ===

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            egress_proxy_address: Some("istio-egress:80".to_string()),
            discovery_address: "istio-pilot:8080".to_string(),
            mixer_address: None,
            statsd_udp_address: None,
            proxy_listen_port: 15001,
            proxy_admin_port: 15000,
            drain_duration: Duration::from_secs(2),
            parent_shutdown_duration: Duration::from_secs(3),
            discovery_refresh_delay: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            istio_service_cluster: "istio-proxy".to_string(),
            ingress_class: "istio".to_string(),
            ingress_service: "istio-ingress".to_string(),
            ingress_controller_mode: IngressControllerMode::default(),
            auth_policy: AuthPolicy::default(),
            auth_certs_path: "/etc/certs".to_string(),
        }
    }
}

impl MeshConfig {
    /// Parses and validates a mesh config.
    ///
    /// The document is either the mesh config itself or a config-map style
    /// document whose `mesh` key holds the config as a YAML string. Fields
    /// that are not set keep their defaults.
    pub fn from_yaml(yaml: &str) -> Result<Self, MeshError> {
        let doc = serde_yaml::from_str::<serde_yaml::Value>(yaml)?;
        let mesh = match doc.get("mesh").and_then(|m| m.as_str()) {
            Some(inner) => serde_yaml::from_str::<Self>(inner)?,
            None if doc.is_null() => Self::default(),
            None => serde_yaml::from_value::<Self>(doc)?,
        };
        mesh.validate()?;
        Ok(mesh)
    }

    pub fn is_mtls(&self) -> bool {
        self.auth_policy == AuthPolicy::MutualTls
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        let mut errs = ValidationError::default();

        errs.merge(validate_address("discovery address", &self.discovery_address));
        for (what, addr) in [
            ("egress proxy address", &self.egress_proxy_address),
            ("mixer address", &self.mixer_address),
            ("statsd address", &self.statsd_udp_address),
        ] {
            if let Some(addr) = addr {
                errs.merge(validate_address(what, addr));
            }
        }

        if self.proxy_listen_port == 0 {
            errs.push("proxy listen port must not be 0");
        }
        if self.proxy_admin_port == 0 {
            errs.push("proxy admin port must not be 0");
        }
        if self.proxy_listen_port == self.proxy_admin_port {
            errs.push("proxy listen and admin ports must differ");
        }

        for (what, d) in [
            ("drain duration", self.drain_duration),
            ("parent shutdown duration", self.parent_shutdown_duration),
            ("discovery refresh delay", self.discovery_refresh_delay),
            ("connect timeout", self.connect_timeout),
        ] {
            if d.is_zero() {
                errs.push(format!("{what} must be positive"));
            }
        }

        if self.istio_service_cluster.is_empty() {
            errs.push("service cluster must not be empty");
        }

        errs.into_result()
    }
}

fn validate_address(what: &str, addr: &str) -> Result<(), ValidationError> {
    let valid = match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && matches!(port.parse::<u16>(), Ok(p) if p != 0),
        None => false,
    };
    if !valid {
        return Err(format!("{what} {addr:?} must be of the form host:port").into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn defaults_are_valid() {
        assert!(MeshConfig::default().validate().is_ok());
    }

    #[test]
    fn empty_document_is_default() {
        assert_eq!(MeshConfig::from_yaml("").unwrap(), MeshConfig::default());
    }

    #[test]
    fn parses_overrides() {
        let mesh = MeshConfig::from_yaml(
            "
mixerAddress: istio-mixer:9091
connectTimeout: 500ms
authPolicy: MUTUAL_TLS
ingressControllerMode: 'OFF'
",
        )
        .unwrap();
        assert_eq!(mesh.mixer_address.as_deref(), Some("istio-mixer:9091"));
        assert_eq!(mesh.connect_timeout, Duration::from_millis(500));
        assert!(mesh.is_mtls());
        assert_eq!(mesh.ingress_controller_mode, IngressControllerMode::Off);
        assert_eq!(mesh.proxy_listen_port, 15001, "unset fields keep defaults");
    }

    #[test]
    fn parses_config_map_document() {
        let mesh = MeshConfig::from_yaml(
            "
mesh: |
  istioServiceCluster: my-proxy
  drainDuration: 5s
",
        )
        .unwrap();
        assert_eq!(mesh.istio_service_cluster, "my-proxy");
        assert_eq!(mesh.drain_duration, Duration::from_secs(5));
    }

    #[test]
    fn rejects_invalid() {
        let err = MeshConfig::from_yaml(
            "
discoveryAddress: istio-pilot
proxyAdminPort: 15001
connectTimeout: 0s
",
        )
        .unwrap_err();
        let MeshError::Invalid(errs) = err else {
            panic!("expected a validation error, got {err}");
        };
        assert_eq!(errs.errors().len(), 3, "{errs}");
    }

    #[test]
    fn rejects_unknown_enum() {
        assert!(matches!(
            MeshConfig::from_yaml("authPolicy: SOMETIMES"),
            Err(MeshError::Yaml(_))
        ));
    }
}
