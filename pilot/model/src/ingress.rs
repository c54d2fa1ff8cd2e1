use crate::rule::RouteRule;
use pilot_core::{validation::is_dns1123_label, MessageType, Port, PortList, Spec, ValidationError};
use serde::{Deserialize, Serialize};

/// Exposes a port of a mesh service through the ingress proxy.
///
/// The rule's match and routes have the same meaning as in a route rule; the
/// `authority` header, if matched exactly, selects the virtual host.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    #[serde(flatten)]
    pub rule: RouteRule,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_service_port_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_service_port: Option<u16>,

    /// Name of the secret holding the TLS key pair for this rule's host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret: Option<String>,
}

/// The destination port of an ingress rule, by name or by number.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ServicePort<'a> {
    Name(&'a str),
    Number(u16),
}

// === impl IngressRule ===

impl IngressRule {
    pub fn service_port(&self) -> Option<ServicePort<'_>> {
        match (&self.destination_service_port_name, self.destination_service_port) {
            (Some(name), None) => Some(ServicePort::Name(name)),
            (None, Some(num)) => Some(ServicePort::Number(num)),
            _ => None,
        }
    }
}

impl MessageType for IngressRule {
    const NAME: &'static str = "pilot.v1.IngressRule";
}

impl Spec for IngressRule {
    fn key(&self) -> String {
        self.rule.name.clone()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut errs = ValidationError::default();
        if !is_dns1123_label(&self.rule.name) {
            errs.push(format!("invalid rule name: {:?}", self.rule.name));
        }
        errs.merge(self.rule.validate_body());

        match (&self.destination_service_port_name, self.destination_service_port) {
            (Some(name), None) => {
                if !is_dns1123_label(name) {
                    errs.push(format!("invalid destination port name: {name:?}"));
                }
            }
            (None, Some(0)) => errs.push("destination port 0 is out of range"),
            (None, Some(_)) => {}
            _ => errs.push("exactly one of destination port name or number is required"),
        }

        if let Some(secret) = &self.tls_secret {
            if secret.is_empty() {
                errs.push("TLS secret name must not be empty");
            }
        }

        errs.into_result()
    }
}

// === impl ServicePort ===

impl ServicePort<'_> {
    pub fn find<'p>(&self, ports: &'p PortList) -> Option<&'p Port> {
        match *self {
            Self::Name(name) => ports.get(name),
            Self::Number(num) => ports.get_by_port(num),
        }
    }
}
