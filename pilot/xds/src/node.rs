use std::{fmt, net::IpAddr, str::FromStr};

/// The identity a proxy presents as its service node.
///
/// Encoded as `role~ip~id~domain`. A bare IP address identifies a sidecar.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Node {
    pub role: Role,
    pub ip: IpAddr,
    pub id: String,
    pub domain: String,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Role {
    #[default]
    Sidecar,
    Ingress,
    Egress,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidNode {
    #[error("expected role~ip~id~domain, got {0:?}")]
    Format(String),

    #[error("unknown proxy role {0:?}")]
    Role(String),

    #[error("invalid IP address {0:?}")]
    Ip(String),
}

// === impl Node ===

impl Node {
    pub fn sidecar(ip: IpAddr) -> Self {
        Self {
            role: Role::Sidecar,
            ip,
            id: String::new(),
            domain: String::new(),
        }
    }
}

impl FromStr for Node {
    type Err = InvalidNode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parse_ip = |ip: &str| ip.parse().map_err(|_| InvalidNode::Ip(ip.to_string()));

        let parts = s.split('~').collect::<Vec<_>>();
        match parts[..] {
            [ip] => parse_ip(ip).map(Self::sidecar),
            [role, ip, id, domain] => Ok(Self {
                role: role.parse()?,
                ip: parse_ip(ip)?,
                id: id.to_string(),
                domain: domain.to_string(),
            }),
            _ => Err(InvalidNode::Format(s.to_string())),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}~{}~{}~{}", self.role, self.ip, self.id, self.domain)
    }
}

// === impl Role ===

impl FromStr for Role {
    type Err = InvalidNode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sidecar" => Ok(Self::Sidecar),
            "ingress" => Ok(Self::Ingress),
            "egress" => Ok(Self::Egress),
            _ => Err(InvalidNode::Role(s.to_string())),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sidecar => "sidecar",
            Self::Ingress => "ingress",
            Self::Egress => "egress",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn bare_ip_is_sidecar() {
        let node = "10.1.1.1".parse::<Node>().unwrap();
        assert_eq!(node, Node::sidecar([10, 1, 1, 1].into()));
    }

    #[test]
    fn full_form() {
        let node = "ingress~10.1.1.2~istio-ingress-abc.default~default.svc.cluster.local"
            .parse::<Node>()
            .unwrap();
        assert_eq!(node.role, Role::Ingress);
        assert_eq!(node.ip.to_string(), "10.1.1.2");
        assert_eq!(node.id, "istio-ingress-abc.default");
        assert_eq!(node.domain, "default.svc.cluster.local");
        assert_eq!(
            node.to_string(),
            "ingress~10.1.1.2~istio-ingress-abc.default~default.svc.cluster.local"
        );
    }

    #[rstest]
    #[case::empty("", InvalidNode::Ip(String::new()))]
    #[case::hostname("reviews", InvalidNode::Ip("reviews".into()))]
    #[case::short("sidecar~10.1.1.1", InvalidNode::Format("sidecar~10.1.1.1".into()))]
    #[case::role("router~10.1.1.1~a~b", InvalidNode::Role("router".into()))]
    #[case::ip("egress~10.1.1~a~b", InvalidNode::Ip("10.1.1".into()))]
    fn invalid(#[case] s: &str, #[case] expected: InvalidNode) {
        assert_eq!(s.parse::<Node>().unwrap_err(), expected);
    }
}
