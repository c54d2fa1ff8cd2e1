#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod duration;
pub mod ingress;
pub mod mesh;
pub mod policy;
pub mod rule;
pub mod store;

pub use self::{
    duration::Duration,
    ingress::{IngressRule, ServicePort},
    mesh::{AuthPolicy, IngressControllerMode, MeshConfig, MeshError},
    policy::{
        CircuitBreaker, DestinationPolicy, DestinationVersionPolicy, LoadBalancing,
        LoadBalancingMode, SimpleCircuitBreakerPolicy,
    },
    rule::{
        Abort, Delay, DestinationWeight, HttpFaultInjection, HttpRetry, HttpTimeout,
        L4FaultInjection, MatchCondition, RouteRule, SimpleRetry, SimpleTimeout, StringMatch,
    },
    store::{descriptors, IstioConfigStore, DESTINATION_POLICY, INGRESS_RULE, ROUTE_RULE},
};

/// The pseudo-header that matches the request path in route rules.
pub const HEADER_URI: &str = "uri";

/// The header that selects an ingress virtual host.
pub const HEADER_AUTHORITY: &str = "authority";
