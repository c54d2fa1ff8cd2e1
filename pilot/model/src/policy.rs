use pilot_core::{
    validation::{validate_fqdn, validate_percent},
    MessageType, Spec, Tags, ValidationError,
};
use serde::{Deserialize, Serialize};

/// Connection policies for the versions of a destination service.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationPolicy {
    pub destination: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub policy: Vec<DestinationVersionPolicy>,
}

/// The policy for the instances of a destination that carry `tags`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationVersionPolicy {
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancing: Option<LoadBalancing>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreaker>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancing {
    pub name: LoadBalancingMode,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LoadBalancingMode {
    #[default]
    RoundRobin,
    LeastConn,
    Random,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreaker {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simple_cb: Option<SimpleCircuitBreakerPolicy>,
}

/// Zero values mean "use the proxy default".
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SimpleCircuitBreakerPolicy {
    pub max_connections: i32,
    pub http_max_pending_requests: i32,
    pub http_max_requests: i32,
    pub sleep_window_seconds: f64,
    pub http_consecutive_errors: i32,
    pub http_detection_interval_seconds: f64,
    pub http_max_requests_per_connection: i32,
    pub http_max_ejection_percent: i32,
}

// === impl DestinationPolicy ===

impl DestinationPolicy {
    /// The version policy whose tags equal `tags`.
    pub fn get(&self, tags: &Tags) -> Option<&DestinationVersionPolicy> {
        self.policy.iter().find(|p| p.tags == *tags)
    }
}

impl MessageType for DestinationPolicy {
    const NAME: &'static str = "pilot.v1.DestinationPolicy";
}

impl Spec for DestinationPolicy {
    fn key(&self) -> String {
        self.destination.clone()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut errs = ValidationError::default();
        errs.merge(validate_fqdn(&self.destination));

        for (i, p) in self.policy.iter().enumerate() {
            errs.merge(p.tags.validate());
            if self.policy[..i].iter().any(|q| q.tags == p.tags) {
                errs.push(format!("duplicate policy for tags {:?}", p.tags.to_string()));
            }
            if let Some(cb) = p.circuit_breaker.as_ref().and_then(|cb| cb.simple_cb.as_ref()) {
                errs.merge(cb.validate());
            }
        }

        errs.into_result()
    }
}

// === impl SimpleCircuitBreakerPolicy ===

impl SimpleCircuitBreakerPolicy {
    fn validate(&self) -> Result<(), ValidationError> {
        let mut errs = ValidationError::default();
        let limits = [
            ("max connections", self.max_connections),
            ("max pending requests", self.http_max_pending_requests),
            ("max requests", self.http_max_requests),
            ("consecutive errors", self.http_consecutive_errors),
            ("max requests per connection", self.http_max_requests_per_connection),
        ];
        for (what, v) in limits {
            if v < 0 {
                errs.push(format!("circuit breaker {what} must not be negative"));
            }
        }
        if self.sleep_window_seconds < 0.0 {
            errs.push("circuit breaker sleep window must not be negative");
        }
        if self.http_detection_interval_seconds < 0.0 {
            errs.push("circuit breaker detection interval must not be negative");
        }
        errs.merge(validate_percent(
            "ejection",
            f64::from(self.http_max_ejection_percent),
        ));
        errs.into_result()
    }
}
