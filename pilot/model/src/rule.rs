use crate::HEADER_URI;
use pilot_core::{
    validation::{is_dns1123_label, validate_fqdn, validate_percent},
    MessageType, Spec, Tags, ValidationError,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Routes traffic for a destination service, optionally only for requests
/// matching a condition, across weighted versions of one or more services.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteRule {
    pub name: String,

    /// The service the rule applies to.
    pub destination: String,

    /// Rules with higher precedence are evaluated first.
    #[serde(default)]
    pub precedence: i32,

    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_: Option<MatchCondition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub route: Vec<DestinationWeight>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_req_timeout: Option<HttpTimeout>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_req_retries: Option<HttpRetry>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_fault: Option<HttpFaultInjection>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l4_fault: Option<L4FaultInjection>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCondition {
    /// Hostname of the calling service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    /// Tags the calling instance must carry.
    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub source_tags: Tags,

    /// Request header conditions. The `uri` header matches the request path.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub http_headers: BTreeMap<String, StringMatch>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StringMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationWeight {
    /// Defaults to the rule's destination.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,

    #[serde(default, skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,

    /// Percentage of traffic; a lone destination defaults to 100.
    #[serde(default)]
    pub weight: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpTimeout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simple_timeout: Option<SimpleTimeout>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleTimeout {
    pub timeout_seconds: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpRetry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simple_retry: Option<SimpleRetry>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleRetry {
    pub attempts: i32,
    #[serde(default)]
    pub per_try_timeout_seconds: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpFaultInjection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<Delay>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort: Option<Abort>,

    /// Only requests with these headers are subject to the fault.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, StringMatch>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Delay {
    pub percent: f64,
    pub fixed_delay_seconds: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Abort {
    pub percent: f64,
    pub http_status: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct L4FaultInjection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<Throttle>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminate: Option<Terminate>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Throttle {
    pub percent: f64,
    #[serde(default)]
    pub downstream_limit_bps: i64,
    #[serde(default)]
    pub upstream_limit_bps: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Terminate {
    pub percent: f64,
    pub terminate_after_seconds: f64,
}

// === impl RouteRule ===

impl RouteRule {
    /// True if the rule has no request match predicate.
    pub fn matches_all_requests(&self) -> bool {
        self.match_
            .as_ref()
            .map(|m| m.http_headers.is_empty())
            .unwrap_or(true)
    }

    /// Validates everything but the name. Shared with ingress rules.
    pub(crate) fn validate_body(&self) -> Result<(), ValidationError> {
        let mut errs = ValidationError::default();
        errs.merge(validate_fqdn(&self.destination));

        if let Some(m) = &self.match_ {
            errs.merge(m.validate());
        }

        if !self.route.is_empty() {
            let mut sum = 0;
            for dst in &self.route {
                if let Some(d) = &dst.destination {
                    errs.merge(validate_fqdn(d));
                }
                errs.merge(dst.tags.validate());
                if !(0..=100).contains(&dst.weight) {
                    errs.push(format!("weight {} must be in range 0..100", dst.weight));
                }
                sum += dst.effective_weight(self.route.len());
            }
            if sum != 100 {
                errs.push(format!("route weights total {sum} (must total 100)"));
            }
        }

        if let Some(t) = self.http_req_timeout.as_ref().and_then(|t| t.simple_timeout.as_ref()) {
            if t.timeout_seconds < 0.0 {
                errs.push("timeout must not be negative");
            }
        }

        if let Some(r) = self.http_req_retries.as_ref().and_then(|r| r.simple_retry.as_ref()) {
            if r.attempts < 0 {
                errs.push("retry attempts must not be negative");
            }
            if r.per_try_timeout_seconds < 0.0 {
                errs.push("per-try timeout must not be negative");
            }
        }

        if let Some(f) = &self.http_fault {
            errs.merge(f.validate());
        }
        if let Some(f) = &self.l4_fault {
            errs.merge(f.validate());
        }

        errs.into_result()
    }
}

impl MessageType for RouteRule {
    const NAME: &'static str = "pilot.v1.RouteRule";
}

impl Spec for RouteRule {
    fn key(&self) -> String {
        self.name.clone()
    }

    fn validate(&self) -> Result<(), ValidationError> {
        let mut errs = ValidationError::default();
        if !is_dns1123_label(&self.name) {
            errs.push(format!("invalid rule name: {:?}", self.name));
        }
        errs.merge(self.validate_body());
        errs.into_result()
    }
}

// === impl MatchCondition ===

impl MatchCondition {
    fn validate(&self) -> Result<(), ValidationError> {
        let mut errs = ValidationError::default();
        if let Some(source) = &self.source {
            errs.merge(validate_fqdn(source));
        }
        errs.merge(self.source_tags.validate());
        errs.merge(validate_headers(&self.http_headers));
        errs.into_result()
    }
}

fn validate_headers(headers: &BTreeMap<String, StringMatch>) -> Result<(), ValidationError> {
    let mut errs = ValidationError::default();
    for (name, m) in headers {
        if name.is_empty() {
            errs.push("header name must not be empty");
        }
        if name == HEADER_URI {
            match m {
                StringMatch::Exact(p) | StringMatch::Prefix(p) if !p.starts_with('/') => {
                    errs.push(format!("uri match {p:?} must start with '/'"));
                }
                _ => {}
            }
        }
    }
    errs.into_result()
}

// === impl DestinationWeight ===

impl DestinationWeight {
    /// The weight in effect when the rule has `routes` destinations.
    pub fn effective_weight(&self, routes: usize) -> i32 {
        if routes == 1 && self.weight == 0 {
            100
        } else {
            self.weight
        }
    }
}

// === impl HttpFaultInjection ===

impl HttpFaultInjection {
    fn validate(&self) -> Result<(), ValidationError> {
        let mut errs = ValidationError::default();
        if let Some(d) = &self.delay {
            errs.merge(validate_percent("delay", d.percent));
            if d.fixed_delay_seconds < 0.0 {
                errs.push("delay duration must not be negative");
            }
        }
        if let Some(a) = &self.abort {
            errs.merge(validate_percent("abort", a.percent));
            if !(100..=599).contains(&a.http_status) {
                errs.push(format!("invalid abort http status {}", a.http_status));
            }
        }
        errs.merge(validate_headers(&self.headers));
        errs.into_result()
    }
}

// === impl L4FaultInjection ===

impl L4FaultInjection {
    fn validate(&self) -> Result<(), ValidationError> {
        let mut errs = ValidationError::default();
        if let Some(t) = &self.throttle {
            errs.merge(validate_percent("throttle", t.percent));
            if t.downstream_limit_bps < 0 || t.upstream_limit_bps < 0 {
                errs.push("bandwidth limits must not be negative");
            }
        }
        if let Some(t) = &self.terminate {
            errs.merge(validate_percent("terminate", t.percent));
            if t.terminate_after_seconds < 0.0 {
                errs.push("terminate delay must not be negative");
            }
        }
        errs.into_result()
    }
}
