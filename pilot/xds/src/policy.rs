use crate::{
    resources::{
        CircuitBreakerLimits, CircuitBreakers, Cluster, HttpFilter, HttpRouteConfig, LbType,
        Listener, OutlierDetection,
    },
    route::secs_to_millis,
};
use pilot_model::{IstioConfigStore, LoadBalancingMode};
use std::collections::BTreeMap;

const DEFAULT_MAX_EJECTION_PERCENT: i32 = 10;

/// Applies the destination policy for a mesh service cluster's tags, if one
/// exists.
pub(crate) fn apply_destination_policy(config: &IstioConfigStore, cluster: &mut Cluster) {
    let policy = match &cluster.upstream {
        Some(upstream) => config.destination_policy(&upstream.hostname, &upstream.tags),
        None => return,
    };
    let Some(policy) = policy else {
        return;
    };

    if let Some(lb) = &policy.load_balancing {
        cluster.lb_type = match lb.name {
            LoadBalancingMode::RoundRobin => LbType::RoundRobin,
            LoadBalancingMode::LeastConn => LbType::LeastRequest,
            LoadBalancingMode::Random => LbType::Random,
        };
    }

    // The policy's circuit breaker maps to both the cluster's connection
    // limits and per-host outlier ejection.
    if let Some(cb) = policy
        .circuit_breaker
        .as_ref()
        .and_then(|cb| cb.simple_cb.as_ref())
    {
        cluster.max_requests_per_connection = positive(cb.http_max_requests_per_connection);
        cluster.circuit_breaker = Some(CircuitBreakers {
            default: CircuitBreakerLimits {
                max_connections: positive(cb.max_connections),
                max_pending_requests: positive(cb.http_max_pending_requests),
                max_requests: positive(cb.http_max_requests),
            },
        });
        cluster.outlier_detection = Some(OutlierDetection {
            consecutive_5xx: positive(cb.http_consecutive_errors),
            interval_ms: (cb.http_detection_interval_seconds > 0.0)
                .then(|| secs_to_millis(cb.http_detection_interval_seconds)),
            base_ejection_time_ms: (cb.sleep_window_seconds > 0.0)
                .then(|| secs_to_millis(cb.sleep_window_seconds)),
            max_ejection_percent: positive(cb.http_max_ejection_percent)
                .unwrap_or(DEFAULT_MAX_EJECTION_PERCENT),
        });
    }
}

fn positive(n: i32) -> Option<i32> {
    (n > 0).then_some(n)
}

/// Installs a fault filter ahead of the router for every fault carried by
/// the routes a connection manager serves.
pub(crate) fn insert_fault_filters(
    listeners: &mut [Listener],
    route_configs: &BTreeMap<u16, HttpRouteConfig>,
) {
    for listener in listeners {
        for hcm in listener.http_connection_managers() {
            let routes = match (&hcm.route_config, &hcm.rds) {
                (Some(rc), _) => Some(rc),
                (None, Some(rds)) => rds
                    .route_config_name
                    .parse::<u16>()
                    .ok()
                    .and_then(|port| route_configs.get(&port)),
                (None, None) => None,
            };
            let faults = routes
                .into_iter()
                .flat_map(|rc| rc.faults())
                .cloned()
                .map(HttpFilter::Fault)
                .collect::<Vec<_>>();
            if faults.is_empty() {
                continue;
            }

            let router = hcm
                .filters
                .iter()
                .position(|f| matches!(f, HttpFilter::Router))
                .unwrap_or(hcm.filters.len());
            hcm.filters.splice(router..router, faults);
        }
    }
}
