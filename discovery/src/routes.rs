//! Derives the outbound L7 configuration for one proxy node from the
//! registry view and the traffic-management rules.

use crate::{
    resources::{
        CircuitBreakerSettings, CircuitBreakers, Cluster, FaultAbortConfig, FaultDelayConfig,
        FaultFilter, HeaderMatcher, HttpRoute, HttpRouteConfig, HttpRouteConfigs, OutlierDetection,
        RetryPolicy, VirtualHost, WeightedCluster, WeightedClusterEntry,
    },
    ProxyContext,
};
use mesh_controller_core::{
    rules::{HttpFaultInjection, LbPolicy, RouteRule, StringMatch},
    MeshConfig, Port, RuleRegistry, Service, ServiceInstance,
};
use std::collections::BTreeMap;

/// Pseudo-header selecting the request path in a match condition.
const URI_HEADER: &str = "uri";

const DEFAULT_RETRY_ON: &str = "5xx,connect-failure,refused-stream";

const DEFAULT_ABORT_STATUS: i32 = 503;

/// Computes the outbound HTTP route configurations, keyed by listener port,
/// for a proxy co-located with `instances`.
///
/// Route rules are applied in precedence order, filtered to those whose
/// match condition admits one of the co-located instances; every virtual
/// host ends with a catch-all route to the destination's default cluster.
pub fn build_outbound_http_routes(
    instances: &[ServiceInstance],
    services: &[Service],
    ctx: &ProxyContext,
) -> HttpRouteConfigs {
    let rules = ctx.config.route_rules_by_source(instances);

    let mut configs: BTreeMap<u16, HttpRouteConfig> = BTreeMap::new();
    for service in services {
        for port in &service.ports {
            if !port.protocol.is_http() {
                continue;
            }

            let mut routes = Vec::new();
            for rule in rules.iter().filter(|r| r.destination == service.hostname) {
                routes.push(build_http_route(rule, port, &ctx.mesh));
            }
            routes.push(default_route(service, port, &ctx.mesh));

            let vhost = VirtualHost {
                name: format!("{}:{}", service.hostname, port.port),
                domains: build_domains(service, port),
                routes,
            };
            configs
                .entry(port.port)
                .or_default()
                .virtual_hosts
                .push(vhost);
        }
    }

    // Virtual hosts accumulate in registry order; canonicalize.
    for config in configs.values_mut() {
        config.virtual_hosts.sort_by(|a, b| a.name.cmp(&b.name));
    }
    HttpRouteConfigs(configs)
}

/// The domains a virtual host answers for.
fn build_domains(service: &Service, port: &Port) -> Vec<String> {
    let mut domains = vec![
        service.hostname.clone(),
        format!("{}:{}", service.hostname, port.port),
    ];
    if let Some(address) = &service.address {
        domains.push(address.clone());
    }
    domains
}

/// Translates one validated route rule into a route entry for the given
/// destination port.
fn build_http_route(rule: &RouteRule, port: &Port, mesh: &MeshConfig) -> HttpRoute {
    let mut route = HttpRoute::default();

    if let Some(m) = &rule.match_condition {
        // The header map is ordered, so matchers come out canonically.
        for (name, value) in &m.http_headers {
            if name == URI_HEADER {
                match value {
                    StringMatch::Exact(path) => route.path = Some(path.clone()),
                    StringMatch::Prefix(prefix) => route.prefix = Some(prefix.clone()),
                    StringMatch::Regex(re) => route.headers.push(HeaderMatcher {
                        name: ":path".to_string(),
                        value: re.clone(),
                        regex: true,
                    }),
                }
            } else {
                route.headers.push(header_matcher(name, value));
            }
        }
    }
    if route.path.is_none() && route.prefix.is_none() {
        route.prefix = Some("/".to_string());
    }

    match rule.route.as_slice() {
        [] => {
            let cluster = Cluster::outbound(&rule.destination, port, None, mesh);
            route.cluster = Some(cluster.name.clone());
            route.clusters.push(cluster);
        }
        [single] => {
            let destination = if single.destination.is_empty() {
                &rule.destination
            } else {
                &single.destination
            };
            let tags = (!single.tags.is_empty()).then_some(&single.tags);
            let cluster = Cluster::outbound(destination, port, tags, mesh);
            route.cluster = Some(cluster.name.clone());
            route.clusters.push(cluster);
        }
        weighted => {
            let mut entries = Vec::with_capacity(weighted.len());
            for branch in weighted {
                let destination = if branch.destination.is_empty() {
                    &rule.destination
                } else {
                    &branch.destination
                };
                let tags = (!branch.tags.is_empty()).then_some(&branch.tags);
                let cluster = Cluster::outbound(destination, port, tags, mesh);
                entries.push(WeightedClusterEntry {
                    name: cluster.name.clone(),
                    weight: branch.weight,
                });
                route.clusters.push(cluster);
            }
            route.weighted_clusters = Some(WeightedCluster { clusters: entries });
        }
    }

    if let Some(timeout) = rule
        .http_req_timeout
        .as_ref()
        .and_then(|t| t.simple_timeout.as_ref())
    {
        route.timeout_ms = Some((timeout.timeout_seconds * 1000.0) as u64);
    }
    if let Some(retry) = rule
        .http_req_retries
        .as_ref()
        .and_then(|r| r.simple_retry.as_ref())
    {
        route.retry_policy = Some(RetryPolicy {
            retry_on: DEFAULT_RETRY_ON.to_string(),
            num_retries: retry.attempts,
        });
    }
    if let Some(fault) = &rule.http_fault {
        route.fault = Some(build_fault_filter(fault));
    }

    route
}

fn header_matcher(name: &str, value: &StringMatch) -> HeaderMatcher {
    match value {
        StringMatch::Exact(v) => HeaderMatcher {
            name: name.to_string(),
            value: v.clone(),
            regex: false,
        },
        StringMatch::Prefix(prefix) => HeaderMatcher {
            name: name.to_string(),
            value: format!("^{}.*", regex_escape(prefix)),
            regex: true,
        },
        StringMatch::Regex(re) => HeaderMatcher {
            name: name.to_string(),
            value: re.clone(),
            regex: true,
        },
    }
}

// Quotes regex metacharacters in a literal prefix.
fn regex_escape(literal: &str) -> String {
    let mut out = String::with_capacity(literal.len());
    for c in literal.chars() {
        if "\\.+*?()|[]{}^$#".contains(c) {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// The catch-all route appended to every virtual host.
fn default_route(service: &Service, port: &Port, mesh: &MeshConfig) -> HttpRoute {
    let cluster = Cluster::outbound(&service.hostname, port, None, mesh);
    HttpRoute {
        prefix: Some("/".to_string()),
        cluster: Some(cluster.name.clone()),
        clusters: vec![cluster],
        ..HttpRoute::default()
    }
}

fn build_fault_filter(fault: &HttpFaultInjection) -> FaultFilter {
    FaultFilter {
        delay: fault.delay.as_ref().map(|d| FaultDelayConfig {
            delay_type: "fixed",
            percent: d.percent,
            duration_ms: (d.fixed_delay_seconds * 1000.0) as u64,
        }),
        abort: fault.abort.as_ref().map(|a| FaultAbortConfig {
            percent: a.percent,
            http_status: a.http_status.unwrap_or(DEFAULT_ABORT_STATUS),
        }),
    }
}

/// Applies matching destination policies to derived clusters, in rule
/// order: circuit-breaker limits, outlier detection, and load-balancer
/// selection.
pub fn apply_destination_policies(clusters: &mut [Cluster], config: &RuleRegistry) {
    for cluster in clusters.iter_mut() {
        if cluster.service_name.is_none() {
            continue;
        }
        for policy in config.destination_policies(&cluster.hostname, &cluster.tags) {
            if let Some(lb) = &policy.load_balancing {
                cluster.lb_type = match lb.name {
                    LbPolicy::RoundRobin => crate::resources::LbType::RoundRobin,
                    LbPolicy::LeastRequest => crate::resources::LbType::LeastRequest,
                    LbPolicy::Random => crate::resources::LbType::Random,
                };
            }

            let Some(cb) = policy.circuit_breaker.as_ref().and_then(|c| c.simple_cb.as_ref())
            else {
                continue;
            };

            if cb.http_max_requests_per_connection > 0 {
                cluster.max_requests_per_connection = Some(cb.http_max_requests_per_connection);
            }

            let limits = CircuitBreakerSettings {
                max_connections: positive(cb.max_connections),
                max_pending_requests: positive(cb.http_max_pending_requests),
                max_requests: positive(cb.http_max_requests),
                max_retries: None,
            };
            if limits != CircuitBreakerSettings::default() {
                cluster.circuit_breakers = Some(CircuitBreakers { default: limits });
            }

            let outlier = OutlierDetection {
                consecutive_5xx: positive(cb.http_consecutive_errors),
                interval_ms: positive_ms(cb.http_detection_interval_seconds),
                base_ejection_time_ms: positive_ms(cb.sleep_window_seconds),
                max_ejection_percent: positive(cb.http_max_ejection_percent),
            };
            if outlier != OutlierDetection::default() {
                cluster.outlier_detection = Some(outlier);
            }
        }
    }
}

fn positive(v: i32) -> Option<i32> {
    (v > 0).then_some(v)
}

fn positive_ms(seconds: f64) -> Option<i64> {
    (seconds > 0.0).then_some((seconds * 1000.0) as i64)
}
