//! Typed traffic-management rule payloads.
//!
//! These are the external messages carried by the config store; their
//! structural invariants are enforced in [`crate::validation`] before any
//! rule reaches the discovery service or the watcher.

use crate::service::Tags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-destination L7 rule set: request matching, weighted routes, timeouts,
/// retries, and fault injection.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteRule {
    /// FQDN of the destination service.
    pub destination: String,

    /// Rules with higher precedence are evaluated first.
    pub precedence: i32,

    #[serde(rename = "match", skip_serializing_if = "Option::is_none")]
    pub match_condition: Option<MatchCondition>,

    /// Weighted destinations. When more than one is present, the integer
    /// weights must sum to exactly 100.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub route: Vec<DestinationWeight>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_req_timeout: Option<HttpTimeout>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_req_retries: Option<HttpRetry>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_fault: Option<HttpFaultInjection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub l4_fault: Option<L4FaultInjection>,
}

/// Request predicate attached to a route rule.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchCondition {
    /// FQDN of the calling service; empty matches any source.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub source: String,

    #[serde(skip_serializing_if = "Tags::is_empty")]
    pub source_tags: Tags,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tcp: Option<L4MatchAttributes>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub udp: Option<L4MatchAttributes>,

    /// Header name to match expression. The pseudo-header `uri` selects the
    /// request path.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub http_headers: BTreeMap<String, StringMatch>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringMatch {
    Exact(String),
    Prefix(String),
    Regex(String),
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct L4MatchAttributes {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub source_subnet: Vec<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub destination_subnet: Vec<String>,
}

/// One branch of a weighted route.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationWeight {
    /// Destination FQDN; empty inherits the rule's destination.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub destination: String,

    #[serde(skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,

    /// Integer percentage of traffic. A single destination with weight 0 is
    /// treated as 100.
    pub weight: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpTimeout {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simple_timeout: Option<SimpleTimeoutPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimpleTimeoutPolicy {
    pub timeout_seconds: f64,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub override_header_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpRetry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simple_retry: Option<SimpleRetryPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimpleRetryPolicy {
    pub attempts: i32,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub override_header_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpFaultInjection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<FaultDelay>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort: Option<FaultAbort>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultDelay {
    /// Percentage of requests delayed, in `[0.0, 100.0]`.
    pub percent: f32,

    pub fixed_delay_seconds: f64,

    /// Unsupported; a non-zero value is rejected by validation.
    pub exponential_delay_seconds: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FaultAbort {
    /// Percentage of requests aborted, in `[0.0, 100.0]`.
    pub percent: f32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub http2_error: Option<String>,

    /// Unsupported; rejected by validation when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grpc_status: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct L4FaultInjection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle: Option<Throttle>,

    /// Unsupported; rejected by validation when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminate: Option<Terminate>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Throttle {
    pub percent: f32,
    pub downstream_limit_bps: i64,
    pub upstream_limit_bps: i64,
    pub throttle_after_seconds: f64,
    pub throttle_after_bytes: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Terminate {
    pub percent: f32,
    pub terminate_after_seconds: f64,
}

/// Per-destination behavior applied to derived clusters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DestinationPolicy {
    /// FQDN of the destination service.
    pub destination: String,

    /// The policy applies only to instances carrying exactly these tags.
    #[serde(skip_serializing_if = "Tags::is_empty")]
    pub tags: Tags,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_balancing: Option<LoadBalancing>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreaker>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancing {
    pub name: LbPolicy,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LbPolicy {
    #[default]
    RoundRobin,
    LeastRequest,
    Random,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreaker {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub simple_cb: Option<SimpleCircuitBreakerPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
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
