//! Structural validators for registry objects and rule payloads.
//!
//! Validators accumulate every violation they find instead of
//! short-circuiting, so a submitter sees all problems at once.

use crate::{
    config::{ConfigValue, Key, KindMap},
    rules::{
        CircuitBreaker, DestinationPolicy, DestinationWeight, FaultAbort, FaultDelay,
        HttpFaultInjection, HttpRetry, HttpTimeout, L4FaultInjection, L4MatchAttributes,
        LoadBalancing, MatchCondition, RouteRule, Terminate, Throttle,
    },
    service::{Service, ServiceInstance, Tags},
};
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

const DNS1123_LABEL_MAX_LENGTH: usize = 63;

static DNS1123_LABEL_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("label regex compiles"));

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[-A-Za-z0-9_./]*$").expect("tag regex compiles"));

/// The accumulated violations of one validation pass.
#[derive(Debug, Default)]
pub struct ValidationErrors(Vec<String>);

// === impl ValidationErrors ===

impl ValidationErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, violation: impl Into<String>) {
        self.0.push(violation.into());
    }

    /// Folds the violations of a nested validation into this set.
    pub fn merge(&mut self, nested: Result<(), ValidationErrors>) {
        if let Err(errs) = nested {
            self.0.extend(errs.0);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn violations(&self) -> &[String] {
        &self.0
    }

    /// `Ok` when no violation was recorded.
    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.0.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Tests for a string that conforms to the definition of a label in DNS
/// (RFC 1123).
pub fn is_dns1123_label(value: &str) -> bool {
    value.len() <= DNS1123_LABEL_MAX_LENGTH && DNS1123_LABEL_RE.is_match(value)
}

/// A fully qualified domain name: bounded length, every dot-separated label
/// well-formed.
pub fn validate_fqdn(fqdn: &str) -> Result<(), ValidationErrors> {
    let mut errs = ValidationErrors::new();
    if fqdn.is_empty() {
        errs.push("empty domain name not allowed");
        return errs.into_result();
    }
    if fqdn.len() > 255 {
        errs.push(format!("domain name {:?} too long (max 255)", fqdn));
    }
    for label in fqdn.split('.') {
        if !is_dns1123_label(label) {
            errs.push(format!(
                "domain name {:?} invalid (label {:?} invalid)",
                fqdn, label
            ));
        }
    }
    errs.into_result()
}

/// An IPv4 subnet in CIDR or dot-decimal notation: `a.b.c.d/bits` or
/// `a.b.c.d`.
pub fn validate_ipv4_subnet(subnet: &str) -> Result<(), ValidationErrors> {
    let mut errs = ValidationErrors::new();

    let parts = subnet.split('/').collect::<Vec<_>>();
    if parts.len() > 2 {
        errs.push(format!("{:?} is not valid CIDR notation", subnet));
        return errs.into_result();
    }

    if parts.len() == 2 {
        match parts[1].parse::<u32>() {
            Ok(bits) if (1..=32).contains(&bits) => {}
            _ => errs.push(format!("/{} is not a valid CIDR block", parts[1])),
        }
    }

    let octets = parts[0].split('.').collect::<Vec<_>>();
    let valid = octets.len() == 4 && octets.iter().all(|o| o.parse::<u32>().is_ok_and(|n| n <= 255));
    if !valid {
        errs.push(format!("{:?} is not a valid IP address", parts[0]));
    }

    errs.into_result()
}

fn check_percent(errs: &mut ValidationErrors, val: i32, label: &str) {
    if !(0..=100).contains(&val) {
        errs.push(format!("{} must be in range 0..100", label));
    }
}

fn check_float_percent(errs: &mut ValidationErrors, val: f32, label: &str) {
    if !(0.0..=100.0).contains(&val) {
        errs.push(format!("{} must be in range 0..100", label));
    }
}

// === impl Tags ===

impl Tags {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        for (k, v) in &self.0 {
            if !TAG_RE.is_match(k) {
                errs.push(format!("invalid tag key: {:?}", k));
            }
            if !TAG_RE.is_match(v) {
                errs.push(format!("invalid tag value: {:?}", v));
            }
        }
        errs.into_result()
    }
}

// === impl Service ===

impl Service {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.hostname.is_empty() {
            errs.push("invalid empty hostname");
        }
        for label in self.hostname.split('.') {
            if !is_dns1123_label(label) {
                errs.push(format!("invalid hostname part: {:?}", label));
            }
        }

        if self.ports.is_empty() {
            errs.push("service must have at least one declared port");
        }

        // Port names can be empty only if there exists a single port.
        let mut seen = std::collections::BTreeSet::new();
        for port in &self.ports {
            if port.name.is_empty() {
                if self.ports.len() > 1 {
                    errs.push("empty port names are not allowed for services with multiple ports");
                }
            } else if !is_dns1123_label(&port.name) {
                errs.push(format!("invalid port name: {:?}", port.name));
            }
            if !seen.insert(port.name.as_str()) {
                errs.push(format!("duplicate port name: {:?}", port.name));
            }
        }
        errs.into_result()
    }
}

// === impl ServiceInstance ===

impl ServiceInstance {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        errs.merge(self.service.validate());
        errs.merge(self.tags.validate());

        let port = &self.endpoint.service_port;
        match self.service.get_port(&port.name) {
            None => errs.push(format!("missing service port {:?}", port.name)),
            Some(expected) => {
                if expected.port != port.port {
                    errs.push(format!(
                        "unexpected service port value {}, expected {}",
                        port.port, expected.port
                    ));
                }
                if expected.protocol != port.protocol {
                    errs.push(format!(
                        "unexpected service protocol {:?}, expected {:?}",
                        port.protocol, expected.protocol
                    ));
                }
            }
        }

        errs.into_result()
    }
}

// === impl Key ===

impl Key {
    /// Confirms that every name in the key is a DNS-1123 label.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if !is_dns1123_label(&self.kind) {
            errs.push(format!("invalid kind: {:?}", self.kind));
        }
        if !is_dns1123_label(&self.name) {
            errs.push(format!("invalid name: {:?}", self.name));
        }
        if !is_dns1123_label(&self.namespace) {
            errs.push(format!("invalid namespace: {:?}", self.namespace));
        }
        errs.into_result()
    }
}

// === impl KindMap ===

impl KindMap {
    /// Checks that each declared kind name conforms to the label rules.
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        for kind in self.kinds() {
            if !is_dns1123_label(kind) {
                errs.push(format!("invalid kind: {:?}", kind));
            }
        }
        errs.into_result()
    }

    /// Ensures the key is well-formed and its kind declared.
    pub fn validate_key(&self, key: &Key) -> Result<(), crate::Error> {
        key.validate()?;
        if self.get(&key.kind).is_none() {
            return Err(crate::Error::UndeclaredKind(key.kind.clone()));
        }
        Ok(())
    }

    /// The boundary gate: key well-formed, kind declared, payload type
    /// matching, and the per-kind validator satisfied.
    pub fn validate_config(&self, key: &Key, value: &ConfigValue) -> Result<(), crate::Error> {
        key.validate()?;
        let spec = self
            .get(&key.kind)
            .ok_or_else(|| crate::Error::UndeclaredKind(key.kind.clone()))?;
        if value.type_tag() != spec.message_type {
            return Err(crate::Error::TypeMismatch {
                kind: key.kind.clone(),
                actual: value.type_tag(),
            });
        }
        (spec.validate)(value)?;
        Ok(())
    }
}

// === impl MatchCondition ===

impl MatchCondition {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if !self.source.is_empty() {
            errs.merge(validate_fqdn(&self.source));
        }
        errs.merge(self.source_tags.validate());

        if let Some(tcp) = &self.tcp {
            errs.merge(tcp.validate());
        }
        if let Some(udp) = &self.udp {
            errs.merge(udp.validate());
            errs.push("UDP protocol is not supported yet");
        }
        errs.into_result()
    }
}

// === impl L4MatchAttributes ===

impl L4MatchAttributes {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        for subnet in self.source_subnet.iter().chain(&self.destination_subnet) {
            errs.merge(validate_ipv4_subnet(subnet));
        }
        errs.into_result()
    }
}

// === impl DestinationWeight ===

impl DestinationWeight {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if !self.destination.is_empty() {
            errs.merge(validate_fqdn(&self.destination));
        }
        errs.merge(self.tags.validate());
        check_percent(&mut errs, self.weight, "weight");
        errs.into_result()
    }
}

fn check_weights(errs: &mut ValidationErrors, routes: &[DestinationWeight]) {
    let sum: i64 = routes.iter().map(|r| i64::from(r.weight)).sum();

    // A single destination with no weight is assumed to take all traffic.
    if routes.len() == 1 && sum == 0 {
        return;
    }

    if sum != 100 {
        errs.push(format!("route weights total {} (must total 100)", sum));
    }
}

// === impl HttpTimeout ===

impl HttpTimeout {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if let Some(simple) = &self.simple_timeout {
            if simple.timeout_seconds < 0.0 {
                errs.push("timeout_seconds must be in range [0..]");
            }
        }
        errs.into_result()
    }
}

// === impl HttpRetry ===

impl HttpRetry {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if let Some(simple) = &self.simple_retry {
            if simple.attempts < 0 {
                errs.push("attempts must be in range [0..]");
            }
        }
        errs.into_result()
    }
}

// === impl HttpFaultInjection ===

impl HttpFaultInjection {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if let Some(delay) = &self.delay {
            errs.merge(delay.validate());
        }
        if let Some(abort) = &self.abort {
            errs.merge(abort.validate());
        }
        errs.into_result()
    }
}

// === impl FaultDelay ===

impl FaultDelay {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        check_float_percent(&mut errs, self.percent, "delay");
        if self.fixed_delay_seconds < 0.0 {
            errs.push("delay fixed_seconds invalid");
        }
        if self.exponential_delay_seconds != 0.0 {
            if self.exponential_delay_seconds < 0.0 {
                errs.push("delay exponential_seconds invalid");
            }
            errs.push("exponential_seconds is not supported yet");
        }
        errs.into_result()
    }
}

// === impl FaultAbort ===

impl FaultAbort {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        check_float_percent(&mut errs, self.percent, "abort");
        if self.grpc_status.is_some() {
            errs.push("gRPC fault injection is not supported yet");
        }
        if let Some(status) = self.http_status {
            if !(0..=600).contains(&status) {
                errs.push(format!("invalid abort http status {}", status));
            }
        }
        errs.into_result()
    }
}

// === impl L4FaultInjection ===

impl L4FaultInjection {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if let Some(terminate) = &self.terminate {
            errs.merge(terminate.validate());
            errs.push("the terminate fault is not supported yet");
        }
        if let Some(throttle) = &self.throttle {
            errs.merge(throttle.validate());
        }
        errs.into_result()
    }
}

// === impl Terminate ===

impl Terminate {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        check_float_percent(&mut errs, self.percent, "terminate");
        if self.terminate_after_seconds < 0.0 {
            errs.push("terminate_after_seconds invalid");
        }
        errs.into_result()
    }
}

// === impl Throttle ===

impl Throttle {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        check_float_percent(&mut errs, self.percent, "throttle");
        if self.downstream_limit_bps < 0 {
            errs.push("downstream_limit_bps invalid");
        }
        if self.upstream_limit_bps < 0 {
            errs.push("upstream_limit_bps invalid");
        }
        if self.throttle_after_seconds < 0.0 {
            errs.push("throttle_after_seconds invalid");
        }
        if self.throttle_after_bytes < 0 {
            errs.push("throttle_after_bytes invalid");
        }
        errs.into_result()
    }
}

// === impl LoadBalancing ===

impl LoadBalancing {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        // The policy is just a name; nothing to check.
        Ok(())
    }
}

// === impl CircuitBreaker ===

impl CircuitBreaker {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if let Some(simple) = &self.simple_cb {
            if simple.max_connections < 0 {
                errs.push("circuit_breaker max_connections must be in range [0..]");
            }
            if simple.http_max_pending_requests < 0 {
                errs.push("circuit_breaker max_pending_requests must be in range [0..]");
            }
            if simple.http_max_requests < 0 {
                errs.push("circuit_breaker max_requests must be in range [0..]");
            }
            if simple.sleep_window_seconds < 0.0 {
                errs.push("circuit_breaker sleep_window_seconds must be in range [0..]");
            }
            if simple.http_consecutive_errors < 0 {
                errs.push("circuit_breaker http_consecutive_errors must be in range [0..]");
            }
            if simple.http_detection_interval_seconds < 0.0 {
                errs.push("circuit_breaker http_detection_interval_seconds must be in range [0..]");
            }
            if simple.http_max_requests_per_connection < 0 {
                errs.push("circuit_breaker http_max_requests_per_connection must be in range [0..]");
            }
            check_percent(
                &mut errs,
                simple.http_max_ejection_percent,
                "circuit_breaker http_max_ejection_percent",
            );
        }
        errs.into_result()
    }
}

// === impl RouteRule ===

impl RouteRule {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.destination.is_empty() {
            errs.push("route rule must have a destination service");
        }
        errs.merge(validate_fqdn(&self.destination));

        // Any precedence value is legal.

        if let Some(m) = &self.match_condition {
            errs.merge(m.validate());
        }

        if !self.route.is_empty() {
            for weight in &self.route {
                errs.merge(weight.validate());
            }
            check_weights(&mut errs, &self.route);
        }

        if let Some(timeout) = &self.http_req_timeout {
            errs.merge(timeout.validate());
        }
        if let Some(retries) = &self.http_req_retries {
            errs.merge(retries.validate());
        }
        if let Some(fault) = &self.http_fault {
            errs.merge(fault.validate());
        }
        if let Some(fault) = &self.l4_fault {
            errs.merge(fault.validate());
            errs.push("L4 faults are not implemented");
        }

        errs.into_result()
    }
}

// === impl DestinationPolicy ===

impl DestinationPolicy {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if self.destination.is_empty() {
            errs.push("destination policy must have a valid service name in its destination field");
        } else {
            errs.merge(validate_fqdn(&self.destination));
        }
        errs.merge(self.tags.validate());

        if let Some(lb) = &self.load_balancing {
            errs.merge(lb.validate());
        }
        if let Some(cb) = &self.circuit_breaker {
            errs.merge(cb.validate());
        }
        errs.into_result()
    }
}
