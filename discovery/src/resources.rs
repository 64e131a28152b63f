//! Data model of the configuration served to proxies: clusters, route
//! configurations, and the filters attached to them.
//!
//! Two semantically equal inputs must produce byte-identical JSON, so every
//! collection here is either sorted on construction or ordered by key; this
//! is what makes cache keys and downstream equality well-defined.

use mesh_controller_core::{AuthPolicy, MeshConfig, Port, Tags};
use serde::Serialize;
use std::collections::BTreeMap;

pub const OUTBOUND_CLUSTER_PREFIX: &str = "outbound:";
pub const INBOUND_CLUSTER_PREFIX: &str = "inbound:";

/// An upstream endpoint of a statically addressed cluster.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Host {
    pub url: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterType {
    /// Endpoints resolved through the discovery service.
    Sds,
    StrictDns,
    Static,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LbType {
    RoundRobin,
    LeastRequest,
    Random,
}

/// An upstream cluster derived from a service port and an optional tag
/// subset.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Cluster {
    pub name: String,

    /// SDS lookup key; present for discovery-backed clusters.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    pub connect_timeout_ms: u64,

    #[serde(rename = "type")]
    pub cluster_type: ClusterType,

    pub lb_type: LbType,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<Host>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests_per_connection: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub circuit_breakers: Option<CircuitBreakers>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub outlier_detection: Option<OutlierDetection>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_context: Option<SslContext>,

    /// Destination identity the cluster was derived from; used to look up
    /// destination policies, never serialized.
    #[serde(skip)]
    pub hostname: String,

    #[serde(skip)]
    pub tags: Tags,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CircuitBreakers {
    pub default: CircuitBreakerSettings,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CircuitBreakerSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_pending_requests: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_requests: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i32>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct OutlierDetection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consecutive_5xx: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_ejection_time_ms: Option<i64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_ejection_percent: Option<i32>,
}

/// Workload TLS material attached to clusters under mutual TLS.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SslContext {
    pub cert_chain_file: String,
    pub private_key_file: String,
    pub ca_cert_file: String,
}

/// One listener port's worth of L7 routes.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HttpRouteConfig {
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    pub routes: Vec<HttpRoute>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HttpRoute {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatcher>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub weighted_clusters: Option<WeightedCluster>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<FaultFilter>,

    /// The clusters this route refers to, carried out-of-band for CDS
    /// extraction.
    #[serde(skip)]
    pub clusters: Vec<Cluster>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HeaderMatcher {
    pub name: String,
    pub value: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub regex: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct WeightedCluster {
    pub clusters: Vec<WeightedClusterEntry>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeightedClusterEntry {
    pub name: String,
    pub weight: i32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub retry_on: String,
    pub num_retries: i32,
}

/// Fault injection derived from a validated route rule.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FaultFilter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay: Option<FaultDelayConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub abort: Option<FaultAbortConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FaultDelayConfig {
    #[serde(rename = "type")]
    pub delay_type: &'static str,
    pub percent: f32,
    pub duration_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FaultAbortConfig {
    pub percent: f32,
    pub http_status: i32,
}

/// Route configurations keyed by listener port.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HttpRouteConfigs(pub BTreeMap<u16, HttpRouteConfig>);

/// The CDS response body.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ClusterManager {
    pub clusters: Vec<Cluster>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub sds: Option<SdsBootstrap>,
}

/// Points a proxy at the discovery service for endpoint resolution.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SdsBootstrap {
    pub cluster: Cluster,
    pub refresh_delay_ms: u64,
}

// === impl Cluster ===

impl Cluster {
    /// The discovery-backed cluster for one destination service port,
    /// optionally narrowed to a tag subset.
    pub fn outbound(hostname: &str, port: &Port, tags: Option<&Tags>, mesh: &MeshConfig) -> Self {
        let key = mesh_controller_core::service_key(
            hostname,
            &[port],
            &tags.cloned().map(|t| vec![t]).unwrap_or_default(),
        );
        Self {
            name: format!("{}{}", OUTBOUND_CLUSTER_PREFIX, key),
            service_name: Some(key),
            connect_timeout_ms: mesh.connect_timeout.as_millis() as u64,
            cluster_type: ClusterType::Sds,
            lb_type: LbType::RoundRobin,
            hosts: Vec::new(),
            max_requests_per_connection: None,
            circuit_breakers: None,
            outlier_detection: None,
            ssl_context: None,
            hostname: hostname.to_string(),
            tags: tags.cloned().unwrap_or_default(),
        }
    }

    /// The loopback cluster for a co-located workload port.
    pub fn inbound(port: u16, mesh: &MeshConfig) -> Self {
        Self {
            name: format!("{}{}", INBOUND_CLUSTER_PREFIX, port),
            service_name: None,
            connect_timeout_ms: mesh.connect_timeout.as_millis() as u64,
            cluster_type: ClusterType::Static,
            lb_type: LbType::RoundRobin,
            hosts: vec![Host {
                url: format!("tcp://127.0.0.1:{}", port),
            }],
            max_requests_per_connection: None,
            circuit_breakers: None,
            outlier_detection: None,
            ssl_context: None,
            hostname: String::new(),
            tags: Tags::default(),
        }
    }

    /// Attaches the mesh TLS material when mutual TLS is in force.
    pub fn apply_auth_policy(&mut self, mesh: &MeshConfig) {
        if mesh.auth_policy == AuthPolicy::MutualTls {
            self.ssl_context = Some(SslContext {
                cert_chain_file: format!("{}/cert-chain.pem", mesh.auth_certs_path),
                private_key_file: format!("{}/key.pem", mesh.auth_certs_path),
                ca_cert_file: format!("{}/root-cert.pem", mesh.auth_certs_path),
            });
        }
    }
}

/// De-duplicates and canonicalizes derived clusters: stable order by name,
/// identical entries merged.
pub fn normalize(mut clusters: Vec<Cluster>) -> Vec<Cluster> {
    clusters.sort_by(|a, b| a.name.cmp(&b.name));
    clusters.dedup_by(|a, b| a.name == b.name);
    clusters
}

// === impl HttpRouteConfigs ===

impl HttpRouteConfigs {
    /// Every cluster referenced by any route, in derivation order
    /// (callers normalize).
    pub fn clusters(&self) -> Vec<Cluster> {
        let mut out = Vec::new();
        for config in self.0.values() {
            for vhost in &config.virtual_hosts {
                for route in &vhost.routes {
                    out.extend(route.clusters.iter().cloned());
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_controller_core::Protocol;

    fn mesh() -> MeshConfig {
        MeshConfig::default()
    }

    fn http_port() -> Port {
        Port {
            name: "http".into(),
            port: 80,
            protocol: Protocol::Http,
        }
    }

    #[test]
    fn outbound_cluster_name_carries_key() {
        let tags: Tags = "version=v1".parse().unwrap();
        let cluster = Cluster::outbound(
            "hello.default.svc.cluster.local",
            &http_port(),
            Some(&tags),
            &mesh(),
        );
        assert_eq!(
            cluster.name,
            "outbound:hello.default.svc.cluster.local|http|version=v1"
        );
        assert_eq!(
            cluster.service_name.as_deref(),
            Some("hello.default.svc.cluster.local|http|version=v1")
        );
        assert_eq!(cluster.cluster_type, ClusterType::Sds);
    }

    #[test]
    fn normalize_sorts_and_merges() {
        let port = http_port();
        let a = Cluster::outbound("b.default.svc.cluster.local", &port, None, &mesh());
        let b = Cluster::outbound("a.default.svc.cluster.local", &port, None, &mesh());
        let clusters = normalize(vec![a.clone(), b.clone(), a.clone()]);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].name, b.name);
        assert_eq!(clusters[1].name, a.name);
    }

    #[test]
    fn mutual_tls_attaches_ssl_context() {
        let mesh = MeshConfig {
            auth_policy: AuthPolicy::MutualTls,
            ..MeshConfig::default()
        };
        let mut cluster =
            Cluster::outbound("hello.default.svc.cluster.local", &http_port(), None, &mesh);
        cluster.apply_auth_policy(&mesh);
        let ssl = cluster.ssl_context.expect("ssl context");
        assert_eq!(ssl.cert_chain_file, "/etc/certs/cert-chain.pem");
    }

    #[test]
    fn serialized_cluster_omits_bookkeeping() {
        let cluster = Cluster::outbound(
            "hello.default.svc.cluster.local",
            &http_port(),
            None,
            &mesh(),
        );
        let json = serde_json::to_string(&cluster).unwrap();
        assert!(!json.contains("hostname"));
        assert!(!json.contains("tags"));
        assert!(!json.contains("hosts"));
    }
}
