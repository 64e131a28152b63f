//! Generates the bootstrap configuration handed to a supervised proxy.
//!
//! The output is a pure function of the registry view, the rule store, and
//! the proxy identity: the watcher compares successive values structurally
//! to decide whether a hot restart is warranted, so generation must be
//! deterministic.

use crate::{
    resources::{
        normalize, Cluster, ClusterManager, ClusterType, HttpRoute, HttpRouteConfig, LbType,
        SdsBootstrap, VirtualHost,
    },
    routes::{apply_destination_policies, build_outbound_http_routes},
    ProxyContext,
};
use ahash::AHashSet;
use mesh_controller_core::{MeshConfig, Tags};
use serde::Serialize;
use std::{io, path::Path};

/// The root configuration of one supervised proxy.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ProxyConfig {
    pub admin: Admin,
    pub listeners: Vec<Listener>,
    pub cluster_manager: ClusterManager,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Admin {
    pub access_log_path: String,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Listener {
    pub address: String,
    pub filters: Vec<NetworkFilter>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NetworkFilter {
    #[serde(rename = "type")]
    pub filter_type: &'static str,
    pub name: &'static str,
    pub config: HttpConnectionManager,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HttpConnectionManager {
    pub codec_type: &'static str,
    pub stat_prefix: &'static str,
    pub access_log: Vec<AccessLog>,
    pub route_config: HttpRouteConfig,
    pub filters: Vec<HttpFilter>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AccessLog {
    pub path: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HttpFilter {
    #[serde(rename = "type")]
    pub filter_type: &'static str,
    pub name: &'static str,
    pub config: RouterConfig,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RouterConfig {}

// === impl ProxyConfig ===

impl ProxyConfig {
    /// Canonical serialized form: two-space indented JSON.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    /// Writes the serialized configuration to the epoch file consumed by
    /// the proxy on start.
    pub async fn write_file(&self, path: &Path) -> io::Result<()> {
        let data = self
            .to_json()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tokio::fs::write(path, data).await
    }
}

/// Derives the full proxy configuration for the node identified by
/// `ctx.ip_address`.
pub fn generate(ctx: &ProxyContext) -> ProxyConfig {
    let addrs: AHashSet<String> = [ctx.ip_address.clone()].into_iter().collect();
    let instances = ctx.discovery.host_instances(&addrs);
    let services = ctx.discovery.services();

    let route_configs = build_outbound_http_routes(&instances, &services, ctx);

    let mut clusters = normalize(route_configs.clusters());
    apply_destination_policies(&mut clusters, &ctx.config);
    for cluster in &mut clusters {
        cluster.apply_auth_policy(&ctx.mesh);
    }

    let mut listeners = Vec::new();
    for (port, config) in &route_configs.0 {
        listeners.push(Listener {
            address: format!("tcp://0.0.0.0:{}", port),
            filters: vec![http_connection_manager(config.clone(), &ctx.mesh)],
        });
    }

    // Inbound traffic for co-located workloads terminates on the loopback.
    for instance in &instances {
        if !instance.endpoint.service_port.protocol.is_http() {
            continue;
        }
        let cluster = Cluster::inbound(instance.endpoint.port, &ctx.mesh);
        let route_config = HttpRouteConfig {
            virtual_hosts: vec![VirtualHost {
                name: cluster.name.clone(),
                domains: vec!["*".to_string()],
                routes: vec![HttpRoute {
                    prefix: Some("/".to_string()),
                    cluster: Some(cluster.name.clone()),
                    ..HttpRoute::default()
                }],
            }],
        };
        listeners.push(Listener {
            address: format!(
                "tcp://{}:{}",
                instance.endpoint.address, instance.endpoint.port
            ),
            filters: vec![http_connection_manager(route_config, &ctx.mesh)],
        });
        clusters.push(cluster);
    }

    listeners.sort_by(|a, b| a.address.cmp(&b.address));
    let clusters = normalize(clusters);

    ProxyConfig {
        admin: Admin {
            access_log_path: ctx.mesh.access_log_path.clone(),
            address: format!("tcp://127.0.0.1:{}", ctx.mesh.proxy_admin_port),
        },
        listeners,
        cluster_manager: ClusterManager {
            clusters,
            sds: Some(SdsBootstrap {
                cluster: sds_cluster(&ctx.mesh),
                refresh_delay_ms: ctx.mesh.discovery_refresh_delay.as_millis() as u64,
            }),
        },
    }
}

fn http_connection_manager(route_config: HttpRouteConfig, mesh: &MeshConfig) -> NetworkFilter {
    NetworkFilter {
        filter_type: "read",
        name: "http_connection_manager",
        config: HttpConnectionManager {
            codec_type: "auto",
            stat_prefix: "http",
            access_log: vec![AccessLog {
                path: mesh.access_log_path.clone(),
            }],
            route_config,
            filters: vec![HttpFilter {
                filter_type: "decoder",
                name: "router",
                config: RouterConfig::default(),
            }],
        },
    }
}

fn sds_cluster(mesh: &MeshConfig) -> Cluster {
    Cluster {
        name: "sds".to_string(),
        service_name: None,
        connect_timeout_ms: mesh.connect_timeout.as_millis() as u64,
        cluster_type: ClusterType::StrictDns,
        lb_type: LbType::RoundRobin,
        hosts: vec![crate::resources::Host {
            url: format!("tcp://{}", mesh.discovery_address),
        }],
        max_requests_per_connection: None,
        circuit_breakers: None,
        outlier_detection: None,
        ssl_context: None,
        hostname: String::new(),
        tags: Tags::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_controller_core::{
        config::default_kind_map, memory::Registry, NetworkEndpoint, Port, Protocol, RuleRegistry,
        Service, ServiceInstance,
    };
    use std::sync::Arc;

    fn http_port() -> Port {
        Port {
            name: "http".into(),
            port: 80,
            protocol: Protocol::Http,
        }
    }

    fn mk_context() -> ProxyContext {
        let registry = Arc::new(Registry::new(default_kind_map()));
        let service = Service {
            hostname: "hello.default.svc.cluster.local".into(),
            address: None,
            ports: vec![http_port()],
        };
        registry.add_service(service.clone()).unwrap();
        registry
            .add_instance(ServiceInstance {
                endpoint: NetworkEndpoint {
                    address: "10.1.1.0".into(),
                    port: 8080,
                    service_port: http_port(),
                },
                service,
                tags: Tags::default(),
            })
            .unwrap();
        ProxyContext {
            discovery: registry.clone(),
            config: RuleRegistry::new(registry),
            mesh: Arc::new(MeshConfig::default()),
            ip_address: "10.1.1.0".to_string(),
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let ctx = mk_context();
        let first = generate(&ctx);
        let second = generate(&ctx);
        assert_eq!(first, second);
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    }

    #[test]
    fn generates_inbound_and_outbound_listeners() {
        let config = generate(&mk_context());
        let addresses = config
            .listeners
            .iter()
            .map(|l| l.address.as_str())
            .collect::<Vec<_>>();
        assert_eq!(addresses, vec!["tcp://0.0.0.0:80", "tcp://10.1.1.0:8080"]);

        let names = config
            .cluster_manager
            .clusters
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                "inbound:8080",
                "outbound:hello.default.svc.cluster.local|http",
            ]
        );
        assert!(config.cluster_manager.sds.is_some());
    }

    #[tokio::test]
    async fn write_file_round_trips_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("envoy-rev0.json");

        let config = generate(&mk_context());
        config.write_file(&path).await.unwrap();

        let written = tokio::fs::read(&path).await.unwrap();
        assert_eq!(written, config.to_json().unwrap());
    }
}
