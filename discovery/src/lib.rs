#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

//! The discovery side of the control plane: derives clusters and routes
//! from the registry view, serves them over HTTP to sidecar proxies, and
//! generates the bootstrap configuration supervised by the proxy agent.

pub mod cache;
mod config;
mod resources;
mod routes;
mod service;

pub use self::{
    config::{generate, ProxyConfig},
    resources::{
        normalize, Cluster, ClusterManager, HttpRouteConfig, HttpRouteConfigs, VirtualHost,
    },
    routes::{apply_destination_policies, build_outbound_http_routes},
    service::{DiscoveryService, DiscoveryServiceOptions},
};

use mesh_controller_core::{MeshConfig, RuleRegistry, ServiceDiscovery};
use std::{fmt, sync::Arc};

/// Everything needed to derive one proxy's configuration: the registry
/// view, the rule store, the mesh settings, and the proxy's own identity.
#[derive(Clone)]
pub struct ProxyContext {
    /// Interface for listing services and instances.
    pub discovery: Arc<dyn ServiceDiscovery>,

    /// Typed view of the traffic-management rules.
    pub config: RuleRegistry,

    /// Mesh-wide settings.
    pub mesh: Arc<MeshConfig>,

    /// IP address identifying the proxy and its co-located instances.
    pub ip_address: String,
}

impl fmt::Debug for ProxyContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyContext")
            .field("ip_address", &self.ip_address)
            .finish_non_exhaustive()
    }
}
