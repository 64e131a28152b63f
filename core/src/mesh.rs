use std::{fmt, str::FromStr, time::Duration};

/// Mesh-wide settings supplied to the discovery service and the sidecar
/// watcher at construction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshConfig {
    /// Address of the discovery service, as reachable from sidecars.
    pub discovery_address: String,

    /// Refresh interval sidecars use when polling discovery.
    pub discovery_refresh_delay: Duration,

    /// The service-cluster identity every proxy in this mesh presents.
    pub service_cluster: String,

    /// How long a retiring proxy keeps draining open connections.
    pub drain_duration: Duration,

    /// How long a superseded proxy lingers before exiting on its own.
    pub parent_shutdown_duration: Duration,

    /// Upstream connect timeout applied to derived clusters.
    pub connect_timeout: Duration,

    pub auth_policy: AuthPolicy,

    /// Directory holding the workload certificates used when mutual TLS is
    /// enabled.
    pub auth_certs_path: String,

    pub access_log_path: String,

    /// Local admin port of the supervised proxy.
    pub proxy_admin_port: u16,
}

/// Authentication posture between sidecars.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AuthPolicy {
    #[default]
    None,
    MutualTls,
}

// === impl MeshConfig ===

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            discovery_address: "localhost:8080".to_string(),
            discovery_refresh_delay: Duration::from_secs(1),
            service_cluster: "proxy".to_string(),
            drain_duration: Duration::from_secs(45),
            parent_shutdown_duration: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(1),
            auth_policy: AuthPolicy::None,
            auth_certs_path: "/etc/certs".to_string(),
            access_log_path: "/dev/stdout".to_string(),
            proxy_admin_port: 15000,
        }
    }
}

// === impl AuthPolicy ===

impl FromStr for AuthPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(AuthPolicy::None),
            "mutual-tls" => Ok(AuthPolicy::MutualTls),
            other => Err(format!(
                "invalid auth policy {:?} (expected `none` or `mutual-tls`)",
                other
            )),
        }
    }
}

impl fmt::Display for AuthPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthPolicy::None => "none".fmt(f),
            AuthPolicy::MutualTls => "mutual-tls".fmt(f),
        }
    }
}
