//! The discovery HTTP service: publishes endpoints (SDS), clusters (CDS),
//! and routes (RDS) derived from the registry view, with per-family
//! response caches invalidated on any registry or rule change.

use crate::{
    cache::{CacheStats, DiscoveryCache},
    resources::{normalize, ClusterManager},
    routes::{apply_destination_policies, build_outbound_http_routes},
    ProxyContext,
};
use bytes::Bytes;
use futures::future;
use hyper::{header, Body, Method, Request, Response, StatusCode};
use mesh_controller_core::{
    config::{DESTINATION_POLICY, ROUTE_RULE},
    parse_service_key,
    rules::{DestinationPolicy, RouteRule},
    Controller, Key, MeshConfig, RuleRegistry, Service, ServiceDiscovery, ServiceInstance,
};
use serde::Serialize;
use std::{collections::BTreeMap, net::SocketAddr, sync::Arc};
use tracing::{info, warn};

/// The SDS response body. The hosts field is always an array, never null.
#[derive(Serialize)]
struct Hosts {
    hosts: Vec<HostEntry>,
}

#[derive(Serialize)]
struct HostEntry {
    ip_address: String,
    port: u16,

    /// An integer in `[1, 100]`, or omitted.
    #[serde(skip_serializing_if = "Option::is_none")]
    load_balancing_weight: Option<u32>,
}

#[derive(Serialize)]
struct DiscoveryCacheStats {
    cache_stats: BTreeMap<String, CacheStats>,
}

#[derive(Serialize)]
struct RegistryDump {
    services: Vec<Service>,
    instances: Vec<ServiceInstance>,
}

#[derive(Serialize)]
struct ConfigDump {
    route_rules: Vec<(Key, RouteRule)>,
    ingress_rules: Vec<(Key, RouteRule)>,
    destination_policies: Vec<(Key, DestinationPolicy)>,
}

/// Options for creating a discovery service instance.
pub struct DiscoveryServiceOptions {
    pub services: Arc<dyn ServiceDiscovery>,
    pub config: RuleRegistry,
    pub mesh: Arc<MeshConfig>,
    pub enable_caching: bool,
    pub enable_debug: bool,
}

/// Publishes services, clusters, and routes for all proxies.
pub struct DiscoveryService {
    services: Arc<dyn ServiceDiscovery>,
    config: RuleRegistry,
    mesh: Arc<MeshConfig>,

    sds_cache: DiscoveryCache,
    cds_cache: DiscoveryCache,
    rds_cache: DiscoveryCache,

    enable_debug: bool,
}

// === impl DiscoveryService ===

impl DiscoveryService {
    /// Creates the service and installs cache invalidators with the
    /// controller: any service, instance, or rule change flushes all three
    /// caches. Over-invalidation is preferred to staleness.
    pub fn new(
        options: DiscoveryServiceOptions,
        controller: &dyn Controller,
    ) -> Result<Arc<Self>, mesh_controller_core::Error> {
        let ds = Arc::new(Self {
            services: options.services,
            config: options.config,
            mesh: options.mesh,
            sds_cache: DiscoveryCache::new(options.enable_caching),
            cds_cache: DiscoveryCache::new(options.enable_caching),
            rds_cache: DiscoveryCache::new(options.enable_caching),
            enable_debug: options.enable_debug,
        });

        {
            let ds = ds.clone();
            controller.append_service_handler(Box::new(move |_, _| ds.clear_cache()))?;
        }
        {
            let ds = ds.clone();
            controller.append_instance_handler(Box::new(move |_, _| ds.clear_cache()))?;
        }
        for kind in [ROUTE_RULE, DESTINATION_POLICY] {
            let ds = ds.clone();
            controller.append_config_handler(kind, Box::new(move |_, _, _| ds.clear_cache()))?;
        }

        Ok(ds)
    }

    /// Serves the discovery API until `stop` is signaled.
    pub async fn serve(
        self: Arc<Self>,
        addr: SocketAddr,
        stop: drain::Watch,
    ) -> Result<(), hyper::Error> {
        let ds = self;
        let server = hyper::server::Server::try_bind(&addr)?.serve(
            hyper::service::make_service_fn(move |_conn| {
                let ds = ds.clone();
                future::ok::<_, hyper::Error>(hyper::service::service_fn(
                    move |req: Request<Body>| future::ok::<_, hyper::Error>(ds.handle(req)),
                ))
            }),
        );
        info!(%addr, "discovery service listening");
        server
            .with_graceful_shutdown(async move {
                let _ = stop.signaled().await;
            })
            .await
    }

    /// Routes one request. All computation is synchronous over in-memory
    /// snapshots.
    pub fn handle(&self, req: Request<Body>) -> Response<Body> {
        let url = req.uri().to_string();
        let path = req.uri().path().to_string();
        let segments = path.trim_start_matches('/').split('/').collect::<Vec<_>>();

        match (req.method(), segments.as_slice()) {
            (&Method::GET, ["v1", "registration", service_key]) => {
                self.list_endpoints(&url, service_key)
            }
            (&Method::GET, ["v1", "clusters", service_cluster, service_node]) => {
                self.list_clusters(&url, service_cluster, service_node)
            }
            (&Method::GET, ["v1", "routes", route_config_name, service_cluster, service_node]) => {
                self.list_routes(&url, route_config_name, service_cluster, service_node)
            }
            (&Method::GET, ["cache_stats"]) => self.get_cache_stats(),
            (&Method::POST, ["cache_stats_delete"]) => {
                self.clear_cache_stats();
                Response::new(Body::empty())
            }
            (&Method::GET, ["debug", "registryz"]) if self.enable_debug => self.debug_registry(),
            (&Method::GET, ["debug", "configz"]) if self.enable_debug => self.debug_config(),
            _ => error_response(StatusCode::NOT_FOUND, format!("no route for {}", path)),
        }
    }

    /// Responds to SDS requests. The service-key path segment arrives
    /// percent-encoded since its section separator is not a URI character.
    fn list_endpoints(&self, key: &str, service_key: &str) -> Response<Body> {
        if let Some(data) = self.sds_cache.cached_response(key) {
            return json_response(data);
        }

        let (hostname, ports, tags) = parse_service_key(&percent_decode(service_key));
        let hosts = self
            .services
            .instances(&hostname, &ports, &tags)
            .into_iter()
            .map(|instance| HostEntry {
                ip_address: instance.endpoint.address,
                port: instance.endpoint.port,
                load_balancing_weight: None,
            })
            .collect::<Vec<_>>();

        match to_json(&Hosts { hosts }) {
            Ok(data) => {
                self.sds_cache.update_cached_response(key, data.clone());
                json_response(data)
            }
            Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
        }
    }

    /// Responds to CDS requests for all outbound clusters of one proxy
    /// node.
    fn list_clusters(
        &self,
        key: &str,
        service_cluster: &str,
        service_node: &str,
    ) -> Response<Body> {
        if let Some(data) = self.cds_cache.cached_response(key) {
            return json_response(data);
        }

        if service_cluster != self.mesh.service_cluster {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("Unexpected service-cluster {:?}", service_cluster),
            );
        }

        // CDS computes the clusters referenced by the proxy's outbound
        // routes, so the route derivation runs here as well.
        let ctx = self.proxy_context(service_node);
        let route_configs = self.outbound_routes(&ctx);

        let mut clusters = normalize(route_configs.clusters());
        apply_destination_policies(&mut clusters, &self.config);
        for cluster in &mut clusters {
            cluster.apply_auth_policy(&self.mesh);
        }

        match to_json(&ClusterManager {
            clusters,
            sds: None,
        }) {
            Ok(data) => {
                self.cds_cache.update_cached_response(key, data.clone());
                json_response(data)
            }
            Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
        }
    }

    /// Responds to RDS requests. The route-config name is the listener
    /// port; the service-node value holds the proxy identity.
    fn list_routes(
        &self,
        key: &str,
        route_config_name: &str,
        service_cluster: &str,
        service_node: &str,
    ) -> Response<Body> {
        if let Some(data) = self.rds_cache.cached_response(key) {
            return json_response(data);
        }

        if service_cluster != self.mesh.service_cluster {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("Unexpected service-cluster {:?}", service_cluster),
            );
        }

        let port: u16 = match route_config_name.parse() {
            Ok(port) => port,
            Err(_) => {
                return error_response(
                    StatusCode::NOT_FOUND,
                    format!("Unexpected route-config-name {:?}", route_config_name),
                );
            }
        };

        let ctx = self.proxy_context(service_node);
        let route_configs = self.outbound_routes(&ctx);
        let Some(route_config) = route_configs.0.get(&port) else {
            return error_response(
                StatusCode::NOT_FOUND,
                format!("Missing route config for port {}", port),
            );
        };

        match to_json(route_config) {
            Ok(data) => {
                self.rds_cache.update_cached_response(key, data.clone());
                json_response(data)
            }
            Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
        }
    }

    fn get_cache_stats(&self) -> Response<Body> {
        let mut stats = self.sds_cache.stats();
        stats.extend(self.cds_cache.stats());
        stats.extend(self.rds_cache.stats());
        match to_json(&DiscoveryCacheStats { cache_stats: stats }) {
            Ok(data) => json_response(data),
            Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
        }
    }

    fn clear_cache_stats(&self) {
        self.sds_cache.reset_stats();
        self.cds_cache.reset_stats();
        self.rds_cache.reset_stats();
    }

    /// Flushes all cached responses; keys and statistics are retained.
    pub fn clear_cache(&self) {
        info!("cleared discovery service cache");
        self.sds_cache.clear();
        self.cds_cache.clear();
        self.rds_cache.clear();
    }

    fn debug_registry(&self) -> Response<Body> {
        let services = self.services.services();
        let mut instances = Vec::new();
        for service in &services {
            instances.extend(
                self.services
                    .instances(&service.hostname, &[], &Vec::new()),
            );
        }
        match to_json(&RegistryDump {
            services,
            instances,
        }) {
            Ok(data) => json_response(data),
            Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
        }
    }

    fn debug_config(&self) -> Response<Body> {
        match to_json(&ConfigDump {
            route_rules: self.config.route_rules(),
            ingress_rules: self.config.ingress_rules(),
            destination_policies: self.config.policies(),
        }) {
            Ok(data) => json_response(data),
            Err(error) => error_response(StatusCode::INTERNAL_SERVER_ERROR, error.to_string()),
        }
    }

    fn proxy_context(&self, ip_address: &str) -> ProxyContext {
        ProxyContext {
            discovery: self.services.clone(),
            config: self.config.clone(),
            mesh: self.mesh.clone(),
            ip_address: ip_address.to_string(),
        }
    }

    fn outbound_routes(&self, ctx: &ProxyContext) -> crate::resources::HttpRouteConfigs {
        let addrs = [ctx.ip_address.clone()].into_iter().collect();
        let instances = self.services.host_instances(&addrs);
        let services = self.services.services();
        build_outbound_http_routes(&instances, &services, ctx)
    }
}

/// Minimal percent-decoding for path segments; malformed escapes pass
/// through unchanged.
fn percent_decode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '%' {
            let hex: String = chars.by_ref().take(2).collect();
            if hex.len() == 2 {
                if let Ok(byte) = u8::from_str_radix(&hex, 16) {
                    out.push(byte as char);
                    continue;
                }
            }
            out.push('%');
            out.push_str(&hex);
        } else {
            out.push(c);
        }
    }
    out
}

fn to_json<T: Serialize>(value: &T) -> Result<Bytes, serde_json::Error> {
    serde_json::to_vec_pretty(value).map(Bytes::from)
}

fn json_response(data: Bytes) -> Response<Body> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(data))
        .unwrap()
}

fn error_response(status: StatusCode, message: String) -> Response<Body> {
    warn!(%status, %message, "discovery request failed");
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain")
        .body(Body::from(message))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mesh_controller_core::{
        config::default_kind_map,
        memory::Registry,
        rules::{DestinationWeight, RouteRule, SimpleCircuitBreakerPolicy},
        NetworkEndpoint, Port, Protocol, Tags,
    };
    use serde_json::Value;

    const HELLO: &str = "hello.default.svc.cluster.local";
    const WORLD: &str = "world.default.svc.cluster.local";
    const NODE_V0: &str = "10.1.1.0";
    const NODE_V1: &str = "10.1.1.1";

    fn http_port() -> Port {
        Port {
            name: "http".into(),
            port: 80,
            protocol: Protocol::Http,
        }
    }

    fn mk_service(hostname: &str) -> Service {
        Service {
            hostname: hostname.into(),
            address: None,
            ports: vec![http_port()],
        }
    }

    fn mk_instance(hostname: &str, address: &str, port: u16, version: &str) -> ServiceInstance {
        ServiceInstance {
            endpoint: NetworkEndpoint {
                address: address.into(),
                port,
                service_port: http_port(),
            },
            service: mk_service(hostname),
            tags: format!("version={}", version).parse().unwrap(),
        }
    }

    fn mk_registry() -> Arc<Registry> {
        let registry = Arc::new(Registry::new(default_kind_map()));
        registry.add_service(mk_service(HELLO)).unwrap();
        registry.add_service(mk_service(WORLD)).unwrap();
        registry
            .add_instance(mk_instance(HELLO, NODE_V0, 80, "v0"))
            .unwrap();
        registry
            .add_instance(mk_instance(HELLO, NODE_V1, 80, "v1"))
            .unwrap();
        registry
            .add_instance(mk_instance(WORLD, "10.1.2.0", 80, "v0"))
            .unwrap();
        registry
            .add_instance(mk_instance(WORLD, "10.1.2.1", 80, "v1"))
            .unwrap();
        registry
    }

    fn mk_discovery(registry: &Arc<Registry>) -> Arc<DiscoveryService> {
        let store: Arc<dyn mesh_controller_core::ConfigStore> = registry.clone();
        DiscoveryService::new(
            DiscoveryServiceOptions {
                services: registry.clone(),
                config: RuleRegistry::new(store),
                mesh: Arc::new(MeshConfig::default()),
                enable_caching: true,
                enable_debug: true,
            },
            registry.as_ref(),
        )
        .expect("handlers register")
    }

    fn get(ds: &DiscoveryService, url: &str) -> Response<Body> {
        let req = Request::builder().uri(url).body(Body::empty()).unwrap();
        ds.handle(req)
    }

    fn post(ds: &DiscoveryService, url: &str) -> Response<Body> {
        let req = Request::builder()
            .method(Method::POST)
            .uri(url)
            .body(Body::empty())
            .unwrap();
        ds.handle(req)
    }

    async fn body_bytes(rsp: Response<Body>) -> Bytes {
        hyper::body::to_bytes(rsp.into_body()).await.unwrap()
    }

    async fn body_json(rsp: Response<Body>) -> Value {
        serde_json::from_slice(&body_bytes(rsp).await).unwrap()
    }

    #[tokio::test]
    async fn sds_lists_all_instances() {
        let registry = mk_registry();
        let ds = mk_discovery(&registry);

        let url = format!("/v1/registration/{}%7Chttp", HELLO);
        let rsp = get(&ds, &url);
        assert_eq!(rsp.status(), StatusCode::OK);

        let body = body_json(rsp).await;
        let hosts = body["hosts"].as_array().unwrap();
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts[0]["ip_address"], NODE_V0);
        assert_eq!(hosts[0]["port"], 80);
        assert_eq!(hosts[1]["ip_address"], NODE_V1);
    }

    #[tokio::test]
    async fn sds_applies_tag_selector() {
        let registry = mk_registry();
        let ds = mk_discovery(&registry);

        let url = format!("/v1/registration/{}%7Chttp%7Cversion=v1", HELLO);
        let body = body_json(get(&ds, &url)).await;
        let hosts = body["hosts"].as_array().unwrap();
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts[0]["ip_address"], NODE_V1);
    }

    #[tokio::test]
    async fn sds_unknown_service_yields_empty_array() {
        let registry = mk_registry();
        let ds = mk_discovery(&registry);

        let rsp = get(&ds, "/v1/registration/nonexistent");
        assert_eq!(rsp.status(), StatusCode::OK);
        let raw = body_bytes(rsp).await;
        let text = std::str::from_utf8(&raw).unwrap();
        assert!(text.contains("\"hosts\": []"), "{}", text);
    }

    #[tokio::test]
    async fn cds_returns_normalized_clusters() {
        let registry = mk_registry();
        let ds = mk_discovery(&registry);

        let url = format!("/v1/clusters/proxy/{}", NODE_V0);
        let body = body_json(get(&ds, &url)).await;
        let clusters = body["clusters"].as_array().unwrap();
        let names = clusters
            .iter()
            .map(|c| c["name"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            vec![
                format!("outbound:{}|http", HELLO),
                format!("outbound:{}|http", WORLD),
            ]
        );
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted, "clusters must be in stable name order");
    }

    #[tokio::test]
    async fn cds_rejects_unknown_service_cluster() {
        let registry = mk_registry();
        let ds = mk_discovery(&registry);

        let url = format!("/v1/clusters/other/{}", NODE_V0);
        let rsp = get(&ds, &url);
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
        let raw = body_bytes(rsp).await;
        assert!(std::str::from_utf8(&raw)
            .unwrap()
            .contains("Unexpected service-cluster"));
    }

    #[tokio::test]
    async fn cds_applies_circuit_breaker_policy() {
        let registry = mk_registry();
        let key = Key {
            kind: "destination-policy".into(),
            name: "hello-cb".into(),
            namespace: "default".into(),
        };
        let policy = mesh_controller_core::ConfigValue::DestinationPolicy(DestinationPolicy {
            destination: HELLO.into(),
            circuit_breaker: Some(mesh_controller_core::rules::CircuitBreaker {
                simple_cb: Some(SimpleCircuitBreakerPolicy {
                    max_connections: 100,
                    http_consecutive_errors: 5,
                    http_detection_interval_seconds: 10.0,
                    http_max_ejection_percent: 50,
                    ..Default::default()
                }),
            }),
            ..Default::default()
        });
        use mesh_controller_core::ConfigStore;
        registry.post(key, policy).unwrap();

        let ds = mk_discovery(&registry);
        let url = format!("/v1/clusters/proxy/{}", NODE_V0);
        let body = body_json(get(&ds, &url)).await;
        let hello = &body["clusters"][0];
        assert_eq!(hello["circuit_breakers"]["default"]["max_connections"], 100);
        assert_eq!(hello["outlier_detection"]["consecutive_5xx"], 5);
        assert_eq!(hello["outlier_detection"]["interval_ms"], 10_000);
        assert_eq!(hello["outlier_detection"]["max_ejection_percent"], 50);
    }

    #[tokio::test]
    async fn rds_selects_route_config_by_port() {
        let registry = mk_registry();
        let ds = mk_discovery(&registry);

        let url = format!("/v1/routes/80/proxy/{}", NODE_V0);
        let body = body_json(get(&ds, &url)).await;
        let vhosts = body["virtual_hosts"].as_array().unwrap();
        assert_eq!(vhosts.len(), 2);
        assert_eq!(vhosts[0]["name"], format!("{}:80", HELLO));
        assert_eq!(vhosts[1]["name"], format!("{}:80", WORLD));

        let missing = get(&ds, &format!("/v1/routes/81/proxy/{}", NODE_V0));
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rds_rejects_bad_route_config_name() {
        let registry = mk_registry();
        let ds = mk_discovery(&registry);

        let rsp = get(&ds, &format!("/v1/routes/notanumber/proxy/{}", NODE_V0));
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn rds_renders_weighted_routes() {
        let registry = mk_registry();
        let key = Key {
            kind: "route-rule".into(),
            name: "hello-split".into(),
            namespace: "default".into(),
        };
        let rule = mesh_controller_core::ConfigValue::RouteRule(RouteRule {
            destination: HELLO.into(),
            route: vec![
                DestinationWeight {
                    tags: "version=v0".parse::<Tags>().unwrap(),
                    weight: 25,
                    ..Default::default()
                },
                DestinationWeight {
                    tags: "version=v1".parse::<Tags>().unwrap(),
                    weight: 75,
                    ..Default::default()
                },
            ],
            ..Default::default()
        });
        use mesh_controller_core::ConfigStore;
        registry.post(key, rule).unwrap();

        let ds = mk_discovery(&registry);
        let body = body_json(get(&ds, &format!("/v1/routes/80/proxy/{}", NODE_V0))).await;
        let routes = body["virtual_hosts"][0]["routes"].as_array().unwrap();
        // The weighted rule, then the catch-all default.
        assert_eq!(routes.len(), 2);
        let weighted = routes[0]["weighted_clusters"]["clusters"].as_array().unwrap();
        assert_eq!(weighted.len(), 2);
        assert_eq!(weighted[0]["weight"], 25);
        assert_eq!(weighted[1]["weight"], 75);
        assert_eq!(routes[1]["prefix"], "/");

        // The weighted clusters also surface through CDS.
        let cds = body_json(get(&ds, &format!("/v1/clusters/proxy/{}", NODE_V0))).await;
        let names = cds["clusters"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["name"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert!(names.contains(&format!("outbound:{}|http|version=v0", HELLO)));
        assert!(names.contains(&format!("outbound:{}|http|version=v1", HELLO)));
    }

    #[tokio::test]
    async fn responses_are_byte_identical() {
        let registry = mk_registry();
        let ds = mk_discovery(&registry);

        for url in [
            format!("/v1/registration/{}%7Chttp", HELLO),
            format!("/v1/clusters/proxy/{}", NODE_V0),
            format!("/v1/routes/80/proxy/{}", NODE_V0),
        ] {
            let first = body_bytes(get(&ds, &url)).await;
            let second = body_bytes(get(&ds, &url)).await;
            assert_eq!(first, second, "{}", url);

            ds.clear_cache();
            let recomputed = body_bytes(get(&ds, &url)).await;
            assert_eq!(first, recomputed, "{}", url);
        }
    }

    #[tokio::test]
    async fn cache_lifecycle() {
        let registry = mk_registry();
        let ds = mk_discovery(&registry);

        let urls = [
            format!("/v1/registration/{}%7Chttp", HELLO),
            format!("/v1/clusters/proxy/{}", NODE_V0),
            format!("/v1/routes/80/proxy/{}", NODE_V0),
        ];

        // Fresh service: no keys at all.
        let stats = body_json(get(&ds, "/cache_stats")).await;
        assert_eq!(stats["cache_stats"].as_object().unwrap().len(), 0);

        // One query each: three cold entries.
        for url in &urls {
            get(&ds, url);
        }
        let stats = body_json(get(&ds, "/cache_stats")).await;
        for url in &urls {
            assert_eq!(stats["cache_stats"][url]["miss"], 1, "{}", url);
            assert_eq!(stats["cache_stats"][url]["hit"], 0, "{}", url);
        }

        // Again: all hits.
        for url in &urls {
            get(&ds, url);
        }
        let stats = body_json(get(&ds, "/cache_stats")).await;
        for url in &urls {
            assert_eq!(stats["cache_stats"][url]["hit"], 1, "{}", url);
        }

        // Clearing keeps entries; the next read refills.
        ds.clear_cache();
        for url in &urls {
            get(&ds, url);
        }
        let stats = body_json(get(&ds, "/cache_stats")).await;
        for url in &urls {
            assert_eq!(stats["cache_stats"][url]["miss"], 2, "{}", url);
            assert_eq!(stats["cache_stats"][url]["hit"], 1, "{}", url);
        }

        // Deleting stats zeroes the counters.
        post(&ds, "/cache_stats_delete");
        let stats = body_json(get(&ds, "/cache_stats")).await;
        for url in &urls {
            assert_eq!(stats["cache_stats"][url]["miss"], 0, "{}", url);
            assert_eq!(stats["cache_stats"][url]["hit"], 0, "{}", url);
        }
    }

    #[tokio::test]
    async fn change_notification_clears_cache() {
        let registry = mk_registry();
        let ds = mk_discovery(&registry);

        let url = format!("/v1/registration/{}%7Chttp", HELLO);
        get(&ds, &url);
        get(&ds, &url);

        let (signal, watch) = drain::channel();
        let ctl = registry.clone();
        let task = tokio::spawn(async move { ctl.run(watch).await });

        registry
            .add_instance(mk_instance(HELLO, "10.1.1.7", 80, "v2"))
            .unwrap();

        // The instance handler flushes all caches once the event is
        // delivered; the next read recomputes.
        loop {
            get(&ds, &url);
            let stats = body_json(get(&ds, "/cache_stats")).await;
            if stats["cache_stats"][&url]["miss"] == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }

        signal.drain().await;
        task.await.unwrap();
    }

    #[tokio::test]
    async fn debug_routes_require_flag() {
        let registry = mk_registry();
        let ds = mk_discovery(&registry);

        let rsp = get(&ds, "/debug/registryz");
        assert_eq!(rsp.status(), StatusCode::OK);
        let body = body_json(rsp).await;
        assert_eq!(body["services"].as_array().unwrap().len(), 2);

        let store: Arc<dyn mesh_controller_core::ConfigStore> = registry.clone();
        let without_debug = DiscoveryService::new(
            DiscoveryServiceOptions {
                services: registry.clone(),
                config: RuleRegistry::new(store),
                mesh: Arc::new(MeshConfig::default()),
                enable_caching: true,
                enable_debug: false,
            },
            registry.as_ref(),
        )
        .unwrap();
        let rsp = get(&without_debug, "/debug/registryz");
        assert_eq!(rsp.status(), StatusCode::NOT_FOUND);
    }
}
