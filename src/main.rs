#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use mesh_controller::{
    agent::Agent,
    core::{
        config::default_kind_map,
        memory::{Registry, Seed},
        AuthPolicy, Controller, MeshConfig, RuleRegistry,
    },
    discovery::{DiscoveryService, DiscoveryServiceOptions, ProxyContext},
    Envoy, Watcher,
};
use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};
use tracing::info;

#[derive(Debug, Parser)]
#[clap(name = "mesh-controller", about = "Service mesh control plane")]
struct Args {
    #[clap(
        long,
        default_value = "mesh_controller=info,warn",
        env = "MESH_CONTROLLER_LOG"
    )]
    log_level: String,

    #[clap(long, value_enum, default_value = "plain")]
    log_format: LogFormat,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum LogFormat {
    Plain,
    Json,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Serve the discovery API.
    Discovery(DiscoveryArgs),

    /// Supervise a co-located sidecar proxy.
    Proxy(ProxyArgs),
}

#[derive(Debug, clap::Args)]
struct DiscoveryArgs {
    #[clap(long, default_value = "0.0.0.0:8080")]
    addr: SocketAddr,

    /// JSON file seeding the in-memory registry with services, instances,
    /// and rules.
    #[clap(long)]
    registry: Option<PathBuf>,

    #[clap(long)]
    disable_caching: bool,

    /// Expose the registry and rule stores under /debug.
    #[clap(long)]
    enable_debug: bool,

    #[clap(flatten)]
    mesh: MeshArgs,
}

#[derive(Debug, clap::Args)]
struct ProxyArgs {
    /// IP address identifying this proxy and its co-located instances.
    #[clap(long)]
    ip_address: String,

    #[clap(long, default_value = "/usr/local/bin/envoy")]
    binary_path: PathBuf,

    /// Directory holding the per-epoch proxy configuration files.
    #[clap(long, default_value = "/etc/envoy")]
    config_dir: PathBuf,

    /// JSON file seeding the in-memory registry.
    #[clap(long)]
    registry: Option<PathBuf>,

    #[clap(long, default_value = "10")]
    retry_budget: u32,

    #[clap(long, default_value = "100")]
    retry_base_delay_ms: u64,

    #[clap(flatten)]
    mesh: MeshArgs,
}

#[derive(Debug, clap::Args)]
struct MeshArgs {
    #[clap(long, default_value = "localhost:8080")]
    discovery_address: String,

    #[clap(long, default_value = "proxy")]
    service_cluster: String,

    #[clap(long, default_value = "45")]
    drain_duration_s: u64,

    #[clap(long, default_value = "60")]
    parent_shutdown_duration_s: u64,

    #[clap(long, default_value = "none")]
    auth_policy: AuthPolicy,

    #[clap(long, default_value = "/etc/certs")]
    auth_certs_path: String,
}

// === impl MeshArgs ===

impl MeshArgs {
    fn into_mesh(self) -> MeshConfig {
        MeshConfig {
            discovery_address: self.discovery_address,
            service_cluster: self.service_cluster,
            drain_duration: Duration::from_secs(self.drain_duration_s),
            parent_shutdown_duration: Duration::from_secs(self.parent_shutdown_duration_s),
            auth_policy: self.auth_policy,
            auth_certs_path: self.auth_certs_path,
            ..MeshConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level, args.log_format)?;

    let (signal, stop) = drain::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received; draining");
            signal.drain().await;
        }
    });

    match args.command {
        Command::Discovery(args) => run_discovery(args, stop).await,
        Command::Proxy(args) => run_proxy(args, stop).await,
    }
}

async fn run_discovery(args: DiscoveryArgs, stop: drain::Watch) -> Result<()> {
    let registry = Arc::new(Registry::new(default_kind_map()));
    seed_registry(&registry, args.registry.as_deref())?;

    let ds = DiscoveryService::new(
        DiscoveryServiceOptions {
            services: registry.clone(),
            config: RuleRegistry::new(registry.clone()),
            mesh: Arc::new(args.mesh.into_mesh()),
            enable_caching: !args.disable_caching,
            enable_debug: args.enable_debug,
        },
        registry.as_ref(),
    )?;

    let controller = registry.clone();
    let controller_task = {
        let stop = stop.clone();
        tokio::spawn(async move { controller.run(stop).await })
    };

    ds.serve(args.addr, stop)
        .await
        .context("discovery server failed")?;
    let _ = controller_task.await;
    Ok(())
}

async fn run_proxy(args: ProxyArgs, stop: drain::Watch) -> Result<()> {
    let registry = Arc::new(Registry::new(default_kind_map()));
    seed_registry(&registry, args.registry.as_deref())?;

    let mesh = Arc::new(args.mesh.into_mesh());
    let context = ProxyContext {
        discovery: registry.clone(),
        config: RuleRegistry::new(registry.clone()),
        mesh: mesh.clone(),
        ip_address: args.ip_address.clone(),
    };

    let envoy = Envoy::new(mesh, args.ip_address, args.binary_path, args.config_dir);
    let (agent, handle) = Agent::new(
        envoy,
        args.retry_budget,
        Duration::from_millis(args.retry_base_delay_ms),
    );

    let watcher = Watcher::new(context, registry, handle)?;
    watcher.run(agent, stop).await;
    Ok(())
}

fn seed_registry(registry: &Registry, path: Option<&std::path::Path>) -> Result<()> {
    let Some(path) = path else { return Ok(()) };
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read registry seed {}", path.display()))?;
    let seed: Seed = serde_json::from_slice(&data)
        .with_context(|| format!("failed to parse registry seed {}", path.display()))?;
    registry
        .apply_seed(seed)
        .context("failed to load registry seed")?;
    Ok(())
}

fn init_tracing(filter: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(filter).context("invalid log level")?;
    match format {
        LogFormat::Plain => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))?,
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {}", e))?,
    }
    Ok(())
}
