//! Lodestar Agent
//!
//! Registers an endpoint and/or watches a path against etcd, logging every
//! discovery change until interrupted.

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use lodestar::observability::{init_tracing, metrics, TracingConfig};
use lodestar::{
    CoordinationStore, Discover, DiscoverOption, EtcdStore, LodestarConfig, MemoryStore,
    Register, RegisterOption,
};
use lodestar_core::Endpoint;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "lodestar-agent")]
#[command(about = "Register endpoints and watch service paths")]
struct Cli {
    /// etcd endpoints (comma-separated)
    #[arg(long, env = "ETCD_ENDPOINTS", global = true)]
    etcd_endpoints: Option<String>,

    /// Use an in-process store instead of etcd
    #[arg(long, global = true)]
    in_memory: bool,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "METRICS_ADDR", global = true)]
    metrics_addr: Option<SocketAddr>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an endpoint and keep its lease alive
    Register(RegisterArgs),
    /// Watch a path and log discovery changes
    Watch {
        /// Path to watch
        path: String,
        /// Watch every key under the path
        #[arg(long)]
        prefix: bool,
    },
    /// Register an endpoint and watch its path in one process
    Demo(RegisterArgs),
}

#[derive(Args)]
struct RegisterArgs {
    /// Path to register under
    path: String,
    #[arg(long)]
    host: String,
    #[arg(long, default_value_t = 0)]
    grpc_port: u16,
    #[arg(long, default_value_t = 0)]
    http_port: u16,
    #[arg(long, default_value = "")]
    domain: String,
    /// Register as one of several instances under the path
    #[arg(long)]
    multi: bool,
    /// Lease TTL in seconds
    #[arg(long, env = "LEASE_TTL")]
    ttl: Option<i64>,
}

impl RegisterArgs {
    fn option(&self) -> RegisterOption {
        let endpoint = Endpoint {
            host_name: self.host.clone(),
            grpc_port: self.grpc_port,
            http_port: self.http_port,
            domain: self.domain.clone(),
            ..Default::default()
        };
        let option = RegisterOption::new(&self.path, endpoint).multi(self.multi);
        match self.ttl {
            Some(ttl) => option.ttl(ttl),
            None => option,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(TracingConfig::from_env())
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    if let Some(addr) = cli.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install Prometheus exporter")?;
        metrics::describe_metrics();
        info!(addr = %addr, "Serving metrics");
    }

    let mut config = LodestarConfig::from_env();
    if let Some(endpoints) = &cli.etcd_endpoints {
        config.etcd_endpoints = endpoints.split(',').map(|s| s.trim().to_string()).collect();
    }

    let store: Arc<dyn CoordinationStore> = if cli.in_memory {
        info!("Using in-memory store");
        Arc::new(MemoryStore::new())
    } else {
        info!(endpoints = ?config.etcd_endpoints, "Connecting to etcd");
        Arc::new(
            EtcdStore::connect(&config)
                .await
                .context("failed to connect to etcd")?,
        )
    };

    let register = Register::from_config(store.clone(), &config);
    let discover = Discover::from_config(store, &config);

    match &cli.command {
        Commands::Register(args) => {
            register.append(args.option()).await?;
        }
        Commands::Watch { path, prefix } => {
            discover.append(watch_option(path, *prefix)).await?;
        }
        Commands::Demo(args) => {
            discover.append(watch_option(&args.path, true)).await?;
            register.append(args.option()).await?;
        }
    }

    info!("Running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    info!("Shutting down");
    register.stop_all().await;
    discover.stop_all().await;
    Ok(())
}

fn watch_option(path: &str, prefix: bool) -> DiscoverOption {
    DiscoverOption::new(path)
        .prefix(prefix)
        .on_put(|key, _, state| {
            let endpoint = match state.children().and_then(|c| c.get(key)) {
                Some(child) => child.data(),
                None => state.data(),
            };
            if let Some(endpoint) = endpoint {
                info!(key = %key, grpc = %endpoint.grpc_addr(), http = %endpoint.http_base_url(), "Endpoint up");
            }
        })
        .on_del(|key, _, state| {
            let remaining = state.children().map_or(0, |c| c.count());
            info!(key = %key, remaining = remaining, "Endpoint down");
        })
}
