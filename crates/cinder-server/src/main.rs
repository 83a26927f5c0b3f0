mod bus;
mod config;

use std::path::PathBuf;
use std::time::Instant;

use cinder_cluster::ClusterState;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use crate::bus::Bootstrap;
use crate::config::ServerConfig;

#[derive(Parser)]
#[command(name = "cinder-server", about = "cinder cluster bus node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "CINDER_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind the bus listener to
    #[arg(long, env = "CINDER_HOST")]
    host: Option<String>,

    /// client port; the bus listens at port + bus offset
    #[arg(short, long, env = "CINDER_PORT")]
    port: Option<u16>,

    /// offset from the client port to the bus port
    #[arg(long, env = "CINDER_BUS_PORT_OFFSET")]
    bus_port_offset: Option<u16>,

    /// ip advertised to other nodes
    #[arg(long, env = "CINDER_ANNOUNCE_IP")]
    announce_ip: Option<String>,

    /// fixed node name (40 hex characters)
    #[arg(long, env = "CINDER_NODE_NAME")]
    node_name: Option<String>,

    /// bootstrap a new cluster as a single node owning all 16384 slots
    #[arg(long, env = "CINDER_BOOTSTRAP")]
    bootstrap: bool,

    /// slot ranges to serve at startup, e.g. 0-5460 (repeatable)
    #[arg(long = "slots", env = "CINDER_SLOTS", value_delimiter = ',')]
    slots: Vec<String>,

    /// client address of a node to meet at startup (repeatable)
    #[arg(long = "seed", env = "CINDER_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,

    /// name of the master to replicate once it is known
    #[arg(long, env = "CINDER_REPLICATE_OF")]
    replicate_of: Option<String>,

    /// node timeout in milliseconds for failure detection
    #[arg(long, env = "CINDER_NODE_TIMEOUT")]
    node_timeout: Option<u64>,
}

/// Applies CLI overrides to a `ServerConfig`. Only values actually given
/// take effect, so the order is defaults, then TOML file, then env vars and
/// flags.
fn apply_args(cfg: &mut ServerConfig, args: &Args) {
    if let Some(ref host) = args.host {
        cfg.bind = host.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(offset) = args.bus_port_offset {
        cfg.bus_port_offset = offset;
    }
    if let Some(ref ip) = args.announce_ip {
        cfg.announce_ip = ip.clone();
    }
    if let Some(ref name) = args.node_name {
        cfg.node_name = name.clone();
    }
    if args.bootstrap {
        cfg.bootstrap = true;
    }
    if !args.slots.is_empty() {
        cfg.slots = args.slots.clone();
    }
    if !args.seeds.is_empty() {
        cfg.seeds = args.seeds.clone();
    }
    if let Some(ref primary) = args.replicate_of {
        cfg.replicate_of = primary.clone();
    }
    if let Some(v) = args.node_timeout {
        cfg.cluster.node_timeout_ms = v;
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cinder=info".into()),
        )
        .init();

    let args = Args::parse();

    if args.config_template {
        match ServerConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    let mut cfg = match &args.config {
        Some(path) => ServerConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => ServerConfig::default(),
    };
    apply_args(&mut cfg, &args);

    let bus_addr = cfg.bus_bind_addr().unwrap_or_else(|e| exit_err(e));
    let announce = cfg.announce_addr().unwrap_or_else(|e| exit_err(e));
    let name = cfg.node_name().unwrap_or_else(|e| exit_err(e));
    let seeds = cfg.seed_addrs().unwrap_or_else(|e| exit_err(e));
    let slots = cfg.startup_slots().unwrap_or_else(|e| exit_err(e));
    let replicate_of = cfg.replicate_of().unwrap_or_else(|e| exit_err(e));

    let mut state = ClusterState::new(cfg.cluster.clone(), name, announce, Instant::now())
        .unwrap_or_else(|e| exit_err(e));
    if cfg.bootstrap {
        if let Err(e) = state.bootstrap() {
            exit_err(format!("bootstrap failed: {e}"));
        }
        info!("bootstrapped a new cluster serving all slots");
    }
    if !slots.is_empty() {
        if let Err(e) = state.add_slots(&slots) {
            exit_err(format!("failed to claim startup slots: {e}"));
        }
        info!("serving {} slots", slots.len());
    }

    let listener = match TcpListener::bind(bus_addr).await {
        Ok(l) => l,
        Err(e) => exit_err(format!("failed to bind cluster bus on {bus_addr}: {e}")),
    };

    info!(
        node = %name,
        bus = %bus_addr,
        node_timeout_ms = cfg.cluster.node_timeout_ms,
        "cinder node starting..."
    );

    bus::run(
        state,
        listener,
        Bootstrap {
            seeds,
            replicate_of,
        },
    )
    .await;
}
