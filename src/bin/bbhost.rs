//! Burst buffer host agent
//!
//! Long-running daemon on every storage host: registers the host's
//! bricks, keeps the liveness lease fresh, and performs the physical work
//! for volumes fronted by this host until interrupted.

use burst_buffer_operator::agent::{HostAgent, HostAgentConfig};
use burst_buffer_operator::domain::ports::{CommandRunnerRef, FilesystemDriverRef, KeystoreRef};
use burst_buffer_operator::driver::{PfsDriver, SshRunner};
use burst_buffer_operator::registry::EtcdKeystore;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Burst buffer storage host agent")]
struct Args {
    /// Hostname to register bricks under
    #[arg(long, env = "DAC_HOSTNAME")]
    hostname: String,

    /// Pool the host's bricks belong to
    #[arg(long, env = "DAC_POOL", default_value = "default")]
    pool: String,

    /// Block devices to offer as bricks, comma separated
    #[arg(long, env = "DAC_DEVICES", value_delimiter = ',')]
    devices: Vec<String>,

    /// Capacity of each brick
    #[arg(long, env = "DAC_BRICK_CAPACITY_GB", default_value = "1400")]
    capacity_gb: u64,

    /// Etcd endpoints, comma separated
    #[arg(long, env = "ETCDCTL_ENDPOINTS", default_value = "localhost:2379")]
    etcd_endpoints: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args);

    info!("Starting burst buffer host agent");
    info!("  Version: {}", burst_buffer_operator::VERSION);
    info!("  Hostname: {}", args.hostname);
    info!("  Pool: {}", args.pool);
    info!("  Bricks: {:?}", args.devices);

    let endpoints: Vec<String> = args
        .etcd_endpoints
        .split(',')
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    let store: KeystoreRef = match EtcdKeystore::connect(endpoints).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!("failed to reach the registry: {}", err);
            std::process::exit(1);
        }
    };

    let runner: CommandRunnerRef = Arc::new(SshRunner::from_env());
    let pfs = PfsDriver::from_env(runner);
    info!("  MDT size: {}", pfs.mdt_size());
    let driver: FilesystemDriverRef = Arc::new(pfs);

    let agent = HostAgent::new(
        store,
        driver,
        HostAgentConfig {
            hostname: args.hostname,
            pool: args.pool,
            devices: args.devices,
            capacity_gb: args.capacity_gb,
        },
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, draining");
                cancel.cancel();
            }
        });
    }

    if let Err(err) = agent.run(cancel).await {
        error!("host agent failed: {}", err);
        std::process::exit(1);
    }
    info!("host agent shutdown complete");
}
