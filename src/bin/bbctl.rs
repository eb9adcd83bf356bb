//! Burst buffer front-end
//!
//! Invoked by the workload manager with `--function <name>`; blocks until
//! the requested lifecycle step has been fulfilled by the host agents.
//! Exit code 0 on success, non-zero with a single-line reason otherwise.

use burst_buffer_operator::cli::{CliActions, CliArgs};
use burst_buffer_operator::domain::ports::KeystoreRef;
use burst_buffer_operator::registry::EtcdKeystore;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Burst buffer orchestration front-end")]
struct Args {
    #[command(flatten)]
    cli: CliArgs,

    /// Etcd endpoints, comma separated
    #[arg(long, env = "ETCDCTL_ENDPOINTS", default_value = "localhost:2379")]
    etcd_endpoints: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(true))
        .init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(&args.log_level);
    debug!(function = %args.cli.function, "bbctl invoked");

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });
    }

    let endpoints: Vec<String> = args
        .etcd_endpoints
        .split(',')
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    let store: KeystoreRef = match EtcdKeystore::connect(endpoints).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            eprintln!("{}", err);
            std::process::exit(1);
        }
    };

    let actions = CliActions::new(store, cancel);
    if let Err(err) = actions.run(&args.cli).await {
        eprintln!("{}", err);
        std::process::exit(1);
    }
}
