//! HTTP server with admission control and graceful shutdown

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use admit_limit::AdmissionGate;
use admit_limit::GateConfig;
use admit_server::BackgroundTasks;
use admit_server::Config;
use admit_server::HttpEndpoint;
use admit_server::Shutdown;
use admit_server::TerminationSignals;
use admit_server::app;
use clap::Parser;
use tower::BoxError;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "admit-server")]
#[command(about = "HTTP server with per-client admission control")]
struct Args {
    /// TOML configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Operating environment (development, staging, production)
    #[arg(long)]
    env: Option<String>,

    /// Admit every request
    #[arg(long)]
    no_rate_limit: bool,

    /// Log filter used when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&args.log_level))?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.addr = addr;
    }
    if let Some(env) = args.env {
        config.server.env = env;
    }
    if args.no_rate_limit {
        config.rate_limit.enabled = false;
    }

    let gate = Arc::new(AdmissionGate::new(GateConfig::from(config.rate_limit)));
    let sweeper = gate.spawn_sweeper();

    let tasks = BackgroundTasks::new();
    let mut signals = TerminationSignals::install()?;

    let state = app::AppState::new(
        app::AppInfo {
            env: config.server.env.clone(),
        },
        tasks.clone(),
    );
    let router = app::router(Arc::clone(&gate), state);
    let endpoint = Arc::new(HttpEndpoint::bind(config.server.addr, router).await?);
    tracing::info!(
        addr = %endpoint.local_addr(),
        env = %config.server.env,
        rate_limit = config.rate_limit.enabled,
        "listening"
    );

    let shutdown = Shutdown::new(config.shutdown.drain_timeout, tasks);
    let result = shutdown
        .run(endpoint, async move { signals.recv().await })
        .await;

    if let Some(sweeper) = sweeper {
        sweeper.abort();
    }
    result?;
    Ok(())
}
