use std::future::IntoFuture;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pool_settlement::{
    api::{router, ApiState},
    config::{load_pool_configs, Settings},
    metrics::register_metrics,
    PoolCoordinator, Supervisor,
};

#[derive(Parser, Debug)]
#[clap(name = "pool-settlement")]
#[clap(about = "Mining pool share accounting and payment settlement", long_about = None)]
struct Args {
    /// Redis URL for the shared ledger
    #[clap(long, env = "POOL_REDIS_URL", default_value = "redis://localhost:6379")]
    redis_url: String,

    /// Directory holding one JSON file per pool
    #[clap(long, env = "POOL_CONFIG_DIR", default_value = "pool_configs")]
    config_dir: PathBuf,

    /// Where unrecorded settlement batches are written for manual replay
    #[clap(long, env = "POOL_RECOVERY_DIR", default_value = ".")]
    recovery_dir: PathBuf,

    /// HTTP API bind address
    #[clap(long, env = "POOL_HTTP_BIND", default_value = "0.0.0.0:8080")]
    http_bind: SocketAddr,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let pools = load_pool_configs(&args.config_dir)
        .with_context(|| format!("loading pool configs from {}", args.config_dir.display()))?;
    let settings = Settings {
        redis_url: args.redis_url,
        recovery_dir: args.recovery_dir,
        http_bind: args.http_bind,
        pools,
    };

    info!("Starting settlement for {} pools", settings.pools.len());
    info!("Ledger store: {}", settings.store_address()?);

    register_metrics().context("registering metrics")?;

    let coordinator = Arc::new(
        PoolCoordinator::connect(&settings)
            .await
            .context("connecting pool backends")?,
    );

    let supervisor = Supervisor::new(coordinator.clone());
    let app = router(ApiState {
        coordinator,
        events: supervisor.events(),
    });

    let listener = tokio::net::TcpListener::bind(settings.http_bind)
        .await
        .with_context(|| format!("binding {}", settings.http_bind))?;
    info!("HTTP API listening on {}", settings.http_bind);

    let http_server = axum::serve(listener, app).into_future();
    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    };

    tokio::select! {
        res = http_server => {
            if let Err(e) = res {
                error!("HTTP server error: {}", e);
            }
        }
        res = supervisor.run(shutdown) => {
            if let Err(e) = res {
                error!("Supervisor error: {}", e);
            }
            info!("Received shutdown signal");
        }
    }

    info!("Pool settlement shutting down");
    Ok(())
}
