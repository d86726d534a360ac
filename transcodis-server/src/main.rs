//! The transcodis coordinator binary: a thin wrapper that loads
//! configuration, wires up [`transcodis_server`]'s repository, scheduler,
//! and HTTP surface, and runs them until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcodis_contracts::{EventBus, RedisEventBus};
use transcodis_server::config::{Config, ConfigLoader, ConfigLoaderOptions};
use transcodis_server::repository::JobRepository;
use transcodis_server::{http, scheduler};

#[derive(Parser, Debug)]
#[command(name = "transcodis-server")]
#[command(about = "Coordinator for the transcodis distributed transcoding pipeline")]
struct Args {
    /// Path to a TOML config file (overrides the default search locations).
    #[arg(long, env = "TRANSCODIS_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "transcodis_server=info,transcodis_core=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ConfigLoader::with_options(ConfigLoaderOptions {
        config_path: args.config,
    })
    .load()
    .map_err(|err| {
        error!(%err, "failed to load configuration");
        err
    })?;

    if let Err(err) = run(config).await {
        error!(%err, "coordinator exited with error");
        return Err(err);
    }

    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.web.download_path).await?;
    tokio::fs::create_dir_all(&config.web.upload_path).await?;

    let repository = JobRepository::connect(&config.database.dsn).await?;
    repository.migrate().await?;
    info!("database migrated");

    let bus: Arc<dyn EventBus> = Arc::new(RedisEventBus::connect(&config.broker.url).await?);

    let cancellation = CancellationToken::new();
    spawn_shutdown_signal(cancellation.clone());

    let scheduler = Arc::new(scheduler::Scheduler::new(
        repository.clone(),
        bus,
        config.broker.clone(),
        config.scheduler.clone(),
    ));
    let scheduler_task = {
        let cancellation = cancellation.clone();
        tokio::spawn(async move { scheduler.run(cancellation).await })
    };

    let http_state = http::HttpState {
        repository,
        web: Arc::new(config.web.clone()),
    };
    let app = http::router(http_state);
    let listener = tokio::net::TcpListener::bind(config.web.bind_address).await?;
    info!(address = %config.web.bind_address, "coordinator HTTP surface listening");

    let server_task = {
        let cancellation = cancellation.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancellation.cancelled().await })
                .await
        })
    };

    let (server_result, _) = tokio::join!(server_task, scheduler_task);
    server_result??;

    Ok(())
}

fn spawn_shutdown_signal(cancellation: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");

        #[cfg(unix)]
        tokio::select! {
            _ = ctrl_c => info!("received SIGINT"),
            _ = terminate.recv() => info!("received SIGTERM"),
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received ctrl-c");
        }

        cancellation.cancel();
    });
}
