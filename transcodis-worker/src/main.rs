//! The transcodis worker binary: a thin wrapper that loads
//! configuration, wires up [`transcodis_worker`]'s pipeline and OCR
//! bridge, and runs them until a shutdown signal arrives.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcodis_contracts::{EventBus, RedisEventBus, TokioProcessRunner};
use transcodis_core::job::TaskEncode;
use transcodis_worker::checkpoint::CheckpointStore;
use transcodis_worker::config::{Config, ConfigLoader, ConfigLoaderOptions};
use transcodis_worker::events::EventRecorder;
use transcodis_worker::ocr_bridge::{self, OcrBridge};
use transcodis_worker::pipeline::{self, Pipeline, StageContext};
use transcodis_worker::task::{Stage, WorkTask};

#[derive(Parser, Debug)]
#[command(name = "transcodis-worker")]
#[command(about = "Worker node for the transcodis distributed transcoding pipeline")]
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
                .unwrap_or_else(|_| "transcodis_worker=info,transcodis_core=info".into()),
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
        error!(%err, "worker exited with error");
        return Err(err);
    }

    Ok(())
}

async fn run(config: Config) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(&config.worker.temporal_path).await?;

    let bus: Arc<dyn EventBus> = Arc::new(RedisEventBus::connect(&config.broker.url).await?);

    let cancellation = CancellationToken::new();
    spawn_shutdown_signal(cancellation.clone());

    let events = EventRecorder::new(Arc::clone(&bus), config.broker.encode_events_queue.clone(), config.worker_name.clone());
    let ocr = OcrBridge::new(Arc::clone(&bus), config.broker.pgs_request_queue.clone());

    let router_task = {
        let bus = Arc::clone(&bus);
        let pending = ocr.pending_handle();
        let response_queue = config.broker.pgs_response_queue.clone();
        let cancellation = cancellation.clone();
        tokio::spawn(async move { ocr_bridge::run_response_router(bus, response_queue, pending, cancellation).await })
    };

    let ctx = Arc::new(StageContext {
        worker_name: config.worker_name.clone(),
        worker_config: config.worker.clone(),
        events,
        checkpoint: CheckpointStore::new(),
        ocr,
        http: reqwest::Client::new(),
        runner: Arc::new(TokioProcessRunner::new()),
        cancellation: cancellation.clone(),
        prefetched: AtomicUsize::new(0),
    });

    let pipeline = Pipeline::spawn(Arc::clone(&ctx));
    resume_checkpoints(&ctx, &pipeline).await;

    let request_consumer = {
        let ctx = Arc::clone(&ctx);
        let bus = Arc::clone(&bus);
        let queue = config.broker.encode_request_queue.clone();
        let download_tx = pipeline.download_tx.clone();
        tokio::spawn(async move { run_request_consumer(ctx, bus, queue, download_tx).await })
    };

    info!(worker = %config.worker_name, "worker started");
    pipeline.join().await;
    let _ = router_task.await;
    let _ = request_consumer.await;

    Ok(())
}

/// Re-enters every checkpointed job left behind by a previous run at the
/// stage it last reached — the same channel a freshly dispatched job
/// would flow through, so there is no separate resumption code path
/// inside any individual stage.
async fn resume_checkpoints(ctx: &Arc<StageContext>, pipeline: &Pipeline) {
    let statuses = match CheckpointStore::scan(&ctx.worker_config.temporal_path, &ctx.worker_name).await {
        Ok(statuses) => statuses,
        Err(err) => {
            error!(%err, "failed to scan checkpoints for resumption");
            return;
        }
    };

    for status in statuses {
        info!(job_id = %status.work_task.job_id, stage = ?status.stage, "resuming checkpointed job");
        if matches!(status.stage, Stage::Downloading | Stage::Encoding) {
            ctx.prefetched.fetch_add(1, Ordering::SeqCst);
        }
        let sent = match status.stage {
            Stage::Downloading => pipeline.download_tx.send(status.work_task).await,
            Stage::Encoding => pipeline.encode_tx.send(status.work_task).await,
            Stage::Uploading => pipeline.upload_tx.send(status.work_task).await,
        };
        if sent.is_err() {
            error!("pipeline channel closed while resuming checkpointed jobs");
        }
    }
}

/// Pulls `TaskEncode` requests off `encode.request`, admitting one only
/// when [`StageContext::accept_jobs`] allows new intake (not paused,
/// inside the configured daily window, and under `max_prefetch_jobs`).
/// A request arriving while intake is closed is nacked for redelivery
/// rather than held, so another worker can pick it up in the meantime.
async fn run_request_consumer(ctx: Arc<StageContext>, bus: Arc<dyn EventBus>, queue: String, download_tx: mpsc::Sender<WorkTask>) {
    let stream = match bus.consume(&queue).await {
        Ok(stream) => stream,
        Err(err) => {
            error!(%err, "failed to subscribe to encode.request");
            return;
        }
    };
    tokio::pin!(stream);

    loop {
        tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                info!("request consumer shutting down");
                return;
            }
            next = futures::StreamExt::next(&mut stream) => {
                let Some(delivery) = next else {
                    warn!("encode.request stream ended");
                    return;
                };
                match delivery {
                    Ok((payload, ack)) => {
                        if !ctx.accept_jobs(chrono::Local::now().time()) {
                            ack.nack();
                            tokio::select! {
                                _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                                _ = ctx.cancellation.cancelled() => return,
                            }
                            continue;
                        }

                        match serde_json::from_slice::<TaskEncode>(&payload) {
                            Ok(task) => {
                                ack.ack();
                                ctx.prefetched.fetch_add(1, Ordering::SeqCst);
                                let job_id = task.job_id;
                                let work_dir = pipeline::work_dir_for(&ctx.worker_config.temporal_path, &ctx.worker_name, job_id);
                                let work_task = WorkTask::new(task, work_dir);
                                if download_tx.send(work_task).await.is_err() {
                                    warn!(job_id = %job_id, "download channel closed, dropping newly accepted job");
                                    ctx.prefetched.fetch_sub(1, Ordering::SeqCst);
                                }
                            }
                            Err(err) => {
                                error!(%err, "malformed encode.request payload");
                                ack.nack();
                            }
                        }
                    }
                    Err(err) => error!(%err, "error consuming encode.request"),
                }
            }
        }
    }
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
