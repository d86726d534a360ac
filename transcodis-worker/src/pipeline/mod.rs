//! The three-stage worker pipeline: `download -> encode -> upload`,
//! connected by bounded channels, all sharing one [`StageContext`] and
//! one [`tokio_util::sync::CancellationToken`].

mod download;
mod encode;
mod upload;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use transcodis_contracts::ProcessRunner;

use crate::checkpoint::CheckpointStore;
use crate::config::WorkerConfig;
use crate::errors::PipelineError;
use crate::events::EventRecorder;
use crate::ocr_bridge::OcrBridge;
use crate::task::WorkTask;

/// Channel capacity for every inter-stage handoff (spec §5: bounded to
/// 100 entries, providing backpressure from encode back to download).
const STAGE_CHANNEL_CAPACITY: usize = 100;

/// Dependencies every stage worker needs, shared via `Arc` rather than
/// threaded through function signatures one field at a time.
pub struct StageContext {
    pub worker_name: String,
    pub worker_config: WorkerConfig,
    pub events: EventRecorder,
    pub checkpoint: CheckpointStore,
    pub ocr: OcrBridge,
    pub http: reqwest::Client,
    pub runner: Arc<dyn ProcessRunner>,
    pub cancellation: CancellationToken,
    pub prefetched: AtomicUsize,
}

impl StageContext {
    pub fn accept_jobs(&self, now: chrono::NaiveTime) -> bool {
        self.worker_config.accepts_new_work_at(now)
            && self.prefetched.load(std::sync::atomic::Ordering::SeqCst) < self.worker_config.max_prefetch_jobs
    }
}

pub struct Pipeline {
    pub download_tx: mpsc::Sender<WorkTask>,
    pub encode_tx: mpsc::Sender<WorkTask>,
    pub upload_tx: mpsc::Sender<WorkTask>,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Spawns the download task (always one), `encode_jobs` encode
    /// tasks sharing one receiver, and `encode_jobs` upload tasks
    /// sharing another — mirroring the reference worker pool's
    /// per-stage task/channel wiring, generalized from N identical
    /// workers to three distinct stage kinds.
    pub fn spawn(ctx: Arc<StageContext>) -> Self {
        let (download_tx, download_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (encode_tx, encode_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);
        let (upload_tx, upload_rx) = mpsc::channel(STAGE_CHANNEL_CAPACITY);

        let mut tasks = Vec::new();

        {
            let ctx = Arc::clone(&ctx);
            let encode_tx = encode_tx.clone();
            tasks.push(tokio::spawn(async move {
                download::run(ctx, download_rx, encode_tx).await;
            }));
        }

        let encode_rx = Arc::new(Mutex::new(encode_rx));
        let encode_worker_count = ctx.worker_config.encode_jobs.max(1);
        for worker_id in 0..encode_worker_count {
            let ctx = Arc::clone(&ctx);
            let encode_rx = Arc::clone(&encode_rx);
            let upload_tx = upload_tx.clone();
            tasks.push(tokio::spawn(async move {
                encode::run(worker_id, ctx, encode_rx, upload_tx).await;
            }));
        }

        let upload_rx = Arc::new(Mutex::new(upload_rx));
        for worker_id in 0..encode_worker_count {
            let ctx = Arc::clone(&ctx);
            let upload_rx = Arc::clone(&upload_rx);
            tasks.push(tokio::spawn(async move {
                upload::run(worker_id, ctx, upload_rx).await;
            }));
        }

        Self { download_tx, encode_tx, upload_tx, tasks }
    }

    /// Awaits every stage task. Each stage task exits on its own once
    /// the shared cancellation token fires and its channel drains, so
    /// this simply waits for that to finish.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

pub fn work_dir_for(temporal_path: &Path, worker_name: &str, job_id: Uuid) -> PathBuf {
    temporal_path.join(format!("worker-{worker_name}")).join(job_id.to_string())
}

/// Common failure handling shared by every stage: a cancellation is
/// reported best-effort as `JOB:canceled` and leaves on-disk state
/// intact for resumption (§5, §7). Any other failure has already had
/// its stage-specific `*:failed` event emitted by the caller (which is
/// what actually drives `Job::apply_event`'s terminal transition), so
/// this only needs to clean up the working directory.
pub(crate) async fn handle_stage_failure(ctx: &StageContext, mut work_task: WorkTask, err: PipelineError) {
    let job_id = work_task.job_id;

    if err.is_cancellation() {
        warn!(job_id = %job_id, "stage cancelled, leaving on-disk state intact for resumption");
        let _ = ctx
            .events
            .emit(&mut work_task, transcodis_core::job::NotificationType::Job, transcodis_core::job::EventStatus::Canceled, Some(err.to_string()))
            .await;
        return;
    }

    error!(job_id = %job_id, %err, "job failed");
    ctx.checkpoint.remove(&work_task.work_dir, job_id).await;
    if let Err(io_err) = tokio::fs::remove_dir_all(&work_task.work_dir).await {
        if io_err.kind() != std::io::ErrorKind::NotFound {
            warn!(job_id = %job_id, path = %work_task.work_dir.display(), error = %io_err, "failed to clean up working directory");
        }
    }
}
