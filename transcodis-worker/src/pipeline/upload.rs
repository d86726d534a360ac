//! Upload stage: streams the encoded target back to the coordinator,
//! verifies it accepted the upload, then emits both the stage-specific
//! completion event and the explicit job-level completion event that
//! `TaskEvent::job_status` needs to mark the job `Completed`.

use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use transcodis_core::job::{EventStatus, NotificationType};

use crate::errors::{PipelineError, PipelineResult};
use crate::retry;
use crate::task::WorkTask;

use super::StageContext;

pub(super) async fn run(worker_id: usize, ctx: Arc<StageContext>, rx: Arc<Mutex<mpsc::Receiver<WorkTask>>>) {
    loop {
        let received = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = ctx.cancellation.cancelled() => None,
                item = rx.recv() => item,
            }
        };

        if ctx.cancellation.is_cancelled() {
            info!(worker_id, "upload stage shutting down");
            return;
        }
        let Some(work_task) = received else {
            info!(worker_id, "upload stage channel closed");
            return;
        };
        handle_one(&ctx, work_task).await;
    }
}

async fn handle_one(ctx: &Arc<StageContext>, work_task: WorkTask) {
    let job_id = work_task.job_id;
    let limit = ctx.worker_config.upload_retry_limit;
    let delay = ctx.worker_config.retry_delay;

    let outcome = retry::retry_loop(limit, delay, &ctx.cancellation, |attempt| {
        let ctx = Arc::clone(ctx);
        let mut work_task = work_task.clone();
        async move {
            if attempt > 1 {
                debug!(job_id = %work_task.job_id, attempt, "retrying upload");
            }
            attempt_upload(&ctx, &mut work_task).await.map(|_| work_task)
        }
    })
    .await;

    match outcome {
        Ok(mut uploaded) => {
            if let Err(err) = ctx.events.emit(&mut uploaded, NotificationType::Upload, EventStatus::Completed, None).await {
                error!(job_id = %job_id, %err, "failed to publish upload-completed event");
            }
            if let Err(err) = ctx.events.emit(&mut uploaded, NotificationType::Job, EventStatus::Completed, None).await {
                error!(job_id = %job_id, %err, "failed to publish job-completed event");
            }
            ctx.checkpoint.remove(&uploaded.work_dir, job_id).await;
            if let Err(io_err) = tokio::fs::remove_dir_all(&uploaded.work_dir).await {
                if io_err.kind() != std::io::ErrorKind::NotFound {
                    warn!(job_id = %job_id, path = %uploaded.work_dir.display(), error = %io_err, "failed to clean up working directory after upload");
                }
            }
        }
        Err(err) => {
            let failure = if err.is_terminal() {
                err
            } else {
                PipelineError::UploadExhausted(job_id, err.to_string())
            };

            let mut work_task = work_task;
            if !failure.is_cancellation() {
                if let Err(emit_err) = ctx
                    .events
                    .emit(&mut work_task, NotificationType::Upload, EventStatus::Failed, Some(failure.to_string()))
                    .await
                {
                    error!(job_id = %job_id, %emit_err, "failed to publish upload-failed event");
                }
            }
            super::handle_stage_failure(ctx, work_task, failure).await;
        }
    }
}

async fn attempt_upload(ctx: &StageContext, work_task: &mut WorkTask) -> PipelineResult<()> {
    let job_id = work_task.job_id;
    let target_path = work_task
        .target_file_path
        .clone()
        .ok_or_else(|| PipelineError::Protocol("upload stage reached with no encoded target".into()))?;

    ctx.events.emit(work_task, NotificationType::Upload, EventStatus::Progressing, None).await?;

    let checksum = sha256_file(&target_path).await?;
    let content_length = tokio::fs::metadata(&target_path).await?.len();

    let file = tokio::fs::File::open(&target_path).await?;
    let body = reqwest::Body::wrap_stream(tokio_util::io::ReaderStream::new(file));

    let response = ctx
        .http
        .post(&work_task.upload_url)
        .header("checksum", checksum)
        .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
        .header(reqwest::header::CONTENT_LENGTH, content_length)
        .body(body)
        .send()
        .await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(PipelineError::NotFound(job_id));
    }
    if response.status() != reqwest::StatusCode::CREATED {
        return Err(PipelineError::Protocol(format!("upload returned status {}, expected 201", response.status())));
    }

    Ok(())
}

/// Hashes the encoded target ahead of the upload request, since the
/// coordinator's `checksum` header must be known before the streamed
/// body is sent.
async fn sha256_file(path: &Path) -> PipelineResult<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let read = file.read(&mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
