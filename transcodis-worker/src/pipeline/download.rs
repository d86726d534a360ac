//! Download stage: one task, pulling `WorkTask`s off the entry channel,
//! streaming the source file from the coordinator while hashing it, and
//! verifying both byte count and checksum before handing off to encode.

use std::sync::Arc;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use transcodis_core::job::{EventStatus, NotificationType};

use crate::errors::{PipelineError, PipelineResult};
use crate::retry;
use crate::task::{Stage, TaskStatus, WorkTask};

use super::StageContext;

pub(super) async fn run(ctx: Arc<StageContext>, mut rx: mpsc::Receiver<WorkTask>, encode_tx: mpsc::Sender<WorkTask>) {
    loop {
        tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                info!("download stage shutting down");
                return;
            }
            received = rx.recv() => {
                let Some(work_task) = received else {
                    info!("download stage channel closed");
                    return;
                };
                handle_one(&ctx, work_task, &encode_tx).await;
            }
        }
    }
}

async fn handle_one(ctx: &Arc<StageContext>, work_task: WorkTask, encode_tx: &mpsc::Sender<WorkTask>) {
    let job_id = work_task.job_id;
    let limit = ctx.worker_config.download_retry_limit;
    let delay = ctx.worker_config.retry_delay;

    let outcome = retry::retry_loop(limit, delay, &ctx.cancellation, |attempt| {
        let ctx = Arc::clone(ctx);
        let mut work_task = work_task.clone();
        async move {
            if attempt > 1 {
                debug!(job_id = %work_task.job_id, attempt, "retrying download");
            }
            attempt_download(&ctx, &mut work_task).await.map(|_| work_task)
        }
    })
    .await;

    match outcome {
        Ok(mut downloaded) => {
            if let Err(err) = ctx.events.emit(&mut downloaded, NotificationType::Download, EventStatus::Completed, None).await {
                error!(job_id = %job_id, %err, "failed to publish download-completed event");
            }
            if let Err(err) = ctx
                .checkpoint
                .write(&TaskStatus { stage: Stage::Encoding, work_task: downloaded.clone() })
                .await
            {
                error!(job_id = %job_id, %err, "failed to persist checkpoint after download");
            }
            if encode_tx.send(downloaded).await.is_err() {
                warn!(job_id = %job_id, "encode channel closed, dropping completed download");
            }
        }
        Err(err) => {
            let failure = if err.is_terminal() {
                err
            } else {
                PipelineError::DownloadExhausted(job_id, err.to_string())
            };

            let mut work_task = work_task;
            if !failure.is_cancellation() {
                if let Err(emit_err) = ctx
                    .events
                    .emit(&mut work_task, NotificationType::Download, EventStatus::Failed, Some(failure.to_string()))
                    .await
                {
                    error!(job_id = %job_id, %emit_err, "failed to publish download-failed event");
                }
            }
            super::handle_stage_failure(ctx, work_task, failure).await;
        }
    }
}

async fn attempt_download(ctx: &StageContext, work_task: &mut WorkTask) -> PipelineResult<()> {
    let job_id = work_task.job_id;
    tokio::fs::create_dir_all(&work_task.work_dir).await?;

    ctx.events.emit(work_task, NotificationType::Download, EventStatus::Progressing, None).await?;

    let response = ctx.http.get(&work_task.download_url).send().await?;
    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(PipelineError::NotFound(job_id));
    }
    if !response.status().is_success() {
        return Err(PipelineError::Protocol(format!("download returned status {}", response.status())));
    }

    let content_length = response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .ok_or_else(|| PipelineError::Protocol("download response missing Content-Length".into()))?;

    let filename = response
        .headers()
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_content_disposition_filename)
        .ok_or_else(|| PipelineError::Protocol("download response missing Content-Disposition filename".into()))?;

    let source_path = work_task.work_dir.join(&filename);
    let mut file = tokio::fs::File::create(&source_path).await?;
    let mut hasher = Sha256::new();
    let mut written: u64 = 0;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        hasher.update(&chunk);
        written += chunk.len() as u64;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    if written != content_length {
        return Err(PipelineError::DownloadSizeMismatch { job_id, downloaded: written, expected: content_length });
    }

    let checksum_response = ctx.http.get(&work_task.checksum_url).send().await?;
    if checksum_response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(PipelineError::NotFound(job_id));
    }
    let expected_checksum = checksum_response.text().await?.trim().to_lowercase();
    let actual_checksum = hex::encode(hasher.finalize());
    if actual_checksum != expected_checksum {
        return Err(PipelineError::ChecksumMismatch(job_id));
    }

    work_task.source_file_path = Some(source_path);
    Ok(())
}

fn parse_content_disposition_filename(header: &str) -> Option<String> {
    header.split(';').map(str::trim).find_map(|part| part.strip_prefix("filename=").map(|v| v.trim_matches('"').to_string()))
}
