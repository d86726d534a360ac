//! Encode stage: probe the downloaded source, pull any PGS subtitle
//! tracks through OCR, build and run the `ffmpeg` plan, then validate the
//! result before handing off to upload.
//!
//! Runs as `encode_jobs` tasks sharing one receiver. `prefetched` is
//! incremented when the job is first accepted off the broker (or resumed
//! from a checkpoint), not here, so it bounds everything in flight from
//! acceptance through encode; this stage only decrements it on the way
//! out, success or failure.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::future::join_all;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};
use transcodis_contracts::{LineSink, ProcessError, RunRequest};
use transcodis_core::container::ContainerDescription;
use transcodis_core::job::{EventStatus, NotificationType, TaskPgs};
use transcodis_core::planner::{self, PlanRequest};
use uuid::Uuid;

use crate::errors::{PipelineError, PipelineResult};
use crate::task::{Stage, TaskStatus, WorkTask};

use super::StageContext;

/// Re-probing the encoded target must stay within this of the source's
/// duration, or the encode is treated as having dropped content (§4.4).
const DURATION_TOLERANCE_SECONDS: f64 = 60.0;

pub(super) async fn run(
    worker_id: usize,
    ctx: Arc<StageContext>,
    rx: Arc<Mutex<mpsc::Receiver<WorkTask>>>,
    upload_tx: mpsc::Sender<WorkTask>,
) {
    loop {
        let received = {
            let mut rx = rx.lock().await;
            tokio::select! {
                _ = ctx.cancellation.cancelled() => None,
                item = rx.recv() => item,
            }
        };

        if ctx.cancellation.is_cancelled() {
            info!(worker_id, "encode stage shutting down");
            return;
        }
        let Some(work_task) = received else {
            info!(worker_id, "encode stage channel closed");
            return;
        };

        handle_one(worker_id, &ctx, work_task, &upload_tx).await;
        ctx.prefetched.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn handle_one(worker_id: usize, ctx: &Arc<StageContext>, mut work_task: WorkTask, upload_tx: &mpsc::Sender<WorkTask>) {
    let job_id = work_task.job_id;
    match attempt_encode(worker_id, ctx, &mut work_task).await {
        Ok(()) => {
            if let Err(err) = ctx.events.emit(&mut work_task, NotificationType::Ffmpeg, EventStatus::Completed, None).await {
                error!(job_id = %job_id, %err, "failed to publish ffmpeg-completed event");
            }
            if let Err(err) = ctx
                .checkpoint
                .write(&TaskStatus { stage: Stage::Uploading, work_task: work_task.clone() })
                .await
            {
                error!(job_id = %job_id, %err, "failed to persist checkpoint after encode");
            }
            if upload_tx.send(work_task).await.is_err() {
                warn!(job_id = %job_id, "upload channel closed, dropping encoded job");
            }
        }
        Err(err) => {
            if !err.is_cancellation() {
                let (notification_type, message) = failure_notification(&err);
                if let Err(emit_err) = ctx.events.emit(&mut work_task, notification_type, EventStatus::Failed, Some(message)).await {
                    error!(job_id = %job_id, %emit_err, "failed to publish encode-failure event");
                }
            }
            super::handle_stage_failure(ctx, work_task, err).await;
        }
    }
}

/// Attributes a notification type to the stage that actually failed, so
/// the coordinator's status derivation (`TaskEvent::job_status`) lands on
/// the right bucket instead of a generic encode failure.
fn failure_notification(err: &PipelineError) -> (NotificationType, String) {
    match err {
        PipelineError::Probe(_, _) => (NotificationType::Ffprobe, err.to_string()),
        PipelineError::OcrTimeout { .. } | PipelineError::OcrFailed { .. } => (NotificationType::Pgs, err.to_string()),
        PipelineError::Process(ProcessError::Spawn { program, .. } | ProcessError::UnacceptedExit { program, .. })
            if program == "mkvextract" =>
        {
            (NotificationType::Mkvextract, err.to_string())
        }
        _ => (NotificationType::Ffmpeg, err.to_string()),
    }
}

async fn attempt_encode(worker_id: usize, ctx: &StageContext, work_task: &mut WorkTask) -> PipelineResult<()> {
    let job_id = work_task.job_id;
    let source_path = work_task
        .source_file_path
        .clone()
        .ok_or_else(|| PipelineError::Protocol("encode stage reached with no downloaded source".into()))?;
    let source_path_str = source_path.to_string_lossy().to_string();

    ctx.events.emit(work_task, NotificationType::Ffprobe, EventStatus::Started, None).await?;
    let container = planner_probe(ctx, job_id, &source_path_str).await?;
    ctx.events.emit(work_task, NotificationType::Ffprobe, EventStatus::Completed, None).await?;

    let selected = container.selected();
    let pgs_srt_paths = extract_and_transcribe_pgs(worker_id, ctx, work_task, &selected).await?;

    let target_path = work_task.work_dir.join(format!("{job_id}-encoded.mkv"));
    let plan_request = PlanRequest {
        container: &selected,
        source_path: source_path_str.clone(),
        work_dir: work_task.work_dir.to_string_lossy().to_string(),
        target_path: target_path.to_string_lossy().to_string(),
        thread_count: ctx.worker_config.threads,
        pgs_srt_paths,
    };
    let plan = planner::build_plan(&plan_request).map_err(|err| PipelineError::Plan(job_id, err))?;

    ctx.events.emit(work_task, NotificationType::Ffmpeg, EventStatus::Started, None).await?;
    run_ffmpeg(ctx, work_task, &plan.args, container.duration_seconds, container.video.first().map(|v| v.frame_rate).unwrap_or(24.0)).await?;

    validate_encode_result(ctx, job_id, &source_path, &target_path, container.duration_seconds).await?;
    work_task.target_file_path = Some(target_path);

    Ok(())
}

async fn planner_probe(ctx: &StageContext, job_id: Uuid, source_path: &str) -> PipelineResult<ContainerDescription> {
    transcodis_core::probe::probe(ctx.runner.as_ref(), source_path)
        .await
        .map_err(|err| PipelineError::Probe(job_id, err))
}

/// Extracts any PGS subtitle track with `mkvextract`, OCRs each through
/// [`crate::ocr_bridge::OcrBridge`], and writes the returned `.srt` files
/// into the working directory. Returns the map `build_plan` expects,
/// keyed by the PGS stream's probed index.
async fn extract_and_transcribe_pgs(
    worker_id: usize,
    ctx: &StageContext,
    work_task: &mut WorkTask,
    container: &ContainerDescription,
) -> PipelineResult<HashMap<usize, String>> {
    let pgs_subtitles: Vec<_> = container
        .subtitle
        .iter()
        .filter(|s| planner::is_pgs_codec(&s.codec_name))
        .collect();

    if pgs_subtitles.is_empty() {
        return Ok(HashMap::new());
    }

    let job_id = work_task.job_id;
    let source_path = work_task
        .source_file_path
        .as_ref()
        .expect("pgs extraction only runs after source_file_path is set")
        .clone();

    ctx.events.emit(work_task, NotificationType::Mkvextract, EventStatus::Started, None).await?;

    let mut args = vec!["tracks".to_string(), source_path.to_string_lossy().to_string()];
    let mut sup_paths = HashMap::new();
    for subtitle in &pgs_subtitles {
        let sup_path = work_task.work_dir.join(format!("{}.sup", subtitle.index));
        args.push(format!("{}:{}", subtitle.index, sup_path.to_string_lossy()));
        sup_paths.insert(subtitle.index, sup_path);
    }

    let request = RunRequest::new("mkvextract", args)
        .with_cwd(work_task.work_dir.clone())
        .with_cancellation(ctx.cancellation.clone())
        .with_accepted_exit_codes(vec![0, 1]);
    ctx.runner.run(request).await?;

    ctx.events.emit(work_task, NotificationType::Mkvextract, EventStatus::Completed, None).await?;
    ctx.events.emit(work_task, NotificationType::Pgs, EventStatus::Started, None).await?;

    debug!(worker_id, job_id = %job_id, count = pgs_subtitles.len(), "requesting OCR for pgs tracks");

    let mut pending = Vec::new();
    for subtitle in &pgs_subtitles {
        let sup_path = &sup_paths[&subtitle.index];
        let pgs_data = tokio::fs::read(sup_path).await?;
        let request = TaskPgs {
            job_id,
            pgs_id: subtitle.index.to_string(),
            pgs_data,
            language: subtitle.language.clone(),
        };
        let receiver = ctx.ocr.request(request).await?;
        pending.push((subtitle.index, subtitle.index.to_string(), receiver));
    }

    let timeout = ctx.worker_config.ocr_timeout;
    let awaited = pending.into_iter().map(|(index, pgs_id, receiver)| async move {
        let outcome = tokio::time::timeout(timeout, receiver).await;
        (index, pgs_id, outcome)
    });

    let mut srt_paths = HashMap::new();
    for (index, pgs_id, outcome) in join_all(awaited).await {
        match outcome {
            Err(_) => return Err(PipelineError::OcrTimeout { job_id, pgs_id }),
            Ok(Err(_)) => return Err(PipelineError::OcrFailed { job_id, pgs_id, message: "OCR worker dropped the response channel".into() }),
            Ok(Ok(response)) => {
                if let Some(message) = response.error {
                    return Err(PipelineError::OcrFailed { job_id, pgs_id, message });
                }
                let Some(srt_bytes) = response.srt_bytes else {
                    return Err(PipelineError::OcrFailed { job_id, pgs_id, message: "OCR response carried neither srt data nor an error".into() });
                };
                let srt_path = work_task.work_dir.join(format!("{index}.srt"));
                tokio::fs::write(&srt_path, &srt_bytes).await?;
                srt_paths.insert(index, srt_path.to_string_lossy().to_string());
            }
        }
    }

    ctx.events.emit(work_task, NotificationType::Pgs, EventStatus::Completed, None).await?;
    Ok(srt_paths)
}

/// Tracks wall-clock progress through an ffmpeg run from its stderr
/// `time=` field, reporting only once percent-complete has advanced by at
/// least ten points since the last report.
struct ProgressTracker {
    duration_seconds: f64,
    frame_rate: f64,
    last_reported_percent: i64,
}

impl ProgressTracker {
    fn new(duration_seconds: f64, frame_rate: f64) -> Self {
        Self { duration_seconds, frame_rate, last_reported_percent: -10 }
    }

    fn observe(&mut self, time_seconds: f64) -> Option<(i64, f64)> {
        if self.duration_seconds <= 0.0 {
            return None;
        }
        let percent = ((time_seconds / self.duration_seconds) * 100.0).clamp(0.0, 100.0) as i64;
        if percent - self.last_reported_percent >= 10 {
            self.last_reported_percent = percent;
            Some((percent, time_seconds * self.frame_rate))
        } else {
            None
        }
    }
}

/// Pulls the value following `key` out of an ffmpeg progress line, up to
/// the next whitespace, the way the reference transcoding worker's own
/// progress monitor reads `time=`/`speed=` tokens out of its stderr.
fn extract_value<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let start = line.find(key)? + key.len();
    let rest = &line[start..];
    let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
    let value = rest[..end].trim();
    (!value.is_empty()).then_some(value)
}

fn parse_time_to_seconds(value: &str) -> Option<f64> {
    let mut parts = value.splitn(3, ':');
    let hours: f64 = parts.next()?.parse().ok()?;
    let minutes: f64 = parts.next()?.parse().ok()?;
    let seconds: f64 = parts.next()?.parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

async fn run_ffmpeg(ctx: &StageContext, work_task: &mut WorkTask, args: &[String], duration_seconds: f64, frame_rate: f64) -> PipelineResult<()> {
    let job_id = work_task.job_id;
    let tracker = Arc::new(StdMutex::new(ProgressTracker::new(duration_seconds, frame_rate)));
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(i64, f64)>();

    let sink_tracker = Arc::clone(&tracker);
    let stderr_sink: LineSink = Arc::new(move |line: &str| {
        let Some(time_str) = extract_value(line, "time=") else { return };
        let Some(time_seconds) = parse_time_to_seconds(time_str) else { return };
        let mut tracker = sink_tracker.lock().expect("ffmpeg progress tracker poisoned");
        if let Some((percent, frames_completed)) = tracker.observe(time_seconds) {
            let _ = progress_tx.send((percent, frames_completed));
        }
    });

    let event_counter = Arc::new(AtomicI64::new(work_task.next_event_id));
    let reporter_counter = Arc::clone(&event_counter);
    let reporter_bus = Arc::clone(ctx.events.bus());
    let reporter_queue = ctx.events.queue().to_string();
    let reporter_worker_name = ctx.events.worker_name().to_string();
    let reporter = tokio::spawn(async move {
        while let Some((percent, frames_completed)) = progress_rx.recv().await {
            let event_id = reporter_counter.fetch_add(1, Ordering::SeqCst);
            let message = format!("{percent}% complete ({frames_completed:.0} frames encoded)");
            if let Err(err) = crate::events::publish_event(
                &reporter_bus,
                &reporter_queue,
                &reporter_worker_name,
                job_id,
                event_id,
                NotificationType::Ffmpeg,
                EventStatus::Progressing,
                Some(message),
            )
            .await
            {
                warn!(job_id = %job_id, %err, "failed to publish ffmpeg progress event");
            }
        }
    });

    let mut env = HashMap::new();
    if cfg!(unix) {
        if let Ok(existing) = std::env::var("LD_LIBRARY_PATH") {
            env.insert("LD_LIBRARY_PATH".to_string(), existing);
        }
    }

    let request = RunRequest {
        program: "ffmpeg".to_string(),
        args: args.to_vec(),
        cwd: Some(work_task.work_dir.clone()),
        env,
        stdout_sink: None,
        stderr_sink: Some(stderr_sink),
        cancellation: ctx.cancellation.clone(),
        accepted_exit_codes: vec![0],
    };
    let result = ctx.runner.run(request).await;

    let _ = reporter.await;
    work_task.next_event_id = event_counter.load(Ordering::SeqCst);

    result.map(|_| ()).map_err(PipelineError::from)
}

async fn validate_encode_result(ctx: &StageContext, job_id: Uuid, source_path: &PathBuf, target_path: &PathBuf, source_duration: f64) -> PipelineResult<()> {
    let target_container = transcodis_core::probe::probe(ctx.runner.as_ref(), &target_path.to_string_lossy())
        .await
        .map_err(|err| PipelineError::Probe(job_id, err))?;

    if (target_container.duration_seconds - source_duration).abs() > DURATION_TOLERANCE_SECONDS {
        return Err(PipelineError::DurationRegression {
            job_id,
            source: source_duration,
            encoded: target_container.duration_seconds,
        });
    }

    let source_size = tokio::fs::metadata(source_path).await?.len();
    let target_size = tokio::fs::metadata(target_path).await?.len();
    if target_size > source_size {
        return Err(PipelineError::SizeRegression { job_id, source: source_size, encoded: target_size });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_value_reads_token_up_to_next_whitespace() {
        let line = "frame=  100 fps=30 time=00:00:04.00 speed=1.0x";
        assert_eq!(extract_value(line, "time="), Some("00:00:04.00"));
        assert_eq!(extract_value(line, "speed="), Some("1.0x"));
        assert_eq!(extract_value(line, "missing="), None);
    }

    #[test]
    fn parse_time_to_seconds_converts_hms() {
        assert_eq!(parse_time_to_seconds("00:01:02.50"), Some(62.5));
        assert_eq!(parse_time_to_seconds("01:00:00.00"), Some(3600.0));
        assert_eq!(parse_time_to_seconds("garbage"), None);
    }

    #[test]
    fn progress_tracker_reports_only_at_ten_point_steps() {
        let mut tracker = ProgressTracker::new(100.0, 24.0);
        assert!(tracker.observe(5.0).is_none());
        let (percent, _) = tracker.observe(11.0).unwrap();
        assert_eq!(percent, 11);
        assert!(tracker.observe(15.0).is_none());
        let (percent, _) = tracker.observe(21.0).unwrap();
        assert_eq!(percent, 21);
    }
}
