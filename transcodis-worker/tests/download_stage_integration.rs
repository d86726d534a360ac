//! End-to-end download-stage behaviour against a real local HTTP server,
//! covering spec.md §8 scenario S1 (happy-path download) and S2
//! (checksum mismatch fails the job) without needing a live coordinator
//! or Redis.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::extract::Path as AxumPath;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::get;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use transcodis_contracts::{EventBus, InMemoryEventBus, TokioProcessRunner};
use transcodis_core::job::{EventStatus, NotificationType, TaskEncode, TaskEvent};
use transcodis_worker::checkpoint::CheckpointStore;
use transcodis_worker::config::WorkerConfig;
use transcodis_worker::events::EventRecorder;
use transcodis_worker::ocr_bridge::OcrBridge;
use transcodis_worker::pipeline::{Pipeline, StageContext, work_dir_for};
use transcodis_worker::task::WorkTask;

const BODY: &[u8] = b"fake mkv payload, repeated enough to look like a real stream";

async fn serve_file(AxumPath(_job_id): AxumPath<Uuid>) -> impl IntoResponse {
    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_LENGTH, BODY.len().to_string().parse().unwrap());
    headers.insert(header::CONTENT_DISPOSITION, "attachment; filename=\"source.mkv\"".parse().unwrap());
    (headers, Bytes::from_static(BODY))
}

async fn serve_checksum(AxumPath(_job_id): AxumPath<Uuid>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(BODY);
    hex::encode(hasher.finalize())
}

async fn serve_wrong_checksum(AxumPath(_job_id): AxumPath<Uuid>) -> String {
    "0000000000000000000000000000000000000000000000000000000000000".to_string()
}

async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

fn worker_config(temp_dir: &std::path::Path, download_retry_limit: u32) -> WorkerConfig {
    WorkerConfig {
        max_prefetch_jobs: 2,
        encode_jobs: 1,
        threads: 1,
        temporal_path: temp_dir.to_path_buf(),
        paused: false,
        start_after: None,
        stop_after: None,
        download_retry_limit,
        upload_retry_limit: 1,
        retry_delay: Duration::from_millis(5),
        ocr_timeout: Duration::from_secs(1),
    }
}

fn build_context(bus: Arc<dyn EventBus>, worker_config: WorkerConfig) -> (Arc<StageContext>, CancellationToken) {
    let cancellation = CancellationToken::new();
    let ctx = Arc::new(StageContext {
        worker_name: "test-worker".to_string(),
        worker_config,
        events: EventRecorder::new(Arc::clone(&bus), "encode.events", "test-worker"),
        checkpoint: CheckpointStore::new(),
        ocr: OcrBridge::new(Arc::clone(&bus), "pgs.request"),
        http: reqwest::Client::new(),
        runner: Arc::new(TokioProcessRunner::new()),
        cancellation: cancellation.clone(),
        prefetched: AtomicUsize::new(0),
    });
    (ctx, cancellation)
}

async fn next_download_event(bus: &Arc<dyn EventBus>) -> TaskEvent {
    let mut stream = bus.consume("encode.events").await.unwrap();
    loop {
        let (payload, ack) = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("an encode.events message should arrive")
            .unwrap()
            .unwrap();
        ack.ack();
        let event: TaskEvent = serde_json::from_slice(&payload).unwrap();
        if event.notification_type == NotificationType::Download
            && matches!(event.status, EventStatus::Completed | EventStatus::Failed)
        {
            return event;
        }
    }
}

#[tokio::test]
async fn s1_happy_path_download_emits_completed_and_checkpoints_for_encode() {
    let temp = tempfile::tempdir().unwrap();
    let addr = spawn_server(Router::new().route("/download/{job_id}", get(serve_file)).route("/checksum/{job_id}", get(serve_checksum))).await;

    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    let (ctx, cancellation) = build_context(Arc::clone(&bus), worker_config(temp.path(), 1));
    let pipeline = Pipeline::spawn(Arc::clone(&ctx));

    let job_id = Uuid::new_v4();
    let task = TaskEncode {
        job_id,
        download_url: format!("http://{addr}/download/{job_id}"),
        checksum_url: format!("http://{addr}/checksum/{job_id}"),
        upload_url: format!("http://{addr}/upload/{job_id}"),
    };
    let work_dir = work_dir_for(temp.path(), "test-worker", job_id);
    pipeline.download_tx.send(WorkTask::new(task, work_dir.clone())).await.unwrap();

    let event = next_download_event(&bus).await;
    assert_eq!(event.status, EventStatus::Completed);

    let checkpoint_path = CheckpointStore::path_for(&work_dir, job_id);
    let raw = tokio::fs::read(&checkpoint_path).await.unwrap();
    let status: transcodis_worker::task::TaskStatus = serde_json::from_slice(&raw).unwrap();
    assert_eq!(status.stage, transcodis_worker::task::Stage::Encoding);
    assert!(status.work_task.source_file_path.is_some());

    cancellation.cancel();
    pipeline.join().await;
}

#[tokio::test]
async fn s2_checksum_mismatch_fails_the_job_without_handoff_to_encode() {
    let temp = tempfile::tempdir().unwrap();
    let addr = spawn_server(
        Router::new()
            .route("/download/{job_id}", get(serve_file))
            .route("/checksum/{job_id}", get(serve_wrong_checksum)),
    )
    .await;

    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    // download_retry_limit = 1 so the (non-terminal) checksum mismatch
    // fails fast instead of retrying for real minutes.
    let (ctx, cancellation) = build_context(Arc::clone(&bus), worker_config(temp.path(), 1));
    let pipeline = Pipeline::spawn(Arc::clone(&ctx));

    let job_id = Uuid::new_v4();
    let task = TaskEncode {
        job_id,
        download_url: format!("http://{addr}/download/{job_id}"),
        checksum_url: format!("http://{addr}/checksum/{job_id}"),
        upload_url: format!("http://{addr}/upload/{job_id}"),
    };
    let work_dir = work_dir_for(temp.path(), "test-worker", job_id);
    pipeline.download_tx.send(WorkTask::new(task, work_dir.clone())).await.unwrap();

    let event = next_download_event(&bus).await;
    assert_eq!(event.status, EventStatus::Failed);
    assert!(event.message.unwrap_or_default().contains("exhausting retries"));

    // The job's working directory is cleaned up on a non-cancellation failure.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!work_dir.exists());

    cancellation.cancel();
    pipeline.join().await;
}

#[tokio::test]
async fn s1_checkpoints_scanned_at_startup_resume_at_the_recorded_stage() {
    let temp = tempfile::tempdir().unwrap();
    let job_id = Uuid::new_v4();
    let work_dir = work_dir_for(temp.path(), "test-worker", job_id);
    tokio::fs::create_dir_all(&work_dir).await.unwrap();

    let task = TaskEncode {
        job_id,
        download_url: "http://example.invalid/download".into(),
        checksum_url: "http://example.invalid/checksum".into(),
        upload_url: "http://example.invalid/upload".into(),
    };
    let mut work_task = WorkTask::new(task, work_dir.clone());
    work_task.source_file_path = Some(work_dir.join("source.mkv"));

    let status = transcodis_worker::task::TaskStatus {
        stage: transcodis_worker::task::Stage::Encoding,
        work_task,
    };
    CheckpointStore::new().write(&status).await.unwrap();

    let resumed = CheckpointStore::scan(temp.path(), "test-worker").await.unwrap();
    assert_eq!(resumed.len(), 1);
    assert_eq!(resumed[0].stage, transcodis_worker::task::Stage::Encoding);
    assert_eq!(resumed[0].work_task.job_id, job_id);
}
