//! The HTTP surface workers talk to: job submission, source download,
//! source checksum, and result upload.

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Path, State},
    http::{HeaderMap, StatusCode, header},
    response::Response,
    routing::{get, post},
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::WebConfig;
use crate::errors::{AppError, AppResult};
use crate::repository::JobRepository;

#[derive(Clone)]
pub struct HttpState {
    pub repository: JobRepository,
    pub web: Arc<WebConfig>,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/ping", get(ping_handler))
        .route("/jobs", post(submit_job_handler))
        .route("/download/{job_id}", get(download_handler))
        .route("/checksum/{job_id}", get(checksum_handler))
        .route("/upload/{job_id}", post(upload_handler))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping_handler() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct SubmitJobRequest {
    source_path: String,
    destination_path: String,
    #[serde(default)]
    priority: i32,
}

#[derive(Debug, Serialize)]
struct SubmitJobResponse {
    job_id: Uuid,
}

async fn submit_job_handler(
    State(state): State<HttpState>,
    Json(request): Json<SubmitJobRequest>,
) -> AppResult<Json<SubmitJobResponse>> {
    let job = state
        .repository
        .add_job(&request.source_path, &request.destination_path, request.priority)
        .await?;
    info!(job_id = %job.id, "job submitted");
    Ok(Json(SubmitJobResponse { job_id: job.id }))
}

async fn download_handler(State(state): State<HttpState>, Path(job_id): Path<Uuid>) -> AppResult<Response> {
    let job = state.repository.get(job_id).await?;
    let source_path = state.web.download_path.join(&job.source_path);

    let file = tokio::fs::File::open(&source_path).await?;
    let metadata = file.metadata().await?;
    let filename = source_path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("source")
        .to_string();

    let stream = ReaderStream::new(file);
    let body = Body::from_stream(stream);

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, metadata.len())
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{filename}\""),
        )
        .body(body)
        .map_err(|e| AppError::internal(e.to_string()))?)
}

async fn checksum_handler(State(state): State<HttpState>, Path(job_id): Path<Uuid>) -> AppResult<String> {
    let job = state.repository.get(job_id).await?;
    let source_path = state.web.download_path.join(&job.source_path);

    let mut file = tokio::fs::File::open(&source_path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1 << 20];
    loop {
        let read = tokio::io::AsyncReadExt::read(&mut file, &mut buf).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

async fn upload_handler(
    State(state): State<HttpState>,
    Path(job_id): Path<Uuid>,
    headers: HeaderMap,
    body: Body,
) -> AppResult<StatusCode> {
    let job = state.repository.get(job_id).await?;

    let expected_checksum = headers
        .get("checksum")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::bad_request("missing checksum header"))?
        .to_lowercase();

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::bad_request("missing Content-Type header"))?;
    if content_type != "application/octet-stream" {
        return Err(AppError::bad_request(format!(
            "unsupported Content-Type {content_type}, expected application/octet-stream"
        )));
    }

    let destination_path = state.web.upload_path.join(&job.destination_path);
    if let Some(parent) = destination_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut file = tokio::fs::File::create(&destination_path).await?;
    let mut hasher = Sha256::new();
    let mut stream = body.into_data_stream();

    while let Some(chunk) = stream
        .try_next()
        .await
        .map_err(|e| AppError::bad_request(format!("body read error: {e}")))?
    {
        hasher.update(&chunk);
        file.write_all(&chunk).await?;
    }
    file.flush().await?;

    let actual_checksum = hex::encode(hasher.finalize());
    if actual_checksum != expected_checksum {
        warn!(job_id = %job_id, "upload checksum mismatch");
        tokio::fs::remove_file(&destination_path).await.ok();
        return Err(AppError::bad_request("checksum mismatch"));
    }

    Ok(StatusCode::CREATED)
}
