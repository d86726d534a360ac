//! Crash-safe on-disk checkpoints. Each job's status is rewritten on
//! every stage transition via `open(trunc|create|rw) -> write -> fsync
//! -> close`, serialized behind a single worker-wide mutex.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::errors::{PipelineError, PipelineResult};
use crate::task::TaskStatus;

pub struct CheckpointStore {
    lock: Mutex<()>,
}

impl CheckpointStore {
    pub fn new() -> Self {
        Self { lock: Mutex::new(()) }
    }

    pub fn path_for(work_dir: &Path, job_id: Uuid) -> PathBuf {
        work_dir.join(format!("{job_id}.json"))
    }

    /// Persists `status` to its working directory's `<job_id>.json`,
    /// fsyncing before returning so a crash immediately after this call
    /// still observes the new stage on restart.
    pub async fn write(&self, status: &TaskStatus) -> PipelineResult<()> {
        let _guard = self.lock.lock().await;
        let path = Self::path_for(&status.work_task.work_dir, status.work_task.job_id);
        let payload = serde_json::to_vec_pretty(status)?;

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .await
            .map_err(|source| PipelineError::Checkpoint { path: path.clone(), source })?;
        file.write_all(&payload)
            .await
            .map_err(|source| PipelineError::Checkpoint { path: path.clone(), source })?;
        file.sync_all()
            .await
            .map_err(|source| PipelineError::Checkpoint { path: path.clone(), source })?;

        Ok(())
    }

    /// Removes a job's checkpoint file, if present. Used once a job
    /// reaches a terminal state and its working directory is about to be
    /// cleaned up, and tolerated as a no-op if the file is already gone.
    pub async fn remove(&self, work_dir: &Path, job_id: Uuid) {
        let _guard = self.lock.lock().await;
        let path = Self::path_for(work_dir, job_id);
        if let Err(err) = tokio::fs::remove_file(&path).await {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), %err, "failed to remove checkpoint file");
            }
        }
    }

    /// Scans `<temporal_path>/worker-<name>/*/*.json` for checkpoints
    /// left behind by a previous run of this worker, for startup
    /// resumption.
    pub async fn scan(temporal_path: &Path, worker_name: &str) -> PipelineResult<Vec<TaskStatus>> {
        let worker_dir = temporal_path.join(format!("worker-{worker_name}"));
        let mut found = Vec::new();

        let mut job_dirs = match tokio::fs::read_dir(&worker_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(err) => return Err(PipelineError::Checkpoint { path: worker_dir, source: err }),
        };

        while let Some(job_dir) = job_dirs
            .next_entry()
            .await
            .map_err(|source| PipelineError::Checkpoint { path: worker_dir.clone(), source })?
        {
            if !job_dir.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }

            let mut entries = match tokio::fs::read_dir(job_dir.path()).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Some(entry) = entries.next_entry().await.ok().flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match tokio::fs::read(&path).await {
                    Ok(bytes) => match serde_json::from_slice::<TaskStatus>(&bytes) {
                        Ok(status) => found.push(status),
                        Err(err) => warn!(path = %path.display(), %err, "skipping unparseable checkpoint"),
                    },
                    Err(err) => warn!(path = %path.display(), %err, "failed to read checkpoint"),
                }
            }
        }

        Ok(found)
    }
}

impl Default for CheckpointStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Stage, WorkTask};
    use transcodis_core::job::TaskEncode;

    fn status(job_id: Uuid, work_dir: PathBuf) -> TaskStatus {
        let task = TaskEncode {
            job_id,
            download_url: "/download".into(),
            checksum_url: "/checksum".into(),
            upload_url: "/upload".into(),
        };
        TaskStatus {
            stage: Stage::Downloading,
            work_task: WorkTask::new(task, work_dir),
        }
    }

    #[tokio::test]
    async fn write_then_scan_round_trips_checkpoint() {
        let temp = tempfile::tempdir().unwrap();
        let job_id = Uuid::new_v4();
        let work_dir = temp.path().join("worker-a").join(job_id.to_string());
        tokio::fs::create_dir_all(&work_dir).await.unwrap();

        let store = CheckpointStore::new();
        store.write(&status(job_id, work_dir.clone())).await.unwrap();

        let found = CheckpointStore::scan(temp.path(), "a").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].work_task.job_id, job_id);
        assert_eq!(found[0].stage, Stage::Downloading);
    }

    #[tokio::test]
    async fn scan_of_missing_worker_dir_returns_empty() {
        let temp = tempfile::tempdir().unwrap();
        let found = CheckpointStore::scan(temp.path(), "never-ran").await.unwrap();
        assert!(found.is_empty());
    }
}
