//! The worker-local view of a job: a `TaskEncode` bound to a working
//! directory, evolving as it moves through the pipeline, and the
//! on-disk record used to resume it after a crash.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use transcodis_core::job::TaskEncode;
use uuid::Uuid;

/// Which pipeline stage a [`WorkTask`] was last handed to. Used both to
/// route a resumed task back into the right channel and as the
/// checkpoint's on-disk marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Downloading,
    Encoding,
    Uploading,
}

/// A `TaskEncode` plus the mutable state the pipeline accumulates as it
/// runs: the working directory, the downloaded source and encoded
/// target paths once known, and the next `event_id` this worker will
/// assign for this job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkTask {
    pub job_id: Uuid,
    pub download_url: String,
    pub checksum_url: String,
    pub upload_url: String,
    pub work_dir: PathBuf,
    pub source_file_path: Option<PathBuf>,
    pub target_file_path: Option<PathBuf>,
    pub next_event_id: i64,
}

impl WorkTask {
    pub fn new(task: TaskEncode, work_dir: PathBuf) -> Self {
        Self {
            job_id: task.job_id,
            download_url: task.download_url,
            checksum_url: task.checksum_url,
            upload_url: task.upload_url,
            work_dir,
            source_file_path: None,
            target_file_path: None,
            next_event_id: 1,
        }
    }
}

/// The checkpoint persisted to `<job_id>.json` in the task's working
/// directory: which stage it last entered, and the task state needed to
/// re-enter that stage from scratch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatus {
    pub stage: Stage,
    pub work_task: WorkTask,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_work_task_starts_with_no_local_paths_and_event_id_one() {
        let task = TaskEncode {
            job_id: Uuid::new_v4(),
            download_url: "/download/1".into(),
            checksum_url: "/checksum/1".into(),
            upload_url: "/upload/1".into(),
        };
        let work_task = WorkTask::new(task, PathBuf::from("/tmp/worker-a/1"));
        assert!(work_task.source_file_path.is_none());
        assert!(work_task.target_file_path.is_none());
        assert_eq!(work_task.next_event_id, 1);
    }
}
