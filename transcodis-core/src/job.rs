//! The job state machine and the wire types exchanged with workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A persisted transcoding request. See `spec.md` §3 for the full
/// invariant list; [`Job::apply_event`] is the only place those
/// invariants are enforced on mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source_path: String,
    pub destination_path: String,
    pub priority: i32,
    pub status: JobStatus,
    pub event_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub last_event_at: DateTime<Utc>,
    pub worker_name: Option<String>,
    pub last_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Added,
    Downloading,
    Encoding,
    Uploading,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    /// A job in a terminal status never transitions out (§3 invariant).
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Canceled)
    }

    /// `worker_name` is set iff status is one of these three (§3 invariant).
    pub fn carries_worker(self) -> bool {
        matches!(
            self,
            JobStatus::Downloading | JobStatus::Encoding | JobStatus::Uploading
        )
    }

    pub fn is_schedulable_reclaim_candidate(self) -> bool {
        matches!(
            self,
            JobStatus::Added | JobStatus::Downloading | JobStatus::Encoding | JobStatus::Uploading
        )
    }
}

impl Job {
    pub fn new(id: Uuid, source_path: String, destination_path: String, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id,
            source_path,
            destination_path,
            priority,
            status: JobStatus::Queued,
            event_id: 0,
            scheduled_at: now,
            last_event_at: now,
            worker_name: None,
            last_message: None,
        }
    }

    /// Apply a `TaskEvent`, enforcing the strictly-increasing `event_id`
    /// invariant. Returns `true` if the event was applied, `false` if it
    /// was discarded as a stale/duplicate replay.
    pub fn apply_event(&mut self, event: &TaskEvent) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        if event.event_id <= self.event_id {
            return false;
        }

        self.event_id = event.event_id;
        self.last_event_at = event.event_time;
        self.last_message = event.message.clone();

        if let Some(status) = event.job_status() {
            self.status = status;
        }

        self.worker_name = if self.status.carries_worker() {
            Some(event.worker_name.clone())
        } else {
            None
        };

        true
    }
}

/// The message payload delivered to a worker, derived from a [`Job`] at
/// publish time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEncode {
    pub job_id: Uuid,
    pub download_url: String,
    pub checksum_url: String,
    pub upload_url: String,
}

/// Emitted by workers as lifecycle notifications.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEvent {
    pub job_id: Uuid,
    pub event_id: i64,
    pub worker_name: String,
    pub event_time: DateTime<Utc>,
    pub notification_type: NotificationType,
    pub status: EventStatus,
    pub message: Option<String>,
}

impl TaskEvent {
    pub fn new(
        job_id: Uuid,
        event_id: i64,
        worker_name: impl Into<String>,
        notification_type: NotificationType,
        status: EventStatus,
        message: Option<String>,
    ) -> Self {
        Self {
            job_id,
            event_id,
            worker_name: worker_name.into(),
            event_time: Utc::now(),
            notification_type,
            status,
            message,
        }
    }

    /// Only `JOB`-scoped events drive the job's own `status` field;
    /// sub-stage events (`DOWNLOAD`, `FFPROBE`, ...) update `last_message`
    /// and `last_event_at` only, but are still used for stuck-job
    /// reclamation below. `DOWNLOAD`/`FFMPEG`/`UPLOAD` progress also
    /// implies the coarse job status even without an explicit `JOB`
    /// event, since a worker does not always emit a redundant `JOB`
    /// event per stage transition.
    fn job_status(&self) -> Option<JobStatus> {
        use EventStatus::*;
        use NotificationType::*;
        match (self.notification_type, self.status) {
            (Job, Completed) => Some(JobStatus::Completed),
            (Job, Canceled) => Some(JobStatus::Canceled),
            (Job, Failed) => Some(JobStatus::Failed),
            (Download, _) => Some(JobStatus::Downloading),
            (Ffprobe | Mkvextract | Pgs | Ffmpeg, Failed) => Some(JobStatus::Failed),
            (Ffprobe | Mkvextract | Pgs | Ffmpeg, _) => Some(JobStatus::Encoding),
            (Upload, Failed) => Some(JobStatus::Failed),
            (Upload, _) => Some(JobStatus::Uploading),
            (Job, _) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationType {
    Job,
    Download,
    Ffprobe,
    Mkvextract,
    Pgs,
    Ffmpeg,
    Upload,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Started,
    Progressing,
    Completed,
    Failed,
    Canceled,
}

/// The subtitle OCR request/response pair exchanged over `pgs.request`
/// and `pgs.response`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPgs {
    pub job_id: Uuid,
    pub pgs_id: String,
    pub pgs_data: Vec<u8>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPgsResponse {
    pub job_id: Uuid,
    pub pgs_id: String,
    pub srt_bytes: Option<Vec<u8>>,
    pub error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> Job {
        Job::new(Uuid::new_v4(), "src.mkv".into(), "dst.mkv".into(), 5)
    }

    fn event(job_id: Uuid, event_id: i64, status: EventStatus, nt: NotificationType) -> TaskEvent {
        TaskEvent::new(job_id, event_id, "worker-1", nt, status, None)
    }

    #[test]
    fn out_of_order_event_is_a_no_op() {
        let mut j = job();
        assert!(j.apply_event(&event(j.id, 1, EventStatus::Started, NotificationType::Download)));
        assert!(!j.apply_event(&event(j.id, 1, EventStatus::Progressing, NotificationType::Download)));
        assert_eq!(j.event_id, 1);
    }

    #[test]
    fn worker_name_cleared_once_job_leaves_active_stage() {
        let mut j = job();
        j.apply_event(&event(j.id, 1, EventStatus::Started, NotificationType::Download));
        assert_eq!(j.worker_name.as_deref(), Some("worker-1"));

        j.apply_event(&event(j.id, 2, EventStatus::Completed, NotificationType::Job));
        assert_eq!(j.status, JobStatus::Completed);
        assert_eq!(j.worker_name, None);
    }

    #[test]
    fn terminal_status_never_transitions_out() {
        let mut j = job();
        j.apply_event(&event(j.id, 1, EventStatus::Completed, NotificationType::Job));
        assert!(!j.apply_event(&event(j.id, 2, EventStatus::Started, NotificationType::Download)));
        assert_eq!(j.status, JobStatus::Completed);
    }
}
