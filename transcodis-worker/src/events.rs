//! Publishes `TaskEvent` lifecycle notifications onto `encode.events`,
//! assigning the strictly-increasing per-job `event_id` the repository's
//! `Job::apply_event` depends on.

use std::sync::Arc;

use transcodis_contracts::EventBus;
use transcodis_core::job::{EventStatus, NotificationType, TaskEvent};
use uuid::Uuid;

use crate::errors::PipelineResult;
use crate::task::WorkTask;

pub struct EventRecorder {
    bus: Arc<dyn EventBus>,
    queue: String,
    worker_name: String,
}

impl EventRecorder {
    pub fn new(bus: Arc<dyn EventBus>, queue: impl Into<String>, worker_name: impl Into<String>) -> Self {
        Self {
            bus,
            queue: queue.into(),
            worker_name: worker_name.into(),
        }
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn bus(&self) -> &Arc<dyn EventBus> {
        &self.bus
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Assigns `work_task.next_event_id`, publishes the resulting event,
    /// and advances the counter so the next call (on this task, from any
    /// stage) gets the next value.
    pub async fn emit(
        &self,
        work_task: &mut WorkTask,
        notification_type: NotificationType,
        status: EventStatus,
        message: Option<String>,
    ) -> PipelineResult<()> {
        let event_id = work_task.next_event_id;
        work_task.next_event_id += 1;
        publish_event(&self.bus, &self.queue, &self.worker_name, work_task.job_id, event_id, notification_type, status, message).await
    }
}

/// Publishes a single `TaskEvent` given an explicit `event_id`, for
/// callers that don't hold `&mut WorkTask` — namely the encode stage's
/// ffmpeg progress reporter, which tracks its own event-id counter
/// seeded from (and written back to) `work_task.next_event_id` so the
/// sequence stays contiguous across both callers.
pub async fn publish_event(
    bus: &Arc<dyn EventBus>,
    queue: &str,
    worker_name: &str,
    job_id: Uuid,
    event_id: i64,
    notification_type: NotificationType,
    status: EventStatus,
    message: Option<String>,
) -> PipelineResult<()> {
    let event = TaskEvent::new(job_id, event_id, worker_name, notification_type, status, message);
    let payload = serde_json::to_vec(&event)?;
    bus.publish(queue, payload).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use transcodis_contracts::InMemoryEventBus;

    fn work_task() -> WorkTask {
        WorkTask {
            job_id: Uuid::new_v4(),
            download_url: "/download/1".into(),
            checksum_url: "/checksum/1".into(),
            upload_url: "/upload/1".into(),
            work_dir: PathBuf::from("/tmp/worker-a/1"),
            source_file_path: None,
            target_file_path: None,
            next_event_id: 1,
        }
    }

    #[tokio::test]
    async fn emit_assigns_and_advances_event_id() {
        let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
        let recorder = EventRecorder::new(bus.clone(), "encode.events", "worker-a");
        let mut task = work_task();

        recorder
            .emit(&mut task, NotificationType::Download, EventStatus::Started, None)
            .await
            .unwrap();
        assert_eq!(task.next_event_id, 2);

        recorder
            .emit(&mut task, NotificationType::Download, EventStatus::Completed, None)
            .await
            .unwrap();
        assert_eq!(task.next_event_id, 3);
    }
}
