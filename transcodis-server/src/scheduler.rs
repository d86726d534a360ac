//! The coordinator's two long-lived cooperative tasks: a tick loop that
//! dispatches schedulable jobs, and an event consumer that folds worker
//! `TaskEvent`s back into the repository. Both share one cancellation
//! token rooted at the process's shutdown signal.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use transcodis_core::job::{Job, TaskEncode, TaskEvent};
use transcodis_contracts::EventBus;

use crate::config::{BrokerConfig, SchedulerConfig};
use crate::repository::JobRepository;

pub struct Scheduler {
    repository: JobRepository,
    bus: Arc<dyn EventBus>,
    broker: BrokerConfig,
    scheduler: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        repository: JobRepository,
        bus: Arc<dyn EventBus>,
        broker: BrokerConfig,
        scheduler: SchedulerConfig,
    ) -> Self {
        Self {
            repository,
            bus,
            broker,
            scheduler,
        }
    }

    /// Runs the tick loop and the event consumer concurrently until
    /// `cancellation` fires, then returns once both have exited.
    pub async fn run(self: Arc<Self>, cancellation: CancellationToken) {
        let tick_scheduler = Arc::clone(&self);
        let tick_token = cancellation.clone();
        let tick_task = tokio::spawn(async move { tick_scheduler.run_tick_loop(tick_token).await });

        let event_scheduler = Arc::clone(&self);
        let event_token = cancellation.clone();
        let event_task = tokio::spawn(async move { event_scheduler.run_event_consumer(event_token).await });

        let _ = tokio::join!(tick_task, event_task);
    }

    async fn run_tick_loop(&self, cancellation: CancellationToken) {
        let mut interval = tokio::time::interval(self.scheduler.schedule_time);
        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    info!("scheduler tick loop shutting down");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(%err, "scheduler tick failed");
                    }
                }
            }
        }
    }

    /// `select_schedulable` already locks, reclaims, and marks candidate
    /// rows `added` inside one transaction, so a tick only has to publish
    /// the dispatch message for whatever it's handed back.
    async fn tick(&self) -> anyhow::Result<()> {
        let job_timeout_seconds = self.scheduler.job_timeout.as_secs() as i64;
        let candidates = self
            .repository
            .select_schedulable(self.scheduler.batch_size, job_timeout_seconds)
            .await?;

        for job in candidates {
            self.dispatch(&job).await?;
        }

        Ok(())
    }

    async fn dispatch(&self, job: &Job) -> anyhow::Result<()> {
        let task = TaskEncode {
            job_id: job.id,
            download_url: format!("/download/{}", job.id),
            checksum_url: format!("/checksum/{}", job.id),
            upload_url: format!("/upload/{}", job.id),
        };
        let payload = serde_json::to_vec(&task)?;
        self.bus.publish(&self.broker.encode_request_queue, payload).await?;
        debug!(job_id = %job.id, "dispatched job");
        Ok(())
    }

    /// Drains `encode.events` until cancelled. On cancellation, rather
    /// than dropping the stream immediately, keeps consuming for up to
    /// `shutdown_grace` so events already in flight from workers still
    /// get applied instead of being left for redelivery (§5 Cancellation).
    async fn run_event_consumer(&self, cancellation: CancellationToken) {
        let stream = match self.bus.consume(&self.broker.encode_events_queue).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(%err, "failed to subscribe to encode.events");
                return;
            }
        };
        tokio::pin!(stream);

        loop {
            tokio::select! {
                _ = cancellation.cancelled() => {
                    info!(grace = ?self.scheduler.shutdown_grace, "scheduler event consumer draining before shutdown");
                    self.drain_event_consumer(&mut stream).await;
                    return;
                }
                next = futures::StreamExt::next(&mut stream) => {
                    let Some(delivery) = next else {
                        warn!("encode.events stream ended");
                        return;
                    };
                    self.apply_delivery(delivery).await;
                }
            }
        }
    }

    async fn drain_event_consumer(&self, stream: &mut (impl futures::Stream<Item = Result<transcodis_contracts::bus::Delivery, transcodis_contracts::EventBusError>> + Unpin)) {
        let grace = tokio::time::sleep(self.scheduler.shutdown_grace);
        tokio::pin!(grace);

        loop {
            tokio::select! {
                _ = &mut grace => {
                    info!("scheduler event consumer grace period elapsed, shutting down");
                    return;
                }
                next = futures::StreamExt::next(stream) => {
                    let Some(delivery) = next else {
                        info!("scheduler event consumer drained fully before grace period elapsed");
                        return;
                    };
                    self.apply_delivery(delivery).await;
                }
            }
        }
    }

    async fn apply_delivery(&self, delivery: Result<transcodis_contracts::bus::Delivery, transcodis_contracts::EventBusError>) {
        match delivery {
            Ok((payload, ack)) => match self.apply_event_payload(&payload).await {
                Ok(_) => ack.ack(),
                Err(err) => {
                    error!(%err, "failed to apply task event, leaving for redelivery");
                    ack.nack();
                }
            },
            Err(err) => error!(%err, "error consuming encode.events"),
        }
    }

    async fn apply_event_payload(&self, payload: &[u8]) -> anyhow::Result<()> {
        let event: TaskEvent = serde_json::from_slice(payload)?;
        let applied = self.repository.apply_event(&event).await?;
        if !applied {
            debug!(job_id = %event.job_id, event_id = event.event_id, "discarded stale/duplicate event");
        }
        Ok(())
    }
}
