//! End-to-end scheduler behaviour: dispatch onto an in-memory bus and
//! stuck-job reclamation (spec.md §8 scenario S6), against a real,
//! migrated database but a fake broker so the test doesn't need Redis.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use transcodis_contracts::{EventBus, InMemoryEventBus};
use transcodis_core::job::TaskEncode;
use transcodis_server::config::{BrokerConfig, SchedulerConfig};
use transcodis_server::repository::JobRepository;
use transcodis_server::scheduler::Scheduler;

fn broker_config() -> BrokerConfig {
    BrokerConfig {
        url: "memory://".to_string(),
        encode_request_queue: "encode.request".to_string(),
        encode_events_queue: "encode.events".to_string(),
        pgs_request_queue: "pgs.request".to_string(),
        pgs_response_queue: "pgs.response".to_string(),
    }
}

#[sqlx::test(migrator = "transcodis_server::MIGRATOR")]
async fn a_queued_job_is_dispatched_on_the_first_tick(pool: PgPool) {
    let repo = JobRepository::from_pool(pool);
    let job = repo.add_job("movies/a.mkv", "out/a.mkv", 1).await.unwrap();

    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    let scheduler = Arc::new(Scheduler::new(
        repo.clone(),
        Arc::clone(&bus),
        broker_config(),
        SchedulerConfig {
            schedule_time: Duration::from_millis(20),
            job_timeout: Duration::from_secs(1800),
            shutdown_grace: Duration::from_millis(50),
            batch_size: 10,
        },
    ));

    let cancellation = CancellationToken::new();
    let run_token = cancellation.clone();
    let run_task = tokio::spawn(async move { scheduler.run(run_token).await });

    let mut stream = bus.consume("encode.request").await.unwrap();
    let (payload, ack) = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("dispatch should happen within the tick period")
        .unwrap()
        .unwrap();
    ack.ack();

    let task: TaskEncode = serde_json::from_slice(&payload).unwrap();
    assert_eq!(task.job_id, job.id);

    cancellation.cancel();
    run_task.await.unwrap();
}

#[sqlx::test(migrator = "transcodis_server::MIGRATOR")]
async fn a_stuck_job_is_reclaimed_and_redispatched_once(pool: PgPool) {
    let repo = JobRepository::from_pool(pool);
    let job = repo.add_job("movies/a.mkv", "out/a.mkv", 1).await.unwrap();
    repo.mark_dispatched(job.id).await.unwrap();

    let bus: Arc<dyn EventBus> = Arc::new(InMemoryEventBus::new());
    let scheduler = Arc::new(Scheduler::new(
        repo.clone(),
        Arc::clone(&bus),
        broker_config(),
        SchedulerConfig {
            // A zero job_timeout means the job is stuck from tick one.
            schedule_time: Duration::from_millis(20),
            job_timeout: Duration::from_secs(0),
            shutdown_grace: Duration::from_millis(50),
            batch_size: 10,
        },
    ));

    let cancellation = CancellationToken::new();
    let run_token = cancellation.clone();
    let run_task = tokio::spawn(async move { scheduler.run(run_token).await });

    let mut stream = bus.consume("encode.request").await.unwrap();
    let (_, ack) = tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("reclaimed job should be redispatched")
        .unwrap()
        .unwrap();
    ack.ack();

    cancellation.cancel();
    run_task.await.unwrap();

    let after = repo.get(job.id).await.unwrap();
    assert_eq!(after.status, transcodis_core::job::JobStatus::Added);
}
