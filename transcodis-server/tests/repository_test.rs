//! Repository behaviour against a real, migrated Postgres instance,
//! spun up per-test by `sqlx::test` the way the reference core's
//! `database_postgres_behaviour.rs` does.

use chrono::Utc;
use sqlx::PgPool;
use transcodis_core::job::{EventStatus, JobStatus, NotificationType, TaskEvent};
use transcodis_server::repository::{JobFilter, JobRepository};

#[sqlx::test(migrator = "transcodis_server::MIGRATOR")]
async fn add_job_is_idempotent_by_source_and_destination(pool: PgPool) {
    let repo = JobRepository::from_pool(pool);
    let first = repo.add_job("movies/a.mkv", "out/a.mkv", 5).await.unwrap();
    let second = repo.add_job("movies/a.mkv", "out/a.mkv", 5).await.unwrap();
    assert_eq!(first.id, second.id);

    let all = repo.list(&JobFilter::default()).await.unwrap();
    assert_eq!(all.len(), 1);
}

#[sqlx::test(migrator = "transcodis_server::MIGRATOR")]
async fn select_schedulable_returns_fresh_queued_jobs(pool: PgPool) {
    let repo = JobRepository::from_pool(pool);
    let job = repo.add_job("movies/a.mkv", "out/a.mkv", 1).await.unwrap();

    let schedulable = repo.select_schedulable(10, 1800).await.unwrap();
    assert_eq!(schedulable.len(), 1);
    assert_eq!(schedulable[0].id, job.id);
    assert_eq!(schedulable[0].status, JobStatus::Queued);
}

#[sqlx::test(migrator = "transcodis_server::MIGRATOR")]
async fn stuck_job_past_job_timeout_is_reclaimable(pool: PgPool) {
    let repo = JobRepository::from_pool(pool);
    let job = repo.add_job("movies/a.mkv", "out/a.mkv", 1).await.unwrap();
    repo.mark_dispatched(job.id).await.unwrap();

    // Freshly dispatched: not stuck yet under any reasonable timeout.
    let none_stuck = repo.select_schedulable(10, 3600).await.unwrap();
    assert!(none_stuck.is_empty());

    // A zero-second timeout treats it as immediately stuck.
    let stuck = repo.select_schedulable(10, 0).await.unwrap();
    assert_eq!(stuck.len(), 1);

    let observed_event_id = stuck[0].event_id;
    let reclaimed = repo.reclaim(job.id, observed_event_id).await.unwrap();
    assert!(reclaimed);

    let after = repo.get(job.id).await.unwrap();
    assert_eq!(after.status, JobStatus::Queued);
    assert!(after.worker_name.is_none());
}

#[sqlx::test(migrator = "transcodis_server::MIGRATOR")]
async fn apply_event_discards_out_of_order_events(pool: PgPool) {
    let repo = JobRepository::from_pool(pool);
    let job = repo.add_job("movies/a.mkv", "out/a.mkv", 1).await.unwrap();

    let first = TaskEvent::new(job.id, 1, "worker-1", NotificationType::Download, EventStatus::Started, None);
    let stale = TaskEvent {
        event_time: Utc::now(),
        ..TaskEvent::new(job.id, 1, "worker-1", NotificationType::Download, EventStatus::Progressing, None)
    };

    assert!(repo.apply_event(&first).await.unwrap());
    assert!(!repo.apply_event(&stale).await.unwrap());

    let after = repo.get(job.id).await.unwrap();
    assert_eq!(after.event_id, 1);
    assert_eq!(after.status, JobStatus::Downloading);
}

#[sqlx::test(migrator = "transcodis_server::MIGRATOR")]
async fn cancel_moves_non_terminal_job_to_canceled(pool: PgPool) {
    let repo = JobRepository::from_pool(pool);
    let job = repo.add_job("movies/a.mkv", "out/a.mkv", 1).await.unwrap();
    repo.cancel(job.id).await.unwrap();

    let after = repo.get(job.id).await.unwrap();
    assert_eq!(after.status, JobStatus::Canceled);

    // Canceling again is a no-op; the terminal status doesn't move.
    repo.cancel(job.id).await.unwrap();
    let still = repo.get(job.id).await.unwrap();
    assert_eq!(still.status, JobStatus::Canceled);
}
