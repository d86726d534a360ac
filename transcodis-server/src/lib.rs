//! The coordinator as a library: job repository, scheduler, and the
//! HTTP surface workers pull source bytes from and push encoded
//! results to. `main.rs` is a thin binary wrapper over this crate so
//! integration tests can exercise the repository and scheduler
//! directly against a real database.

pub mod config;
pub mod errors;
pub mod http;
pub mod repository;
pub mod scheduler;

/// Embedded schema migrations, exposed so integration tests can spin up
/// a throwaway database via `#[sqlx::test(migrator = "transcodis_server::MIGRATOR")]`
/// instead of duplicating the migration path.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
