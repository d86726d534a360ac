//! Capability abstractions shared by the coordinator and the worker.
//!
//! Neither side talks to the broker transport or spawns subprocesses
//! directly; both go through the traits in [`bus`] and [`process`] so the
//! concrete transport (Redis, a real `ffmpeg` binary) can be swapped for
//! an in-memory fake in tests.

pub mod bus;
pub mod bus_redis;
pub mod process;

pub use bus::{AckHandle, EventBus, EventBusError, InMemoryEventBus};
pub use bus_redis::RedisEventBus;
pub use process::{
    FakeProcessRunner, ProcessError, ProcessRunner, RunOutcome, RunRequest, TokioProcessRunner,
};
