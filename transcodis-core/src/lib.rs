//! Shared domain model for the transcodis coordinator and worker.
//!
//! This crate owns the job state machine, the wire types exchanged over
//! the broker, the probed container description, and the pure FFMPEG
//! command planner. Neither the coordinator nor the worker binary holds
//! its own copy of these types.

pub mod container;
pub mod error;
pub mod job;
pub mod planner;
pub mod probe;

pub use error::{CoreError, CoreResult};
