//! The worker as a library: checkpointed three-stage pipeline, the PGS
//! OCR bridge, and worker configuration. `main.rs` is a thin binary
//! wrapper over this crate so integration tests can drive the pipeline
//! directly against fake transport/process doubles.

pub mod checkpoint;
pub mod config;
pub mod errors;
pub mod events;
pub mod ocr_bridge;
pub mod pipeline;
pub mod retry;
pub mod task;
