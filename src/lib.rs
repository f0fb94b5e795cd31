//! SMM panel order-fulfillment pipeline.
//!
//! Exposes the domain model, persistence, message bus, external-service
//! clients, order intake, and background workers so both `main.rs` and the
//! operator binaries under `src/bin/` can assemble them.

pub mod bus;
pub mod config;
pub mod domain;
pub mod error;
pub mod intake;
pub mod store;
pub mod tracker;
pub mod video;
pub mod workers;

pub use config::Config;
pub use error::{PipelineError, PipelineResult};
