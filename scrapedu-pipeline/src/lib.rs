//! scrapedu pipeline: rate limiting, phase dispatch, and the worker pool.
//!
//! - [`limiter`] — per-host rate limiter
//! - [`registry`] — phase handler trait and registry
//! - [`context`] — what a handler sees
//! - [`orchestrator`] — bounded worker pool, dry-run planning
//! - [`rescrape`] — manifest + metadata reset

pub mod context;
pub mod error;
pub mod limiter;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod rescrape;
mod worker;

pub use context::PhaseContext;
pub use error::{PipelineError, StoreFailed};
pub use limiter::RateLimiter;
pub use orchestrator::{Orchestrator, PlannedEntity, RunOptions, RunSummary};
pub use registry::{Outcome, PhaseDefinition, PhaseHandler, PhaseRegistry, Unconfigured};
pub use rescrape::rescrape;

pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;
