//! Core domain types for model job dispatch.
//!
//! This crate contains shared types used across all packages:
//! - Job descriptors, correlation ids and the per-job state machine
//! - Worker reply messages
//! - Domain events for real-time updates
//! - Queue configuration

mod config;
mod events;
mod job;
mod reply;

pub use config::{ConfigError, QueueConfig, QueueSettings};
pub use events::{DomainEvent, EventType, NAMESPACE_SEPARATOR};
pub use job::{
    CorrelationId, ImportDescriptor, InvalidCorrelationId, JobDescriptor, JobKind, JobState,
    TrackedJob, TransitionError, WorkQueue,
};
pub use reply::{Outcome, PROCESSING_STATUS, ReplyError, ReplyMessage, ReplyPayload};
