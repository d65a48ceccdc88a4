//! Scheduling, dispatch and external execution for Harvest collections.
//!
//! [`CollectionScheduler`] ticks over active collections and hands due
//! segments to the [`SegmentDispatcher`], which submits them through the
//! shared [`RateLimiter`] and settles them in the segment store.
//! [`CollectionService`] exposes the user-facing control operations.

pub mod dispatcher;
pub mod execution;
pub mod memory;
pub mod params;
pub mod rate_limiter;
pub mod scheduler;
pub mod service;

pub use dispatcher::{DispatchOutcome, PollSettings, SegmentDispatcher, SegmentFailure};
pub use execution::{
    await_terminal, AwaitOutcome, HttpExecutionClient, MockExecutionClient, ScriptedOutcome,
    SubmissionRecord,
};
pub use memory::InMemoryStore;
pub use params::build_request;
pub use rate_limiter::RateLimiter;
pub use scheduler::{CollectionScheduler, SchedulerParts, SchedulerSettings, TickReport};
pub use service::{CollectionProgress, CollectionService, CreateCollection, ServiceSettings};
