//! Core domain types and traits for the Harvest collection orchestrator.

pub mod clock;
pub mod collection;
pub mod config;
pub mod error;
pub mod execution;
pub mod ids;
pub mod metrics;
pub mod plan;
pub mod retry;
pub mod segment;
pub mod traits;
pub mod update;

pub use clock::{Clock, ManualClock, SystemClock};
pub use collection::{
    Collection, CollectionStatistics, CollectionStatus, CollectionType, DateRange,
};
pub use config::HarvestConfig;
pub use error::{CoreError, CoreResult};
pub use execution::{
    ExecutionClient, ExecutionError, ExecutionHandle, ExecutionRequest, ExecutionState,
    ExecutionStatus,
};
pub use ids::{CollectionId, ExecutionId, SegmentId};
pub use plan::{data_frontier, plan_windows, rolling_windows, TimeWindow};
pub use retry::{RetryDecision, RetryPolicy};
pub use segment::{Segment, SegmentStatus};
pub use traits::{CollectionStore, SegmentStore};
pub use update::{AttemptChange, FieldUpdate, SegmentUpdate};
