//! Typed partial updates for segment rows.
//!
//! Every constructor spells out every field, so leaving a column untouched
//! is always written down as `FieldUpdate::Keep`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::ExecutionId;
use crate::segment::SegmentStatus;

/// Change to one nullable column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldUpdate<T> {
    /// Leave the stored value as is.
    Keep,
    /// Overwrite with a new value.
    Set(T),
    /// Reset to `NULL`.
    Clear,
}

impl<T: Clone> FieldUpdate<T> {
    /// Applies the change to an in-memory slot.
    pub fn apply_to(&self, slot: &mut Option<T>) {
        match self {
            Self::Keep => {}
            Self::Set(value) => *slot = Some(value.clone()),
            Self::Clear => *slot = None,
        }
    }
}

impl<T> FieldUpdate<T> {
    /// Numeric mode used by SQL `CASE` expressions: 0 keep, 1 set, 2 clear.
    #[must_use]
    pub const fn mode(&self) -> i64 {
        match self {
            Self::Keep => 0,
            Self::Set(_) => 1,
            Self::Clear => 2,
        }
    }

    /// Returns the new value when this is a `Set`.
    #[must_use]
    pub const fn value(&self) -> Option<&T> {
        match self {
            Self::Set(value) => Some(value),
            Self::Keep | Self::Clear => None,
        }
    }
}

/// Change to the dispatch attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptChange {
    Keep,
    Increment,
    Reset,
}

impl AttemptChange {
    /// Numeric mode used by SQL `CASE` expressions: 0 keep, 1 increment, 2 reset.
    #[must_use]
    pub const fn mode(&self) -> i64 {
        match self {
            Self::Keep => 0,
            Self::Increment => 1,
            Self::Reset => 2,
        }
    }

    /// Returns the counter after the change.
    #[must_use]
    pub const fn apply(&self, current: u32) -> u32 {
        match self {
            Self::Keep => current,
            Self::Increment => current.saturating_add(1),
            Self::Reset => 0,
        }
    }
}

/// One segment state transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentUpdate {
    pub status: SegmentStatus,
    pub attempt: AttemptChange,
    pub execution_id: FieldUpdate<ExecutionId>,
    pub execution_attempt: FieldUpdate<u32>,
    pub record_count: FieldUpdate<u64>,
    pub error_message: FieldUpdate<String>,
    pub next_attempt_at: FieldUpdate<DateTime<Utc>>,
    pub started_at: FieldUpdate<DateTime<Utc>>,
    pub completed_at: FieldUpdate<DateTime<Utc>>,
}

impl SegmentUpdate {
    /// `pending | failed → running`: a worker takes ownership of the segment.
    ///
    /// The previous `execution_id` stays for audit until a new submission
    /// overwrites it.
    #[must_use]
    pub fn claim(now: DateTime<Utc>) -> Self {
        Self {
            status: SegmentStatus::Running,
            attempt: AttemptChange::Increment,
            execution_id: FieldUpdate::Keep,
            execution_attempt: FieldUpdate::Keep,
            record_count: FieldUpdate::Clear,
            error_message: FieldUpdate::Clear,
            next_attempt_at: FieldUpdate::Clear,
            started_at: FieldUpdate::Set(now),
            completed_at: FieldUpdate::Clear,
        }
    }

    /// `running → running`: records the lineage key of an accepted submission.
    #[must_use]
    pub fn submitted(execution_id: ExecutionId, attempt: u32) -> Self {
        Self {
            status: SegmentStatus::Running,
            attempt: AttemptChange::Keep,
            execution_id: FieldUpdate::Set(execution_id),
            execution_attempt: FieldUpdate::Set(attempt),
            record_count: FieldUpdate::Keep,
            error_message: FieldUpdate::Keep,
            next_attempt_at: FieldUpdate::Keep,
            started_at: FieldUpdate::Keep,
            completed_at: FieldUpdate::Keep,
        }
    }

    /// `running → completed`.
    #[must_use]
    pub fn complete(record_count: u64, now: DateTime<Utc>) -> Self {
        Self {
            status: SegmentStatus::Completed,
            attempt: AttemptChange::Keep,
            execution_id: FieldUpdate::Keep,
            execution_attempt: FieldUpdate::Keep,
            record_count: FieldUpdate::Set(record_count),
            error_message: FieldUpdate::Clear,
            next_attempt_at: FieldUpdate::Clear,
            started_at: FieldUpdate::Keep,
            completed_at: FieldUpdate::Set(now),
        }
    }

    /// `running → failed`, with a retry time or none when retries are exhausted.
    #[must_use]
    pub fn fail(
        error_message: impl Into<String>,
        next_attempt_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            status: SegmentStatus::Failed,
            attempt: AttemptChange::Keep,
            execution_id: FieldUpdate::Keep,
            execution_attempt: FieldUpdate::Keep,
            record_count: FieldUpdate::Clear,
            error_message: FieldUpdate::Set(error_message.into()),
            next_attempt_at: next_attempt_at.map_or(FieldUpdate::Clear, FieldUpdate::Set),
            started_at: FieldUpdate::Keep,
            completed_at: FieldUpdate::Set(now),
        }
    }

    /// `failed → failed`: drops a scheduled retry, keeping the last error.
    #[must_use]
    pub fn exhaust() -> Self {
        Self {
            status: SegmentStatus::Failed,
            attempt: AttemptChange::Keep,
            execution_id: FieldUpdate::Keep,
            execution_attempt: FieldUpdate::Keep,
            record_count: FieldUpdate::Keep,
            error_message: FieldUpdate::Keep,
            next_attempt_at: FieldUpdate::Clear,
            started_at: FieldUpdate::Keep,
            completed_at: FieldUpdate::Keep,
        }
    }

    /// `failed → pending` with a fresh attempt budget.
    #[must_use]
    pub fn requeue() -> Self {
        Self {
            status: SegmentStatus::Pending,
            attempt: AttemptChange::Reset,
            execution_id: FieldUpdate::Keep,
            execution_attempt: FieldUpdate::Keep,
            record_count: FieldUpdate::Clear,
            error_message: FieldUpdate::Clear,
            next_attempt_at: FieldUpdate::Clear,
            started_at: FieldUpdate::Clear,
            completed_at: FieldUpdate::Clear,
        }
    }
}
