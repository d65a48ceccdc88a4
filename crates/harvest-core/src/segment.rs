use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{CoreError, CoreResult};
use crate::ids::{CollectionId, ExecutionId, SegmentId};
use crate::plan::TimeWindow;
use crate::update::SegmentUpdate;

/// Lifecycle state of a segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl SegmentStatus {
    /// Returns the canonical string stored in SQLite.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for SegmentStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(CoreError::invalid_state(format!(
                "unknown segment status: {s}"
            ))),
        }
    }
}

impl fmt::Display for SegmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One time window of a collection, dispatched as one external execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub segment_id: SegmentId,
    pub collection_id: CollectionId,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub status: SegmentStatus,
    /// Dispatch attempts so far, incremented on every claim.
    pub attempt_count: u32,
    /// Lineage key of the most recent accepted submission.
    pub execution_id: Option<ExecutionId>,
    /// Attempt number that produced `execution_id`.
    pub execution_attempt: Option<u32>,
    pub record_count: Option<u64>,
    pub error_message: Option<String>,
    /// When a failed segment becomes due again; `None` once retries are exhausted.
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Segment {
    /// Creates a pending segment for `window`.
    #[must_use]
    pub fn new(collection_id: CollectionId, window: TimeWindow, now: DateTime<Utc>) -> Self {
        Self {
            segment_id: SegmentId::new(),
            collection_id,
            window_start: window.start,
            window_end: window.end,
            status: SegmentStatus::Pending,
            attempt_count: 0,
            execution_id: None,
            execution_attempt: None,
            record_count: None,
            error_message: None,
            next_attempt_at: None,
            started_at: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[must_use]
    pub const fn window(&self) -> TimeWindow {
        TimeWindow::new(self.window_start, self.window_end)
    }

    /// Failed with no retry scheduled.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.status == SegmentStatus::Failed && self.next_attempt_at.is_none()
    }

    /// Failed with a retry scheduled that `max_attempts` no longer allows.
    ///
    /// Happens when the attempt ceiling is lowered while retries are
    /// pending; such a segment is never due again and must be exhausted.
    #[must_use]
    pub fn has_stranded_retry(&self, max_attempts: u32) -> bool {
        self.status == SegmentStatus::Failed
            && self.next_attempt_at.is_some()
            && self.attempt_count >= max_attempts
    }

    /// Running with an accepted submission from the current attempt.
    ///
    /// Such a segment must be re-polled, never resubmitted.
    #[must_use]
    pub fn has_live_execution(&self) -> bool {
        self.status == SegmentStatus::Running
            && self.execution_id.is_some()
            && self.execution_attempt == Some(self.attempt_count)
    }

    /// Eligible for dispatch at `now`.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        match self.status {
            SegmentStatus::Pending => true,
            SegmentStatus::Failed => {
                self.attempt_count < max_attempts
                    && self.next_attempt_at.is_some_and(|due| due <= now)
            }
            SegmentStatus::Running | SegmentStatus::Completed => false,
        }
    }

    /// Applies `update` in place and checks the row invariants.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the result would break an invariant; the
    /// segment is left unchanged in that case.
    pub fn apply(&mut self, update: &SegmentUpdate, now: DateTime<Utc>) -> CoreResult<()> {
        let mut next = self.clone();
        next.status = update.status;
        next.attempt_count = update.attempt.apply(next.attempt_count);
        update.execution_id.apply_to(&mut next.execution_id);
        update.execution_attempt.apply_to(&mut next.execution_attempt);
        update.record_count.apply_to(&mut next.record_count);
        update.error_message.apply_to(&mut next.error_message);
        update.next_attempt_at.apply_to(&mut next.next_attempt_at);
        update.started_at.apply_to(&mut next.started_at);
        update.completed_at.apply_to(&mut next.completed_at);
        next.updated_at = now;
        next.check_invariants()?;
        *self = next;
        Ok(())
    }

    /// Verifies the per-row invariants.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` describing the first violated invariant.
    pub fn check_invariants(&self) -> CoreResult<()> {
        if self.status == SegmentStatus::Completed && self.execution_id.is_none() {
            return Err(CoreError::invalid_state(format!(
                "segment {} cannot complete without an execution_id",
                self.segment_id
            )));
        }
        if self.error_message.is_some() && self.status != SegmentStatus::Failed {
            return Err(CoreError::invalid_state(format!(
                "segment {} carries an error_message while {}",
                self.segment_id, self.status
            )));
        }
        if self.record_count.is_some() && self.status != SegmentStatus::Completed {
            return Err(CoreError::invalid_state(format!(
                "segment {} carries a record_count while {}",
                self.segment_id, self.status
            )));
        }
        if self.window_end <= self.window_start {
            return Err(CoreError::invalid_state(format!(
                "segment {} has an empty window",
                self.segment_id
            )));
        }
        Ok(())
    }
}
