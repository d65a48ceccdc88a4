use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;
use crate::ids::CollectionId;
use crate::segment::{Segment, SegmentStatus};

/// Kind of batch a collection represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionType {
    /// Fixed historical range, all segments materialized at creation.
    Backfill,
    /// Open-ended range that grows forward as data becomes available.
    RollingUpdate,
}

impl CollectionType {
    /// Returns the canonical string stored in SQLite.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Backfill => "backfill",
            Self::RollingUpdate => "rolling_update",
        }
    }
}

impl FromStr for CollectionType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "backfill" => Ok(Self::Backfill),
            "rolling_update" => Ok(Self::RollingUpdate),
            _ => Err(CoreError::invalid_state(format!(
                "unknown collection type: {s}"
            ))),
        }
    }
}

impl fmt::Display for CollectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a collection.
///
/// ```text
/// pending ──► running ──► completed | failed
///    │          │  ▲          │
///    │          ▼  │          └──► running   (retry_failed)
///    │        paused
///    └──────────┴──────────────► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl CollectionStatus {
    /// All statuses, in lifecycle order.
    pub const ALL: [Self; 6] = [
        Self::Pending,
        Self::Running,
        Self::Paused,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Returns the canonical string stored in SQLite.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Statuses the scheduler picks up on every tick.
    #[must_use]
    pub const fn is_schedulable(&self) -> bool {
        matches!(self, Self::Pending | Self::Running)
    }

    /// Returns true once no further automatic transition can happen.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Returns whether the state machine permits moving to `next`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        use CollectionStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Running, Paused)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Cancelled)
                | (Completed, Running)
                | (Failed, Running)
        )
    }
}

impl FromStr for CollectionStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::invalid_state(format!("unknown collection status: {s}")))
    }
}

impl fmt::Display for CollectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Half-open date range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    #[must_use]
    pub const fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Number of whole days covered by the range.
    #[must_use]
    pub fn days(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// Returns true when the range covers no days.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

/// Segment counts for one collection, recomputed on every segment transition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionStatistics {
    pub total_segments: u32,
    pub pending: u32,
    pub running: u32,
    pub completed: u32,
    /// All `failed` segments, including those waiting on a scheduled retry.
    pub failed: u32,
    /// Subset of `failed` with no retry left.
    pub exhausted: u32,
    /// Sum of `record_count` over completed segments.
    pub records_collected: u64,
}

impl CollectionStatistics {
    /// Tallies statistics from the full segment list of a collection.
    #[must_use]
    pub fn tally<'a>(segments: impl IntoIterator<Item = &'a Segment>) -> Self {
        let mut stats = Self::default();
        for segment in segments {
            stats.total_segments += 1;
            match segment.status {
                SegmentStatus::Pending => stats.pending += 1,
                SegmentStatus::Running => stats.running += 1,
                SegmentStatus::Completed => {
                    stats.completed += 1;
                    stats.records_collected += segment.record_count.unwrap_or(0);
                }
                SegmentStatus::Failed => {
                    stats.failed += 1;
                    if segment.is_exhausted() {
                        stats.exhausted += 1;
                    }
                }
            }
        }
        stats
    }

    /// Completed share of all segments, 0-100.
    #[must_use]
    pub fn progress_percentage(&self) -> f64 {
        if self.total_segments == 0 {
            return 0.0;
        }
        f64::from(self.completed) * 100.0 / f64::from(self.total_segments)
    }

    /// Segments that have been claimed at least once.
    #[must_use]
    pub const fn dispatched(&self) -> u32 {
        self.running + self.completed + self.failed
    }

    /// Returns true when every segment is completed or out of retries.
    #[must_use]
    pub const fn is_settled(&self) -> bool {
        self.total_segments > 0 && self.completed + self.exhausted == self.total_segments
    }
}

/// A batch job covering a date range, decomposed into segments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub collection_id: CollectionId,
    /// External query definition.
    pub workflow_id: String,
    /// External execution target.
    pub instance_id: String,
    pub collection_type: CollectionType,
    pub date_range: DateRange,
    pub segment_width_days: u32,
    /// Fixed workflow parameters merged into every execution request.
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub status: CollectionStatus,
    pub statistics: CollectionStatistics,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Collection {
    /// Default width of one segment.
    pub const DEFAULT_SEGMENT_WIDTH_DAYS: u32 = 7;

    /// Creates a pending collection with empty statistics.
    #[must_use]
    pub fn new(
        workflow_id: impl Into<String>,
        instance_id: impl Into<String>,
        collection_type: CollectionType,
        date_range: DateRange,
        segment_width_days: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            collection_id: CollectionId::new(),
            workflow_id: workflow_id.into(),
            instance_id: instance_id.into(),
            collection_type,
            date_range,
            segment_width_days,
            parameters: serde_json::Map::new(),
            status: CollectionStatus::Pending,
            statistics: CollectionStatistics::default(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the fixed workflow parameters.
    #[must_use]
    pub fn with_parameters(mut self, parameters: serde_json::Map<String, serde_json::Value>) -> Self {
        self.parameters = parameters;
        self
    }

    /// Expected segment count for the current date range.
    #[must_use]
    pub fn expected_segments(&self) -> u32 {
        let days = self.date_range.days().max(0) as u64;
        let width = u64::from(self.segment_width_days.max(1));
        u32::try_from(days.div_ceil(width)).unwrap_or(u32::MAX)
    }

    /// Next status implied by the current statistics, if any.
    ///
    /// A backfill settles as `failed` only when every segment is exhausted;
    /// any completed segment makes it `completed`. Rolling updates never
    /// settle on their own.
    #[must_use]
    pub fn rollup_status(&self) -> Option<CollectionStatus> {
        let stats = &self.statistics;
        match self.status {
            CollectionStatus::Pending if stats.dispatched() > 0 => Some(CollectionStatus::Running),
            CollectionStatus::Running
                if self.collection_type == CollectionType::Backfill && stats.is_settled() =>
            {
                if stats.completed == 0 {
                    Some(CollectionStatus::Failed)
                } else {
                    Some(CollectionStatus::Completed)
                }
            }
            _ => None,
        }
    }
}
