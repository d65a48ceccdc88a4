use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use crate::collection::{Collection, CollectionStatus};
use crate::error::CoreResult;
use crate::ids::{CollectionId, SegmentId};
use crate::segment::{Segment, SegmentStatus};
use crate::update::SegmentUpdate;

/// Durable table of collection jobs.
#[async_trait]
pub trait CollectionStore: Send + Sync {
    /// Persists a new collection together with its initial segments.
    ///
    /// Statistics are tallied from `segments` in the same write.
    async fn create(&self, collection: &Collection, segments: &[Segment]) -> CoreResult<()>;

    /// Fetches a collection by identifier.
    async fn get(&self, collection_id: CollectionId) -> CoreResult<Option<Collection>>;

    /// Lists collections whose status is in `statuses` (all when empty),
    /// oldest first.
    async fn list(&self, statuses: &[CollectionStatus]) -> CoreResult<Vec<Collection>>;

    /// Moves a collection from `expected` to `next`, stamping `updated_at`
    /// with `now`.
    ///
    /// Fails with `StaleState` when the stored status is not `expected`, and
    /// with `InvalidState` when the state machine forbids the transition.
    async fn update_status(
        &self,
        collection_id: CollectionId,
        expected: CollectionStatus,
        next: CollectionStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<Collection>;

    /// Deletes a collection and every segment it owns.
    async fn delete(&self, collection_id: CollectionId) -> CoreResult<()>;
}

/// Durable table of collection segments.
#[async_trait]
pub trait SegmentStore: Send + Sync {
    /// Fetches a segment by identifier.
    async fn get(&self, segment_id: SegmentId) -> CoreResult<Option<Segment>>;

    /// Lists all segments of a collection ordered by window.
    async fn list_by_collection(&self, collection_id: CollectionId) -> CoreResult<Vec<Segment>>;

    /// Segments eligible for dispatch at `now`, ordered by window.
    ///
    /// Eligible means `pending`, or `failed` with `attempt_count <
    /// max_attempts` and a retry time at or before `now`.
    async fn list_due(
        &self,
        collection_id: CollectionId,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> CoreResult<Vec<Segment>>;

    /// Claims a due segment for dispatch (`pending | failed → running`).
    ///
    /// The write is conditioned on the same predicate as [`list_due`] and on
    /// the owning collection being `pending` or `running`, so a segment that
    /// was settled or exhausted since it was listed, or whose collection was
    /// paused or cancelled meanwhile, is never claimed. Fails with
    /// `StaleState` when either condition does not hold.
    ///
    /// [`list_due`]: SegmentStore::list_due
    async fn claim(
        &self,
        segment_id: SegmentId,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> CoreResult<Segment>;

    /// Conditionally applies `update` when the stored status is one of
    /// `expected`, then recomputes the owning collection's statistics.
    /// Both rows are stamped with `now`.
    ///
    /// Fails with `StaleState` when the status does not match.
    async fn update(
        &self,
        segment_id: SegmentId,
        update: &SegmentUpdate,
        expected: &[SegmentStatus],
        now: DateTime<Utc>,
    ) -> CoreResult<Segment>;

    /// Appends newly eligible segments to a rolling collection and advances
    /// its `end_date` to `new_end`.
    async fn append(
        &self,
        collection_id: CollectionId,
        segments: &[Segment],
        new_end: NaiveDate,
        now: DateTime<Utc>,
    ) -> CoreResult<Collection>;
}
