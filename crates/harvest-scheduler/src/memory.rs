//! In-process store for embedding the orchestrator and for tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use harvest_core::{
    Collection, CollectionId, CollectionStatistics, CollectionStatus, CollectionStore,
    CollectionType, CoreError, CoreResult, Segment, SegmentId, SegmentStatus, SegmentStore,
    SegmentUpdate,
};
use parking_lot::Mutex;

#[derive(Debug, Default)]
struct MemoryState {
    collections: HashMap<CollectionId, Collection>,
    segments: HashMap<SegmentId, Segment>,
}

impl MemoryState {
    fn segments_of(&self, collection_id: CollectionId) -> Vec<Segment> {
        let mut segments: Vec<Segment> = self
            .segments
            .values()
            .filter(|segment| segment.collection_id == collection_id)
            .cloned()
            .collect();
        segments.sort_by_key(|segment| segment.window_start);
        segments
    }

    fn refresh_statistics(&mut self, collection_id: CollectionId, now: DateTime<Utc>) {
        let statistics = CollectionStatistics::tally(
            self.segments
                .values()
                .filter(|segment| segment.collection_id == collection_id),
        );
        if let Some(collection) = self.collections.get_mut(&collection_id) {
            collection.statistics = statistics;
            collection.updated_at = now;
        }
    }

    /// Applies `update` to a segment and recounts its collection.
    fn apply(
        &mut self,
        segment_id: SegmentId,
        update: &SegmentUpdate,
        now: DateTime<Utc>,
        allowed: impl FnOnce(&Segment) -> bool,
    ) -> CoreResult<Segment> {
        let segment = self
            .segments
            .get_mut(&segment_id)
            .ok_or_else(|| CoreError::not_found("segment", segment_id.to_string()))?;
        if !allowed(segment) {
            return Err(CoreError::stale("segment", segment_id.to_string()));
        }
        segment.apply(update, now)?;
        let segment = segment.clone();
        self.refresh_statistics(segment.collection_id, now);
        Ok(segment)
    }
}

/// Collection and segment store held in memory behind one lock.
///
/// Each operation runs under the lock, which gives the same conditional
/// write semantics as the SQLite store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one collection.
    #[must_use]
    pub fn collection(&self, collection_id: CollectionId) -> Option<Collection> {
        self.state.lock().collections.get(&collection_id).cloned()
    }

    /// Snapshot of one segment.
    #[must_use]
    pub fn segment(&self, segment_id: SegmentId) -> Option<Segment> {
        self.state.lock().segments.get(&segment_id).cloned()
    }

    /// Snapshot of a collection's segments ordered by window.
    #[must_use]
    pub fn segments_of(&self, collection_id: CollectionId) -> Vec<Segment> {
        self.state.lock().segments_of(collection_id)
    }
}

fn check_ownership(collection_id: CollectionId, segments: &[Segment]) -> CoreResult<()> {
    match segments
        .iter()
        .find(|segment| segment.collection_id != collection_id)
    {
        Some(stray) => Err(CoreError::invalid_state(format!(
            "segment {} belongs to collection {}",
            stray.segment_id, stray.collection_id
        ))),
        None => Ok(()),
    }
}

fn check_new_windows(
    state: &MemoryState,
    collection_id: CollectionId,
    segments: &[Segment],
) -> CoreResult<()> {
    let mut starts: Vec<NaiveDate> = state
        .segments_of(collection_id)
        .iter()
        .map(|segment| segment.window_start)
        .collect();
    for segment in segments {
        segment.check_invariants()?;
        if state.segments.contains_key(&segment.segment_id) || starts.contains(&segment.window_start)
        {
            return Err(CoreError::already_exists(
                "segment",
                segment.segment_id.to_string(),
            ));
        }
        starts.push(segment.window_start);
    }
    Ok(())
}

#[async_trait]
impl CollectionStore for InMemoryStore {
    async fn create(&self, collection: &Collection, segments: &[Segment]) -> CoreResult<()> {
        check_ownership(collection.collection_id, segments)?;
        let mut state = self.state.lock();
        if state.collections.contains_key(&collection.collection_id) {
            return Err(CoreError::already_exists(
                "collection",
                collection.collection_id.to_string(),
            ));
        }
        check_new_windows(&state, collection.collection_id, segments)?;

        state
            .collections
            .insert(collection.collection_id, collection.clone());
        for segment in segments {
            state.segments.insert(segment.segment_id, segment.clone());
        }
        state.refresh_statistics(collection.collection_id, collection.updated_at);
        Ok(())
    }

    async fn get(&self, collection_id: CollectionId) -> CoreResult<Option<Collection>> {
        Ok(self.collection(collection_id))
    }

    async fn list(&self, statuses: &[CollectionStatus]) -> CoreResult<Vec<Collection>> {
        let state = self.state.lock();
        let mut collections: Vec<Collection> = state
            .collections
            .values()
            .filter(|collection| statuses.is_empty() || statuses.contains(&collection.status))
            .cloned()
            .collect();
        collections.sort_by_key(|collection| (collection.created_at, collection.collection_id));
        Ok(collections)
    }

    async fn update_status(
        &self,
        collection_id: CollectionId,
        expected: CollectionStatus,
        next: CollectionStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<Collection> {
        if !expected.can_transition_to(next) {
            return Err(CoreError::invalid_state(format!(
                "collection cannot move from {expected} to {next}"
            )));
        }
        let mut state = self.state.lock();
        let collection = state
            .collections
            .get_mut(&collection_id)
            .ok_or_else(|| CoreError::not_found("collection", collection_id.to_string()))?;
        if collection.status != expected {
            return Err(CoreError::stale("collection", collection_id.to_string()));
        }
        collection.status = next;
        collection.updated_at = now;
        Ok(collection.clone())
    }

    async fn delete(&self, collection_id: CollectionId) -> CoreResult<()> {
        let mut state = self.state.lock();
        if state.collections.remove(&collection_id).is_none() {
            return Err(CoreError::not_found("collection", collection_id.to_string()));
        }
        state
            .segments
            .retain(|_, segment| segment.collection_id != collection_id);
        Ok(())
    }
}

#[async_trait]
impl SegmentStore for InMemoryStore {
    async fn get(&self, segment_id: SegmentId) -> CoreResult<Option<Segment>> {
        Ok(self.segment(segment_id))
    }

    async fn list_by_collection(&self, collection_id: CollectionId) -> CoreResult<Vec<Segment>> {
        Ok(self.segments_of(collection_id))
    }

    async fn list_due(
        &self,
        collection_id: CollectionId,
        now: DateTime<Utc>,
        max_attempts: u32,
        limit: usize,
    ) -> CoreResult<Vec<Segment>> {
        Ok(self
            .segments_of(collection_id)
            .into_iter()
            .filter(|segment| segment.is_due(now, max_attempts))
            .take(limit)
            .collect())
    }

    async fn claim(
        &self,
        segment_id: SegmentId,
        now: DateTime<Utc>,
        max_attempts: u32,
    ) -> CoreResult<Segment> {
        let mut state = self.state.lock();
        let schedulable = state
            .segments
            .get(&segment_id)
            .and_then(|segment| state.collections.get(&segment.collection_id))
            .is_some_and(|collection| collection.status.is_schedulable());
        state.apply(segment_id, &SegmentUpdate::claim(now), now, |segment| {
            schedulable && segment.is_due(now, max_attempts)
        })
    }

    async fn update(
        &self,
        segment_id: SegmentId,
        update: &SegmentUpdate,
        expected: &[SegmentStatus],
        now: DateTime<Utc>,
    ) -> CoreResult<Segment> {
        self.state
            .lock()
            .apply(segment_id, update, now, |segment| {
                expected.contains(&segment.status)
            })
    }

    async fn append(
        &self,
        collection_id: CollectionId,
        segments: &[Segment],
        new_end: NaiveDate,
        now: DateTime<Utc>,
    ) -> CoreResult<Collection> {
        check_ownership(collection_id, segments)?;
        let mut state = self.state.lock();
        let collection = state
            .collections
            .get(&collection_id)
            .ok_or_else(|| CoreError::not_found("collection", collection_id.to_string()))?;
        if collection.collection_type != CollectionType::RollingUpdate
            || collection.date_range.end > new_end
            || segments.iter().any(|segment| segment.window_end > new_end)
        {
            return Err(CoreError::invalid_state(format!(
                "collection {collection_id} cannot be extended to {new_end}"
            )));
        }
        check_new_windows(&state, collection_id, segments)?;

        for segment in segments {
            state.segments.insert(segment.segment_id, segment.clone());
        }
        if let Some(collection) = state.collections.get_mut(&collection_id) {
            collection.date_range.end = new_end;
        }
        state.refresh_statistics(collection_id, now);
        state
            .collections
            .get(&collection_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("collection", collection_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use harvest_core::{plan_windows, DateRange, ExecutionId};

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, d).unwrap()
    }

    async fn seeded() -> (InMemoryStore, Collection, Vec<Segment>) {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let collection = Collection::new(
            "wf",
            "inst",
            CollectionType::Backfill,
            DateRange::new(date(1), date(29)),
            7,
            now,
        );
        let segments: Vec<Segment> = plan_windows(collection.date_range, 7)
            .into_iter()
            .map(|w| Segment::new(collection.collection_id, w, now))
            .collect();
        store.create(&collection, &segments).await.unwrap();
        (store, collection, segments)
    }

    #[tokio::test]
    async fn conditional_update_rejects_unexpected_status() {
        let (store, _, segments) = seeded().await;
        let id = segments[0].segment_id;

        store.claim(id, Utc::now(), 3).await.unwrap();
        let err = store.claim(id, Utc::now(), 3).await.unwrap_err();
        assert!(err.is_stale());

        let err = store
            .update(
                id,
                &SegmentUpdate::complete(5, Utc::now()),
                &[SegmentStatus::Pending],
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(err.is_stale());
    }

    #[tokio::test]
    async fn invariant_violations_leave_the_row_untouched() {
        let (store, collection, segments) = seeded().await;
        let id = segments[0].segment_id;
        store.claim(id, Utc::now(), 3).await.unwrap();

        let err = store
            .update(
                id,
                &SegmentUpdate::complete(5, Utc::now()),
                &[SegmentStatus::Running],
                Utc::now(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvalidState { .. }));
        assert_eq!(store.segment(id).unwrap().status, SegmentStatus::Running);
        assert_eq!(
            store.collection(collection.collection_id).unwrap().statistics.running,
            1
        );
    }

    #[tokio::test]
    async fn statistics_follow_every_transition() {
        let (store, collection, segments) = seeded().await;
        let id = segments[0].segment_id;
        store.claim(id, Utc::now(), 3).await.unwrap();
        store
            .update(
                id,
                &SegmentUpdate::submitted(ExecutionId::new("exec-1"), 1),
                &[SegmentStatus::Running],
                Utc::now(),
            )
            .await
            .unwrap();
        store
            .update(
                id,
                &SegmentUpdate::complete(9, Utc::now()),
                &[SegmentStatus::Running],
                Utc::now(),
            )
            .await
            .unwrap();

        let stats = store.collection(collection.collection_id).unwrap().statistics;
        assert_eq!(stats.total_segments, 4);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.records_collected, 9);
    }

    #[tokio::test]
    async fn delete_drops_owned_segments() {
        let (store, collection, segments) = seeded().await;
        store.delete(collection.collection_id).await.unwrap();
        assert!(store.segment(segments[0].segment_id).is_none());
        assert!(store.segments_of(collection.collection_id).is_empty());
    }

    #[tokio::test]
    async fn claim_requires_a_schedulable_collection() {
        let (store, collection, segments) = seeded().await;
        let id = collection.collection_id;
        let now = Utc::now();

        store
            .update_status(id, CollectionStatus::Pending, CollectionStatus::Cancelled, now)
            .await
            .unwrap();
        let err = store.claim(segments[0].segment_id, now, 3).await.unwrap_err();
        assert!(err.is_stale());

        let segment = store.segment(segments[0].segment_id).unwrap();
        assert_eq!(segment.status, SegmentStatus::Pending);
        assert_eq!(segment.attempt_count, 0);
        assert_eq!(store.collection(id).unwrap().statistics.running, 0);
    }

    #[tokio::test]
    async fn writes_are_stamped_with_the_caller_time() {
        let (store, collection, segments) = seeded().await;
        let id = collection.collection_id;
        let at = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();

        store.claim(segments[0].segment_id, at, 3).await.unwrap();
        assert_eq!(store.segment(segments[0].segment_id).unwrap().updated_at, at);
        assert_eq!(store.collection(id).unwrap().updated_at, at);

        let later = at + chrono::Duration::minutes(1);
        let running = store
            .update_status(id, CollectionStatus::Pending, CollectionStatus::Running, later)
            .await
            .unwrap();
        assert_eq!(running.updated_at, later);
    }
}
