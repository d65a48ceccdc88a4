//! Control operations exposed to the rest of the application.

use std::sync::Arc;

use harvest_core::config::CollectionConfig;
use harvest_core::metrics::COLLECTION_TRANSITIONS;
use harvest_core::{
    plan_windows, Clock, Collection, CollectionId, CollectionStatus, CollectionStore,
    CollectionType, CoreError, CoreResult, DateRange, Segment, SegmentStatus, SegmentStore,
    SegmentUpdate,
};
use serde::Serialize;
use tracing::{debug, info};

/// Attempts at a read-then-compare-and-set status change before giving up.
const MAX_STATUS_ATTEMPTS: usize = 3;

/// Request to create a collection.
#[derive(Debug, Clone)]
pub struct CreateCollection {
    pub workflow_id: String,
    pub instance_id: String,
    pub collection_type: CollectionType,
    pub date_range: DateRange,
    /// Falls back to the configured default width.
    pub segment_width_days: Option<u32>,
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl CreateCollection {
    #[must_use]
    pub fn new(
        workflow_id: impl Into<String>,
        instance_id: impl Into<String>,
        collection_type: CollectionType,
        date_range: DateRange,
    ) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            instance_id: instance_id.into(),
            collection_type,
            date_range,
            segment_width_days: None,
            parameters: serde_json::Map::new(),
        }
    }

    #[must_use]
    pub fn with_segment_width(mut self, days: u32) -> Self {
        self.segment_width_days = Some(days);
        self
    }

    #[must_use]
    pub fn with_parameters(
        mut self,
        parameters: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Read-only projection for progress polling.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionProgress {
    pub collection: Collection,
    pub progress_percentage: f64,
    pub segments: Vec<Segment>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServiceSettings {
    pub default_segment_width_days: u32,
    pub max_backfill_days: u32,
}

impl Default for ServiceSettings {
    fn default() -> Self {
        Self {
            default_segment_width_days: Collection::DEFAULT_SEGMENT_WIDTH_DAYS,
            max_backfill_days: 430,
        }
    }
}

impl ServiceSettings {
    #[must_use]
    pub fn from_config(config: &CollectionConfig) -> Self {
        Self {
            default_segment_width_days: config.default_segment_width_days,
            max_backfill_days: config.max_backfill_days,
        }
    }
}

/// Creates collections and applies user-requested status transitions.
///
/// Every transition is a compare-and-set against the status just read, so
/// a request racing the scheduler's rollup is retried on fresh state rather
/// than overwriting it.
#[derive(Clone)]
pub struct CollectionService {
    collections: Arc<dyn CollectionStore>,
    segments: Arc<dyn SegmentStore>,
    clock: Arc<dyn Clock>,
    settings: ServiceSettings,
}

impl CollectionService {
    #[must_use]
    pub fn new(
        collections: Arc<dyn CollectionStore>,
        segments: Arc<dyn SegmentStore>,
        clock: Arc<dyn Clock>,
        settings: ServiceSettings,
    ) -> Self {
        Self {
            collections,
            segments,
            clock,
            settings,
        }
    }

    /// Validates the request, plans its segments and stores both atomically.
    ///
    /// Rolling collections may start with an empty range; the scheduler
    /// appends their windows once the data is available.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` for malformed requests.
    pub async fn create_collection(&self, request: CreateCollection) -> CoreResult<CollectionId> {
        let width = request
            .segment_width_days
            .unwrap_or(self.settings.default_segment_width_days);
        self.validate(&request, width)?;

        let now = self.clock.now();
        let collection = Collection::new(
            request.workflow_id,
            request.instance_id,
            request.collection_type,
            request.date_range,
            width,
            now,
        )
        .with_parameters(request.parameters);
        let segments: Vec<Segment> = plan_windows(collection.date_range, width)
            .into_iter()
            .map(|window| Segment::new(collection.collection_id, window, now))
            .collect();

        self.collections.create(&collection, &segments).await?;
        info!(
            collection_id = %collection.collection_id,
            collection_type = %collection.collection_type,
            start = %collection.date_range.start,
            end = %collection.date_range.end,
            segments = segments.len(),
            "Created collection"
        );
        Ok(collection.collection_id)
    }

    fn validate(&self, request: &CreateCollection, width: u32) -> CoreResult<()> {
        if request.workflow_id.trim().is_empty() {
            return Err(CoreError::validation("workflow_id must not be empty"));
        }
        if request.instance_id.trim().is_empty() {
            return Err(CoreError::validation("instance_id must not be empty"));
        }
        if width == 0 {
            return Err(CoreError::validation("segment width must be at least one day"));
        }

        let range = request.date_range;
        match request.collection_type {
            CollectionType::Backfill if range.is_empty() => {
                return Err(CoreError::validation(format!(
                    "backfill range {} .. {} is empty",
                    range.start, range.end
                )));
            }
            CollectionType::RollingUpdate if range.end < range.start => {
                return Err(CoreError::validation(format!(
                    "rolling range ends before it starts ({} .. {})",
                    range.start, range.end
                )));
            }
            _ => {}
        }
        if range.days() > i64::from(self.settings.max_backfill_days) {
            return Err(CoreError::validation(format!(
                "range spans {} days, the limit is {}",
                range.days(),
                self.settings.max_backfill_days
            )));
        }
        Ok(())
    }

    /// Stops new dispatches; in-flight segments finish normally.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` unless the collection is running.
    pub async fn pause(&self, collection_id: CollectionId) -> CoreResult<Collection> {
        self.transition(collection_id, CollectionStatus::Paused, |status| {
            status == CollectionStatus::Running
        })
        .await
    }

    /// # Errors
    ///
    /// Returns `InvalidState` unless the collection is paused.
    pub async fn resume(&self, collection_id: CollectionId) -> CoreResult<Collection> {
        self.transition(collection_id, CollectionStatus::Running, |status| {
            status == CollectionStatus::Paused
        })
        .await
    }

    /// # Errors
    ///
    /// Returns `InvalidState` for completed or failed collections.
    pub async fn cancel(&self, collection_id: CollectionId) -> CoreResult<Collection> {
        self.transition(collection_id, CollectionStatus::Cancelled, |status| {
            matches!(
                status,
                CollectionStatus::Pending | CollectionStatus::Running | CollectionStatus::Paused
            )
        })
        .await
    }

    async fn transition(
        &self,
        collection_id: CollectionId,
        target: CollectionStatus,
        allowed_from: impl Fn(CollectionStatus) -> bool,
    ) -> CoreResult<Collection> {
        for _ in 0..MAX_STATUS_ATTEMPTS {
            let collection = self.require(collection_id).await?;
            if collection.status == target {
                return Ok(collection);
            }
            if !allowed_from(collection.status) {
                return Err(CoreError::invalid_state(format!(
                    "collection {collection_id} is {}, cannot move to {target}",
                    collection.status
                )));
            }

            match self
                .collections
                .update_status(collection_id, collection.status, target, self.clock.now())
                .await
            {
                Ok(updated) => {
                    COLLECTION_TRANSITIONS
                        .with_label_values(&[target.as_str()])
                        .inc();
                    info!(
                        collection_id = %collection_id,
                        from = %collection.status,
                        to = %target,
                        "Collection status changed"
                    );
                    return Ok(updated);
                }
                Err(err) if err.is_stale() => {
                    debug!(collection_id = %collection_id, "Status changed concurrently, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(CoreError::stale("collection", collection_id.to_string()))
    }

    /// Requeues every exhausted segment with a fresh attempt budget and
    /// reopens a settled collection. Returns the number of requeued segments.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` for cancelled collections.
    pub async fn retry_failed(&self, collection_id: CollectionId) -> CoreResult<usize> {
        let collection = self.require(collection_id).await?;
        if collection.status == CollectionStatus::Cancelled {
            return Err(CoreError::invalid_state(format!(
                "collection {collection_id} is cancelled"
            )));
        }

        let mut requeued = 0;
        for segment in self.segments.list_by_collection(collection_id).await? {
            if !segment.is_exhausted() {
                continue;
            }
            match self
                .segments
                .update(
                    segment.segment_id,
                    &SegmentUpdate::requeue(),
                    &[SegmentStatus::Failed],
                    self.clock.now(),
                )
                .await
            {
                Ok(_) => requeued += 1,
                Err(err) if err.is_stale() => {
                    debug!(segment_id = %segment.segment_id, "Segment changed before requeue");
                }
                Err(err) => return Err(err),
            }
        }

        if requeued > 0 {
            let reopened = self
                .transition(collection_id, CollectionStatus::Running, |status| {
                    matches!(status, CollectionStatus::Completed | CollectionStatus::Failed)
                })
                .await;
            match reopened {
                Ok(_) => {}
                // Pending and paused collections keep their status.
                Err(CoreError::InvalidState { .. }) => {}
                Err(err) => return Err(err),
            }
        }

        info!(collection_id = %collection_id, requeued, "Requeued exhausted segments");
        Ok(requeued)
    }

    /// # Errors
    ///
    /// Returns `NotFound` for unknown collections.
    pub async fn get_progress(&self, collection_id: CollectionId) -> CoreResult<CollectionProgress> {
        let collection = self.require(collection_id).await?;
        let segments = self.segments.list_by_collection(collection_id).await?;
        Ok(CollectionProgress {
            progress_percentage: collection.statistics.progress_percentage(),
            collection,
            segments,
        })
    }

    /// Lists collections in any of `statuses`, or all when empty.
    ///
    /// # Errors
    ///
    /// Returns store errors.
    pub async fn list_collections(
        &self,
        statuses: &[CollectionStatus],
    ) -> CoreResult<Vec<Collection>> {
        self.collections.list(statuses).await
    }

    /// Deletes a collection and its segments.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` while any segment is running.
    pub async fn delete_collection(&self, collection_id: CollectionId) -> CoreResult<()> {
        let collection = self.require(collection_id).await?;
        if collection.statistics.running > 0 {
            return Err(CoreError::invalid_state(format!(
                "collection {collection_id} has {} running segment(s)",
                collection.statistics.running
            )));
        }
        self.collections.delete(collection_id).await?;
        info!(collection_id = %collection_id, "Deleted collection");
        Ok(())
    }

    async fn require(&self, collection_id: CollectionId) -> CoreResult<Collection> {
        self.collections
            .get(collection_id)
            .await?
            .ok_or_else(|| CoreError::not_found("collection", collection_id.to_string()))
    }
}
