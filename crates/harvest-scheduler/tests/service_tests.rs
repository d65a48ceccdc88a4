use std::sync::Arc;

use chrono::{NaiveDate, TimeZone, Utc};
use harvest_core::{
    Clock, CollectionStatus, CollectionType, CoreError, DateRange, ManualClock, SegmentStatus,
    SegmentStore,
};
use harvest_scheduler::{CollectionService, CreateCollection, InMemoryStore, ServiceSettings};
use serde_json::json;

fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, m, d).unwrap()
}

fn setup() -> (Arc<InMemoryStore>, Arc<ManualClock>, CollectionService) {
    let store = Arc::new(InMemoryStore::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
    ));
    let service = CollectionService::new(
        store.clone(),
        store.clone(),
        clock.clone(),
        ServiceSettings {
            default_segment_width_days: 7,
            max_backfill_days: 90,
        },
    );
    (store, clock, service)
}

fn backfill(start: NaiveDate, end: NaiveDate) -> CreateCollection {
    CreateCollection::new("wf-1", "inst-1", CollectionType::Backfill, DateRange::new(start, end))
}

fn assert_validation(result: Result<impl std::fmt::Debug, CoreError>) {
    match result {
        Err(CoreError::ValidationError(_)) => {}
        other => panic!("expected validation error, got {other:?}"),
    }
}

fn assert_invalid_state(result: Result<impl std::fmt::Debug, CoreError>) {
    match result {
        Err(CoreError::InvalidState { .. }) => {}
        other => panic!("expected invalid state, got {other:?}"),
    }
}

#[tokio::test]
async fn create_rejects_malformed_requests() {
    let (_, _, service) = setup();

    assert_validation(
        service
            .create_collection(CreateCollection::new(
                " ",
                "inst-1",
                CollectionType::Backfill,
                DateRange::new(date(1, 1), date(1, 8)),
            ))
            .await,
    );
    assert_validation(
        service
            .create_collection(backfill(date(1, 1), date(1, 8)).with_segment_width(0))
            .await,
    );
    assert_validation(service.create_collection(backfill(date(1, 8), date(1, 8))).await);
    assert_validation(service.create_collection(backfill(date(1, 8), date(1, 1))).await);
    // 120 days against a 90 day limit.
    assert_validation(service.create_collection(backfill(date(1, 1), date(5, 1))).await);
    assert_validation(
        service
            .create_collection(CreateCollection::new(
                "wf-1",
                "inst-1",
                CollectionType::RollingUpdate,
                DateRange::new(date(2, 1), date(1, 1)),
            ))
            .await,
    );
}

#[tokio::test]
async fn create_plans_segments_with_default_or_requested_width() {
    let (store, clock, service) = setup();

    let weekly = service
        .create_collection(backfill(date(1, 1), date(1, 29)))
        .await
        .unwrap();
    let collection = store.collection(weekly).unwrap();
    assert_eq!(collection.status, CollectionStatus::Pending);
    assert_eq!(collection.segment_width_days, 7);
    assert_eq!(collection.statistics.total_segments, 4);
    assert_eq!(collection.statistics.pending, 4);
    assert_eq!(collection.created_at, clock.now());

    let mut parameters = serde_json::Map::new();
    parameters.insert("advertiserId".into(), json!("A-1"));
    let short = service
        .create_collection(
            backfill(date(1, 1), date(1, 11))
                .with_segment_width(3)
                .with_parameters(parameters.clone()),
        )
        .await
        .unwrap();
    let collection = store.collection(short).unwrap();
    assert_eq!(collection.parameters, parameters);
    let segments = store.segments_of(short);
    assert_eq!(segments.len(), 4);
    assert_eq!(segments[3].window_start, date(1, 10));
    assert_eq!(segments[3].window_end, date(1, 11));
}

#[tokio::test]
async fn transitions_follow_the_state_machine() {
    let (_, clock, service) = setup();
    let id = service
        .create_collection(backfill(date(1, 1), date(1, 29)))
        .await
        .unwrap();

    // Only running collections can be paused.
    assert_invalid_state(service.pause(id).await);
    assert_invalid_state(service.resume(id).await);

    clock.advance(chrono::Duration::minutes(5));
    let cancelled = service.cancel(id).await.unwrap();
    assert_eq!(cancelled.status, CollectionStatus::Cancelled);
    assert_eq!(cancelled.updated_at, clock.now());
    // Repeating the request is a no-op.
    assert_eq!(
        service.cancel(id).await.unwrap().status,
        CollectionStatus::Cancelled
    );
    assert_invalid_state(service.resume(id).await);
    assert_invalid_state(service.retry_failed(id).await);
}

#[tokio::test]
async fn pause_and_resume_round_trip() {
    let (store, clock, service) = setup();
    let id = service
        .create_collection(backfill(date(1, 1), date(1, 29)))
        .await
        .unwrap();
    let segment_id = store.segments_of(id)[0].segment_id;
    store.claim(segment_id, clock.now(), 3).await.unwrap();
    harvest_core::CollectionStore::update_status(
        store.as_ref(),
        id,
        CollectionStatus::Pending,
        CollectionStatus::Running,
        clock.now(),
    )
    .await
    .unwrap();

    assert_eq!(service.pause(id).await.unwrap().status, CollectionStatus::Paused);
    assert_eq!(service.pause(id).await.unwrap().status, CollectionStatus::Paused);
    assert_eq!(service.resume(id).await.unwrap().status, CollectionStatus::Running);
}

#[tokio::test]
async fn delete_is_refused_while_segments_run() {
    let (store, clock, service) = setup();
    let id = service
        .create_collection(backfill(date(1, 1), date(1, 15)))
        .await
        .unwrap();
    let segment_id = store.segments_of(id)[0].segment_id;
    store.claim(segment_id, clock.now(), 3).await.unwrap();

    assert_invalid_state(service.delete_collection(id).await);
    assert!(store.collection(id).is_some());

    service.cancel(id).await.unwrap();
    store
        .update(
            segment_id,
            &harvest_core::SegmentUpdate::fail("stopped", None, clock.now()),
            &[SegmentStatus::Running],
            clock.now(),
        )
        .await
        .unwrap();

    service.delete_collection(id).await.unwrap();
    assert!(store.collection(id).is_none());
    assert!(store.segments_of(id).is_empty());
    assert!(matches!(
        service.delete_collection(id).await,
        Err(CoreError::NotFound { .. })
    ));
}

#[tokio::test]
async fn progress_and_listing_project_current_state() {
    let (store, clock, service) = setup();
    let first = service
        .create_collection(backfill(date(1, 1), date(1, 29)))
        .await
        .unwrap();
    clock.advance(chrono::Duration::seconds(1));
    let second = service
        .create_collection(backfill(date(2, 1), date(2, 8)))
        .await
        .unwrap();
    service.cancel(second).await.unwrap();

    let progress = service.get_progress(first).await.unwrap();
    assert_eq!(progress.segments.len(), 4);
    assert_eq!(progress.progress_percentage, 0.0);
    let body = serde_json::to_value(&progress).unwrap();
    assert_eq!(body["collection"]["status"], json!("pending"));

    let all = service.list_collections(&[]).await.unwrap();
    assert_eq!(
        all.iter().map(|c| c.collection_id).collect::<Vec<_>>(),
        vec![first, second]
    );
    let cancelled = service
        .list_collections(&[CollectionStatus::Cancelled])
        .await
        .unwrap();
    assert_eq!(cancelled.len(), 1);
    assert_eq!(cancelled[0].collection_id, second);

    let missing = harvest_core::CollectionId::new();
    assert!(matches!(
        service.get_progress(missing).await,
        Err(CoreError::NotFound { .. })
    ));
    assert!(store.collection(missing).is_none());
}
