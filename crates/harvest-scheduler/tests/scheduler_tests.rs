use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use harvest_core::{
    Clock, Collection, CollectionId, CollectionStatistics, CollectionStatus, CollectionStore,
    CollectionType, CoreResult, DateRange, ExecutionId, ManualClock, RetryPolicy, Segment,
    SegmentStatus, SegmentStore, SegmentUpdate,
};
use harvest_scheduler::{
    CollectionScheduler, CollectionService, CreateCollection, InMemoryStore, MockExecutionClient,
    PollSettings, RateLimiter, SchedulerParts, SchedulerSettings, ScriptedOutcome,
    ServiceSettings, TickReport,
};

fn date(m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, m, d).unwrap()
}

fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()
}

fn settings(per_collection: usize) -> SchedulerSettings {
    SchedulerSettings {
        per_collection_concurrency: per_collection,
        poll: PollSettings {
            poll_interval: Duration::from_secs(30),
            max_poll_duration: Duration::from_secs(24 * 3600),
        },
        ..SchedulerSettings::default()
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    client: MockExecutionClient,
    clock: Arc<ManualClock>,
    limiter: Arc<RateLimiter>,
    scheduler: CollectionScheduler,
    service: CollectionService,
}

impl Harness {
    fn new(client: MockExecutionClient) -> Self {
        Self::build(client, RateLimiter::new(100, Duration::from_secs(60)), settings(10))
    }

    fn build(client: MockExecutionClient, limiter: RateLimiter, settings: SchedulerSettings) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(start_time()));
        let limiter = Arc::new(limiter);
        let service = CollectionService::new(
            store.clone(),
            store.clone(),
            clock.clone(),
            ServiceSettings::default(),
        );
        let scheduler = scheduler_for(&store, &client, &clock, &limiter, settings);
        Self {
            store,
            client,
            clock,
            limiter,
            scheduler,
            service,
        }
    }

    /// A second scheduler over the same store and execution API, as another
    /// worker process would run.
    fn another_scheduler(&self) -> CollectionScheduler {
        scheduler_for(
            &self.store,
            &self.client,
            &self.clock,
            &self.limiter,
            self.scheduler.settings().clone(),
        )
    }

    async fn backfill(&self, start: NaiveDate, end: NaiveDate) -> CollectionId {
        self.service
            .create_collection(CreateCollection::new(
                "wf-1",
                "inst-1",
                CollectionType::Backfill,
                DateRange::new(start, end),
            ))
            .await
            .unwrap()
    }

    async fn round(&self) -> TickReport {
        let report = self.scheduler.tick().await.unwrap();
        self.scheduler.drain().await;
        report
    }

    fn clock_now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn collection(&self, id: CollectionId) -> Collection {
        self.store.collection(id).unwrap()
    }

    /// Runs rounds, moving the clock past the longest backoff between them.
    async fn run_rounds(&self, rounds: usize) {
        for _ in 0..rounds {
            self.round().await;
            self.clock.advance(chrono::Duration::seconds(301));
        }
    }
}

fn scheduler_for(
    store: &Arc<InMemoryStore>,
    client: &MockExecutionClient,
    clock: &Arc<ManualClock>,
    limiter: &Arc<RateLimiter>,
    settings: SchedulerSettings,
) -> CollectionScheduler {
    CollectionScheduler::new(
        SchedulerParts {
            collections: store.clone(),
            segments: store.clone(),
            client: Arc::new(client.clone()),
            limiter: limiter.clone(),
            clock: clock.clone(),
        },
        RetryPolicy::default(),
        settings,
    )
}

fn assert_consistent(store: &InMemoryStore, id: CollectionId) {
    let collection = store.collection(id).unwrap();
    let segments = store.segments_of(id);
    for segment in &segments {
        segment.check_invariants().unwrap();
        if segment.status == SegmentStatus::Completed {
            assert!(segment.execution_id.is_some());
        }
    }
    let stats = collection.statistics;
    assert_eq!(
        stats.pending + stats.running + stats.completed + stats.failed,
        stats.total_segments
    );
    assert_eq!(stats, CollectionStatistics::tally(&segments));
}

#[tokio::test(start_paused = true)]
async fn four_week_backfill_runs_to_completion() {
    let h = Harness::new(MockExecutionClient::new());
    let id = h.backfill(date(1, 1), date(1, 29)).await;

    let windows: Vec<(NaiveDate, NaiveDate)> = h
        .store
        .segments_of(id)
        .iter()
        .map(|segment| (segment.window_start, segment.window_end))
        .collect();
    assert_eq!(
        windows,
        vec![
            (date(1, 1), date(1, 8)),
            (date(1, 8), date(1, 15)),
            (date(1, 15), date(1, 22)),
            (date(1, 22), date(1, 29)),
        ]
    );

    let report = h.round().await;
    assert_eq!(report.dispatched, 4);

    let collection = h.collection(id);
    assert_eq!(collection.status, CollectionStatus::Completed);
    assert_eq!(collection.statistics.completed, 4);
    assert_eq!(collection.statistics.records_collected, 400);
    assert_eq!(h.client.submission_count(), 4);
    assert_consistent(&h.store, id);
}

#[tokio::test(start_paused = true)]
async fn always_failing_segment_stops_after_max_attempts() {
    let h = Harness::new(MockExecutionClient::new());
    h.client
        .script(date(1, 1), [ScriptedOutcome::FailTerminal("boom".into())]);
    let id = h.backfill(date(1, 1), date(1, 8)).await;

    h.run_rounds(6).await;

    assert_eq!(h.client.submissions_for(date(1, 1)), 3);
    let segment = h.store.segments_of(id)[0].clone();
    assert!(segment.is_exhausted());
    assert_eq!(segment.attempt_count, 3);
    assert!(segment.error_message.as_deref().unwrap().contains("boom"));
    // The failed attempt's execution id stays for audit.
    assert_eq!(segment.execution_id, Some(ExecutionId::new("exec-3")));

    let collection = h.collection(id);
    assert_eq!(collection.status, CollectionStatus::Failed);
    assert_eq!(collection.statistics.exhausted, 1);
    assert_consistent(&h.store, id);
}

#[tokio::test(start_paused = true)]
async fn one_bad_segment_does_not_fail_the_collection() {
    let h = Harness::new(MockExecutionClient::new());
    h.client
        .script(date(1, 8), [ScriptedOutcome::FailTerminal("bad window".into())]);
    let id = h.backfill(date(1, 1), date(1, 29)).await;

    h.round().await;
    let collection = h.collection(id);
    assert_eq!(collection.status, CollectionStatus::Running);
    assert_eq!(collection.statistics.completed, 3);
    assert_eq!(collection.statistics.failed, 1);
    assert_eq!(collection.statistics.exhausted, 0);

    h.clock.advance(chrono::Duration::seconds(301));
    h.run_rounds(4).await;

    let collection = h.collection(id);
    assert_eq!(collection.status, CollectionStatus::Completed);
    assert_eq!(collection.statistics.failed, 1);
    assert_eq!(collection.statistics.completed, 3);
    assert_eq!(h.client.submissions_for(date(1, 8)), 3);
    assert_consistent(&h.store, id);
}

#[tokio::test(start_paused = true)]
async fn retry_waits_for_backoff() {
    let h = Harness::new(MockExecutionClient::new());
    h.client.script(
        date(1, 1),
        [
            ScriptedOutcome::FailSubmit("quota exceeded".into()),
            ScriptedOutcome::Succeed {
                records: 5,
                polls_before_done: 0,
            },
        ],
    );
    let id = h.backfill(date(1, 1), date(1, 8)).await;

    h.round().await;
    let segment = h.store.segments_of(id)[0].clone();
    assert_eq!(segment.status, SegmentStatus::Failed);
    assert!(segment.execution_id.is_none());

    // Not due yet: the first backoff is one minute.
    h.clock.advance(chrono::Duration::seconds(30));
    assert_eq!(h.round().await.dispatched, 0);

    h.clock.advance(chrono::Duration::seconds(31));
    assert_eq!(h.round().await.dispatched, 1);
    let segment = h.store.segments_of(id)[0].clone();
    assert_eq!(segment.status, SegmentStatus::Completed);
    assert_eq!(segment.attempt_count, 2);
    assert_eq!(h.collection(id).status, CollectionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn concurrent_schedulers_never_double_submit() {
    let h = Harness::new(MockExecutionClient::new());
    let id = h.backfill(date(1, 1), date(1, 29)).await;
    let other = h.another_scheduler();

    // Both ticks pick the same due segments before either claims them.
    let first = h.scheduler.tick().await.unwrap();
    let second = other.tick().await.unwrap();
    assert_eq!(first.dispatched, 4);
    assert_eq!(second.dispatched, 4);

    h.scheduler.drain().await;
    other.drain().await;

    assert_eq!(h.client.submission_count(), 4);
    for segment in h.store.segments_of(id) {
        assert_eq!(h.client.submissions_for(segment.window_start), 1);
        assert_eq!(segment.attempt_count, 1);
    }
    assert_eq!(h.collection(id).status, CollectionStatus::Completed);
    assert_consistent(&h.store, id);
}

#[tokio::test(start_paused = true)]
async fn restart_re_polls_accepted_execution() {
    let h = Harness::new(MockExecutionClient::new());
    let id = h.backfill(date(1, 1), date(1, 8)).await;
    let segment_id = h.store.segments_of(id)[0].segment_id;

    // A previous process claimed and submitted, then died while polling.
    h.store.claim(segment_id, h.clock_now(), 3).await.unwrap();
    h.store
        .update(
            segment_id,
            &SegmentUpdate::submitted(ExecutionId::new("exec-prior"), 1),
            &[SegmentStatus::Running],
            h.clock_now(),
        )
        .await
        .unwrap();
    h.client.seed_execution(
        "exec-prior",
        ScriptedOutcome::Succeed {
            records: 42,
            polls_before_done: 1,
        },
    );

    let report = h.round().await;
    assert_eq!(report.reconciled, 1);
    assert_eq!(report.dispatched, 0);
    assert_eq!(h.client.submission_count(), 0);
    assert_eq!(h.client.poll_count(&ExecutionId::new("exec-prior")), 2);

    let segment = h.store.segment(segment_id).unwrap();
    assert_eq!(segment.status, SegmentStatus::Completed);
    assert_eq!(segment.record_count, Some(42));
    assert_eq!(segment.execution_id, Some(ExecutionId::new("exec-prior")));
    assert_eq!(h.collection(id).status, CollectionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn pause_lets_in_flight_segments_finish() {
    let h = Harness::build(
        MockExecutionClient::with_default(ScriptedOutcome::NeverFinish),
        RateLimiter::new(100, Duration::from_secs(60)),
        settings(2),
    );
    let id = h.backfill(date(1, 1), date(2, 5)).await;
    assert_eq!(h.store.segments_of(id).len(), 5);

    assert_eq!(h.scheduler.tick().await.unwrap().dispatched, 2);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.client.submission_count(), 2);

    // The next tick sees both claims and rolls the collection to running.
    let report = h.scheduler.tick().await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(report.transitions, 1);

    h.service.pause(id).await.unwrap();
    assert_eq!(h.collection(id).status, CollectionStatus::Paused);

    let done = ScriptedOutcome::Succeed {
        records: 10,
        polls_before_done: 0,
    };
    assert!(h.client.resolve(&ExecutionId::new("exec-1"), done.clone()));
    assert!(h.client.resolve(&ExecutionId::new("exec-2"), done));
    h.scheduler.drain().await;

    let stats = h.collection(id).statistics;
    assert_eq!(stats.completed, 2);
    assert_eq!(stats.pending, 3);

    for _ in 0..3 {
        h.clock.advance(chrono::Duration::minutes(10));
        assert_eq!(h.round().await.dispatched, 0);
    }
    assert_eq!(h.collection(id).status, CollectionStatus::Paused);
    assert_eq!(h.client.submission_count(), 2);

    h.service.resume(id).await.unwrap();
    assert_eq!(h.scheduler.tick().await.unwrap().dispatched, 2);

    h.scheduler.shutdown().await;
    assert_consistent(&h.store, id);
}

#[tokio::test(start_paused = true)]
async fn cancel_stops_new_dispatches() {
    let h = Harness::build(
        MockExecutionClient::with_default(ScriptedOutcome::NeverFinish),
        RateLimiter::new(100, Duration::from_secs(60)),
        settings(2),
    );
    let id = h.backfill(date(1, 1), date(2, 5)).await;

    h.scheduler.tick().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.service.cancel(id).await.unwrap();

    let done = ScriptedOutcome::Succeed {
        records: 1,
        polls_before_done: 0,
    };
    h.client.resolve(&ExecutionId::new("exec-1"), done.clone());
    h.client.resolve(&ExecutionId::new("exec-2"), done);
    h.scheduler.drain().await;

    assert_eq!(h.round().await.dispatched, 0);
    let collection = h.collection(id);
    assert_eq!(collection.status, CollectionStatus::Cancelled);
    assert_eq!(collection.statistics.completed, 2);
    assert_eq!(collection.statistics.pending, 3);
    assert_eq!(h.client.submission_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn rate_limit_bounds_submissions_per_window() {
    let h = Harness::build(
        MockExecutionClient::new(),
        RateLimiter::new(2, Duration::from_secs(60)),
        settings(10),
    );
    let id = h.backfill(date(1, 1), date(2, 5)).await;

    assert_eq!(h.round().await.dispatched, 5);

    let mut times: Vec<_> = h
        .client
        .submissions()
        .into_iter()
        .map(|record| record.at)
        .collect();
    times.sort();
    assert_eq!(times.len(), 5);
    for pair in times.windows(3) {
        assert!(pair[2].duration_since(pair[0]) >= Duration::from_secs(60));
    }
    assert_eq!(h.collection(id).status, CollectionStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn worker_pool_caps_dispatches_across_collections() {
    let h = Harness::build(
        MockExecutionClient::with_default(ScriptedOutcome::NeverFinish),
        RateLimiter::new(100, Duration::from_secs(60)),
        SchedulerSettings {
            max_in_flight: 3,
            ..settings(10)
        },
    );
    h.backfill(date(1, 1), date(1, 29)).await;
    h.backfill(date(3, 1), date(3, 29)).await;

    assert_eq!(h.scheduler.tick().await.unwrap().dispatched, 3);
    assert_eq!(h.scheduler.in_flight(), 3);

    h.scheduler.shutdown().await;
    assert_eq!(h.scheduler.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn retry_failed_requeues_exhausted_segments() {
    let h = Harness::new(MockExecutionClient::new());
    h.client
        .script(date(1, 1), [ScriptedOutcome::FailTerminal("boom".into())]);
    let id = h.backfill(date(1, 1), date(1, 8)).await;
    h.run_rounds(4).await;
    assert_eq!(h.collection(id).status, CollectionStatus::Failed);

    h.client.script(
        date(1, 1),
        [ScriptedOutcome::Succeed {
            records: 8,
            polls_before_done: 0,
        }],
    );
    assert_eq!(h.service.retry_failed(id).await.unwrap(), 1);

    let collection = h.collection(id);
    assert_eq!(collection.status, CollectionStatus::Running);
    let segment = h.store.segments_of(id)[0].clone();
    assert_eq!(segment.status, SegmentStatus::Pending);
    assert_eq!(segment.attempt_count, 0);
    assert!(segment.error_message.is_none());
    assert_eq!(segment.execution_id, Some(ExecutionId::new("exec-3")));

    h.round().await;
    let collection = h.collection(id);
    assert_eq!(collection.status, CollectionStatus::Completed);
    assert_eq!(collection.statistics.records_collected, 8);
    assert_eq!(h.client.submission_count(), 4);
}

#[tokio::test(start_paused = true)]
async fn rolling_collection_grows_with_the_data_frontier() {
    let h = Harness::new(MockExecutionClient::new());
    let id = h
        .service
        .create_collection(CreateCollection::new(
            "wf-1",
            "inst-1",
            CollectionType::RollingUpdate,
            DateRange::new(date(5, 1), date(5, 1)),
        ))
        .await
        .unwrap();
    assert!(h.store.segments_of(id).is_empty());

    // Today is 06-01, so data is complete up to 05-18.
    let report = h.round().await;
    assert_eq!(report.materialized, 2);
    assert_eq!(report.dispatched, 2);
    let collection = h.collection(id);
    assert_eq!(collection.date_range.end, date(5, 15));
    assert_eq!(collection.status, CollectionStatus::Running);
    assert_eq!(collection.statistics.completed, 2);

    assert_eq!(h.round().await.materialized, 0);

    h.clock.advance(chrono::Duration::days(7));
    let report = h.round().await;
    assert_eq!(report.materialized, 1);
    let collection = h.collection(id);
    assert_eq!(collection.date_range.end, date(5, 22));
    assert_eq!(collection.statistics.completed, 3);
    // Rolling collections stay open.
    assert_eq!(collection.status, CollectionStatus::Running);
    assert_consistent(&h.store, id);
}

#[tokio::test(start_paused = true)]
async fn stale_claim_without_submission_is_abandoned() {
    let h = Harness::new(MockExecutionClient::new());
    let id = h.backfill(date(1, 1), date(1, 8)).await;
    let segment_id = h.store.segments_of(id)[0].segment_id;

    // Claimed by a worker that died before submitting.
    h.store.claim(segment_id, h.clock_now(), 3).await.unwrap();

    h.clock.advance(chrono::Duration::minutes(5));
    let report = h.round().await;
    assert_eq!(report.abandoned, 0);
    assert_eq!(report.dispatched, 0);
    assert_eq!(
        h.store.segment(segment_id).unwrap().status,
        SegmentStatus::Running
    );

    h.clock.advance(chrono::Duration::minutes(30));
    let report = h.round().await;
    assert_eq!(report.abandoned, 1);
    let segment = h.store.segment(segment_id).unwrap();
    assert_eq!(segment.status, SegmentStatus::Failed);
    assert_eq!(
        segment.error_message.as_deref(),
        Some("dispatch abandoned before submission")
    );
    assert!(segment.next_attempt_at.is_some());

    h.clock.advance(chrono::Duration::seconds(61));
    h.round().await;
    let segment = h.store.segment(segment_id).unwrap();
    assert_eq!(segment.status, SegmentStatus::Completed);
    assert_eq!(segment.attempt_count, 2);
    assert_eq!(h.client.submission_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_leaves_accepted_execution_for_the_next_worker() {
    let h = Harness::new(MockExecutionClient::with_default(
        ScriptedOutcome::NeverFinish,
    ));
    let id = h.backfill(date(1, 1), date(1, 8)).await;

    h.scheduler.tick().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    h.scheduler.shutdown().await;

    let segment = h.store.segments_of(id)[0].clone();
    assert_eq!(segment.status, SegmentStatus::Running);
    assert!(segment.has_live_execution());
    assert_eq!(segment.execution_id, Some(ExecutionId::new("exec-1")));

    h.client.resolve(
        &ExecutionId::new("exec-1"),
        ScriptedOutcome::Succeed {
            records: 5,
            polls_before_done: 0,
        },
    );
    let next = h.another_scheduler();
    let report = next.tick().await.unwrap();
    next.drain().await;

    assert_eq!(report.reconciled, 1);
    assert_eq!(h.client.submission_count(), 1);
    let collection = h.collection(id);
    assert_eq!(collection.status, CollectionStatus::Completed);
    assert_eq!(collection.statistics.records_collected, 5);
}

#[tokio::test(start_paused = true)]
async fn background_loop_ticks_until_shutdown() {
    let h = Harness::new(MockExecutionClient::new());
    let id = h.backfill(date(1, 1), date(1, 29)).await;

    h.scheduler.start();
    h.scheduler.start();
    tokio::time::sleep(Duration::from_secs(5)).await;
    h.scheduler.shutdown().await;

    assert_eq!(h.collection(id).status, CollectionStatus::Completed);
    assert_eq!(h.client.submission_count(), 4);
}

/// Cancels the collection while serving its `cancel_after`-th read, returning
/// the snapshot taken before the cancel.
struct CancelAfterRead {
    inner: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
    reads: AtomicUsize,
    cancel_after: usize,
}

#[async_trait]
impl CollectionStore for CancelAfterRead {
    async fn create(&self, collection: &Collection, segments: &[Segment]) -> CoreResult<()> {
        CollectionStore::create(self.inner.as_ref(), collection, segments).await
    }

    async fn get(&self, collection_id: CollectionId) -> CoreResult<Option<Collection>> {
        let snapshot = CollectionStore::get(self.inner.as_ref(), collection_id).await?;
        let read = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if read == self.cancel_after {
            if let Some(collection) = &snapshot {
                self.inner
                    .update_status(
                        collection_id,
                        collection.status,
                        CollectionStatus::Cancelled,
                        self.clock.now(),
                    )
                    .await?;
            }
        }
        Ok(snapshot)
    }

    async fn list(&self, statuses: &[CollectionStatus]) -> CoreResult<Vec<Collection>> {
        self.inner.list(statuses).await
    }

    async fn update_status(
        &self,
        collection_id: CollectionId,
        expected: CollectionStatus,
        next: CollectionStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<Collection> {
        self.inner
            .update_status(collection_id, expected, next, now)
            .await
    }

    async fn delete(&self, collection_id: CollectionId) -> CoreResult<()> {
        self.inner.delete(collection_id).await
    }
}

#[tokio::test(start_paused = true)]
async fn cancel_racing_a_dispatch_wins_before_submission() {
    let h = Harness::new(MockExecutionClient::new());
    let id = h.backfill(date(1, 1), date(1, 8)).await;

    // The tick's rollup reads first, the dispatch task's recheck second.
    let collections = Arc::new(CancelAfterRead {
        inner: h.store.clone(),
        clock: h.clock.clone(),
        reads: AtomicUsize::new(0),
        cancel_after: 2,
    });
    let scheduler = CollectionScheduler::new(
        SchedulerParts {
            collections,
            segments: h.store.clone(),
            client: Arc::new(h.client.clone()),
            limiter: h.limiter.clone(),
            clock: h.clock.clone(),
        },
        RetryPolicy::default(),
        settings(10),
    );

    assert_eq!(scheduler.tick().await.unwrap().dispatched, 1);
    scheduler.drain().await;

    assert_eq!(h.collection(id).status, CollectionStatus::Cancelled);
    assert_eq!(h.client.submission_count(), 0);
    let segment = h.store.segments_of(id)[0].clone();
    assert_eq!(segment.status, SegmentStatus::Pending);
    assert_eq!(segment.attempt_count, 0);
    assert_consistent(&h.store, id);
}

#[tokio::test(start_paused = true)]
async fn lowered_attempt_ceiling_exhausts_pending_retries() {
    let h = Harness::new(MockExecutionClient::new());
    h.client
        .script(date(1, 1), [ScriptedOutcome::FailTerminal("boom".into())]);
    let id = h.backfill(date(1, 1), date(1, 8)).await;

    h.round().await;
    h.clock.advance(chrono::Duration::seconds(61));
    h.round().await;
    let segment = h.store.segments_of(id)[0].clone();
    assert_eq!(segment.status, SegmentStatus::Failed);
    assert_eq!(segment.attempt_count, 2);
    assert!(segment.next_attempt_at.is_some());

    // Restarted with a lower ceiling before the scheduled retry is due.
    let scheduler = CollectionScheduler::new(
        SchedulerParts {
            collections: h.store.clone(),
            segments: h.store.clone(),
            client: Arc::new(h.client.clone()),
            limiter: h.limiter.clone(),
            clock: h.clock.clone(),
        },
        RetryPolicy::new(2, vec![Duration::from_secs(60)]),
        settings(10),
    );
    let report = scheduler.tick().await.unwrap();
    scheduler.drain().await;

    assert_eq!(report.exhausted, 1);
    assert_eq!(report.dispatched, 0);
    let segment = h.store.segments_of(id)[0].clone();
    assert!(segment.is_exhausted());
    assert!(segment.error_message.as_deref().unwrap().contains("boom"));
    let collection = h.collection(id);
    assert_eq!(collection.status, CollectionStatus::Failed);
    assert_eq!(collection.statistics.exhausted, 1);
    assert_eq!(h.client.submissions_for(date(1, 1)), 2);
    assert_consistent(&h.store, id);
}
