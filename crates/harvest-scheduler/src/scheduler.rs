//! Periodic control loop over active collections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use harvest_core::metrics::{ACTIVE_DISPATCHES, COLLECTION_TRANSITIONS, SCHEDULER_TICK_DURATION};
use harvest_core::{
    data_frontier, rolling_windows, Clock, Collection, CollectionId, CollectionStatus,
    CollectionStore, CollectionType, CoreError, CoreResult, ExecutionClient, HarvestConfig,
    RetryPolicy, Segment, SegmentId, SegmentStatus, SegmentStore,
};
use parking_lot::Mutex;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::dispatcher::{DispatchOutcome, PollSettings, SegmentDispatcher};
use crate::rate_limiter::RateLimiter;

/// Collection statuses the loop visits each tick. Paused and cancelled
/// collections are only visited to settle executions already in flight.
const VISITED_STATUSES: [CollectionStatus; 4] = [
    CollectionStatus::Pending,
    CollectionStatus::Running,
    CollectionStatus::Paused,
    CollectionStatus::Cancelled,
];

/// Upper bound on rollup steps per call (`pending → running → completed`).
const MAX_ROLLUP_STEPS: usize = 3;

/// Scheduler tuning knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub tick_interval: Duration,
    /// Concurrent dispatches allowed per collection.
    pub per_collection_concurrency: usize,
    /// Concurrent dispatch tasks allowed in this process.
    pub max_in_flight: usize,
    /// Days before a window's data is considered complete upstream.
    pub data_lag_days: u32,
    /// Age after which a claimed, never-submitted segment is abandoned.
    pub orphan_claim_timeout: Duration,
    pub poll: PollSettings,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            per_collection_concurrency: 10,
            max_in_flight: 64,
            data_lag_days: 14,
            orphan_claim_timeout: Duration::from_secs(1800),
            poll: PollSettings::default(),
        }
    }
}

impl SchedulerSettings {
    #[must_use]
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            tick_interval: config.scheduler.tick_interval(),
            per_collection_concurrency: config.per_collection_concurrency(),
            max_in_flight: config.scheduler.max_in_flight,
            data_lag_days: config.scheduler.data_lag_days,
            orphan_claim_timeout: config.scheduler.orphan_claim_timeout(),
            poll: PollSettings {
                poll_interval: config.execution.poll_interval(),
                max_poll_duration: config.execution.max_poll_duration(),
            },
        }
    }
}

/// Collaborators the scheduler is constructed from.
#[derive(Clone)]
pub struct SchedulerParts {
    pub collections: Arc<dyn CollectionStore>,
    pub segments: Arc<dyn SegmentStore>,
    pub client: Arc<dyn ExecutionClient>,
    pub limiter: Arc<RateLimiter>,
    pub clock: Arc<dyn Clock>,
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub collections: usize,
    pub materialized: usize,
    pub dispatched: usize,
    pub reconciled: usize,
    pub abandoned: usize,
    /// Scheduled retries dropped because the attempt ceiling was lowered.
    pub exhausted: usize,
    pub transitions: usize,
    pub errors: usize,
}

enum Job {
    Dispatch(Segment),
    Reconcile(Segment),
}

impl Job {
    fn segment(&self) -> &Segment {
        match self {
            Self::Dispatch(segment) | Self::Reconcile(segment) => segment,
        }
    }
}

struct SchedulerInner {
    collections: Arc<dyn CollectionStore>,
    segments: Arc<dyn SegmentStore>,
    dispatcher: SegmentDispatcher,
    clock: Arc<dyn Clock>,
    settings: SchedulerSettings,
    in_flight: Mutex<HashMap<SegmentId, CollectionId>>,
    workers: Arc<Semaphore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

/// Removes a segment from the in-flight registry when its task ends.
struct InFlightGuard {
    inner: Arc<SchedulerInner>,
    segment_id: SegmentId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.inner.in_flight.lock().remove(&self.segment_id);
        ACTIVE_DISPATCHES.dec();
    }
}

/// Selects due segments of active collections and fans them out to the
/// dispatcher with bounded concurrency.
///
/// Safe to run in several processes against one store: every claim is a
/// conditional write, so a segment is dispatched at most once per attempt.
#[derive(Clone)]
pub struct CollectionScheduler {
    inner: Arc<SchedulerInner>,
}

impl CollectionScheduler {
    #[must_use]
    pub fn new(parts: SchedulerParts, retry: RetryPolicy, settings: SchedulerSettings) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let dispatcher = SegmentDispatcher::new(
            parts.segments.clone(),
            parts.client,
            parts.limiter,
            retry,
            parts.clock.clone(),
            settings.poll,
            shutdown_rx,
        );
        let workers = Arc::new(Semaphore::new(settings.max_in_flight.max(1)));

        Self {
            inner: Arc::new(SchedulerInner {
                collections: parts.collections,
                segments: parts.segments,
                dispatcher,
                clock: parts.clock,
                settings,
                in_flight: Mutex::new(HashMap::new()),
                workers,
                tasks: Mutex::new(Vec::new()),
                ticker: Mutex::new(None),
                shutdown,
            }),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &SchedulerSettings {
        &self.inner.settings
    }

    /// Segments this process is dispatching or re-polling right now.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    /// Spawns the tick loop.
    pub fn start(&self) {
        let mut slot = self.inner.ticker.lock();
        if slot.is_some() {
            warn!("Scheduler loop already running");
            return;
        }

        let scheduler = self.clone();
        let interval = self.inner.settings.tick_interval;
        let mut shutdown = self.inner.shutdown.subscribe();

        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = scheduler.tick().await {
                            error!(error = %err, "Scheduler tick failed");
                        }
                    }
                    _ = shutdown.changed() => {}
                }
                if *shutdown.borrow() {
                    break;
                }
            }
            info!("Scheduler loop stopped");
        }));
        info!("Scheduler loop started (interval: {:?})", interval);
    }

    /// Stops ticking, tells awaiting dispatches to stop polling, and waits
    /// for every spawned task.
    ///
    /// Interrupted segments keep their durable execution id and are re-polled
    /// by the next process that ticks.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let ticker = self.inner.ticker.lock().take();
        if let Some(handle) = ticker {
            if let Err(err) = handle.await {
                error!(error = %err, "Scheduler loop ended abnormally");
            }
        }
        self.drain().await;
        info!("Scheduler shut down");
    }

    /// Waits for every dispatch task spawned so far.
    pub async fn drain(&self) {
        loop {
            let handles = std::mem::take(&mut *self.inner.tasks.lock());
            if handles.is_empty() {
                return;
            }
            for handle in handles {
                if let Err(err) = handle.await {
                    error!(error = %err, "Dispatch task panicked");
                }
            }
        }
    }

    /// Runs one pass over all active collections.
    ///
    /// Errors scoped to one collection are logged and counted in the report
    /// without stopping the pass.
    ///
    /// # Errors
    ///
    /// Returns an error only when the collection list cannot be read.
    pub async fn tick(&self) -> CoreResult<TickReport> {
        let _timer = SCHEDULER_TICK_DURATION.start_timer();
        let collections = self.inner.collections.list(&VISITED_STATUSES).await?;
        let mut report = TickReport::default();

        for collection in collections {
            if !collection.status.is_schedulable() && collection.statistics.running == 0 {
                continue;
            }
            report.collections += 1;
            let collection_id = collection.collection_id;
            if let Err(err) = self.tick_collection(collection, &mut report).await {
                report.errors += 1;
                error!(collection_id = %collection_id, error = %err, "Collection tick failed");
            }
        }

        debug!(?report, "Scheduler tick finished");
        Ok(report)
    }

    async fn tick_collection(
        &self,
        mut collection: Collection,
        report: &mut TickReport,
    ) -> CoreResult<()> {
        let schedulable = collection.status.is_schedulable();
        if schedulable && collection.collection_type == CollectionType::RollingUpdate {
            let (extended, added) = self.inner.materialize(collection).await?;
            collection = extended;
            report.materialized += added;
        }

        let collection_id = collection.collection_id;
        let now = self.inner.clock.now();
        let segments = self.inner.segments.list_by_collection(collection_id).await?;

        // Settle running rows this process is not already handling and
        // retries the current ceiling no longer allows.
        let max_attempts = self.inner.dispatcher.retry_policy().max_attempts();
        let mut busy = 0;
        for segment in &segments {
            if segment.has_stranded_retry(max_attempts) {
                if self.inner.dispatcher.retire(segment).await? == DispatchOutcome::Exhausted {
                    report.exhausted += 1;
                }
                continue;
            }
            if segment.status != SegmentStatus::Running {
                continue;
            }
            if self.inner.is_in_flight(segment.segment_id) {
                busy += 1;
            } else if segment.has_live_execution() {
                busy += 1;
                if self.spawn(Job::Reconcile(segment.clone())) {
                    report.reconciled += 1;
                }
            } else if self.inner.is_orphaned(segment, now) {
                match self.inner.dispatcher.abandon(segment).await? {
                    DispatchOutcome::Skipped => {}
                    _ => report.abandoned += 1,
                }
            } else {
                busy += 1;
            }
        }

        if !schedulable {
            return Ok(());
        }

        let in_flight_here = self.inner.in_flight_for(collection_id);
        let cap = self.inner.settings.per_collection_concurrency.max(1);
        let capacity = cap.saturating_sub(busy.max(in_flight_here));
        if capacity > 0 {
            let due = self
                .inner
                .segments
                .list_due(collection_id, now, max_attempts, capacity + in_flight_here)
                .await?;
            for segment in due
                .into_iter()
                .filter(|segment| !self.inner.is_in_flight(segment.segment_id))
                .take(capacity)
            {
                if !self.spawn(Job::Dispatch(segment)) {
                    break;
                }
                report.dispatched += 1;
            }
        }

        report.transitions += self.inner.rollup(collection_id).await?;
        Ok(())
    }

    /// Spawns a dispatch task unless the worker pool is saturated.
    fn spawn(&self, job: Job) -> bool {
        let Ok(permit) = self.inner.workers.clone().try_acquire_owned() else {
            debug!("Worker pool saturated, deferring to next tick");
            return false;
        };

        let segment_id = job.segment().segment_id;
        let collection_id = job.segment().collection_id;
        if self
            .inner
            .in_flight
            .lock()
            .insert(segment_id, collection_id)
            .is_some()
        {
            return false;
        }
        ACTIVE_DISPATCHES.inc();
        let guard = InFlightGuard {
            inner: self.inner.clone(),
            segment_id,
        };

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;

            let result = match &job {
                Job::Dispatch(segment) => inner.run_dispatch(segment).await,
                Job::Reconcile(segment) => inner.dispatcher.reconcile(segment).await,
            };
            match result {
                Ok(outcome) => debug!(
                    segment_id = %segment_id,
                    outcome = outcome.label(),
                    "Dispatch finished"
                ),
                Err(err) => error!(
                    collection_id = %collection_id,
                    segment_id = %segment_id,
                    error = %err,
                    "Dispatch failed"
                ),
            }

            if let Err(err) = inner.rollup(collection_id).await {
                error!(collection_id = %collection_id, error = %err, "Collection rollup failed");
            }
        });

        let mut tasks = self.inner.tasks.lock();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        true
    }
}

impl SchedulerInner {
    fn is_in_flight(&self, segment_id: SegmentId) -> bool {
        self.in_flight.lock().contains_key(&segment_id)
    }

    fn in_flight_for(&self, collection_id: CollectionId) -> usize {
        self.in_flight
            .lock()
            .values()
            .filter(|owner| **owner == collection_id)
            .count()
    }

    /// Claimed long ago and never submitted.
    fn is_orphaned(&self, segment: &Segment, now: DateTime<Utc>) -> bool {
        match segment.started_at {
            Some(started) => (now - started)
                .to_std()
                .is_ok_and(|age| age >= self.settings.orphan_claim_timeout),
            None => true,
        }
    }

    async fn run_dispatch(&self, segment: &Segment) -> CoreResult<DispatchOutcome> {
        if *self.shutdown.borrow() {
            return Ok(DispatchOutcome::Skipped);
        }
        // Re-read so a pause or cancel issued since the tick is honoured.
        match self.collections.get(segment.collection_id).await? {
            Some(collection) if collection.status.is_schedulable() => {
                self.dispatcher.dispatch(&collection, segment).await
            }
            Some(collection) => {
                debug!(
                    collection_id = %collection.collection_id,
                    status = %collection.status,
                    "Collection no longer schedulable, skipping segment"
                );
                Ok(DispatchOutcome::Skipped)
            }
            None => Ok(DispatchOutcome::Skipped),
        }
    }

    /// Appends rolling segments whose windows are past the data frontier.
    async fn materialize(&self, collection: Collection) -> CoreResult<(Collection, usize)> {
        let collection_id = collection.collection_id;
        let frontier = data_frontier(self.clock.today(), self.settings.data_lag_days);
        let windows = rolling_windows(
            collection.date_range.end,
            frontier,
            collection.segment_width_days,
        );
        let Some(last) = windows.last().copied() else {
            return Ok((collection, 0));
        };

        let now = self.clock.now();
        let segments: Vec<Segment> = windows
            .into_iter()
            .map(|window| Segment::new(collection_id, window, now))
            .collect();

        match self
            .segments
            .append(collection_id, &segments, last.end, now)
            .await
        {
            Ok(extended) => {
                info!(
                    collection_id = %collection_id,
                    added = segments.len(),
                    end_date = %last.end,
                    "Materialized rolling segments"
                );
                Ok((extended, segments.len()))
            }
            Err(CoreError::AlreadyExists { .. }) => {
                debug!(collection_id = %collection_id, "Rolling segments materialized elsewhere");
                let fresh = self
                    .collections
                    .get(collection_id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("collection", collection_id.to_string()))?;
                Ok((fresh, 0))
            }
            Err(err) => Err(err),
        }
    }

    /// Applies the status transitions implied by the collection's statistics.
    async fn rollup(&self, collection_id: CollectionId) -> CoreResult<usize> {
        let mut transitions = 0;
        for _ in 0..MAX_ROLLUP_STEPS {
            let Some(collection) = self.collections.get(collection_id).await? else {
                break;
            };
            let Some(next) = collection.rollup_status() else {
                break;
            };

            match self
                .collections
                .update_status(collection_id, collection.status, next, self.clock.now())
                .await
            {
                Ok(_) => {
                    COLLECTION_TRANSITIONS
                        .with_label_values(&[next.as_str()])
                        .inc();
                    info!(
                        collection_id = %collection_id,
                        from = %collection.status,
                        to = %next,
                        completed = collection.statistics.completed,
                        failed = collection.statistics.failed,
                        "Collection status changed"
                    );
                    transitions += 1;
                }
                Err(err) if err.is_stale() => {
                    debug!(collection_id = %collection_id, "Collection changed during rollup");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(transitions)
    }
}
