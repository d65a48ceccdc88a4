//! Drives one segment through claim, submission, and settlement.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use harvest_core::metrics::{
    EXECUTION_DURATION, EXECUTION_SUBMISSIONS, SEGMENT_DISPATCHES, SEGMENT_TRANSITIONS,
};
use harvest_core::{
    Clock, Collection, CoreError, CoreResult, ExecutionClient, ExecutionHandle, ExecutionState,
    RetryDecision, RetryPolicy, Segment, SegmentStatus, SegmentStore, SegmentUpdate,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::execution::{await_terminal, AwaitOutcome};
use crate::params::build_request;
use crate::rate_limiter::RateLimiter;

/// Attempts at persisting an accepted execution id before giving up.
const SUBMISSION_WRITE_ATTEMPTS: u32 = 3;

/// Why a dispatch attempt failed. Every variant goes through the retry
/// policy.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SegmentFailure {
    /// Rejected before an execution id was assigned.
    #[error("{0}")]
    Submit(String),

    /// No terminal status within the maximum poll duration.
    #[error("no terminal status after {waited_secs}s{}", poll_error_suffix(.last_error))]
    PollTimeout {
        waited_secs: u64,
        last_error: Option<String>,
    },

    /// The execution API reported the run as failed.
    #[error("execution failed: {0}")]
    Terminal(String),

    /// Claimed but never submitted, typically after a crash.
    #[error("dispatch abandoned before submission")]
    Abandoned,
}

/// Result of one dispatch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Another worker claimed or settled the segment first.
    Skipped,
    Completed { record_count: u64 },
    /// Failed; due again at `next_attempt_at`.
    RetryScheduled { next_attempt_at: DateTime<Utc> },
    /// Failed with no attempts left.
    Exhausted,
    /// Shutdown while awaiting the execution; the segment stays `running`
    /// with its execution id and is reconciled later.
    Interrupted,
}

impl DispatchOutcome {
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::Completed { .. } => "completed",
            Self::RetryScheduled { .. } => "retry",
            Self::Exhausted => "exhausted",
            Self::Interrupted => "interrupted",
        }
    }
}

/// Polling limits for awaiting a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub poll_interval: Duration,
    pub max_poll_duration: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            max_poll_duration: Duration::from_secs(7200),
        }
    }
}

/// Executes single segments against the execution API.
///
/// The accepted execution id is written before the terminal status is
/// awaited, so a crash while polling leaves a `running` row that can be
/// reconciled by re-polling instead of resubmitting.
pub struct SegmentDispatcher {
    segments: Arc<dyn SegmentStore>,
    client: Arc<dyn ExecutionClient>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    clock: Arc<dyn Clock>,
    poll: PollSettings,
    shutdown: watch::Receiver<bool>,
}

impl SegmentDispatcher {
    #[must_use]
    pub fn new(
        segments: Arc<dyn SegmentStore>,
        client: Arc<dyn ExecutionClient>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        clock: Arc<dyn Clock>,
        poll: PollSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            segments,
            client,
            limiter,
            retry,
            clock,
            poll,
            shutdown,
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Claims `segment`, submits it, and settles it.
    ///
    /// # Errors
    ///
    /// Returns store errors other than `StaleState`, which is reported as
    /// [`DispatchOutcome::Skipped`].
    pub async fn dispatch(
        &self,
        collection: &Collection,
        segment: &Segment,
    ) -> CoreResult<DispatchOutcome> {
        let outcome = self.run(collection, segment).await;
        record_outcome(&outcome);
        outcome
    }

    /// Settles a segment whose execution was accepted by an earlier attempt
    /// or process, by polling it rather than resubmitting.
    ///
    /// # Errors
    ///
    /// Returns `InvalidState` when the segment has no live execution.
    pub async fn reconcile(&self, segment: &Segment) -> CoreResult<DispatchOutcome> {
        let execution_id = match &segment.execution_id {
            Some(execution_id) if segment.has_live_execution() => execution_id.clone(),
            _ => {
                return Err(CoreError::invalid_state(format!(
                    "segment {} has no live execution to reconcile",
                    segment.segment_id
                )))
            }
        };

        info!(
            segment_id = %segment.segment_id,
            execution_id = %execution_id,
            attempt = segment.attempt_count,
            "re-polling execution accepted earlier"
        );
        let outcome = self
            .settle(segment, &ExecutionHandle::new(execution_id))
            .await;
        record_outcome(&outcome);
        outcome
    }

    /// Fails a claimed segment that never reached submission.
    ///
    /// # Errors
    ///
    /// Returns store errors other than `StaleState`.
    pub async fn abandon(&self, segment: &Segment) -> CoreResult<DispatchOutcome> {
        let outcome = self.fail(segment, SegmentFailure::Abandoned).await;
        record_outcome(&outcome);
        outcome
    }

    /// Drops a scheduled retry that the attempt ceiling no longer allows, so
    /// the segment counts as exhausted.
    ///
    /// # Errors
    ///
    /// Returns store errors other than `StaleState`.
    pub async fn retire(&self, segment: &Segment) -> CoreResult<DispatchOutcome> {
        let max_attempts = self.retry.max_attempts();
        if !segment.has_stranded_retry(max_attempts) {
            return Ok(DispatchOutcome::Skipped);
        }
        match self
            .segments
            .update(
                segment.segment_id,
                &SegmentUpdate::exhaust(),
                &[SegmentStatus::Failed],
                self.clock.now(),
            )
            .await
        {
            Ok(_) => {
                warn!(
                    collection_id = %segment.collection_id,
                    segment_id = %segment.segment_id,
                    attempt = segment.attempt_count,
                    max_attempts,
                    "dropping retry beyond the attempt ceiling"
                );
                Ok(DispatchOutcome::Exhausted)
            }
            Err(err) if err.is_stale() => Ok(DispatchOutcome::Skipped),
            Err(err) => Err(err),
        }
    }

    async fn run(&self, collection: &Collection, segment: &Segment) -> CoreResult<DispatchOutcome> {
        let claimed = match self
            .segments
            .claim(segment.segment_id, self.clock.now(), self.retry.max_attempts())
            .await
        {
            Ok(claimed) => claimed,
            Err(err) if err.is_stale() => {
                debug!(segment_id = %segment.segment_id, "segment already claimed");
                return Ok(DispatchOutcome::Skipped);
            }
            Err(err) => return Err(err),
        };
        SEGMENT_TRANSITIONS
            .with_label_values(&[SegmentStatus::Running.as_str()])
            .inc();
        info!(
            collection_id = %collection.collection_id,
            segment_id = %claimed.segment_id,
            window_start = %claimed.window_start,
            window_end = %claimed.window_end,
            attempt = claimed.attempt_count,
            "segment claimed"
        );

        let request = build_request(collection, &claimed);
        self.limiter.acquire().await;

        let handle = match self.client.submit(&request).await {
            Ok(handle) => {
                EXECUTION_SUBMISSIONS.with_label_values(&["accepted"]).inc();
                handle
            }
            Err(err) => {
                EXECUTION_SUBMISSIONS.with_label_values(&["rejected"]).inc();
                return self
                    .fail(&claimed, SegmentFailure::Submit(err.to_string()))
                    .await;
            }
        };

        let running = self.record_submission(&claimed, &handle).await?;
        self.settle(&running, &handle).await
    }

    /// Persists the lineage key of an accepted submission.
    async fn record_submission(
        &self,
        segment: &Segment,
        handle: &ExecutionHandle,
    ) -> CoreResult<Segment> {
        let update = SegmentUpdate::submitted(handle.execution_id.clone(), segment.attempt_count);
        let mut attempt = 1;
        loop {
            match self
                .segments
                .update(
                    segment.segment_id,
                    &update,
                    &[SegmentStatus::Running],
                    self.clock.now(),
                )
                .await
            {
                Ok(running) => {
                    info!(
                        segment_id = %segment.segment_id,
                        execution_id = %handle.execution_id,
                        attempt = segment.attempt_count,
                        "execution submitted"
                    );
                    return Ok(running);
                }
                Err(err) if attempt < SUBMISSION_WRITE_ATTEMPTS && !err.is_stale() => {
                    warn!(
                        segment_id = %segment.segment_id,
                        execution_id = %handle.execution_id,
                        error = %err,
                        attempt,
                        "failed to record execution id, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(err) => {
                    EXECUTION_SUBMISSIONS
                        .with_label_values(&["unrecorded"])
                        .inc();
                    error!(
                        segment_id = %segment.segment_id,
                        execution_id = %handle.execution_id,
                        error = %err,
                        "execution accepted but its id could not be recorded"
                    );
                    return Err(err);
                }
            }
        }
    }

    /// Awaits the terminal status of `handle` and writes the outcome.
    async fn settle(
        &self,
        segment: &Segment,
        handle: &ExecutionHandle,
    ) -> CoreResult<DispatchOutcome> {
        let started = tokio::time::Instant::now();
        let outcome = await_terminal(
            self.client.as_ref(),
            handle,
            self.poll.max_poll_duration,
            self.poll.poll_interval,
            self.shutdown.clone(),
        )
        .await;

        match outcome {
            AwaitOutcome::Terminal(status) => {
                let label = if status.state == ExecutionState::Succeeded {
                    "succeeded"
                } else {
                    "failed"
                };
                EXECUTION_DURATION
                    .with_label_values(&[label])
                    .observe(started.elapsed().as_secs_f64());

                if status.state == ExecutionState::Succeeded {
                    self.complete(segment, status.record_count.unwrap_or(0))
                        .await
                } else {
                    let reason = status
                        .error
                        .unwrap_or_else(|| "execution reported failure".to_string());
                    self.fail(segment, SegmentFailure::Terminal(reason)).await
                }
            }
            AwaitOutcome::TimedOut { waited, last_error } => {
                EXECUTION_DURATION
                    .with_label_values(&["timeout"])
                    .observe(waited.as_secs_f64());
                self.fail(
                    segment,
                    SegmentFailure::PollTimeout {
                        waited_secs: waited.as_secs(),
                        last_error,
                    },
                )
                .await
            }
            AwaitOutcome::Interrupted => {
                info!(
                    segment_id = %segment.segment_id,
                    execution_id = %handle.execution_id,
                    "stopped awaiting execution for shutdown"
                );
                Ok(DispatchOutcome::Interrupted)
            }
        }
    }

    async fn complete(&self, segment: &Segment, record_count: u64) -> CoreResult<DispatchOutcome> {
        let now = self.clock.now();
        let update = SegmentUpdate::complete(record_count, now);
        match self
            .segments
            .update(segment.segment_id, &update, &[SegmentStatus::Running], now)
            .await
        {
            Ok(_) => {
                SEGMENT_TRANSITIONS
                    .with_label_values(&[SegmentStatus::Completed.as_str()])
                    .inc();
                info!(
                    collection_id = %segment.collection_id,
                    segment_id = %segment.segment_id,
                    record_count,
                    "segment completed"
                );
                Ok(DispatchOutcome::Completed { record_count })
            }
            Err(err) if err.is_stale() => {
                debug!(segment_id = %segment.segment_id, "segment settled elsewhere");
                Ok(DispatchOutcome::Skipped)
            }
            Err(err) => Err(err),
        }
    }

    /// Marks the segment failed and schedules a retry when attempts remain.
    async fn fail(&self, segment: &Segment, failure: SegmentFailure) -> CoreResult<DispatchOutcome> {
        let now = self.clock.now();
        let (next_attempt_at, outcome) = match self.retry.decide(segment) {
            RetryDecision::RetryAfter(delay) => {
                let at = now
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::days(1));
                (Some(at), DispatchOutcome::RetryScheduled { next_attempt_at: at })
            }
            RetryDecision::GiveUp => (None, DispatchOutcome::Exhausted),
        };

        let update = SegmentUpdate::fail(failure.to_string(), next_attempt_at, now);
        match self
            .segments
            .update(segment.segment_id, &update, &[SegmentStatus::Running], now)
            .await
        {
            Ok(_) => {
                SEGMENT_TRANSITIONS
                    .with_label_values(&[SegmentStatus::Failed.as_str()])
                    .inc();
                match &outcome {
                    DispatchOutcome::RetryScheduled { next_attempt_at } => warn!(
                        collection_id = %segment.collection_id,
                        segment_id = %segment.segment_id,
                        attempt = segment.attempt_count,
                        retry_at = %next_attempt_at,
                        error = %failure,
                        "segment attempt failed, retry scheduled"
                    ),
                    _ => warn!(
                        collection_id = %segment.collection_id,
                        segment_id = %segment.segment_id,
                        attempt = segment.attempt_count,
                        error = %failure,
                        "segment exhausted its retries"
                    ),
                }
                Ok(outcome)
            }
            Err(err) if err.is_stale() => {
                debug!(segment_id = %segment.segment_id, "segment settled elsewhere");
                Ok(DispatchOutcome::Skipped)
            }
            Err(err) => Err(err),
        }
    }
}

fn poll_error_suffix(last_error: &Option<String>) -> String {
    last_error
        .as_ref()
        .map(|err| format!(" (last poll error: {err})"))
        .unwrap_or_default()
}

fn record_outcome(outcome: &CoreResult<DispatchOutcome>) {
    let label = match outcome {
        Ok(outcome) => outcome.label(),
        Err(_) => "error",
    };
    SEGMENT_DISPATCHES.with_label_values(&[label]).inc();
}
