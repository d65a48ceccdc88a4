use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use harvest_core::{
    ExecutionClient, ExecutionError, ExecutionHandle, ExecutionId, ExecutionRequest,
    ExecutionState, ExecutionStatus,
};
use parking_lot::Mutex;
use tokio::time::Instant;

/// Scripted behaviour of one submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptedOutcome {
    /// Accepted; reports `succeeded` after `polls_before_done` in-progress polls.
    Succeed { records: u64, polls_before_done: u32 },
    /// Rejected before an execution id is assigned.
    FailSubmit(String),
    /// Accepted; reports `failed` on the first poll.
    FailTerminal(String),
    /// Accepted; stays `running` until resolved.
    NeverFinish,
}

/// One call to `submit`.
#[derive(Debug, Clone)]
pub struct SubmissionRecord {
    pub window_start: NaiveDate,
    pub execution_id: Option<ExecutionId>,
    pub at: Instant,
}

#[derive(Debug)]
struct MockExecution {
    outcome: ScriptedOutcome,
    polls: u32,
}

#[derive(Debug, Default)]
struct MockState {
    next_id: u64,
    scripts: HashMap<NaiveDate, VecDeque<ScriptedOutcome>>,
    executions: HashMap<ExecutionId, MockExecution>,
    polls: HashMap<ExecutionId, u32>,
    submissions: Vec<SubmissionRecord>,
}

/// Deterministic execution API for tests and local runs.
///
/// Outcomes are scripted per window start and consumed one per submission;
/// the last scripted outcome of a window repeats. Windows without a script
/// use the default outcome.
#[derive(Debug, Clone)]
pub struct MockExecutionClient {
    default: ScriptedOutcome,
    state: Arc<Mutex<MockState>>,
}

impl Default for MockExecutionClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutionClient {
    /// Every submission succeeds with 100 records on the first poll.
    #[must_use]
    pub fn new() -> Self {
        Self::with_default(ScriptedOutcome::Succeed {
            records: 100,
            polls_before_done: 0,
        })
    }

    #[must_use]
    pub fn with_default(default: ScriptedOutcome) -> Self {
        Self {
            default,
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Scripts the outcomes of successive submissions for `window_start`.
    pub fn script(
        &self,
        window_start: NaiveDate,
        outcomes: impl IntoIterator<Item = ScriptedOutcome>,
    ) {
        self.state
            .lock()
            .scripts
            .insert(window_start, outcomes.into_iter().collect());
    }

    /// Registers an execution accepted by an earlier process.
    pub fn seed_execution(&self, execution_id: impl Into<ExecutionId>, outcome: ScriptedOutcome) {
        self.state.lock().executions.insert(
            execution_id.into(),
            MockExecution { outcome, polls: 0 },
        );
    }

    /// Replaces the behaviour of an accepted execution, e.g. to finish a
    /// `NeverFinish` run. Returns false for unknown ids.
    pub fn resolve(&self, execution_id: &ExecutionId, outcome: ScriptedOutcome) -> bool {
        match self.state.lock().executions.get_mut(execution_id) {
            Some(execution) => {
                execution.outcome = outcome;
                execution.polls = 0;
                true
            }
            None => false,
        }
    }

    /// Every `submit` call so far, accepted or not.
    #[must_use]
    pub fn submissions(&self) -> Vec<SubmissionRecord> {
        self.state.lock().submissions.clone()
    }

    #[must_use]
    pub fn submission_count(&self) -> usize {
        self.state.lock().submissions.len()
    }

    #[must_use]
    pub fn submissions_for(&self, window_start: NaiveDate) -> usize {
        self.state
            .lock()
            .submissions
            .iter()
            .filter(|record| record.window_start == window_start)
            .count()
    }

    #[must_use]
    pub fn poll_count(&self, execution_id: &ExecutionId) -> u32 {
        self.state
            .lock()
            .polls
            .get(execution_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl ExecutionClient for MockExecutionClient {
    async fn submit(&self, request: &ExecutionRequest) -> Result<ExecutionHandle, ExecutionError> {
        let mut state = self.state.lock();
        let outcome = match state.scripts.get_mut(&request.window_start) {
            Some(queue) if queue.len() > 1 => queue.pop_front(),
            Some(queue) => queue.front().cloned(),
            None => None,
        }
        .unwrap_or_else(|| self.default.clone());

        if let ScriptedOutcome::FailSubmit(reason) = outcome {
            state.submissions.push(SubmissionRecord {
                window_start: request.window_start,
                execution_id: None,
                at: Instant::now(),
            });
            return Err(ExecutionError::Submit(reason));
        }

        state.next_id += 1;
        let execution_id = ExecutionId::new(format!("exec-{}", state.next_id));
        state.submissions.push(SubmissionRecord {
            window_start: request.window_start,
            execution_id: Some(execution_id.clone()),
            at: Instant::now(),
        });
        state
            .executions
            .insert(execution_id.clone(), MockExecution { outcome, polls: 0 });
        Ok(ExecutionHandle::new(execution_id))
    }

    async fn poll(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ExecutionError> {
        let mut state = self.state.lock();
        *state.polls.entry(handle.execution_id.clone()).or_default() += 1;

        let execution = state
            .executions
            .get_mut(&handle.execution_id)
            .ok_or_else(|| {
                ExecutionError::Poll(format!("unknown execution {}", handle.execution_id))
            })?;
        execution.polls += 1;

        Ok(match &execution.outcome {
            ScriptedOutcome::Succeed {
                records,
                polls_before_done,
            } => {
                if execution.polls > *polls_before_done {
                    ExecutionStatus::succeeded(*records)
                } else {
                    ExecutionStatus::in_progress(ExecutionState::Running)
                }
            }
            ScriptedOutcome::FailTerminal(reason) => ExecutionStatus::failed(reason.clone()),
            ScriptedOutcome::NeverFinish | ScriptedOutcome::FailSubmit(_) => {
                ExecutionStatus::in_progress(ExecutionState::Running)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(day: u32) -> ExecutionRequest {
        let start = NaiveDate::from_ymd_opt(2025, 1, day).unwrap();
        ExecutionRequest {
            workflow_id: "wf".into(),
            instance_id: "inst".into(),
            window_start: start,
            window_end: start + chrono::Duration::days(7),
            parameters: serde_json::Map::new(),
        }
    }

    #[tokio::test]
    async fn scripted_outcomes_are_consumed_in_order() {
        let client = MockExecutionClient::new();
        let day = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        client.script(
            day,
            [
                ScriptedOutcome::FailSubmit("quota".into()),
                ScriptedOutcome::FailTerminal("bad query".into()),
            ],
        );

        assert!(matches!(
            client.submit(&request(1)).await,
            Err(ExecutionError::Submit(_))
        ));
        for _ in 0..2 {
            let handle = client.submit(&request(1)).await.unwrap();
            let status = client.poll(&handle).await.unwrap();
            assert_eq!(status.state, ExecutionState::Failed);
        }
        assert_eq!(client.submissions_for(day), 3);

        let other = client.submit(&request(8)).await.unwrap();
        assert_eq!(other.execution_id, ExecutionId::new("exec-3"));
        assert_eq!(
            client.poll(&other).await.unwrap(),
            ExecutionStatus::succeeded(100)
        );
    }

    #[tokio::test]
    async fn resolve_finishes_a_running_execution() {
        let client = MockExecutionClient::with_default(ScriptedOutcome::NeverFinish);
        let handle = client.submit(&request(1)).await.unwrap();
        assert_eq!(
            client.poll(&handle).await.unwrap().state,
            ExecutionState::Running
        );

        assert!(client.resolve(
            &handle.execution_id,
            ScriptedOutcome::Succeed {
                records: 7,
                polls_before_done: 0
            }
        ));
        assert_eq!(client.poll(&handle).await.unwrap(), ExecutionStatus::succeeded(7));
        assert_eq!(client.poll_count(&handle.execution_id), 2);
    }
}
