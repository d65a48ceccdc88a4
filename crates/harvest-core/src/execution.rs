//! Interface to the external, asynchronously-completing execution API.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::ExecutionId;

/// Parameters for one workflow execution over one time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub workflow_id: String,
    pub instance_id: String,
    pub window_start: NaiveDate,
    pub window_end: NaiveDate,
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

/// Handle for an accepted submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExecutionHandle {
    pub execution_id: ExecutionId,
}

impl ExecutionHandle {
    #[must_use]
    pub fn new(execution_id: impl Into<ExecutionId>) -> Self {
        Self {
            execution_id: execution_id.into(),
        }
    }
}

/// Execution state as reported by the API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ExecutionState {
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// One poll response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub state: ExecutionState,
    pub record_count: Option<u64>,
    pub error: Option<String>,
}

impl ExecutionStatus {
    #[must_use]
    pub const fn in_progress(state: ExecutionState) -> Self {
        Self {
            state,
            record_count: None,
            error: None,
        }
    }

    #[must_use]
    pub const fn succeeded(record_count: u64) -> Self {
        Self {
            state: ExecutionState::Succeeded,
            record_count: Some(record_count),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            state: ExecutionState::Failed,
            record_count: None,
            error: Some(error.into()),
        }
    }
}

/// Errors raised while talking to the execution API.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The submission was rejected or failed before a handle was assigned.
    #[error("submission failed: {0}")]
    Submit(String),

    /// A status request failed; the execution itself may still be running.
    #[error("poll failed: {0}")]
    Poll(String),

    /// The API answered with a body we could not interpret.
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Client for the external workflow-execution API.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    /// Submits an execution and returns its handle once accepted.
    async fn submit(&self, request: &ExecutionRequest) -> Result<ExecutionHandle, ExecutionError>;

    /// Fetches the current status of a previously accepted execution.
    async fn poll(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ExecutionError>;
}
