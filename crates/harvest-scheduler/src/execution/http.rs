use async_trait::async_trait;
use chrono::NaiveDate;
use harvest_core::config::ExecutionConfig;
use harvest_core::{
    ExecutionClient, ExecutionError, ExecutionHandle, ExecutionRequest, ExecutionState,
    ExecutionStatus,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// JSON-over-HTTP client for the workflow execution API.
#[derive(Debug, Clone)]
pub struct HttpExecutionClient {
    client: reqwest::Client,
    base_url: String,
    api_token: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody<'a> {
    workflow_id: &'a str,
    instance_id: &'a str,
    time_window_start: String,
    time_window_end: String,
    parameter_values: &'a serde_json::Map<String, serde_json::Value>,
}

impl<'a> SubmitBody<'a> {
    fn from_request(request: &'a ExecutionRequest) -> Self {
        Self {
            workflow_id: &request.workflow_id,
            instance_id: &request.instance_id,
            time_window_start: format_window_bound(request.window_start),
            time_window_end: format_window_bound(request.window_end),
            parameter_values: &request.parameters,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitResponse {
    workflow_execution_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: String,
    #[serde(default)]
    record_count: Option<u64>,
    #[serde(default)]
    status_reason: Option<String>,
}

impl HttpExecutionClient {
    /// Builds a client from the execution section of the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Submit` if the HTTP client cannot be built.
    pub fn new(config: &ExecutionConfig) -> Result<Self, ExecutionError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|err| ExecutionError::Submit(format!("failed to build HTTP client: {err}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }
}

#[async_trait]
impl ExecutionClient for HttpExecutionClient {
    async fn submit(&self, request: &ExecutionRequest) -> Result<ExecutionHandle, ExecutionError> {
        let response = self
            .authorize(self.client.post(self.endpoint("workflowExecutions")))
            .json(&SubmitBody::from_request(request))
            .send()
            .await
            .map_err(|err| ExecutionError::Submit(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutionError::Submit(format!("HTTP {status}: {body}")));
        }

        let accepted: SubmitResponse = response
            .json()
            .await
            .map_err(|err| ExecutionError::Decode(err.to_string()))?;
        debug!(
            execution_id = %accepted.workflow_execution_id,
            window_start = %request.window_start,
            "execution accepted"
        );
        Ok(ExecutionHandle::new(accepted.workflow_execution_id))
    }

    async fn poll(&self, handle: &ExecutionHandle) -> Result<ExecutionStatus, ExecutionError> {
        let path = format!("workflowExecutions/{}", handle.execution_id);
        let response = self
            .authorize(self.client.get(self.endpoint(&path)))
            .send()
            .await
            .map_err(|err| ExecutionError::Poll(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExecutionError::Poll(format!("HTTP {status}")));
        }

        let body: StatusResponse = response
            .json()
            .await
            .map_err(|err| ExecutionError::Decode(err.to_string()))?;
        into_status(body)
    }
}

/// Window bounds are sent as local midnight timestamps.
fn format_window_bound(date: NaiveDate) -> String {
    format!("{}T00:00:00", date.format("%Y-%m-%d"))
}

fn parse_state(raw: &str) -> Result<ExecutionState, ExecutionError> {
    match raw.to_ascii_uppercase().as_str() {
        "PENDING" | "QUEUED" | "SCHEDULED" => Ok(ExecutionState::Pending),
        "RUNNING" | "IN_PROGRESS" | "STARTED" => Ok(ExecutionState::Running),
        "SUCCEEDED" | "SUCCESS" | "COMPLETED" => Ok(ExecutionState::Succeeded),
        "FAILED" | "ERROR" | "CANCELLED" | "CANCELED" | "TIMED_OUT" => Ok(ExecutionState::Failed),
        other => Err(ExecutionError::Decode(format!(
            "unknown execution status `{other}`"
        ))),
    }
}

fn into_status(body: StatusResponse) -> Result<ExecutionStatus, ExecutionError> {
    let state = parse_state(&body.status)?;
    Ok(match state {
        ExecutionState::Succeeded => ExecutionStatus::succeeded(body.record_count.unwrap_or(0)),
        ExecutionState::Failed => ExecutionStatus::failed(
            body.status_reason
                .unwrap_or_else(|| format!("execution reported {}", body.status)),
        ),
        ExecutionState::Pending | ExecutionState::Running => ExecutionStatus::in_progress(state),
    })
}
