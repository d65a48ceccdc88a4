use std::time::Duration;

use harvest_core::{ExecutionClient, ExecutionHandle, ExecutionStatus};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

/// How a wait for a terminal execution status ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AwaitOutcome {
    /// The API reported `succeeded` or `failed`.
    Terminal(ExecutionStatus),
    /// No terminal status within the allowed wait.
    TimedOut {
        waited: Duration,
        last_error: Option<String>,
    },
    /// Shutdown was requested while waiting. The execution keeps running
    /// remotely.
    Interrupted,
}

/// Polls `handle` every `poll_interval` until it reaches a terminal state,
/// `max_wait` elapses, or `shutdown` flips to `true`.
///
/// Poll errors are transient: they are logged and polling continues until
/// the deadline.
pub async fn await_terminal(
    client: &dyn ExecutionClient,
    handle: &ExecutionHandle,
    max_wait: Duration,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> AwaitOutcome {
    let started = Instant::now();
    let deadline = started + max_wait;
    let mut last_error = None;

    loop {
        if *shutdown.borrow() {
            return AwaitOutcome::Interrupted;
        }

        match client.poll(handle).await {
            Ok(status) if status.state.is_terminal() => return AwaitOutcome::Terminal(status),
            Ok(status) => {
                debug!(execution_id = %handle.execution_id, state = ?status.state, "execution still in progress");
            }
            Err(err) => {
                warn!(execution_id = %handle.execution_id, error = %err, "execution poll failed");
                last_error = Some(err.to_string());
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return AwaitOutcome::TimedOut {
                waited: now - started,
                last_error,
            };
        }

        let nap = poll_interval.min(deadline - now);
        tokio::select! {
            () = tokio::time::sleep(nap) => {}
            changed = shutdown.changed() => {
                // Sender gone: nobody can request shutdown any more.
                if changed.is_err() {
                    tokio::time::sleep(nap).await;
                }
            }
        }
    }
}
