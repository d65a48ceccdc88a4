//! Execution API adapters and the terminal-status wait loop.

mod http;
mod mock;
mod poller;

pub use http::HttpExecutionClient;
pub use mock::{MockExecutionClient, ScriptedOutcome, SubmissionRecord};
pub use poller::{await_terminal, AwaitOutcome};
