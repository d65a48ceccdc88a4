//! Execution parameters for one segment.

use harvest_core::{Collection, ExecutionRequest, Segment};

/// Builds the execution request for `segment`.
///
/// Depends only on the collection's workflow references and fixed
/// parameters plus the segment window, so a retried attempt submits exactly
/// the same request.
#[must_use]
pub fn build_request(collection: &Collection, segment: &Segment) -> ExecutionRequest {
    ExecutionRequest {
        workflow_id: collection.workflow_id.clone(),
        instance_id: collection.instance_id.clone(),
        window_start: segment.window_start,
        window_end: segment.window_end,
        parameters: collection.parameters.clone(),
    }
}
