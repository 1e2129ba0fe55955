//! Core execution logic
//!
//! One attempt of one task: fetch the input through its pre-signed URL, run
//! the handler, write the output through the second URL.

use jobplane_types::{SharedClock, StatusReport, TaskStatus};
use std::time::Instant;

use crate::error::ExecutorError;
use crate::handler::{HandlerContext, HandlerRegistry};
use crate::reporter::StatusReporter;
use crate::transfer::ObjectTransfer;
use crate::types::{Assignment, ExecutionResult};

#[tracing::instrument(
    name = "worker.execute",
    skip_all,
    fields(task_id = %assignment.task_id, attempt = assignment.attempt, pipeline = %assignment.pipeline_ref)
)]
pub async fn execute(
    assignment: &Assignment,
    registry: &HandlerRegistry,
    transfer: &dyn ObjectTransfer,
    reporter: Option<&dyn StatusReporter>,
    clock: &SharedClock,
) -> Result<ExecutionResult, ExecutorError> {
    let start = Instant::now();

    let handler = registry
        .get(&assignment.pipeline_ref)
        .ok_or_else(|| ExecutorError::UnknownPipeline(assignment.pipeline_ref.clone()))?;

    if let Some(reporter) = reporter {
        let report = StatusReport::new(
            assignment.task_id.clone(),
            TaskStatus::Running,
            assignment.attempt,
            clock.now(),
        );
        // Progress is informational; the dispatcher owns the terminal status.
        if let Err(e) = reporter.report(&assignment.callback_token, &report).await {
            tracing::warn!(error = %e, "Failed to report running status");
        }
    }

    let input = transfer.fetch(&assignment.input).await?;
    tracing::debug!(size = input.len(), "Fetched input");

    let ctx = HandlerContext {
        task_id: assignment.task_id.clone(),
        attempt: assignment.attempt,
        parameters: assignment.parameters.clone(),
    };
    let output = handler
        .run(&ctx, input)
        .await
        .map_err(|e| ExecutorError::Execution(e.to_string()))?;

    let digest = blake3::hash(&output).to_hex().to_string();
    let bytes_written = output.len() as u64;
    transfer.store(&assignment.output, output).await?;

    let duration_ms = start.elapsed().as_millis() as u64;
    tracing::info!(duration_ms, digest = %digest, "Execution completed");

    Ok(ExecutionResult {
        task_id: assignment.task_id.clone(),
        attempt: assignment.attempt,
        output_locator: assignment.output.path.clone(),
        output_digest: digest,
        bytes_written,
        duration_ms,
    })
}
