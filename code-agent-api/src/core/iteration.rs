//! Multi-step execution: repeat the coordinator step until the agent
//! signals completion or the iteration cap is reached.

use std::sync::Arc;

use sysinfo::{Pid, ProcessesToUpdate, System};
use tracing::{info, warn};

use crate::core::coordinator::ExecutionCoordinator;
use crate::models::error::ApiError;
use crate::models::request::ExecuteRequest;
use crate::models::result::ExecutionResult;

/// Runs the coordinator step up to `maxIterations` times. Per-iteration
/// bookkeeping: RSS samples around each step, partial-output failures are
/// kept and the loop continues, a failure with no output at all ends the
/// loop (no progress is fatal).
pub struct IterationLoop {
    coordinator: Arc<ExecutionCoordinator>,
}

impl IterationLoop {
    pub fn new(coordinator: Arc<ExecutionCoordinator>) -> Self {
        Self { coordinator }
    }

    pub async fn iterate(&self, request: ExecuteRequest) -> Result<ExecutionResult, ApiError> {
        let cap = request
            .max_iterations
            .unwrap_or(self.coordinator.settings().iteration.default_max)
            .max(1);
        let prepared = self.coordinator.prepare(&request).await?;

        let mut last: Option<ExecutionResult> = None;
        for index in 1..=cap {
            let rss_before = sample_rss_bytes();
            let outcome = self.coordinator.run_step(&prepared).await;
            let rss_after = sample_rss_bytes();
            info!(
                request_id = %prepared.request_id,
                iteration = index,
                max_iterations = cap,
                rss_before_bytes = rss_before.unwrap_or(0),
                rss_after_bytes = rss_after.unwrap_or(0),
                "iteration step finished"
            );

            match outcome {
                Ok(result) => {
                    let done = self
                        .coordinator
                        .settings()
                        .matches_done_marker(&result.combined_output());
                    if done {
                        info!(
                            request_id = %prepared.request_id,
                            iteration = index,
                            "agent reported completion"
                        );
                        return Ok(result.with_iterations(index, cap));
                    }
                    last = Some(result);
                },
                Err(ApiError::CliFailure(result)) => {
                    if result.has_output() {
                        // The partial output is already in the
                        // conversation; keep going.
                        warn!(
                            request_id = %prepared.request_id,
                            iteration = index,
                            "iteration step failed with partial output, continuing"
                        );
                        last = Some(*result);
                    } else {
                        warn!(
                            request_id = %prepared.request_id,
                            iteration = index,
                            "iteration step failed with no output, aborting loop"
                        );
                        return Err(ApiError::CliFailure(Box::new(
                            result.with_iterations(index, cap),
                        )));
                    }
                },
                Err(other) => return Err(other),
            }
        }

        let Some(result) = last else {
            return Err(ApiError::Internal("iteration loop produced no result".into()));
        };
        let result = result.with_iterations(cap, cap);
        if result.success {
            Ok(result)
        } else {
            Err(ApiError::CliFailure(Box::new(result)))
        }
    }
}

/// Resident set size of this process, when the platform exposes it.
fn sample_rss_bytes() -> Option<u64> {
    let pid = Pid::from_u32(std::process::id());
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    system.process(pid).map(|process| process.memory())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rss_sampling_works_on_this_platform() {
        let sample = sample_rss_bytes();
        assert!(sample.is_some());
        assert!(sample.unwrap() > 0);
    }
}
