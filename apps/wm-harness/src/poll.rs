use crate::config::RetryBudget;
use crate::error::{HarnessError, HarnessResult};
use std::thread;
use std::time::Instant;
use tracing::trace;

/// Repeats `attempt` until it yields a value, sleeping the budget interval
/// between tries.
///
/// `Ok(None)` means "not there yet"; transient errors are treated the same
/// way. Any other error aborts the loop immediately. Exhausting the budget
/// yields [`HarnessError::Timeout`] naming `operation`.
pub fn poll_until<T, F>(operation: &str, budget: RetryBudget, mut attempt: F) -> HarnessResult<T>
where
    F: FnMut() -> HarnessResult<Option<T>>,
{
    let started = Instant::now();
    let mut last_error = None;

    for round in 1..=budget.attempts {
        match attempt() {
            Ok(Some(value)) => {
                trace!(target: "wm_harness::poll", operation, round, elapsed = ?started.elapsed(), "condition met");
                return Ok(value);
            }
            Ok(None) => {}
            Err(err) if err.is_transient() => {
                trace!(target: "wm_harness::poll", operation, round, error = %err, "not ready");
                last_error = Some(err.to_string());
            }
            Err(err) => return Err(err),
        }
        if round < budget.attempts {
            thread::sleep(budget.interval());
        }
    }

    Err(HarnessError::Timeout {
        operation: operation.to_string(),
        attempts: budget.attempts,
        elapsed: started.elapsed(),
        last_error,
    })
}
