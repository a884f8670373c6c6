use std::future::Future;
use std::time::{Duration, Instant};

use backon::{ConstantBuilder, Retryable};

use crate::error::{Error, Result};

/// How often a long backpressure wait reports progress.
pub(crate) const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(10);

/// Poll `op` until it resolves to something other than a backpressure
/// signal, sleeping `interval` between attempts.
///
/// This is the one retry loop in the crate: prepare uses it to push a merge
/// job through a congested scheduler, wait-commit uses it to wait for the
/// sorted table. Cancellation has no dedicated token: the op re-checks the
/// installed epoch on every attempt and resolves once it is superseded, so
/// an abandoned task's wait always terminates. Progress is logged at most
/// once per [`PROGRESS_LOG_INTERVAL`] rather than per attempt.
pub(crate) async fn poll_backpressure<T, F, Fut>(
    interval: Duration,
    what: &'static str,
    op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    let mut last_report = Instant::now();
    op.retry(
        &ConstantBuilder::default()
            .with_delay(interval)
            .with_max_times(usize::MAX),
    )
    .sleep(tokio::time::sleep)
    .when(Error::is_backpressure)
    .notify(move |err: &Error, _| {
        if last_report.elapsed() >= PROGRESS_LOG_INTERVAL {
            last_report = Instant::now();
            tracing::info!(
                elapsed_s = started.elapsed().as_secs(),
                "still waiting on {what}: {err}"
            );
        }
    })
    .await
}
