//! Bounded, cancellable polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::config::ReadinessPolicy;
use crate::error::{ClusterError, Result};

/// Runs `probe` until it reports `true`, the policy deadline passes, or the
/// token is cancelled. Probe errors count as "not yet".
pub async fn wait_until<F, Fut>(
    node: &str,
    policy: ReadinessPolicy,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let started = Instant::now();
    let deadline = started + policy.timeout;
    let mut attempts = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(ClusterError::Cancelled(format!(
                "waiting for {node}"
            )));
        }
        attempts += 1;
        match probe().await {
            Ok(true) => {
                trace!(node, attempts, "probe succeeded");
                return Ok(());
            }
            Ok(false) => {}
            Err(error) => trace!(node, attempts, %error, "probe errored"),
        }
        if Instant::now() >= deadline {
            return Err(ClusterError::ReadinessTimeout {
                node: node.to_string(),
                waited: started.elapsed(),
            });
        }
        tokio::select! {
            _ = cancel.cancelled() => {
                return Err(ClusterError::Cancelled(format!("waiting for {node}")));
            }
            _ = sleep(policy.interval) => {}
        }
    }
}

/// Cancellable fixed delay.
pub async fn settle(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ClusterError::Cancelled("settle delay".into())),
        _ = sleep(delay) => Ok(()),
    }
}
