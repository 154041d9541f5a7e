use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Session cancellation token that trips on SIGINT. Cooperative: every
/// fiber, tool call, provider request, and child process watches it.
pub fn cancellation_on_sigint() -> CancellationToken {
    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            loop {
                tokio::signal::ctrl_c().await.ok();
                debug!("keyboard interrupt");
                token.cancel();
            }
        }
    });
    token
}

/// Exponential backoff schedule: 200ms → 400ms → 800ms → …, capped at 10s,
/// with ±20% jitter.
pub(crate) fn backoff(attempt: u64) -> Duration {
    let base_delay_ms = 200u64.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    let capped_ms = base_delay_ms.min(10_000);
    let jitter = rand::rng().random_range(0.8..1.2);
    Duration::from_millis((capped_ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let first = backoff(1);
        assert!(first >= Duration::from_millis(160) && first <= Duration::from_millis(240));
        let late = backoff(20);
        assert!(late <= Duration::from_millis(12_000));
    }
}
