// ErrorThrottler: exponential backoff (1 s doubling to 60 s) between
// reconnect attempts of long-lived streams.

use lxdrunner_common::Tracing;
use lxdrunner_sdk::TraceWriter;

use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct ErrorThrottler {
    current_delay: Duration,
    failures: u32,
    trace: Tracing,
}

impl ErrorThrottler {
    pub fn new(trace: Tracing) -> Self {
        Self {
            current_delay: MIN_BACKOFF,
            failures: 0,
            trace,
        }
    }

    /// Forget past failures after a healthy connection.
    pub fn reset(&mut self) {
        self.current_delay = MIN_BACKOFF;
        self.failures = 0;
    }

    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    /// Consecutive failures since the last reset.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Record a failure and sleep for the current delay, doubling it for next
    /// time. Returns false if `cancel` fired during the wait.
    pub async fn increment_and_wait(&mut self, cancel: &CancellationToken) -> bool {
        let delay = self.current_delay;
        self.failures += 1;
        self.trace.warning(&format!(
            "Retrying in {}s (failure {})",
            delay.as_secs(),
            self.failures
        ));
        self.current_delay = (delay * 2).min(MAX_BACKOFF);

        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::trace_manager;

    fn throttler() -> ErrorThrottler {
        let (manager, _) = trace_manager();
        ErrorThrottler::new(manager.get("Events"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_and_caps() {
        let mut throttler = throttler();
        let cancel = CancellationToken::new();
        let mut waits = Vec::new();
        for _ in 0..8 {
            waits.push(throttler.current_delay().as_secs());
            assert!(throttler.increment_and_wait(&cancel).await);
        }
        assert_eq!(waits, vec![1, 2, 4, 8, 16, 32, 60, 60]);
        assert_eq!(throttler.failures(), 8);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset() {
        let mut throttler = throttler();
        let cancel = CancellationToken::new();
        throttler.increment_and_wait(&cancel).await;
        throttler.increment_and_wait(&cancel).await;
        throttler.reset();
        assert_eq!(throttler.current_delay(), MIN_BACKOFF);
        assert_eq!(throttler.failures(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_wait() {
        let mut throttler = throttler();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!throttler.increment_and_wait(&cancel).await);
    }
}
