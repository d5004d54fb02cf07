//! Bounded polling.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Satisfied,
    TimedOut,
}

/// Call `check` every `interval` until it returns `true` or `deadline`
/// has elapsed. The check runs once immediately and once more at the
/// deadline boundary at most.
pub async fn poll_until<F, Fut>(deadline: Duration, interval: Duration, mut check: F) -> WaitOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let end = Instant::now() + deadline;
    loop {
        if check().await {
            return WaitOutcome::Satisfied;
        }
        let now = Instant::now();
        if now >= end {
            return WaitOutcome::TimedOut;
        }
        tokio::time::sleep(interval.min(end - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn satisfied_after_a_few_polls() {
        let calls = Cell::new(0);
        let outcome = poll_until(Duration::from_secs(300), Duration::from_secs(10), || {
            calls.set(calls.get() + 1);
            let done = calls.get() >= 3;
            async move { done }
        })
        .await;
        assert_eq!(outcome, WaitOutcome::Satisfied);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_at_deadline() {
        let start = Instant::now();
        let calls = Cell::new(0u32);
        let outcome = poll_until(Duration::from_secs(300), Duration::from_secs(10), || {
            calls.set(calls.get() + 1);
            async { false }
        })
        .await;
        assert_eq!(outcome, WaitOutcome::TimedOut);
        assert_eq!(Instant::now() - start, Duration::from_secs(300));
        // Immediately, then every 10s through 300s.
        assert_eq!(calls.get(), 31);
    }
}
