use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Backoff strategy between attempts
#[derive(Clone, Debug, Default)]
pub enum BackoffStrategy {
    /// Fixed delay between attempts
    #[default]
    Fixed,
    /// Exponential backoff with jitter: delay = min(base * 2^attempt + jitter, max)
    ExponentialWithJitter { base_ms: u64, max_ms: u64 },
}

/// Retry configuration
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub delay: Duration,
    pub backoff: BackoffStrategy,
}

impl Default for RetryConfig {
    /// Registry polling: starts at 25ms and caps at 500ms so a dependency
    /// coming up is noticed quickly without hammering the directory.
    fn default() -> Self {
        Self::exponential(25, 500)
    }
}

impl RetryConfig {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            backoff: BackoffStrategy::Fixed,
        }
    }

    pub fn exponential(base_ms: u64, max_ms: u64) -> Self {
        Self {
            delay: Duration::from_millis(base_ms),
            backoff: BackoffStrategy::ExponentialWithJitter { base_ms, max_ms },
        }
    }

    /// Calculate delay for a given attempt number
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match &self.backoff {
            BackoffStrategy::Fixed => self.delay,
            BackoffStrategy::ExponentialWithJitter { base_ms, max_ms } => {
                let base = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
                let jitter = random_jitter(base / 2);
                let total = base.saturating_add(jitter).min(*max_ms);
                Duration::from_millis(total)
            }
        }
    }
}

/// Generate random jitter up to max_jitter
fn random_jitter(max_jitter: u64) -> u64 {
    if max_jitter == 0 {
        return 0;
    }
    rand::thread_rng().gen_range(0..=max_jitter)
}

/// Run `operation` until it yields `Some` or `max_wait` has elapsed.
///
/// Always makes at least one attempt. The last sleep is clipped to the
/// deadline so the call never overshoots `max_wait` by a full backoff step.
pub async fn poll_until<F, Fut, T>(config: &RetryConfig, max_wait: Duration, mut operation: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = Instant::now() + max_wait;
    let mut attempt: u32 = 0;

    loop {
        if let Some(result) = operation().await {
            return Some(result);
        }

        let now = Instant::now();
        if now >= deadline {
            tracing::debug!(attempts = attempt + 1, "giving up after deadline");
            return None;
        }

        let delay = config.delay_for_attempt(attempt).min(deadline - now);
        tracing::trace!(
            attempt = attempt + 1,
            delay_ms = delay.as_millis() as u64,
            "retrying after miss"
        );
        tokio::time::sleep(delay).await;
        attempt = attempt.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let config = RetryConfig::default();
        let call_count = Arc::new(AtomicU32::new(0));
        let count = call_count.clone();

        let result = poll_until(&config, Duration::from_secs(1), || {
            count.fetch_add(1, Ordering::SeqCst);
            async { Some("found") }
        })
        .await;

        assert_eq!(result, Some("found"));
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_found() {
        let config = RetryConfig::fixed(Duration::from_millis(1));
        let call_count = Arc::new(AtomicU32::new(0));
        let count = call_count.clone();

        let result = poll_until(&config, Duration::from_secs(5), || {
            let attempt = count.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    None
                } else {
                    Some("found after retries")
                }
            }
        })
        .await;

        assert_eq!(result, Some("found after retries"));
        assert_eq!(call_count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_at_deadline() {
        let config = RetryConfig::exponential(10, 100);
        let started = Instant::now();

        let result: Option<()> = poll_until(&config, Duration::from_millis(750), || async { None }).await;

        assert!(result.is_none());
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(750));
        assert!(elapsed < Duration::from_millis(800));
    }

    #[tokio::test]
    async fn zero_wait_still_attempts_once() {
        let config = RetryConfig::default();
        let call_count = Arc::new(AtomicU32::new(0));
        let count = call_count.clone();

        let result: Option<()> = poll_until(&config, Duration::ZERO, || {
            count.fetch_add(1, Ordering::SeqCst);
            async { None }
        })
        .await;

        assert!(result.is_none());
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exponential_delay_is_capped() {
        let config = RetryConfig::exponential(25, 500);
        for attempt in 0..20 {
            assert!(config.delay_for_attempt(attempt) <= Duration::from_millis(500));
        }
        assert!(config.delay_for_attempt(0) >= Duration::from_millis(25));
    }
}
