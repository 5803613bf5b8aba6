use super::RetryPolicy;
use std::time::Duration;

/// 指数退避重试策略
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetry {
    max_attempts: usize,
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoffRetry {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }
}

impl RetryPolicy for ExponentialBackoffRetry {
    fn allow_retry(&self, attempt: usize, _elapsed: Duration) -> bool {
        attempt < self.max_attempts
    }

    fn backoff_duration(&self, attempt: usize) -> Duration {
        // 第一次失败等待 base，之后每次翻倍
        let shift = attempt.saturating_sub(1).min(10) as u32;
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}
