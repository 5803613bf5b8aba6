use super::RetryPolicy;
use std::time::Duration;

/// 固定次数、固定间隔的重试策略
#[derive(Debug, Clone)]
pub struct RetryNTimes {
    max_attempts: usize,
    delay: Duration,
}

impl RetryNTimes {
    pub fn new(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// 不等待，立即重试
    pub fn immediate(max_attempts: usize) -> Self {
        Self::new(max_attempts, Duration::ZERO)
    }
}

impl Default for RetryNTimes {
    fn default() -> Self {
        Self::immediate(3)
    }
}

impl RetryPolicy for RetryNTimes {
    fn allow_retry(&self, attempt: usize, _elapsed: Duration) -> bool {
        attempt < self.max_attempts
    }

    fn backoff_duration(&self, _attempt: usize) -> Duration {
        self.delay
    }

    fn max_attempts(&self) -> usize {
        self.max_attempts
    }
}
