//! 重试策略模块
//!
//! 服务池在换端点重试和服务发现重建 watch 时都使用这里的策略

pub mod exponential;
pub mod fixed;

pub use exponential::ExponentialBackoffRetry;
pub use fixed::RetryNTimes;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// 重试策略 trait
pub trait RetryPolicy: Send + Sync {
    /// 是否允许再试一次
    ///
    /// # 参数
    /// * `attempt` - 已经完成（且失败）的尝试次数，从 1 开始
    /// * `elapsed` - 从第一次尝试开始经过的时间
    fn allow_retry(&self, attempt: usize, elapsed: Duration) -> bool;

    /// 第 `attempt` 次失败后、下一次尝试前的等待时间
    fn backoff_duration(&self, attempt: usize) -> Duration;

    /// 最多尝试次数（包括第一次）
    fn max_attempts(&self) -> usize;
}

/// 重试策略类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// 固定间隔
    #[default]
    Fixed,
    /// 指数退避
    Exponential,
}

/// 重试配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub strategy: RetryStrategy,

    /// 最多尝试次数（包括第一次）
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,

    /// 固定间隔 / 指数退避的基础间隔（毫秒）
    #[serde(default)]
    pub base_delay_ms: u64,

    /// 指数退避的最大间隔（毫秒）
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> usize {
    3
}

fn default_max_delay_ms() -> u64 {
    1_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Fixed,
            max_attempts: default_max_attempts(),
            base_delay_ms: 0,
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(PoolError::config("retry.max_attempts must be at least 1"));
        }
        if self.strategy == RetryStrategy::Exponential && self.max_delay_ms < self.base_delay_ms {
            return Err(PoolError::config(
                "retry.max_delay_ms must not be smaller than retry.base_delay_ms",
            ));
        }
        Ok(())
    }

    /// 构建重试策略
    pub fn build(&self) -> Result<Arc<dyn RetryPolicy>> {
        self.validate()?;
        let base = Duration::from_millis(self.base_delay_ms);
        Ok(match self.strategy {
            RetryStrategy::Fixed => Arc::new(RetryNTimes::new(self.max_attempts, base)),
            RetryStrategy::Exponential => Arc::new(ExponentialBackoffRetry::new(
                self.max_attempts,
                base,
                Duration::from_millis(self.max_delay_ms),
            )),
        })
    }
}
