//! 实例缓存策略配置

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// 端点实例数达到上限时的处理方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionAction {
    /// 等待其他调用归还实例（可设置超时）
    Block,
    /// 立即失败
    Fail,
    /// 超出上限继续创建，归还时销毁多余的实例
    #[default]
    Grow,
}

impl std::str::FromStr for ExhaustionAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(ExhaustionAction::Block),
            "fail" => Ok(ExhaustionAction::Fail),
            "grow" => Ok(ExhaustionAction::Grow),
            _ => Err(format!("Unknown exhaustion action: {}", s)),
        }
    }
}

/// 实例缓存策略
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCachingPolicy {
    #[serde(default)]
    pub exhaustion_action: ExhaustionAction,

    /// 每个端点最多缓存的实例数
    #[serde(default = "default_max_instances_per_end_point")]
    pub max_instances_per_end_point: usize,

    /// 实例最长空闲时间（毫秒），0 表示不按空闲时间回收
    #[serde(default = "default_max_idle_time_ms")]
    pub max_idle_time_ms: u64,

    /// BLOCK 策略的等待超时（毫秒），不设置则一直等待
    #[serde(default)]
    pub block_timeout_ms: Option<u64>,

    /// 空闲回收扫描间隔（毫秒）
    #[serde(default = "default_eviction_interval_ms")]
    pub eviction_interval_ms: u64,

    /// 强制使用共享实例缓存（默认由服务工厂决定）
    #[serde(default)]
    pub multi_threaded_client: bool,
}

fn default_max_instances_per_end_point() -> usize {
    10
}

fn default_max_idle_time_ms() -> u64 {
    300_000
}

fn default_eviction_interval_ms() -> u64 {
    60_000
}

/// 转换为毫秒，不足 1 毫秒的非零时长按 1 毫秒计
fn duration_to_millis(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if millis == 0 && !duration.is_zero() { 1 } else { millis }
}

impl Default for ServiceCachingPolicy {
    fn default() -> Self {
        Self {
            exhaustion_action: ExhaustionAction::Grow,
            max_instances_per_end_point: default_max_instances_per_end_point(),
            max_idle_time_ms: default_max_idle_time_ms(),
            block_timeout_ms: None,
            eviction_interval_ms: default_eviction_interval_ms(),
            multi_threaded_client: false,
        }
    }
}

impl ServiceCachingPolicy {
    pub fn with_exhaustion_action(mut self, action: ExhaustionAction) -> Self {
        self.exhaustion_action = action;
        self
    }

    pub fn with_max_instances_per_end_point(mut self, max: usize) -> Self {
        self.max_instances_per_end_point = max;
        self
    }

    pub fn with_max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time_ms = duration_to_millis(idle);
        self
    }

    pub fn with_block_timeout(mut self, timeout: Duration) -> Self {
        self.block_timeout_ms = Some(duration_to_millis(timeout));
        self
    }

    pub fn with_eviction_interval(mut self, interval: Duration) -> Self {
        self.eviction_interval_ms = duration_to_millis(interval);
        self
    }

    pub fn with_multi_threaded_client(mut self, multi_threaded: bool) -> Self {
        self.multi_threaded_client = multi_threaded;
        self
    }

    /// 最长空闲时间，`None` 表示不回收
    pub fn max_idle_time(&self) -> Option<Duration> {
        (self.max_idle_time_ms > 0).then(|| Duration::from_millis(self.max_idle_time_ms))
    }

    pub fn block_timeout(&self) -> Option<Duration> {
        self.block_timeout_ms.map(Duration::from_millis)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_millis(self.eviction_interval_ms)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.max_instances_per_end_point == 0 {
            return Err(PoolError::config(
                "caching.max_instances_per_end_point must be at least 1",
            ));
        }
        if self.max_idle_time_ms > 0 && self.eviction_interval_ms == 0 {
            return Err(PoolError::config(
                "caching.eviction_interval_ms must be positive when idle eviction is enabled",
            ));
        }
        Ok(())
    }
}
