//! 指标收集模块
//!
//! 服务池和实例缓存只依赖 [`MetricsSink`] 接口，由调用方注入具体实现。
//! 不注入时使用 [`NoopMetrics`]，指标实现的行为不影响池的任何逻辑。

#[cfg(feature = "prometheus")]
pub mod prometheus;

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::utils::lock;

/// 指标接收端
///
/// 所有方法都是同步且廉价的，会在热路径上调用
pub trait MetricsSink: Send + Sync {
    /// 计数器增加 `delta`（可为负数）
    fn increment_counter(&self, name: &str, delta: i64);

    /// 设置仪表盘当前值
    fn set_gauge(&self, name: &str, value: f64);

    /// 记录一次事件（速率统计）
    fn mark_meter(&self, name: &str, count: u64);

    /// 记录一次耗时
    fn record_timer(&self, name: &str, duration: Duration);
}

/// 空实现
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_counter(&self, _name: &str, _delta: i64) {}
    fn set_gauge(&self, _name: &str, _value: f64) {}
    fn mark_meter(&self, _name: &str, _count: u64) {}
    fn record_timer(&self, _name: &str, _duration: Duration) {}
}

/// 共享的空实现
pub fn noop() -> Arc<dyn MetricsSink> {
    Arc::new(NoopMetrics)
}

/// 耗时统计
#[derive(Debug, Clone, Default)]
pub struct TimerStats {
    pub count: u64,
    pub total: Duration,
    pub max: Duration,
    /// 最近的耗时样本
    pub recent: VecDeque<Duration>,
}

impl TimerStats {
    /// 平均耗时
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let nanos = self.total.as_nanos() / u128::from(self.count);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// 指标快照
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    pub counters: HashMap<String, i64>,
    pub gauges: HashMap<String, f64>,
    pub meters: HashMap<String, u64>,
    pub timers: HashMap<String, TimerStats>,
}

impl MetricsSnapshot {
    pub fn counter(&self, name: &str) -> i64 {
        self.counters.get(name).copied().unwrap_or(0)
    }

    pub fn gauge(&self, name: &str) -> Option<f64> {
        self.gauges.get(name).copied()
    }

    pub fn meter(&self, name: &str) -> u64 {
        self.meters.get(name).copied().unwrap_or(0)
    }

    pub fn timer(&self, name: &str) -> Option<&TimerStats> {
        self.timers.get(name)
    }
}

/// 只保留最近 1000 个耗时样本
const MAX_TIMER_SAMPLES: usize = 1000;

/// 进程内指标收集器
///
/// 主要用于测试和本地调试，可以随时取快照
#[derive(Clone, Default)]
pub struct InMemoryMetrics {
    data: Arc<Mutex<MetricsSnapshot>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取当前指标快照
    pub fn snapshot(&self) -> MetricsSnapshot {
        lock(&self.data).clone()
    }

    /// 清空所有指标
    pub fn reset(&self) {
        *lock(&self.data) = MetricsSnapshot::default();
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_counter(&self, name: &str, delta: i64) {
        let mut data = lock(&self.data);
        *data.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    fn set_gauge(&self, name: &str, value: f64) {
        lock(&self.data).gauges.insert(name.to_string(), value);
    }

    fn mark_meter(&self, name: &str, count: u64) {
        let mut data = lock(&self.data);
        *data.meters.entry(name.to_string()).or_insert(0) += count;
    }

    fn record_timer(&self, name: &str, duration: Duration) {
        let mut data = lock(&self.data);
        let stats = data.timers.entry(name.to_string()).or_default();
        stats.count += 1;
        stats.total += duration;
        stats.max = stats.max.max(duration);
        stats.recent.push_back(duration);
        if stats.recent.len() > MAX_TIMER_SAMPLES {
            stats.recent.pop_front();
        }
    }
}

/// 给所有指标名加上统一前缀的包装
#[derive(Clone)]
pub struct ScopedMetrics {
    prefix: String,
    inner: Arc<dyn MetricsSink>,
}

impl ScopedMetrics {
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn MetricsSink>) -> Self {
        Self {
            prefix: prefix.into(),
            inner,
        }
    }

    /// 在当前前缀下再嵌套一层
    pub fn scope(&self, name: &str) -> ScopedMetrics {
        ScopedMetrics {
            prefix: self.name(name),
            inner: self.inner.clone(),
        }
    }

    fn name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}.{}", self.prefix, name)
        }
    }
}

impl MetricsSink for ScopedMetrics {
    fn increment_counter(&self, name: &str, delta: i64) {
        self.inner.increment_counter(&self.name(name), delta);
    }

    fn set_gauge(&self, name: &str, value: f64) {
        self.inner.set_gauge(&self.name(name), value);
    }

    fn mark_meter(&self, name: &str, count: u64) {
        self.inner.mark_meter(&self.name(name), count);
    }

    fn record_timer(&self, name: &str, duration: Duration) {
        self.inner.record_timer(&self.name(name), duration);
    }
}

/// 存活实例计数
///
/// 由拥有实例的组件在创建时调用 `acquire`，销毁时调用 `release`，
/// 每次变化都同步到 gauge
pub struct InstanceGauge {
    name: String,
    live: AtomicI64,
    sink: Arc<dyn MetricsSink>,
}

impl InstanceGauge {
    pub fn new(name: impl Into<String>, sink: Arc<dyn MetricsSink>) -> Self {
        Self {
            name: name.into(),
            live: AtomicI64::new(0),
            sink,
        }
    }

    pub fn acquire(&self) {
        let live = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        self.sink.set_gauge(&self.name, live as f64);
    }

    pub fn release(&self) {
        let live = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
        self.sink.set_gauge(&self.name, live as f64);
    }

    pub fn live(&self) -> i64 {
        self.live.load(Ordering::Acquire)
    }
}
