//! Prometheus 指标接收端
//!
//! 指标在第一次使用时注册到给定的 `Registry`，名称中的 `.`、`-` 等字符
//! 会被替换为 `_`

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use prometheus::{Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use tracing::warn;

use super::MetricsSink;
use crate::error::{PoolError, Result};
use crate::utils::lock;

#[derive(Default)]
struct Collectors {
    counters: HashMap<String, IntGauge>,
    gauges: HashMap<String, Gauge>,
    meters: HashMap<String, IntCounter>,
    timers: HashMap<String, Histogram>,
}

/// 基于 prometheus crate 的指标接收端
pub struct PrometheusMetrics {
    registry: Registry,
    collectors: Mutex<Collectors>,
}

impl PrometheusMetrics {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            collectors: Mutex::new(Collectors::default()),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 以文本格式导出所有指标
    pub fn encode_text(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| PoolError::config(format!("failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| PoolError::config(format!("metrics are not valid utf-8: {}", e)))
    }

    fn register<C>(&self, collector: &C, name: &str)
    where
        C: prometheus::core::Collector + Clone + 'static,
    {
        if let Err(e) = self.registry.register(Box::new(collector.clone())) {
            warn!(metric = %name, error = %e, "Failed to register prometheus collector");
        }
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new(Registry::new())
    }
}

/// 把任意指标名转换为合法的 prometheus 指标名
pub fn sanitize_metric_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.chars().next().is_none_or(|c| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

impl MetricsSink for PrometheusMetrics {
    fn increment_counter(&self, name: &str, delta: i64) {
        let name = sanitize_metric_name(name);
        let mut collectors = lock(&self.collectors);
        if let Some(counter) = collectors.counters.get(&name) {
            counter.add(delta);
            return;
        }
        match IntGauge::new(name.clone(), name.clone()) {
            Ok(counter) => {
                self.register(&counter, &name);
                counter.add(delta);
                collectors.counters.insert(name, counter);
            }
            Err(e) => warn!(metric = %name, error = %e, "Invalid counter"),
        }
    }

    fn set_gauge(&self, name: &str, value: f64) {
        let name = sanitize_metric_name(name);
        let mut collectors = lock(&self.collectors);
        if let Some(gauge) = collectors.gauges.get(&name) {
            gauge.set(value);
            return;
        }
        match Gauge::new(name.clone(), name.clone()) {
            Ok(gauge) => {
                self.register(&gauge, &name);
                gauge.set(value);
                collectors.gauges.insert(name, gauge);
            }
            Err(e) => warn!(metric = %name, error = %e, "Invalid gauge"),
        }
    }

    fn mark_meter(&self, name: &str, count: u64) {
        let name = sanitize_metric_name(name);
        let mut collectors = lock(&self.collectors);
        if let Some(meter) = collectors.meters.get(&name) {
            meter.inc_by(count);
            return;
        }
        match IntCounter::new(name.clone(), name.clone()) {
            Ok(meter) => {
                self.register(&meter, &name);
                meter.inc_by(count);
                collectors.meters.insert(name, meter);
            }
            Err(e) => warn!(metric = %name, error = %e, "Invalid meter"),
        }
    }

    fn record_timer(&self, name: &str, duration: Duration) {
        let name = sanitize_metric_name(name);
        let mut collectors = lock(&self.collectors);
        if let Some(timer) = collectors.timers.get(&name) {
            timer.observe(duration.as_secs_f64());
            return;
        }
        match Histogram::with_opts(HistogramOpts::new(name.clone(), name.clone())) {
            Ok(timer) => {
                self.register(&timer, &name);
                timer.observe(duration.as_secs_f64());
                collectors.timers.insert(name, timer);
            }
            Err(e) => warn!(metric = %name, error = %e, "Invalid timer"),
        }
    }
}

