//! 分区过滤模块
//!
//! 调用可以携带分区上下文（如分片键），在负载均衡之前过滤候选端点。
//! 过滤器必须是输入的纯函数，每次调用都会执行。

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::discovery::ServiceEndPoint;

/// 默认分区键
pub const DEFAULT_KEY: &str = "";

/// 分区上下文
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionContext {
    entries: BTreeMap<String, String>,
}

impl PartitionContext {
    /// 空上下文，不做任何过滤
    pub fn empty() -> Self {
        Self::default()
    }

    /// 只包含一个键值对的上下文
    pub fn of(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::builder().put(key, value).build()
    }

    /// 只包含默认键的上下文
    pub fn with_default(value: impl Into<String>) -> Self {
        Self::of(DEFAULT_KEY, value)
    }

    pub fn builder() -> PartitionContextBuilder {
        PartitionContextBuilder::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

impl fmt::Display for PartitionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (key, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}={}", key, value)?;
        }
        write!(f, "}}")
    }
}

/// 分区上下文构建器
#[derive(Debug, Clone, Default)]
pub struct PartitionContextBuilder {
    entries: BTreeMap<String, String>,
}

impl PartitionContextBuilder {
    pub fn put(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn put_default(self, value: impl Into<String>) -> Self {
        self.put(DEFAULT_KEY, value)
    }

    pub fn build(self) -> PartitionContext {
        PartitionContext {
            entries: self.entries,
        }
    }
}

/// 分区过滤器
pub trait PartitionFilter: Send + Sync {
    fn filter(
        &self,
        candidates: Vec<ServiceEndPoint>,
        context: &PartitionContext,
    ) -> Vec<ServiceEndPoint>;
}

/// 不做过滤（默认）
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPartitionFilter;

impl PartitionFilter for IdentityPartitionFilter {
    fn filter(
        &self,
        candidates: Vec<ServiceEndPoint>,
        _context: &PartitionContext,
    ) -> Vec<ServiceEndPoint> {
        candidates
    }
}

/// 按端点 payload 过滤
///
/// payload 必须是 JSON 对象，且包含上下文中的每个键值对才会保留。
/// 非字符串的 JSON 值按其 JSON 文本比较（如 `3`、`true`）。
/// payload 缺失或不是 JSON 对象的端点只在上下文为空时保留。
#[derive(Debug, Clone, Copy, Default)]
pub struct PayloadPartitionFilter;

impl PayloadPartitionFilter {
    fn matches(end_point: &ServiceEndPoint, context: &PartitionContext) -> bool {
        let Some(payload) = end_point.payload() else {
            return false;
        };
        let Ok(Value::Object(fields)) = serde_json::from_str::<Value>(payload) else {
            return false;
        };
        context.iter().all(|(key, expected)| match fields.get(key) {
            Some(Value::String(actual)) => actual == expected,
            Some(other) => other.to_string() == expected,
            None => false,
        })
    }
}

impl PartitionFilter for PayloadPartitionFilter {
    fn filter(
        &self,
        candidates: Vec<ServiceEndPoint>,
        context: &PartitionContext,
    ) -> Vec<ServiceEndPoint> {
        if context.is_empty() {
            return candidates;
        }
        candidates
            .into_iter()
            .filter(|end_point| Self::matches(end_point, context))
            .collect()
    }
}
