//! 服务发现配置

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PoolError, Result};

/// 服务发现配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// 后端类型：memory, etcd
    #[serde(default)]
    pub backend: BackendType,

    /// 后端地址（etcd 为 `http://host:2379` 列表）
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// 命名空间，默认 "flare"
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// 服务组名称
    #[serde(default)]
    pub ensemble: Option<String>,

    /// 要发现的服务类型，在服务池配置中可省略（取服务名称）
    #[serde(default)]
    pub service_type: String,

    /// 周期性全量同步间隔（秒），不设置则只依赖 watch 推送
    #[serde(default)]
    pub resync_interval_secs: Option<u64>,

    /// 重建 watch 的初始退避（毫秒）
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,

    /// 重建 watch 的最大退避（毫秒）
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    /// 注册节点的 TTL（秒），用于 etcd lease
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// 注册方心跳间隔（秒）
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

fn default_namespace() -> String {
    "flare".to_string()
}

fn default_reconnect_base_delay_ms() -> u64 {
    100
}

fn default_reconnect_max_delay_ms() -> u64 {
    10_000
}

fn default_ttl_secs() -> u64 {
    30
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

impl DiscoveryConfig {
    /// 创建指定服务类型的默认配置（进程内注册中心）
    pub fn new(service_type: impl Into<String>) -> Self {
        Self {
            backend: BackendType::Memory,
            endpoints: Vec::new(),
            namespace: default_namespace(),
            ensemble: None,
            service_type: service_type.into(),
            resync_interval_secs: None,
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            ttl_secs: default_ttl_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }

    pub fn with_backend(mut self, backend: BackendType) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn with_ensemble(mut self, ensemble: impl Into<String>) -> Self {
        let ensemble = ensemble.into();
        self.ensemble = (!ensemble.is_empty()).then_some(ensemble);
        self
    }

    pub fn with_resync_interval(mut self, secs: u64) -> Self {
        self.resync_interval_secs = Some(secs);
        self
    }

    pub fn with_reconnect_delay(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.reconnect_base_delay_ms = base_ms;
        self.reconnect_max_delay_ms = max_ms;
        self
    }

    pub fn resync_interval(&self) -> Option<Duration> {
        self.resync_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        if self.service_type.is_empty() {
            return Err(PoolError::config("discovery.service_type must not be empty"));
        }
        if self.namespace.is_empty() || self.namespace.contains('/') {
            return Err(PoolError::config(format!(
                "discovery.namespace is invalid: {:?}",
                self.namespace
            )));
        }
        if self.backend == BackendType::Etcd && self.endpoints.is_empty() {
            return Err(PoolError::config("etcd endpoints not configured"));
        }
        if self.reconnect_max_delay_ms < self.reconnect_base_delay_ms {
            return Err(PoolError::config(
                "discovery.reconnect_max_delay_ms must not be smaller than reconnect_base_delay_ms",
            ));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(PoolError::config("discovery.heartbeat_interval_secs must be positive"));
        }
        Ok(())
    }
}

/// 后端类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// 进程内注册中心
    #[default]
    Memory,
    Etcd,
}

impl std::str::FromStr for BackendType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Ok(BackendType::Memory),
            "etcd" => Ok(BackendType::Etcd),
            _ => Err(format!("Unknown backend type: {}", s)),
        }
    }
}
