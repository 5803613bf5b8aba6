//! 服务池配置
//!
//! 一个 TOML 文件描述一个服务池：
//!
//! ```toml
//! service_name = "calculator"
//! health_check_interval_secs = 30
//! load_balance = "round_robin"
//!
//! [caching]
//! exhaustion_action = "block"
//! max_instances_per_end_point = 4
//! block_timeout_ms = 500
//!
//! [retry]
//! strategy = "exponential"
//! max_attempts = 3
//! base_delay_ms = 50
//!
//! [discovery]
//! backend = "etcd"
//! endpoints = ["http://127.0.0.1:2379"]
//! ensemble = "production"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::balance::LoadBalanceStrategy;
use crate::cache::ServiceCachingPolicy;
use crate::discovery::DiscoveryConfig;
use crate::error::{PoolError, Result};
use crate::retry::RetryConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// 服务名称，发现配置未指定服务类型时作为服务类型
    pub service_name: String,

    #[serde(default)]
    pub caching: ServiceCachingPolicy,

    #[serde(default)]
    pub load_balance: LoadBalanceStrategy,

    #[serde(default)]
    pub retry: RetryConfig,

    /// 坏端点健康检查间隔（秒），0 表示不检查
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    #[serde(default)]
    pub discovery: Option<DiscoveryConfig>,
}

fn default_health_check_interval_secs() -> u64 {
    30
}

impl PoolConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            caching: ServiceCachingPolicy::default(),
            load_balance: LoadBalanceStrategy::default(),
            retry: RetryConfig::default(),
            health_check_interval_secs: default_health_check_interval_secs(),
            discovery: None,
        }
    }

    /// 从 TOML 文件加载并校验
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            PoolError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// 从 TOML 文本解析并校验
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PoolConfig = toml::from_str(content)
            .map_err(|e| PoolError::config(format!("invalid pool config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }

    /// 发现配置，服务类型缺省时取服务名称
    pub fn discovery_config(&self) -> Option<DiscoveryConfig> {
        self.discovery.clone().map(|mut discovery| {
            if discovery.service_type.is_empty() {
                discovery.service_type = self.service_name.clone();
            }
            discovery
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_name.is_empty() {
            return Err(PoolError::config("service_name must not be empty"));
        }
        self.caching.validate()?;
        self.retry.validate()?;
        if let Some(discovery) = self.discovery_config() {
            discovery.validate()?;
        }
        Ok(())
    }
}
