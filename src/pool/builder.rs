//! 服务池构建器

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{AsyncServicePool, PoolOptions, ServicePool, ServicePoolProxy};
use crate::balance::LoadBalanceAlgorithm;
use crate::cache::{EvictionScheduler, ServiceCache, ServiceCachingPolicy};
use crate::client::ServiceFactory;
use crate::config::PoolConfig;
use crate::discovery::source::{self, HostDiscoverySource};
use crate::discovery::{DiscoveryConfig, DiscoveryFactory, HostDiscovery, RegistryBackend};
use crate::error::{PoolError, Result};
use crate::metrics::MetricsSink;
use crate::partition::{PartitionContext, PartitionFilter};
use crate::retry::RetryPolicy;

enum DiscoverySource {
    /// 外部提供，不随服务池关闭
    Shared(Arc<dyn HostDiscovery>),
    /// 按配置创建，由服务池拥有
    Config(DiscoveryConfig),
    /// 基于已有注册中心后端创建，由服务池拥有
    Registry(Arc<dyn RegistryBackend>, Option<DiscoveryConfig>),
    /// 依次询问的来源列表，由服务池拥有选中的主机发现
    Sources(Vec<Arc<dyn HostDiscoverySource>>),
}

/// 服务池构建器
///
/// ```ignore
/// let pool = ServicePoolBuilder::new()
///     .with_service_factory(CalculatorFactory::default())
///     .with_discovery_config(DiscoveryConfig::new("calculator"))
///     .with_caching_policy(ServiceCachingPolicy::default().with_max_instances_per_end_point(4))
///     .build()
///     .await?;
/// ```
pub struct ServicePoolBuilder<S>
where
    S: Send + Sync + 'static,
{
    factory: Option<Arc<dyn ServiceFactory<Service = S>>>,
    discovery: Option<DiscoverySource>,
    ensemble: Option<String>,
    cache: Option<Arc<dyn ServiceCache<S>>>,
    caching_policy: Option<ServiceCachingPolicy>,
    load_balance: Option<Arc<dyn LoadBalanceAlgorithm>>,
    partition_filter: Option<Arc<dyn PartitionFilter>>,
    retry: Option<Arc<dyn RetryPolicy>>,
    health_check_interval: Option<Option<Duration>>,
    metrics: Option<Arc<dyn MetricsSink>>,
    scheduler: Option<EvictionScheduler>,
}

impl<S> Default for ServicePoolBuilder<S>
where
    S: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S> ServicePoolBuilder<S>
where
    S: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            factory: None,
            discovery: None,
            ensemble: None,
            cache: None,
            caching_policy: None,
            load_balance: None,
            partition_filter: None,
            retry: None,
            health_check_interval: None,
            metrics: None,
            scheduler: None,
        }
    }

    /// 设置服务工厂，并让工厂调整构建器
    pub fn with_service_factory<F>(mut self, factory: F) -> Self
    where
        F: ServiceFactory<Service = S>,
    {
        let factory = Arc::new(factory);
        self.factory = Some(factory.clone());
        factory.configure(self)
    }

    /// 设置共享的服务工厂（不调用 `configure`）
    pub fn with_shared_service_factory(
        mut self,
        factory: Arc<dyn ServiceFactory<Service = S>>,
    ) -> Self {
        self.factory = Some(factory);
        self
    }

    /// 使用外部的主机发现，关闭服务池时不会关闭它
    pub fn with_host_discovery(mut self, discovery: Arc<dyn HostDiscovery>) -> Self {
        self.discovery = Some(DiscoverySource::Shared(discovery));
        self
    }

    /// 按配置创建主机发现
    pub fn with_discovery_config(mut self, config: DiscoveryConfig) -> Self {
        self.discovery = Some(DiscoverySource::Config(config));
        self
    }

    /// 基于已有注册中心后端监听服务
    ///
    /// 未设置发现配置时，服务类型取服务工厂的服务名称
    pub fn with_registry(mut self, backend: Arc<dyn RegistryBackend>) -> Self {
        let config = match self.discovery.take() {
            Some(DiscoverySource::Config(config)) => Some(config),
            _ => None,
        };
        self.discovery = Some(DiscoverySource::Registry(backend, config));
        self
    }

    /// 追加一个主机发现来源
    ///
    /// 构建时按追加顺序询问，使用第一个认识该服务的来源。
    /// 会替换之前设置的其他发现方式
    pub fn with_host_discovery_source(mut self, source: Arc<dyn HostDiscoverySource>) -> Self {
        match &mut self.discovery {
            Some(DiscoverySource::Sources(sources)) => sources.push(source),
            _ => self.discovery = Some(DiscoverySource::Sources(vec![source])),
        }
        self
    }

    /// 向发现来源查询时使用的服务组
    pub fn with_ensemble(mut self, ensemble: impl Into<String>) -> Self {
        self.ensemble = Some(ensemble.into());
        self
    }

    /// 使用外部的实例缓存，关闭服务池时不会关闭它
    pub fn with_cache(mut self, cache: Arc<dyn ServiceCache<S>>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_caching_policy(mut self, policy: ServiceCachingPolicy) -> Self {
        self.caching_policy = Some(policy);
        self
    }

    pub fn with_load_balance_algorithm(mut self, algorithm: Arc<dyn LoadBalanceAlgorithm>) -> Self {
        self.load_balance = Some(algorithm);
        self
    }

    pub fn with_partition_filter(mut self, filter: Arc<dyn PartitionFilter>) -> Self {
        self.partition_filter = Some(filter);
        self
    }

    /// 默认重试策略
    pub fn with_retry_policy(mut self, retry: Arc<dyn RetryPolicy>) -> Self {
        self.retry = Some(retry);
        self
    }

    /// 坏端点健康检查间隔，`None` 关闭后台健康检查
    pub fn with_health_check_interval(mut self, interval: Option<Duration>) -> Self {
        self.health_check_interval = Some(interval);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 与其他服务池共享空闲回收调度器
    pub fn with_scheduler(mut self, scheduler: EvictionScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// 应用配置文件中的设置，已显式设置的组件会被覆盖
    pub fn with_config(mut self, config: &PoolConfig) -> Result<Self> {
        config.validate()?;
        self.caching_policy = Some(config.caching.clone());
        self.load_balance = Some(config.load_balance.build());
        self.retry = Some(config.retry.build()?);
        self.health_check_interval = Some(config.health_check_interval());
        if let Some(discovery) = config.discovery_config() {
            self = match self.discovery.take() {
                Some(DiscoverySource::Registry(backend, _)) => {
                    self.with_registry_config(backend, discovery)
                }
                Some(DiscoverySource::Sources(sources)) => {
                    self.discovery = Some(DiscoverySource::Sources(sources));
                    self.ensemble = discovery.ensemble.or(self.ensemble.take());
                    self
                }
                _ => self.with_discovery_config(discovery),
            };
        }
        Ok(self)
    }

    fn with_registry_config(
        mut self,
        backend: Arc<dyn RegistryBackend>,
        config: DiscoveryConfig,
    ) -> Self {
        self.discovery = Some(DiscoverySource::Registry(backend, Some(config)));
        self
    }

    async fn options(self) -> Result<PoolOptions<S>> {
        let factory = self
            .factory
            .ok_or_else(|| PoolError::config("service factory is required"))?;
        let service_name = factory.service_name().to_string();

        let (host_discovery, owns_host_discovery) = match self.discovery {
            Some(DiscoverySource::Shared(discovery)) => (discovery, false),
            Some(DiscoverySource::Config(config)) => {
                let discovery = DiscoveryFactory::create_host_discovery(&config).await?;
                (Arc::new(discovery) as Arc<dyn HostDiscovery>, true)
            }
            Some(DiscoverySource::Registry(backend, config)) => {
                let config = config.unwrap_or_else(|| DiscoveryConfig::new(&service_name));
                let discovery = DiscoveryFactory::host_discovery_for(backend, &config).await?;
                (Arc::new(discovery) as Arc<dyn HostDiscovery>, true)
            }
            Some(DiscoverySource::Sources(sources)) => {
                let ensemble = self.ensemble.as_deref();
                match source::resolve(&sources, ensemble, &service_name).await? {
                    Some(discovery) => (discovery, true),
                    None => {
                        return Err(PoolError::config(format!(
                            "no host discovery source knows service {} (ensemble {})",
                            service_name,
                            ensemble.unwrap_or("~")
                        )));
                    }
                }
            }
            None => return Err(PoolError::config("host discovery is required")),
        };
        debug!(service = %service_name, owns_host_discovery, "Assembling service pool");

        let mut options = PoolOptions::new(factory, host_discovery);
        options.owns_host_discovery = owns_host_discovery;
        options.cache = self.cache;
        if let Some(policy) = self.caching_policy {
            options.caching_policy = policy;
        }
        if let Some(load_balance) = self.load_balance {
            options.load_balance = load_balance;
        }
        if let Some(filter) = self.partition_filter {
            options.partition_filter = filter;
        }
        if let Some(retry) = self.retry {
            options.retry = retry;
        }
        if let Some(interval) = self.health_check_interval {
            options.health_check_interval = interval;
        }
        if let Some(metrics) = self.metrics {
            options.metrics = metrics;
        }
        options.scheduler = self.scheduler;
        Ok(options)
    }

    /// 构建服务池
    pub async fn build(self) -> Result<ServicePool<S>> {
        let options = self.options().await?;
        ServicePool::new(options)
    }

    /// 构建异步服务池，`max_concurrency` 限制同时执行的调用数
    pub async fn build_async(self, max_concurrency: usize) -> Result<AsyncServicePool<S>> {
        let pool = self.build().await?;
        AsyncServicePool::new(pool, max_concurrency)
    }

    /// 构建绑定默认分区上下文的服务池代理
    pub async fn build_proxy(self, context: PartitionContext) -> Result<ServicePoolProxy<S>> {
        let pool = self.build().await?;
        Ok(ServicePoolProxy::new(pool, context))
    }
}
