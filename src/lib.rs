//! Flare Service Pool
//!
//! Client-side SOA runtime: host discovery, load balancing, partition filtering,
//! per-endpoint client instance caching and failover execution.
//!
//! ```ignore
//! use flare_service_pool::prelude::*;
//!
//! let pool = ServicePoolBuilder::new()
//!     .with_service_factory(CalculatorFactory::default())
//!     .with_registry(registry)
//!     .build()
//!     .await?;
//!
//! let sum = pool
//!     .execute(&PartitionContext::empty(), |calc| async move { calc.add(1, 2).await })
//!     .await?;
//! ```

pub mod balance;
pub mod cache;
pub mod client;
pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod metrics;
pub mod partition;
pub mod pool;
pub mod retry;

pub(crate) mod utils;

// Re-exports
pub use balance::{LoadBalanceAlgorithm, LoadBalanceStrategy, RandomAlgorithm, RoundRobinAlgorithm};
pub use cache::{
    EvictionScheduler, ExhaustionAction, MultiThreadedServiceCache, ServiceCache,
    ServiceCacheBuilder, ServiceCachingPolicy, ServiceHandle, SingleThreadedServiceCache,
};
pub use client::ServiceFactory;
pub use config::PoolConfig;
pub use discovery::{
    BackendType, DiscoveryConfig, DiscoveryFactory, EndPointKey, FixedHostDiscovery,
    HostDiscovery, HostDiscoveryListener, HostDiscoverySource, InMemoryRegistry, RegistryBackend,
    RegistryDiscoverySource, RegistryEvent, RegistryHostDiscovery, ServiceEndPoint,
    ServiceEndPointBuilder, ServiceRegistrar,
};
pub use error::{
    EndPointError, EndPointFailure, ErrorCategory, ErrorCode, FailureKind, PoolError,
    RegistryError, Result,
};
pub use health::{HealthStatus, PoolHealth};
pub use metrics::{InMemoryMetrics, MetricsSink, MetricsSnapshot, NoopMetrics, ScopedMetrics};
pub use partition::{
    IdentityPartitionFilter, PartitionContext, PartitionFilter, PayloadPartitionFilter,
};
pub use pool::{
    AsyncServicePool, CallHandle, PoolOptions, ServicePool, ServicePoolBuilder, ServicePoolProxy,
};
pub use retry::{ExponentialBackoffRetry, RetryConfig, RetryNTimes, RetryPolicy, RetryStrategy};

#[cfg(feature = "etcd")]
pub use discovery::EtcdRegistry;

#[cfg(feature = "prometheus")]
pub use metrics::prometheus::PrometheusMetrics;

/// 常用类型
pub mod prelude {
    pub use crate::{
        ExhaustionAction, HostDiscovery, PartitionContext, PoolError, Result, ServiceCachingPolicy,
        ServiceEndPoint, ServiceFactory, ServicePool, ServicePoolBuilder,
    };
}
