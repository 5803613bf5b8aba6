//! 客户端实例缓存模块
//!
//! 按端点创建、复用和销毁客户端实例，有两种策略：
//!
//! - [`SingleThreadedServiceCache`]：实例不是线程安全的，每次签出独占一个实例，
//!   每个端点最多缓存 `max_instances_per_end_point` 个
//! - [`MultiThreadedServiceCache`]：实例线程安全，每个端点只有一个共享实例，
//!   引用计数归零且端点已被驱逐时才销毁
//!
//! 空闲实例由 [`EvictionScheduler`] 定期回收，一个调度器可以被多个缓存共享。

pub mod multi_threaded;
pub mod policy;
pub mod scheduler;
pub mod single_threaded;

pub use multi_threaded::MultiThreadedServiceCache;
pub use policy::{ExhaustionAction, ServiceCachingPolicy};
pub use scheduler::EvictionScheduler;
pub use single_threaded::SingleThreadedServiceCache;

use std::fmt;
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::client::ServiceFactory;
use crate::discovery::ServiceEndPoint;
use crate::error::{PoolError, Result};
use crate::metrics::{self, MetricsSink, ScopedMetrics};

/// 实例缓存
///
/// 签出的句柄必须通过 `check_in` 或 `discard` 归还，否则占用的容量不会释放
#[async_trait]
pub trait ServiceCache<S>: Send + Sync
where
    S: Send + Sync + 'static,
{
    /// 签出一个实例
    ///
    /// 容量耗尽时按 [`ExhaustionAction`] 处理：FAIL 立即返回
    /// `NoCachedInstancesAvailable`，BLOCK 等待（可超时），GROW 超出上限创建
    async fn check_out(&self, end_point: &ServiceEndPoint) -> Result<ServiceHandle<S>>;

    /// 归还实例
    ///
    /// 句柄不属于本缓存或已归还时返回 `CheckInProtocol` 错误
    fn check_in(&self, handle: ServiceHandle<S>) -> Result<()>;

    /// 归还并销毁实例（实例已不可用）
    fn discard(&self, handle: ServiceHandle<S>) -> Result<()>;

    /// 销毁端点的全部实例，使用中的实例在归还时销毁
    fn evict(&self, end_point: &ServiceEndPoint);

    /// 立即执行一次空闲回收，返回销毁的实例数
    fn evict_idle(&self) -> usize;

    /// 端点的空闲实例数
    fn num_idle_instances(&self, end_point: &ServiceEndPoint) -> usize;

    /// 端点的使用中实例数
    fn num_active_instances(&self, end_point: &ServiceEndPoint) -> usize;

    /// 关闭缓存：停止回收任务，销毁全部实例，之后的签出返回 `Closed`
    fn close(&self);

    fn is_closed(&self) -> bool;
}

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_cache_id() -> u64 {
    NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed)
}

/// 句柄持有的缓存内部状态，归还时直接定位到所属端点
pub(crate) enum Lease<S> {
    Exclusive(Arc<single_threaded::Slot<S>>),
    Shared(Arc<multi_threaded::Entry<S>>),
}

/// 签出的实例句柄
pub struct ServiceHandle<S> {
    end_point: ServiceEndPoint,
    instance: Arc<S>,
    id: u64,
    cache_id: u64,
    lease: Lease<S>,
}

impl<S> ServiceHandle<S> {
    pub(crate) fn new(
        end_point: ServiceEndPoint,
        instance: Arc<S>,
        id: u64,
        cache_id: u64,
        lease: Lease<S>,
    ) -> Self {
        Self {
            end_point,
            instance,
            id,
            cache_id,
            lease,
        }
    }

    /// 实例所属端点
    pub fn end_point(&self) -> &ServiceEndPoint {
        &self.end_point
    }

    /// 客户端实例
    pub fn service(&self) -> &Arc<S> {
        &self.instance
    }

    /// 句柄编号（缓存内唯一）
    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn cache_id(&self) -> u64 {
        self.cache_id
    }

    pub(crate) fn lease(&self) -> &Lease<S> {
        &self.lease
    }

    pub(crate) fn into_instance(self) -> Arc<S> {
        self.instance
    }
}

impl<S> Deref for ServiceHandle<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.instance
    }
}

impl<S> fmt::Debug for ServiceHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceHandle")
            .field("end_point", &self.end_point)
            .field("id", &self.id)
            .field("cache_id", &self.cache_id)
            .finish()
    }
}

pub(crate) fn protocol_error<S>(handle: &ServiceHandle<S>, reason: &str) -> PoolError {
    PoolError::CheckInProtocol(format!(
        "handle {} for {}: {}",
        handle.id, handle.end_point, reason
    ))
}

/// 调用工厂销毁实例，工厂 panic 时只记录警告
pub(crate) fn destroy_instance<S>(
    factory: &dyn ServiceFactory<Service = S>,
    metrics: &ScopedMetrics,
    end_point: &ServiceEndPoint,
    instance: Arc<S>,
) where
    S: Send + Sync + 'static,
{
    let result = catch_unwind(AssertUnwindSafe(|| factory.destroy(end_point, instance)));
    if result.is_err() {
        warn!(end_point = %end_point, "Service factory panicked while destroying an instance");
    }
    metrics.mark_meter("destructions", 1);
}

/// 实例缓存构建器
pub struct ServiceCacheBuilder<S> {
    factory: Arc<dyn ServiceFactory<Service = S>>,
    policy: ServiceCachingPolicy,
    metrics: Arc<dyn MetricsSink>,
    scheduler: Option<EvictionScheduler>,
}

impl<S> ServiceCacheBuilder<S>
where
    S: Send + Sync + 'static,
{
    pub fn new(factory: Arc<dyn ServiceFactory<Service = S>>) -> Self {
        Self {
            factory,
            policy: ServiceCachingPolicy::default(),
            metrics: metrics::noop(),
            scheduler: None,
        }
    }

    pub fn with_policy(mut self, policy: ServiceCachingPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// 与其他缓存共享回收调度器
    pub fn with_scheduler(mut self, scheduler: EvictionScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// 按服务工厂和策略选择缓存实现
    ///
    /// 需要在 tokio 运行时中调用
    pub fn build(self) -> Result<Arc<dyn ServiceCache<S>>> {
        let scheduler = self.scheduler.unwrap_or_default();
        let cache: Arc<dyn ServiceCache<S>> =
            if self.factory.is_multi_threaded() || self.policy.multi_threaded_client {
                MultiThreadedServiceCache::new(self.factory, self.policy, self.metrics, scheduler)?
            } else {
                SingleThreadedServiceCache::new(self.factory, self.policy, self.metrics, scheduler)?
            };
        Ok(cache)
    }
}
