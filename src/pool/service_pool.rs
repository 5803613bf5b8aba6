//! 服务池
//!
//! 调用入口：服务发现 → 分区过滤 → 负载均衡 → 实例缓存 → 执行操作，
//! 失败时按工厂的判断换端点重试。
//!
//! 单次调用的状态流转：
//!
//! ```text
//! SELECTING → CHECKED_OUT → SUCCEEDED
//!                         → RETRIABLE_FAILURE → SELECTING
//!                         → FATAL_FAILURE
//!           → EXHAUSTED
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::balance::{LoadBalanceAlgorithm, RandomAlgorithm};
use crate::cache::{
    EvictionScheduler, ServiceCache, ServiceCacheBuilder, ServiceCachingPolicy, ServiceHandle,
};
use crate::client::ServiceFactory;
use crate::discovery::{HostDiscovery, HostDiscoveryListener, ServiceEndPoint};
use crate::error::{EndPointFailure, FailureKind, PoolError, Result};
use crate::health::PoolHealth;
use crate::metrics::{self, MetricsSink, ScopedMetrics};
use crate::partition::{IdentityPartitionFilter, PartitionContext, PartitionFilter};
use crate::retry::{RetryNTimes, RetryPolicy};
use crate::utils::{lock, read, write};

/// 服务池构造参数
pub struct PoolOptions<S> {
    pub factory: Arc<dyn ServiceFactory<Service = S>>,
    pub host_discovery: Arc<dyn HostDiscovery>,
    /// 关闭服务池时是否同时关闭主机发现
    pub owns_host_discovery: bool,
    /// 外部提供的实例缓存（不随服务池关闭），不提供则按 `caching_policy` 创建
    pub cache: Option<Arc<dyn ServiceCache<S>>>,
    pub caching_policy: ServiceCachingPolicy,
    pub load_balance: Arc<dyn LoadBalanceAlgorithm>,
    pub partition_filter: Arc<dyn PartitionFilter>,
    /// `execute` 使用的默认重试策略
    pub retry: Arc<dyn RetryPolicy>,
    /// 坏端点健康检查间隔，`None` 表示不检查
    pub health_check_interval: Option<Duration>,
    pub metrics: Arc<dyn MetricsSink>,
    /// 共享的空闲回收调度器
    pub scheduler: Option<EvictionScheduler>,
}

impl<S> PoolOptions<S>
where
    S: Send + Sync + 'static,
{
    pub fn new(
        factory: Arc<dyn ServiceFactory<Service = S>>,
        host_discovery: Arc<dyn HostDiscovery>,
    ) -> Self {
        Self {
            factory,
            host_discovery,
            owns_host_discovery: false,
            cache: None,
            caching_policy: ServiceCachingPolicy::default(),
            load_balance: Arc::new(RandomAlgorithm),
            partition_filter: Arc::new(IdentityPartitionFilter),
            retry: Arc::new(RetryNTimes::default()),
            health_check_interval: Some(Duration::from_secs(30)),
            metrics: metrics::noop(),
            scheduler: None,
        }
    }
}

/// 单个端点上一次尝试的失败
enum CallError {
    /// 可以换端点重试
    Retriable(EndPointFailure, PoolError),
    /// 立即返回给调用方
    Fatal(PoolError),
}

impl CallError {
    fn into_error(self) -> PoolError {
        match self {
            CallError::Retriable(_, error) | CallError::Fatal(error) => error,
        }
    }
}

/// 操作执行期间持有的实例，未显式归还时在 Drop 中归还
struct CheckInGuard<'a, S>
where
    S: Send + Sync + 'static,
{
    cache: &'a dyn ServiceCache<S>,
    handle: Option<ServiceHandle<S>>,
}

impl<'a, S> CheckInGuard<'a, S>
where
    S: Send + Sync + 'static,
{
    fn new(cache: &'a dyn ServiceCache<S>, handle: ServiceHandle<S>) -> Self {
        Self {
            cache,
            handle: Some(handle),
        }
    }

    fn service(&self) -> Option<Arc<S>> {
        self.handle.as_ref().map(|handle| handle.service().clone())
    }

    fn finish(mut self, discard: bool) {
        if let Some(handle) = self.handle.take() {
            let end_point = handle.end_point().clone();
            let result = if discard {
                self.cache.discard(handle)
            } else {
                self.cache.check_in(handle)
            };
            if let Err(e) = result {
                warn!(end_point = %end_point, error = %e, "Failed to return service instance");
            }
        }
    }
}

impl<S> Drop for CheckInGuard<'_, S>
where
    S: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(end_point = %handle.end_point(), "Call dropped, returning service instance");
            if let Err(e) = self.cache.check_in(handle) {
                warn!(error = %e, "Failed to return service instance");
            }
        }
    }
}

pub(crate) struct PoolInner<S>
where
    S: Send + Sync + 'static,
{
    service_name: String,
    factory: Arc<dyn ServiceFactory<Service = S>>,
    discovery: Arc<dyn HostDiscovery>,
    owns_discovery: bool,
    cache: Arc<dyn ServiceCache<S>>,
    owns_cache: bool,
    load_balance: Arc<dyn LoadBalanceAlgorithm>,
    partition_filter: Arc<dyn PartitionFilter>,
    retry: Arc<dyn RetryPolicy>,
    bad: RwLock<Arc<HashSet<ServiceEndPoint>>>,
    metrics: ScopedMetrics,
    closed: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    listener: Mutex<Option<Arc<dyn HostDiscoveryListener>>>,
}

impl<S> PoolInner<S>
where
    S: Send + Sync + 'static,
{
    fn bad_snapshot(&self) -> Arc<HashSet<ServiceEndPoint>> {
        read(&self.bad).clone()
    }

    fn mark_bad(&self, end_point: &ServiceEndPoint) {
        let inserted = {
            let mut bad = write(&self.bad);
            if bad.contains(end_point) {
                false
            } else {
                let mut next = HashSet::clone(&bad);
                next.insert(end_point.clone());
                *bad = Arc::new(next);
                true
            }
        };
        if inserted {
            warn!(service = %self.service_name, end_point = %end_point, "End point marked bad");
            self.report_end_points();
        }
    }

    fn forget_bad(&self, end_point: &ServiceEndPoint) -> bool {
        let removed = {
            let mut bad = write(&self.bad);
            if bad.contains(end_point) {
                let mut next = HashSet::clone(&bad);
                next.remove(end_point);
                *bad = Arc::new(next);
                true
            } else {
                false
            }
        };
        if removed {
            self.report_end_points();
        }
        removed
    }

    /// 移除与端点身份相同的坏端点（不比较 payload）
    fn forget_bad_by_key(&self, end_point: &ServiceEndPoint) {
        let key = end_point.key();
        let removed = {
            let mut bad = write(&self.bad);
            if bad.iter().any(|b| b.key() == key) {
                let next: HashSet<ServiceEndPoint> =
                    bad.iter().filter(|b| b.key() != key).cloned().collect();
                *bad = Arc::new(next);
                true
            } else {
                false
            }
        };
        if removed {
            self.report_end_points();
        }
    }

    fn counts(&self) -> (usize, usize) {
        let bad = self.bad_snapshot();
        let valid = self
            .discovery
            .hosts()
            .iter()
            .filter(|host| !bad.contains(*host))
            .count();
        (valid, bad.len())
    }

    fn report_end_points(&self) {
        let (valid, bad) = self.counts();
        self.metrics.set_gauge("num-valid-end-points", valid as f64);
        self.metrics.set_gauge("num-bad-end-points", bad as f64);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(PoolError::closed(format!("service pool {}", self.service_name)))
        } else {
            Ok(())
        }
    }

    /// 在一个端点上执行一次操作
    async fn call_end_point<R, F, Fut>(
        &self,
        end_point: &ServiceEndPoint,
        operation: &F,
    ) -> std::result::Result<R, CallError>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let handle = match self.cache.check_out(end_point).await {
            Ok(handle) => handle,
            Err(error @ PoolError::NoCachedInstancesAvailable { .. }) => {
                // 缓存耗尽不代表端点不健康，不标记为坏端点
                debug!(end_point = %end_point, "No cached instances available");
                let failure = EndPointFailure {
                    end_point: end_point.clone(),
                    kind: FailureKind::CacheExhausted,
                    message: error.to_string(),
                };
                return Err(CallError::Retriable(failure, error));
            }
            Err(PoolError::ServiceCreation { end_point, error }) => {
                if self.factory.is_retriable_exception(&error) {
                    warn!(end_point = %end_point, error = %error, "Failed to create service instance");
                    self.mark_bad(&end_point);
                    let failure = EndPointFailure {
                        end_point: end_point.clone(),
                        kind: FailureKind::CreationFailed,
                        message: format!("{:#}", error),
                    };
                    return Err(CallError::Retriable(
                        failure,
                        PoolError::ServiceCreation { end_point, error },
                    ));
                }
                return Err(CallError::Fatal(PoolError::ServiceCreation { end_point, error }));
            }
            Err(other) => return Err(CallError::Fatal(other)),
        };

        let guard = CheckInGuard::new(self.cache.as_ref(), handle);
        let Some(service) = guard.service() else {
            return Err(CallError::Fatal(PoolError::CheckInProtocol(
                "checked-out handle is empty".to_string(),
            )));
        };

        let started = Instant::now();
        let result = operation(service).await;
        self.metrics.record_timer("call", started.elapsed());

        match result {
            Ok(value) => {
                guard.finish(false);
                self.metrics.mark_meter("successes", 1);
                if self.forget_bad(end_point) {
                    info!(service = %self.service_name, end_point = %end_point, "End point recovered");
                }
                Ok(value)
            }
            Err(error) => {
                guard.finish(self.factory.invalidates_instance(&error));
                self.metrics.mark_meter("failures", 1);
                if self.factory.is_retriable_exception(&error) {
                    warn!(end_point = %end_point, error = %error, "Retriable service call failure");
                    self.mark_bad(end_point);
                    let failure = EndPointFailure {
                        end_point: end_point.clone(),
                        kind: FailureKind::ServiceCall,
                        message: format!("{:#}", error),
                    };
                    Err(CallError::Retriable(
                        failure,
                        PoolError::ServiceCallFailure {
                            end_point: end_point.clone(),
                            retriable: true,
                            error,
                        },
                    ))
                } else {
                    debug!(end_point = %end_point, error = %error, "Fatal service call failure");
                    Err(CallError::Fatal(PoolError::ServiceCallFailure {
                        end_point: end_point.clone(),
                        retriable: false,
                        error,
                    }))
                }
            }
        }
    }

    async fn execute_with<R, F, Fut>(
        &self,
        retry: &dyn RetryPolicy,
        context: &PartitionContext,
        operation: F,
    ) -> Result<R>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        self.ensure_open()?;
        let started = Instant::now();
        let candidates = self
            .partition_filter
            .filter(self.discovery.hosts(), context);

        let mut tried: HashSet<ServiceEndPoint> = HashSet::new();
        let mut failures: Vec<EndPointFailure> = Vec::new();
        let mut attempt = 0usize;

        loop {
            let mut excluded = HashSet::clone(&self.bad_snapshot());
            excluded.extend(tried.iter().cloned());
            let Some(end_point) = self.load_balance.choose(&candidates, &excluded) else {
                break;
            };

            tried.insert(end_point.clone());
            attempt += 1;
            match self.call_end_point(&end_point, &operation).await {
                Ok(value) => return Ok(value),
                Err(CallError::Fatal(error)) => return Err(error),
                Err(CallError::Retriable(failure, _)) => failures.push(failure),
            }

            if !retry.allow_retry(attempt, started.elapsed()) {
                break;
            }
            let backoff = retry.backoff_duration(attempt);
            if !backoff.is_zero() {
                tokio::time::sleep(backoff).await;
            }
            self.ensure_open()?;
        }

        if failures.is_empty() {
            return Err(PoolError::NoSuitableHostsAvailable {
                service: self.service_name.clone(),
            });
        }
        warn!(
            service = %self.service_name,
            attempts = failures.len(),
            context = %context,
            "Service call failed on every attempted end point"
        );
        Err(PoolError::Exhausted {
            service: self.service_name.clone(),
            failures,
        })
    }

    /// 重新检查坏端点，移除已不在服务发现中的条目
    async fn check_bad_end_points(&self) {
        let bad = self.bad_snapshot();
        if bad.is_empty() {
            self.report_end_points();
            return;
        }
        let hosts: HashSet<ServiceEndPoint> = self.discovery.hosts().into_iter().collect();
        for end_point in bad.iter() {
            if !hosts.contains(end_point) {
                debug!(end_point = %end_point, "Dropping bad end point that is no longer discovered");
                self.forget_bad(end_point);
                continue;
            }
            if self.factory.is_healthy(end_point).await && self.forget_bad(end_point) {
                info!(service = %self.service_name, end_point = %end_point, "End point passed health check");
            }
        }
        self.report_end_points();
    }

    fn shutdown_sync(&self) {
        self.cancel.cancel();
        if let Some(listener) = lock(&self.listener).take() {
            self.discovery.remove_listener(&listener);
        }
        if self.owns_cache {
            self.cache.close();
        }
    }
}

impl<S> Drop for PoolInner<S>
where
    S: Send + Sync + 'static,
{
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.shutdown_sync();
        }
    }
}

/// 服务发现通知端点下线时驱逐缓存并清理坏端点
struct EndPointRemovalListener<S>
where
    S: Send + Sync + 'static,
{
    pool: Weak<PoolInner<S>>,
}

impl<S> HostDiscoveryListener for EndPointRemovalListener<S>
where
    S: Send + Sync + 'static,
{
    fn on_end_point_added(&self, _end_point: &ServiceEndPoint) {
        if let Some(pool) = self.pool.upgrade() {
            pool.report_end_points();
        }
    }

    fn on_end_point_removed(&self, end_point: &ServiceEndPoint) {
        if let Some(pool) = self.pool.upgrade() {
            pool.cache.evict(end_point);
            pool.forget_bad_by_key(end_point);
            pool.report_end_points();
        }
    }
}

/// 服务池
///
/// 克隆得到的服务池共享同一份状态
pub struct ServicePool<S>
where
    S: Send + Sync + 'static,
{
    inner: Arc<PoolInner<S>>,
}

impl<S> Clone for ServicePool<S>
where
    S: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S> ServicePool<S>
where
    S: Send + Sync + 'static,
{
    /// 创建服务池（需要在 tokio 运行时中调用）
    pub fn new(options: PoolOptions<S>) -> Result<Self> {
        let service_name = options.factory.service_name().to_string();
        if service_name.is_empty() {
            return Err(PoolError::config("service name must not be empty"));
        }
        if options.health_check_interval.is_some_and(|i| i.is_zero()) {
            return Err(PoolError::config("health check interval must be positive"));
        }

        let (cache, owns_cache) = match options.cache {
            Some(cache) => (cache, false),
            None => {
                let mut builder = ServiceCacheBuilder::new(options.factory.clone())
                    .with_policy(options.caching_policy)
                    .with_metrics(options.metrics.clone());
                if let Some(scheduler) = options.scheduler {
                    builder = builder.with_scheduler(scheduler);
                }
                (builder.build()?, true)
            }
        };

        let inner = Arc::new(PoolInner {
            metrics: ScopedMetrics::new(service_name.clone(), options.metrics),
            service_name,
            factory: options.factory,
            discovery: options.host_discovery,
            owns_discovery: options.owns_host_discovery,
            cache,
            owns_cache,
            load_balance: options.load_balance,
            partition_filter: options.partition_filter,
            retry: options.retry,
            bad: RwLock::new(Arc::new(HashSet::new())),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
            listener: Mutex::new(None),
        });

        let listener: Arc<dyn HostDiscoveryListener> = Arc::new(EndPointRemovalListener {
            pool: Arc::downgrade(&inner),
        });
        inner.discovery.add_listener(listener.clone());
        *lock(&inner.listener) = Some(listener);

        if let Some(period) = options.health_check_interval {
            let task = tokio::spawn(health_check_loop(
                Arc::downgrade(&inner),
                inner.cancel.clone(),
                period,
            ));
            lock(&inner.tasks).push(task);
        }

        inner.report_end_points();
        info!(
            service = %inner.service_name,
            hosts = inner.discovery.hosts().len(),
            "✅ Service pool created"
        );
        Ok(Self { inner })
    }

    /// 服务名称
    pub fn service_name(&self) -> &str {
        &self.inner.service_name
    }

    /// 使用默认重试策略执行操作
    pub async fn execute<R, F, Fut>(&self, context: &PartitionContext, operation: F) -> Result<R>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        let retry = self.inner.retry.clone();
        self.inner
            .execute_with(retry.as_ref(), context, operation)
            .await
    }

    /// 使用指定的重试策略执行操作
    pub async fn execute_with<R, F, Fut>(
        &self,
        retry: &dyn RetryPolicy,
        context: &PartitionContext,
        operation: F,
    ) -> Result<R>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        self.inner.execute_with(retry, context, operation).await
    }

    /// 在指定端点上执行一次操作，不做故障转移
    ///
    /// 坏端点的标记规则与 `execute` 相同
    pub async fn execute_on_end_point<R, F, Fut>(
        &self,
        end_point: &ServiceEndPoint,
        operation: F,
    ) -> Result<R>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        self.inner.ensure_open()?;
        self.inner
            .call_end_point(end_point, &operation)
            .await
            .map_err(CallError::into_error)
    }

    /// 当前服务发现中的端点
    pub fn hosts(&self) -> Vec<ServiceEndPoint> {
        self.inner.discovery.hosts()
    }

    /// 当前可用（未被标记为坏）的端点
    pub fn valid_end_points(&self) -> Vec<ServiceEndPoint> {
        let bad = self.inner.bad_snapshot();
        self.inner
            .discovery
            .hosts()
            .into_iter()
            .filter(|host| !bad.contains(host))
            .collect()
    }

    /// 可用端点数
    pub fn num_valid_end_points(&self) -> usize {
        self.inner.counts().0
    }

    /// 坏端点数
    pub fn num_bad_end_points(&self) -> usize {
        self.inner.bad_snapshot().len()
    }

    /// 当前的坏端点
    pub fn bad_end_points(&self) -> Vec<ServiceEndPoint> {
        self.inner.bad_snapshot().iter().cloned().collect()
    }

    /// 健康摘要
    pub fn health(&self) -> PoolHealth {
        let (valid, bad) = self.inner.counts();
        PoolHealth::from_counts(valid, bad)
    }

    /// 立即执行一次坏端点健康检查
    pub async fn check_health(&self) {
        self.inner.check_bad_end_points().await;
    }

    /// 服务池使用的实例缓存
    pub fn cache(&self) -> &Arc<dyn ServiceCache<S>> {
        &self.inner.cache
    }

    pub fn host_discovery(&self) -> &Arc<dyn HostDiscovery> {
        &self.inner.discovery
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// 关闭服务池
    ///
    /// 取消服务发现订阅、停止健康检查，并关闭服务池拥有的缓存和主机发现
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.shutdown_sync();
        let tasks: Vec<JoinHandle<()>> = lock(&self.inner.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        if self.inner.owns_discovery {
            self.inner.discovery.close().await;
        }
        info!(service = %self.inner.service_name, "Service pool closed");
    }
}

async fn health_check_loop<S>(pool: Weak<PoolInner<S>>, cancel: CancellationToken, period: Duration)
where
    S: Send + Sync + 'static,
{
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = timer.tick() => {
                let Some(pool) = pool.upgrade() else { break };
                pool.check_bad_end_points().await;
            }
        }
    }
}
