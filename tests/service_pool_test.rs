//! 服务池测试：故障转移、坏端点、健康检查、异步调用、代理和构建器

mod common;

use std::collections::{HashMap, HashSet};
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use common::{
    as_factory, end_point, end_point_in, end_point_with_payload, init_tracing, wait_until,
    Broken, Calculator, Fatal, RecordingFactory, Transient, SERVICE,
};
use flare_service_pool::{
    AsyncServicePool, DiscoveryConfig, ErrorCode, ExhaustionAction, FailureKind,
    FixedHostDiscovery, HealthStatus, HostDiscovery, HostDiscoverySource, InMemoryMetrics,
    InMemoryRegistry, PartitionContext, PayloadPartitionFilter, PoolConfig, PoolError,
    PoolOptions, RegistryBackend, RegistryDiscoverySource, RegistryHostDiscovery, RetryNTimes,
    RoundRobinAlgorithm, ServiceCachingPolicy, ServiceEndPoint, ServiceFactory, ServicePool,
    ServicePoolBuilder,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
enum Outcome {
    Transient,
    Fatal,
    Broken,
}

/// 按端点编排调用结果，并记录被调用的端点
#[derive(Clone, Default)]
struct Script {
    outcomes: Arc<Mutex<HashMap<String, Outcome>>>,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Script {
    fn fail(&self, id: &str, outcome: Outcome) -> &Self {
        self.outcomes.lock().unwrap().insert(id.to_string(), outcome);
        self
    }

    fn heal(&self, id: &str) {
        self.outcomes.lock().unwrap().remove(id);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn run(&self, calc: &Calculator) -> anyhow::Result<String> {
        let id = calc.end_point.id().to_string();
        self.calls.lock().unwrap().push(id.clone());
        match self.outcomes.lock().unwrap().get(&id) {
            None => Ok(id),
            Some(Outcome::Transient) => Err(Transient(format!("timeout on {}", id)).into()),
            Some(Outcome::Fatal) => Err(Fatal(format!("rejected by {}", id)).into()),
            Some(Outcome::Broken) => Err(Broken(format!("connection reset by {}", id)).into()),
        }
    }

    fn operation(
        &self,
    ) -> impl Fn(Arc<Calculator>) -> Ready<anyhow::Result<String>> + Clone + Send + Sync + 'static
    {
        let script = self.clone();
        move |calc| ready(script.run(&calc))
    }
}

fn fixed(ids: &[&str]) -> Arc<dyn HostDiscovery> {
    Arc::new(FixedHostDiscovery::new(ids.iter().map(|id| end_point(id))))
}

fn options(
    factory: &Arc<RecordingFactory>,
    discovery: Arc<dyn HostDiscovery>,
    attempts: usize,
) -> PoolOptions<Calculator> {
    let mut options = PoolOptions::new(as_factory(factory), discovery);
    options.retry = Arc::new(RetryNTimes::immediate(attempts));
    options.health_check_interval = None;
    options
}

fn pool(
    factory: &Arc<RecordingFactory>,
    discovery: Arc<dyn HostDiscovery>,
    attempts: usize,
) -> ServicePool<Calculator> {
    ServicePool::new(options(factory, discovery, attempts)).unwrap()
}

fn ids(end_points: Vec<ServiceEndPoint>) -> HashSet<String> {
    end_points.iter().map(|ep| ep.id().to_string()).collect()
}

fn set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

async fn slow_call(calc: Arc<Calculator>) -> anyhow::Result<String> {
    tokio::time::sleep(Duration::from_secs(5)).await;
    Ok(calc.end_point.id().to_string())
}

#[tokio::test]
async fn test_execute_reuses_cached_instance() {
    init_tracing();
    let factory = RecordingFactory::new();
    let pool = pool(&factory, fixed(&["a"]), 3);
    let ctx = PartitionContext::empty();

    let sum = pool
        .execute(&ctx, |calc| async move { calc.add(1, 2).await })
        .await
        .unwrap();
    assert_eq!(sum, 3);
    let sum = pool
        .execute(&ctx, |calc| async move { calc.add(40, 2).await })
        .await
        .unwrap();
    assert_eq!(sum, 42);

    assert_eq!(factory.created(), 1);
    assert_eq!(pool.cache().num_idle_instances(&end_point("a")), 1);
    assert_eq!(pool.cache().num_active_instances(&end_point("a")), 0);
}

#[tokio::test]
async fn test_failover_marks_exactly_the_failed_end_points_bad() {
    let factory = RecordingFactory::new();
    let pool = pool(&factory, fixed(&["a", "b", "c"]), 3);
    let script = Script::default();
    script.fail("a", Outcome::Transient).fail("b", Outcome::Transient);

    let result = pool
        .execute(&PartitionContext::empty(), script.operation())
        .await
        .unwrap();
    assert_eq!(result, "c");

    let calls = script.calls();
    assert_eq!(calls.last().map(String::as_str), Some("c"));
    let failed: HashSet<String> = calls[..calls.len() - 1].iter().cloned().collect();
    assert_eq!(failed.len(), calls.len() - 1, "no end point tried twice");
    assert_eq!(ids(pool.bad_end_points()), failed);
    assert_eq!(pool.num_bad_end_points(), failed.len());
    assert_eq!(pool.num_valid_end_points(), 3 - failed.len());
}

#[tokio::test]
async fn test_bad_end_points_are_skipped_by_later_calls() {
    let factory = RecordingFactory::new();
    let pool = pool(&factory, fixed(&["a", "b"]), 2);
    let script = Script::default();
    script.fail("a", Outcome::Transient);

    // 直接在 a 上失败一次，使其被标记为坏端点
    let err = pool
        .execute_on_end_point(&end_point("a"), script.operation())
        .await
        .unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(ids(pool.bad_end_points()), set(&["a"]));

    for _ in 0..10 {
        let result = pool
            .execute(&PartitionContext::empty(), script.operation())
            .await
            .unwrap();
        assert_eq!(result, "b");
    }
    assert_eq!(script.calls().iter().filter(|id| *id == "a").count(), 1);
}

#[tokio::test]
async fn test_fatal_error_is_returned_without_retry() {
    let factory = RecordingFactory::new();
    let pool = pool(&factory, fixed(&["a", "b"]), 5);
    let script = Script::default();
    script.fail("a", Outcome::Fatal).fail("b", Outcome::Fatal);

    let err = pool
        .execute(&PartitionContext::empty(), script.operation())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ServiceCallFailure { retriable: false, .. }));
    assert_eq!(err.code(), ErrorCode::ServiceCallFailure);
    assert!(!err.is_retryable());
    assert_eq!(script.calls().len(), 1);
    assert_eq!(pool.num_bad_end_points(), 0);
}

#[tokio::test]
async fn test_no_suitable_hosts() {
    let factory = RecordingFactory::new();
    let empty = pool(&factory, fixed(&[]), 3);
    let err = empty
        .execute(&PartitionContext::empty(), Script::default().operation())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::NoSuitableHostsAvailable { .. }));
    assert_eq!(err.code(), ErrorCode::NoSuitableHostsAvailable);
    assert!(err.failures().is_empty());

    // 分区过滤掉全部端点
    let discovery: Arc<dyn HostDiscovery> = Arc::new(FixedHostDiscovery::new(vec![
        end_point_with_payload("a", r#"{"shard": "1"}"#),
    ]));
    let mut opts = options(&factory, discovery, 3);
    opts.partition_filter = Arc::new(PayloadPartitionFilter);
    let sharded = ServicePool::new(opts).unwrap();
    let err = sharded
        .execute(&PartitionContext::of("shard", "2"), Script::default().operation())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuitableHostsAvailable);
    assert_eq!(factory.created(), 0);
}

#[tokio::test]
async fn test_exhausted_lists_every_failure() {
    let factory = RecordingFactory::new();
    let pool = pool(&factory, fixed(&["a", "b"]), 5);
    let script = Script::default();
    script.fail("a", Outcome::Transient).fail("b", Outcome::Transient);

    let err = pool
        .execute(&PartitionContext::empty(), script.operation())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Exhausted { .. }));
    assert_eq!(err.code(), ErrorCode::RetriesExhausted);
    let failed: HashSet<String> = err
        .failures()
        .iter()
        .map(|f| f.end_point.id().to_string())
        .collect();
    assert_eq!(failed, set(&["a", "b"]));
    assert!(err.failures().iter().all(|f| f.kind == FailureKind::ServiceCall));
    assert_eq!(pool.num_valid_end_points(), 0);

    // 所有端点都已是坏端点，下一次调用没有候选
    let err = pool
        .execute(&PartitionContext::empty(), script.operation())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuitableHostsAvailable);
    assert_eq!(script.calls().len(), 2);
}

#[tokio::test]
async fn test_retry_policy_limits_attempts() {
    let factory = RecordingFactory::new();
    let pool = pool(&factory, fixed(&["a", "b", "c", "d"]), 2);
    let script = Script::default();
    for id in ["a", "b", "c", "d"] {
        script.fail(id, Outcome::Transient);
    }

    let err = pool
        .execute(&PartitionContext::empty(), script.operation())
        .await
        .unwrap_err();
    assert_eq!(err.failures().len(), 2);
    assert_eq!(script.calls().len(), 2);

    // 单次调用指定的重试策略
    let err = pool
        .execute_with(
            &RetryNTimes::immediate(1),
            &PartitionContext::empty(),
            script.operation(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.failures().len(), 1);
    assert_eq!(script.calls().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_backoff_between_attempts() {
    let factory = RecordingFactory::new();
    let mut opts = options(&factory, fixed(&["a", "b"]), 2);
    opts.retry = Arc::new(RetryNTimes::new(2, Duration::from_millis(300)));
    let pool = ServicePool::new(opts).unwrap();
    let script = Script::default();
    script.fail("a", Outcome::Transient).fail("b", Outcome::Transient);

    let started = tokio::time::Instant::now();
    let err = pool
        .execute(&PartitionContext::empty(), script.operation())
        .await
        .unwrap_err();
    assert_eq!(err.failures().len(), 2);
    assert!(started.elapsed() >= Duration::from_millis(300));
}

#[tokio::test]
async fn test_creation_failures() {
    let factory = RecordingFactory::new();
    let pool = pool(&factory, fixed(&["a", "b"]), 3);
    let script = Script::default();

    factory.fail_creates_for("a");
    let result = pool
        .execute_on_end_point(&end_point("a"), script.operation())
        .await;
    assert!(matches!(result, Err(PoolError::ServiceCreation { .. })));
    assert_eq!(ids(pool.bad_end_points()), set(&["a"]));

    let result = pool
        .execute(&PartitionContext::empty(), script.operation())
        .await
        .unwrap();
    assert_eq!(result, "b");

    // 不可重试的创建失败直接返回
    factory.reject_creates_for("b");
    // b 已有缓存实例，不需要重新创建
    let result = pool
        .execute(&PartitionContext::empty(), Script::default().operation())
        .await;
    assert!(result.is_ok());

    pool.cache().evict(&end_point("b"));
    let err = pool
        .execute(&PartitionContext::empty(), Script::default().operation())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::ServiceCreation { .. }));
    assert_eq!(err.code(), ErrorCode::ServiceCreationFailed);
    assert!(!ids(pool.bad_end_points()).contains("b"));
}

#[tokio::test]
async fn test_cache_exhaustion_does_not_mark_bad() {
    let factory = RecordingFactory::new();
    let mut opts = options(&factory, fixed(&["a"]), 3);
    opts.caching_policy = ServiceCachingPolicy::default()
        .with_exhaustion_action(ExhaustionAction::Fail)
        .with_max_instances_per_end_point(1);
    let pool = ServicePool::new(opts).unwrap();

    let held = pool.cache().check_out(&end_point("a")).await.unwrap();
    let err = pool
        .execute(&PartitionContext::empty(), Script::default().operation())
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Exhausted { .. }));
    assert_eq!(err.code(), ErrorCode::NoCachedInstancesAvailable);
    assert_eq!(err.failures()[0].kind, FailureKind::CacheExhausted);
    assert_eq!(pool.num_bad_end_points(), 0);

    pool.cache().check_in(held).unwrap();
    let result = pool
        .execute(&PartitionContext::empty(), Script::default().operation())
        .await
        .unwrap();
    assert_eq!(result, "a");
}

#[tokio::test]
async fn test_invalidated_instance_is_discarded() {
    let factory = RecordingFactory::new();
    let pool = pool(&factory, fixed(&["a"]), 1);
    let script = Script::default();
    script.fail("a", Outcome::Broken);

    let err = pool
        .execute(&PartitionContext::empty(), script.operation())
        .await
        .unwrap_err();
    assert_eq!(err.failures().len(), 1);
    assert_eq!(factory.destroyed_serials(), vec![1]);
    assert_eq!(pool.cache().num_idle_instances(&end_point("a")), 0);

    // 普通的可重试失败会把实例放回缓存
    pool.check_health().await;
    script.fail("a", Outcome::Transient);
    let _ = pool
        .execute(&PartitionContext::empty(), script.operation())
        .await;
    assert_eq!(pool.cache().num_idle_instances(&end_point("a")), 1);
    assert_eq!(factory.destroyed(), 1);
}

#[tokio::test]
async fn test_health_check_recovers_bad_end_points() {
    let factory = RecordingFactory::new();
    let pool = pool(&factory, fixed(&["a", "b"]), 1);
    let script = Script::default();
    script.fail("a", Outcome::Transient);

    let _ = pool
        .execute_on_end_point(&end_point("a"), script.operation())
        .await;
    assert_eq!(pool.num_bad_end_points(), 1);

    factory.set_healthy("a", false);
    pool.check_health().await;
    assert_eq!(pool.num_bad_end_points(), 1);
    assert_eq!(factory.health_checks(), 1);

    factory.set_healthy("a", true);
    pool.check_health().await;
    assert_eq!(pool.num_bad_end_points(), 0);
    assert_eq!(pool.num_valid_end_points(), 2);

    // 没有坏端点时不做检查
    pool.check_health().await;
    assert_eq!(factory.health_checks(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_background_health_check() {
    let factory = RecordingFactory::new();
    let mut opts = options(&factory, fixed(&["a", "b"]), 1);
    opts.health_check_interval = Some(Duration::from_secs(1));
    let pool = ServicePool::new(opts).unwrap();
    let script = Script::default();
    script.fail("a", Outcome::Transient);

    let _ = pool
        .execute_on_end_point(&end_point("a"), script.operation())
        .await;
    assert_eq!(pool.num_bad_end_points(), 1);

    assert!(wait_until(Duration::from_secs(5), || pool.num_bad_end_points() == 0).await);
    assert!(factory.health_checks() >= 1);
    pool.close().await;
}

#[tokio::test]
async fn test_successful_call_clears_bad_mark() {
    let factory = RecordingFactory::new();
    let pool = pool(&factory, fixed(&["a", "b"]), 1);
    let script = Script::default();
    script.fail("a", Outcome::Transient);

    let _ = pool
        .execute_on_end_point(&end_point("a"), script.operation())
        .await;
    assert_eq!(pool.num_bad_end_points(), 1);

    script.heal("a");
    let result = pool
        .execute_on_end_point(&end_point("a"), script.operation())
        .await
        .unwrap();
    assert_eq!(result, "a");
    assert_eq!(pool.num_bad_end_points(), 0);
}

#[tokio::test]
async fn test_health_summary() {
    let factory = RecordingFactory::new();
    let empty = pool(&factory, fixed(&[]), 1);
    let health = empty.health();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!(health.message, "No end points.");

    let pool = pool(&factory, fixed(&["a", "b"]), 1);
    let script = Script::default();
    script.fail("a", Outcome::Transient).fail("b", Outcome::Transient);
    let _ = pool
        .execute_on_end_point(&end_point("a"), script.operation())
        .await;
    let health = pool.health();
    assert!(health.is_healthy());
    assert_eq!(health.message, "1 healthy instances; 1 unhealthy instances");

    let _ = pool
        .execute_on_end_point(&end_point("b"), script.operation())
        .await;
    let health = pool.health();
    assert_eq!(health.status, HealthStatus::Unhealthy);
    assert_eq!((health.valid, health.bad), (0, 2));
}

#[tokio::test]
async fn test_removed_end_point_is_evicted_and_forgotten() {
    init_tracing();
    let registry = Arc::new(InMemoryRegistry::new());
    registry.register(&end_point("a")).await.unwrap();
    registry.register(&end_point("b")).await.unwrap();
    let discovery = RegistryHostDiscovery::start(
        registry.clone(),
        &DiscoveryConfig::new(SERVICE),
    )
    .await;

    let factory = RecordingFactory::new();
    let pool = pool(&factory, Arc::new(discovery), 1);
    let script = Script::default();
    script.fail("a", Outcome::Transient);
    let _ = pool
        .execute_on_end_point(&end_point("a"), script.operation())
        .await;
    assert_eq!(pool.num_bad_end_points(), 1);
    assert_eq!(pool.cache().num_idle_instances(&end_point("a")), 1);

    registry.unregister(&end_point("a")).await.unwrap();
    assert!(wait_until(WAIT, || pool.num_bad_end_points() == 0).await);
    assert!(wait_until(WAIT, || factory.destroyed() == 1).await);
    assert_eq!(factory.destroyed_end_points(), vec![end_point("a")]);
    assert_eq!(ids(pool.hosts()), set(&["b"]));

    pool.close().await;
    pool.host_discovery().close().await;
}

#[tokio::test]
async fn test_pool_metrics() {
    let factory = RecordingFactory::new();
    let metrics = InMemoryMetrics::new();
    let mut opts = options(&factory, fixed(&["a", "b"]), 1);
    opts.metrics = Arc::new(metrics.clone());
    let pool = ServicePool::new(opts).unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.gauge("calculator.num-valid-end-points"), Some(2.0));
    assert_eq!(snapshot.gauge("calculator.num-bad-end-points"), Some(0.0));

    let script = Script::default();
    script.fail("a", Outcome::Transient);
    let _ = pool
        .execute_on_end_point(&end_point("a"), script.operation())
        .await;
    pool.execute_on_end_point(&end_point("b"), script.operation())
        .await
        .unwrap();

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.meter("calculator.successes"), 1);
    assert_eq!(snapshot.meter("calculator.failures"), 1);
    assert_eq!(snapshot.timer("calculator.call").map(|t| t.count), Some(2));
    assert_eq!(snapshot.gauge("calculator.num-valid-end-points"), Some(1.0));
    assert_eq!(snapshot.gauge("calculator.num-bad-end-points"), Some(1.0));
    assert_eq!(snapshot.meter("calculator.cache.creations"), 2);
}

#[tokio::test]
async fn test_close_rejects_calls_and_closes_owned_cache() {
    let factory = RecordingFactory::new();
    let pool = pool(&factory, fixed(&["a"]), 1);
    pool.execute(&PartitionContext::empty(), Script::default().operation())
        .await
        .unwrap();

    let clone = pool.clone();
    pool.close().await;
    pool.close().await;
    assert!(clone.is_closed());
    assert!(pool.cache().is_closed());
    assert_eq!(factory.destroyed(), 1);

    let err = clone
        .execute(&PartitionContext::empty(), Script::default().operation())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Closed);
}

#[tokio::test]
async fn test_shared_cache_survives_pool_close() {
    let factory = RecordingFactory::new();
    let cache = flare_service_pool::ServiceCacheBuilder::new(as_factory(&factory))
        .build()
        .unwrap();
    let mut opts = options(&factory, fixed(&["a"]), 1);
    opts.cache = Some(cache.clone());
    let pool = ServicePool::new(opts).unwrap();

    pool.execute(&PartitionContext::empty(), Script::default().operation())
        .await
        .unwrap();
    pool.close().await;
    assert!(!cache.is_closed());
    assert_eq!(cache.num_idle_instances(&end_point("a")), 1);
}

#[tokio::test(start_paused = true)]
async fn test_async_execute() {
    let factory = RecordingFactory::new();
    let pool = AsyncServicePool::new(pool(&factory, fixed(&["a"]), 1), 4).unwrap();

    let handle = pool.execute(PartitionContext::empty(), slow_call);
    assert_eq!(handle.await.unwrap(), "a");
    assert_eq!(pool.available_workers(), 4);

    let script = Script::default();
    script.fail("a", Outcome::Fatal);
    let err = pool
        .execute_on_end_point(end_point("a"), script.operation())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ServiceCallFailure);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_before_start_never_runs() {
    let factory = RecordingFactory::new();
    let pool = AsyncServicePool::new(pool(&factory, fixed(&["a"]), 1), 1).unwrap();

    let running = pool.execute(PartitionContext::empty(), slow_call);
    assert!(wait_until(Duration::from_secs(1), || running.is_started()).await);

    let script = Script::default();
    let queued = pool.execute(PartitionContext::empty(), script.operation());
    tokio::task::yield_now().await;
    assert!(!queued.is_started());
    assert!(queued.cancel());
    assert!(queued.is_cancelled());
    assert!(matches!(queued.await, Err(PoolError::Cancelled)));

    assert_eq!(running.await.unwrap(), "a");
    assert!(script.calls().is_empty());
    assert_eq!(factory.created(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_after_start_returns_instance() {
    let factory = RecordingFactory::new();
    let pool = AsyncServicePool::new(pool(&factory, fixed(&["a"]), 1), 2).unwrap();

    let handle = pool.execute(PartitionContext::empty(), slow_call);
    assert!(wait_until(Duration::from_secs(1), || handle.is_started()).await);
    assert!(!handle.cancel());

    let result = handle.await;
    assert!(matches!(result, Err(PoolError::Cancelled)));
    assert_eq!(pool.pool().cache().num_active_instances(&end_point("a")), 0);
    assert_eq!(pool.pool().cache().num_idle_instances(&end_point("a")), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_successful_cancel_always_prevents_the_call() {
    let factory = RecordingFactory::new();
    let pool = AsyncServicePool::new(pool(&factory, fixed(&["a"]), 1), 2).unwrap();
    let runs = Arc::new(AtomicUsize::new(0));

    let mut prevented = 0;
    let mut handles = Vec::new();
    for i in 0..200 {
        let counter = runs.clone();
        let handle = pool.execute(PartitionContext::empty(), move |_calc| {
            counter.fetch_add(1, Ordering::SeqCst);
            ready(Ok::<_, anyhow::Error>(()))
        });
        if i % 3 != 0 {
            tokio::task::yield_now().await;
        }
        if handle.cancel() {
            prevented += 1;
            assert!(!handle.is_started());
        }
        handles.push(handle);
    }

    // 开始前取消与开始后取消都返回 Cancelled
    for handle in handles {
        assert!(matches!(handle.await, Err(PoolError::Cancelled)));
    }
    assert_eq!(runs.load(Ordering::SeqCst), 200 - prevented);
    assert_eq!(pool.available_workers(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_concurrency_limit() {
    let factory = RecordingFactory::new();
    let pool = AsyncServicePool::new(pool(&factory, fixed(&["a"]), 1), 2).unwrap();

    let handles: Vec<_> = (0..5)
        .map(|_| pool.execute(PartitionContext::empty(), slow_call))
        .collect();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(handles.iter().filter(|h| h.is_started()).count(), 2);
    assert_eq!(pool.available_workers(), 0);
    assert_eq!(pool.num_pending_calls(), 5);

    for handle in handles {
        assert_eq!(handle.await.unwrap(), "a");
    }
    assert!(factory.created() <= 2);
}

#[tokio::test]
async fn test_execute_on_all_valid_end_points() {
    let factory = RecordingFactory::new();
    let inner = pool(&factory, fixed(&["a", "b", "c"]), 1);
    let script = Script::default();
    script.fail("c", Outcome::Transient);
    let _ = inner
        .execute_on_end_point(&end_point("c"), script.operation())
        .await;

    let pool = AsyncServicePool::new(inner, 4).unwrap();
    let handles = pool.execute_on_all(script.operation());
    assert_eq!(handles.len(), 2);

    let mut results = HashSet::new();
    for (end_point, handle) in handles {
        let id = handle.await.unwrap();
        assert_eq!(id, end_point.id());
        results.insert(id);
    }
    assert_eq!(results, set(&["a", "b"]));
}

#[tokio::test(start_paused = true)]
async fn test_async_close_drains_pending_calls() {
    let factory = RecordingFactory::new();
    let pool = AsyncServicePool::new(pool(&factory, fixed(&["a"]), 1), 1).unwrap();

    let first = pool.execute(PartitionContext::empty(), slow_call);
    let second = pool.execute(PartitionContext::empty(), slow_call);
    pool.close().await;
    assert!(pool.is_closed());
    assert!(pool.pool().is_closed());
    assert_eq!(first.await.unwrap(), "a");
    assert_eq!(second.await.unwrap(), "a");

    let rejected = pool.execute(PartitionContext::empty(), slow_call);
    assert!(rejected.is_finished());
    assert_eq!(rejected.await.unwrap_err().code(), ErrorCode::Closed);
}

#[tokio::test]
async fn test_async_pool_requires_workers() {
    let factory = RecordingFactory::new();
    let result = AsyncServicePool::new(pool(&factory, fixed(&["a"]), 1), 0);
    assert!(matches!(result, Err(PoolError::Config(_))));
}

fn sharded_hosts() -> Arc<dyn HostDiscovery> {
    Arc::new(FixedHostDiscovery::new(vec![
        end_point_with_payload("a", r#"{"shard": "1"}"#),
        end_point_with_payload("b", r#"{"shard": "2"}"#),
    ]))
}

#[tokio::test]
async fn test_proxy_uses_bound_context() {
    let factory = RecordingFactory::new();
    let proxy = ServicePoolBuilder::new()
        .with_shared_service_factory(as_factory(&factory))
        .with_host_discovery(sharded_hosts())
        .with_partition_filter(Arc::new(PayloadPartitionFilter))
        .with_health_check_interval(None)
        .build_proxy(PartitionContext::of("shard", "2"))
        .await
        .unwrap();

    let script = Script::default();
    for _ in 0..5 {
        assert_eq!(proxy.call(script.operation()).await.unwrap(), "b");
    }
    assert_eq!(proxy.context().get("shard"), Some("2"));

    let other = proxy.with_context(PartitionContext::of("shard", "1"));
    assert_eq!(other.call(script.operation()).await.unwrap(), "a");
    assert_eq!(
        other
            .call_with(&RetryNTimes::immediate(1), script.operation())
            .await
            .unwrap(),
        "a"
    );
    assert_eq!(proxy.pool().service_name(), SERVICE);
}

/// 通过 `configure` 自带分区过滤器的服务工厂
struct ShardedFactory {
    inner: Arc<RecordingFactory>,
}

#[async_trait]
impl ServiceFactory for ShardedFactory {
    type Service = Calculator;

    fn service_name(&self) -> &str {
        self.inner.service_name()
    }

    async fn create(&self, end_point: &ServiceEndPoint) -> anyhow::Result<Calculator> {
        self.inner.create(end_point).await
    }

    fn is_retriable_exception(&self, error: &anyhow::Error) -> bool {
        self.inner.is_retriable_exception(error)
    }

    fn configure(&self, builder: ServicePoolBuilder<Calculator>) -> ServicePoolBuilder<Calculator> {
        builder
            .with_partition_filter(Arc::new(PayloadPartitionFilter))
            .with_load_balance_algorithm(Arc::new(RoundRobinAlgorithm::new()))
    }
}

#[tokio::test]
async fn test_builder_applies_factory_configuration() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry
        .register(&end_point_with_payload("a", r#"{"shard": "1"}"#))
        .await
        .unwrap();
    registry
        .register(&end_point_with_payload("b", r#"{"shard": "2"}"#))
        .await
        .unwrap();

    let factory = RecordingFactory::new();
    let pool = ServicePoolBuilder::new()
        .with_service_factory(ShardedFactory {
            inner: factory.clone(),
        })
        .with_registry(registry.clone())
        .with_health_check_interval(None)
        .build()
        .await
        .unwrap();

    assert_eq!(ids(pool.hosts()), set(&["a", "b"]));
    let script = Script::default();
    let result = pool
        .execute(&PartitionContext::of("shard", "1"), script.operation())
        .await
        .unwrap();
    assert_eq!(result, "a");

    // 服务池拥有基于注册中心创建的主机发现
    pool.close().await;
    assert_eq!(registry.watcher_count(), 0);
}

#[tokio::test]
async fn test_builder_from_config() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.register(&end_point_in("prod", "a")).await.unwrap();
    registry.register(&end_point("b")).await.unwrap();

    let config = PoolConfig::from_toml_str(
        r#"
        service_name = "calculator"
        health_check_interval_secs = 0
        load_balance = "round_robin"

        [caching]
        exhaustion_action = "fail"
        max_instances_per_end_point = 1

        [retry]
        max_attempts = 2

        [discovery]
        ensemble = "prod"
        "#,
    )
    .unwrap();

    let factory = RecordingFactory::new();
    let pool = ServicePoolBuilder::new()
        .with_shared_service_factory(as_factory(&factory))
        .with_registry(registry.clone())
        .with_config(&config)
        .unwrap()
        .build()
        .await
        .unwrap();
    assert_eq!(pool.hosts(), vec![end_point_in("prod", "a")]);

    let held = pool
        .cache()
        .check_out(&end_point_in("prod", "a"))
        .await
        .unwrap();
    let err = pool
        .execute(&PartitionContext::empty(), Script::default().operation())
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoCachedInstancesAvailable);
    pool.cache().check_in(held).unwrap();
    pool.close().await;
}

#[tokio::test]
async fn test_builder_requires_factory_and_discovery() {
    let result = ServicePoolBuilder::<Calculator>::new()
        .with_host_discovery(fixed(&["a"]))
        .build()
        .await;
    assert!(matches!(result, Err(PoolError::Config(_))));

    let factory = RecordingFactory::new();
    let result = ServicePoolBuilder::new()
        .with_shared_service_factory(as_factory(&factory))
        .build()
        .await;
    assert!(matches!(result, Err(PoolError::Config(_))));

    let result = ServicePoolBuilder::new()
        .with_shared_service_factory(as_factory(&factory))
        .with_host_discovery(fixed(&["a"]))
        .build_async(0)
        .await;
    assert!(matches!(result, Err(PoolError::Config(_))));
}

fn search_end_point(id: &str) -> ServiceEndPoint {
    ServiceEndPoint::builder()
        .service_type("search")
        .id(id)
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_host_discovery_sources_are_tried_in_order() {
    let registry = Arc::new(InMemoryRegistry::new());
    registry.register(&end_point("from-registry")).await.unwrap();
    let registry_source: Arc<dyn HostDiscoverySource> = Arc::new(RegistryDiscoverySource::new(
        registry.clone(),
        DiscoveryConfig::new(SERVICE),
    ));

    // 静态列表只认识 search 服务，回落到注册中心
    let static_hosts: Arc<dyn HostDiscoverySource> = Arc::new(FixedHostDiscovery::new(vec![
        search_end_point("s1"),
        end_point_in("prod", "static-prod"),
    ]));
    let factory = RecordingFactory::new();
    let pool = ServicePoolBuilder::new()
        .with_shared_service_factory(as_factory(&factory))
        .with_host_discovery_source(static_hosts.clone())
        .with_host_discovery_source(registry_source.clone())
        .with_health_check_interval(None)
        .build()
        .await
        .unwrap();
    assert_eq!(ids(pool.hosts()), set(&["from-registry"]));
    assert_eq!(registry.watcher_count(), 1);
    pool.close().await;
    assert_eq!(registry.watcher_count(), 0);

    // 静态列表认识 prod 服务组，注册中心不再被询问
    let pool = ServicePoolBuilder::new()
        .with_shared_service_factory(as_factory(&factory))
        .with_host_discovery_source(static_hosts.clone())
        .with_host_discovery_source(registry_source)
        .with_ensemble("prod")
        .with_health_check_interval(None)
        .build()
        .await
        .unwrap();
    assert_eq!(ids(pool.hosts()), set(&["static-prod"]));
    assert_eq!(registry.watcher_count(), 0);
    let result = pool
        .execute(&PartitionContext::empty(), Script::default().operation())
        .await
        .unwrap();
    assert_eq!(result, "static-prod");
    pool.close().await;
}

#[tokio::test]
async fn test_no_host_discovery_source_knows_the_service() {
    let static_hosts: Arc<dyn HostDiscoverySource> =
        Arc::new(FixedHostDiscovery::new(vec![search_end_point("s1")]));
    let factory = RecordingFactory::new();
    let result = ServicePoolBuilder::new()
        .with_shared_service_factory(as_factory(&factory))
        .with_host_discovery_source(static_hosts)
        .build()
        .await;
    assert!(matches!(result, Err(PoolError::Config(_))));

    let source = FixedHostDiscovery::new(vec![search_end_point("s1"), end_point("a")]);
    let found = source.for_service(None, "search").await.unwrap().unwrap();
    assert_eq!(ids(found.hosts()), set(&["s1"]));
    assert!(source.for_service(Some("prod"), "search").await.unwrap().is_none());
}

#[tokio::test]
async fn test_registry_backend_is_shared_across_pools() {
    let registry: Arc<dyn RegistryBackend> = Arc::new(InMemoryRegistry::new());
    registry.register(&end_point("a")).await.unwrap();
    let factory = RecordingFactory::new();

    let first = ServicePoolBuilder::new()
        .with_shared_service_factory(as_factory(&factory))
        .with_registry(registry.clone())
        .build()
        .await
        .unwrap();
    let second = ServicePoolBuilder::new()
        .with_shared_service_factory(as_factory(&factory))
        .with_registry(registry.clone())
        .build()
        .await
        .unwrap();

    registry.register(&end_point("b")).await.unwrap();
    assert!(wait_until(WAIT, || first.hosts().len() == 2 && second.hosts().len() == 2).await);

    first.close().await;
    second.close().await;
}
