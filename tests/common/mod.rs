//! 测试公共工具：记录型服务工厂、端点构造和轮询等待

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use flare_service_pool::{ServiceEndPoint, ServiceFactory};
use thiserror::Error;

pub const SERVICE: &str = "calculator";

static TRACING: Once = Once::new();

/// 安装测试日志（RUST_LOG 控制级别）
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn end_point(id: &str) -> ServiceEndPoint {
    ServiceEndPoint::builder()
        .service_type(SERVICE)
        .id(id)
        .build()
        .unwrap()
}

pub fn end_point_in(ensemble: &str, id: &str) -> ServiceEndPoint {
    ServiceEndPoint::builder()
        .ensemble_name(ensemble)
        .service_type(SERVICE)
        .id(id)
        .build()
        .unwrap()
}

pub fn end_point_with_payload(id: &str, payload: &str) -> ServiceEndPoint {
    ServiceEndPoint::builder()
        .service_type(SERVICE)
        .id(id)
        .payload(payload)
        .build()
        .unwrap()
}

/// 值得换端点重试的错误
#[derive(Debug, Error)]
#[error("transient: {0}")]
pub struct Transient(pub String);

/// 不应重试的错误
#[derive(Debug, Error)]
#[error("fatal: {0}")]
pub struct Fatal(pub String);

/// 实例已损坏，必须销毁
#[derive(Debug, Error)]
#[error("broken: {0}")]
pub struct Broken(pub String);

/// 测试用客户端
#[derive(Debug)]
pub struct Calculator {
    pub end_point: ServiceEndPoint,
    pub serial: u64,
}

impl Calculator {
    pub async fn add(&self, a: i64, b: i64) -> anyhow::Result<i64> {
        Ok(a + b)
    }
}

/// 记录创建 / 销毁次数的服务工厂
#[derive(Default)]
pub struct RecordingFactory {
    multi_threaded: bool,
    created: AtomicU64,
    destroyed: Mutex<Vec<(ServiceEndPoint, u64)>>,
    transient_creates: Mutex<HashSet<String>>,
    fatal_creates: Mutex<HashSet<String>>,
    health: Mutex<HashMap<String, bool>>,
    health_checks: AtomicU64,
    create_delay: Mutex<Option<Duration>>,
}

impl RecordingFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn multi_threaded() -> Arc<Self> {
        Arc::new(Self {
            multi_threaded: true,
            ..Self::default()
        })
    }

    pub fn created(&self) -> u64 {
        self.created.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> usize {
        self.destroyed.lock().unwrap().len()
    }

    /// 被销毁实例的序号
    pub fn destroyed_serials(&self) -> Vec<u64> {
        self.destroyed.lock().unwrap().iter().map(|(_, s)| *s).collect()
    }

    pub fn destroyed_end_points(&self) -> Vec<ServiceEndPoint> {
        self.destroyed
            .lock()
            .unwrap()
            .iter()
            .map(|(ep, _)| ep.clone())
            .collect()
    }

    /// 让端点的实例创建失败（可重试）
    pub fn fail_creates_for(&self, id: &str) {
        self.transient_creates.lock().unwrap().insert(id.to_string());
    }

    /// 让端点的实例创建失败（不可重试）
    pub fn reject_creates_for(&self, id: &str) {
        self.fatal_creates.lock().unwrap().insert(id.to_string());
    }

    pub fn allow_creates_for(&self, id: &str) {
        self.transient_creates.lock().unwrap().remove(id);
        self.fatal_creates.lock().unwrap().remove(id);
    }

    pub fn set_healthy(&self, id: &str, healthy: bool) {
        self.health.lock().unwrap().insert(id.to_string(), healthy);
    }

    pub fn health_checks(&self) -> u64 {
        self.health_checks.load(Ordering::SeqCst)
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl ServiceFactory for RecordingFactory {
    type Service = Calculator;

    fn service_name(&self) -> &str {
        SERVICE
    }

    async fn create(&self, end_point: &ServiceEndPoint) -> anyhow::Result<Calculator> {
        let delay = *self.create_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.transient_creates.lock().unwrap().contains(end_point.id()) {
            return Err(Transient(format!("cannot connect to {}", end_point.id())).into());
        }
        if self.fatal_creates.lock().unwrap().contains(end_point.id()) {
            return Err(Fatal(format!("bad credentials for {}", end_point.id())).into());
        }
        let serial = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Calculator {
            end_point: end_point.clone(),
            serial,
        })
    }

    fn destroy(&self, end_point: &ServiceEndPoint, service: Arc<Calculator>) {
        self.destroyed
            .lock()
            .unwrap()
            .push((end_point.clone(), service.serial));
    }

    async fn is_healthy(&self, end_point: &ServiceEndPoint) -> bool {
        self.health_checks.fetch_add(1, Ordering::SeqCst);
        self.health
            .lock()
            .unwrap()
            .get(end_point.id())
            .copied()
            .unwrap_or(true)
    }

    fn is_retriable_exception(&self, error: &anyhow::Error) -> bool {
        error.downcast_ref::<Transient>().is_some() || error.downcast_ref::<Broken>().is_some()
    }

    fn invalidates_instance(&self, error: &anyhow::Error) -> bool {
        error.downcast_ref::<Broken>().is_some()
    }

    fn is_multi_threaded(&self) -> bool {
        self.multi_threaded
    }
}

/// 转换为服务池使用的工厂对象
pub fn as_factory(factory: &Arc<RecordingFactory>) -> Arc<dyn ServiceFactory<Service = Calculator>> {
    factory.clone()
}

/// 轮询直到条件成立或超时
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// 轮询异步条件
pub async fn wait_until_async<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
