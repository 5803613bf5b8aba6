//! 服务发现工厂和服务注册器
//!
//! 客户端通过 [`DiscoveryFactory`] 从配置创建主机发现，服务端通过
//! [`ServiceRegistrar`] 注册端点并自动维持心跳

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::memory::InMemoryRegistry;
use super::backend::RegistryBackend;
use super::{BackendType, DiscoveryConfig, RegistryHostDiscovery, ServiceEndPoint};
use crate::error::{PoolError, RegistryError, Result};
use crate::utils::lock;

/// 服务发现工厂
pub struct DiscoveryFactory;

impl DiscoveryFactory {
    /// 从配置创建注册中心后端
    pub async fn create_backend(config: &DiscoveryConfig) -> Result<Arc<dyn RegistryBackend>> {
        config.validate()?;
        match config.backend {
            BackendType::Memory => Ok(Arc::new(InMemoryRegistry::with_namespace(
                config.namespace.clone(),
            ))),
            #[cfg(feature = "etcd")]
            BackendType::Etcd => {
                let backend = super::backend::etcd::EtcdRegistry::connect(config).await?;
                Ok(Arc::new(backend))
            }
            #[cfg(not(feature = "etcd"))]
            BackendType::Etcd => Err(PoolError::config(
                "etcd backend requires the `etcd` feature",
            )),
        }
    }

    /// 从配置创建主机发现（后端由配置决定）
    pub async fn create_host_discovery(config: &DiscoveryConfig) -> Result<RegistryHostDiscovery> {
        let backend = Self::create_backend(config).await?;
        Ok(RegistryHostDiscovery::start(backend, config).await)
    }

    /// 在已有后端上创建主机发现
    pub async fn host_discovery_for(
        backend: Arc<dyn RegistryBackend>,
        config: &DiscoveryConfig,
    ) -> Result<RegistryHostDiscovery> {
        config.validate()?;
        Ok(RegistryHostDiscovery::start(backend, config).await)
    }
}

/// 服务注册器
///
/// 注册的端点在后台按固定间隔发送心跳，心跳失败时尝试重新注册。
/// 应该在服务关闭前显式调用 [`ServiceRegistrar::shutdown`]，而不是依赖 Drop
pub struct ServiceRegistrar {
    backend: Arc<dyn RegistryBackend>,
    end_points: Arc<Mutex<HashSet<ServiceEndPoint>>>,
    shutdown: CancellationToken,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServiceRegistrar {
    /// 创建注册器并启动心跳任务
    pub fn new(backend: Arc<dyn RegistryBackend>, heartbeat_interval: Duration) -> Self {
        let end_points: Arc<Mutex<HashSet<ServiceEndPoint>>> = Arc::default();
        let shutdown = CancellationToken::new();

        let task = {
            let backend = backend.clone();
            let end_points = end_points.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut timer = interval(heartbeat_interval.max(Duration::from_millis(1)));
                timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
                // 第一次 tick 立即返回
                timer.tick().await;
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = timer.tick() => {
                            let registered: Vec<ServiceEndPoint> =
                                lock(&end_points).iter().cloned().collect();
                            for end_point in registered {
                                send_heartbeat(backend.as_ref(), &end_point).await;
                            }
                        }
                    }
                }
                debug!("Heartbeat task stopped");
            })
        };

        Self {
            backend,
            end_points,
            shutdown,
            heartbeat_task: Mutex::new(Some(task)),
        }
    }

    /// 按配置中的心跳间隔创建注册器
    pub fn from_config(backend: Arc<dyn RegistryBackend>, config: &DiscoveryConfig) -> Self {
        Self::new(backend, config.heartbeat_interval())
    }

    /// 注册端点
    pub async fn register(&self, end_point: ServiceEndPoint) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(PoolError::closed("service registrar"));
        }
        self.backend.register(&end_point).await?;
        info!(end_point = %end_point, "✅ Service end point registered");
        lock(&self.end_points).insert(end_point);
        Ok(())
    }

    /// 注销端点
    pub async fn unregister(&self, end_point: &ServiceEndPoint) -> Result<()> {
        lock(&self.end_points).remove(end_point);
        self.backend.unregister(end_point).await?;
        info!(end_point = %end_point, "✅ Service end point unregistered");
        Ok(())
    }

    /// 当前已注册的端点
    pub fn registered(&self) -> Vec<ServiceEndPoint> {
        lock(&self.end_points).iter().cloned().collect()
    }

    /// 优雅关闭：停止心跳并注销全部端点
    ///
    /// 返回第一个注销失败的错误，其余端点仍会继续注销
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();
        let task = lock(&self.heartbeat_task).take();
        if let Some(task) = task {
            let _ = task.await;
        }

        let end_points: Vec<ServiceEndPoint> = lock(&self.end_points).drain().collect();
        let mut first_error: Option<RegistryError> = None;
        for end_point in end_points {
            match self.backend.unregister(&end_point).await {
                Ok(()) => info!(end_point = %end_point, "✅ Service end point unregistered"),
                Err(e) => {
                    warn!(end_point = %end_point, error = %e, "⚠️ Failed to unregister end point");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

async fn send_heartbeat(backend: &dyn RegistryBackend, end_point: &ServiceEndPoint) {
    match backend.heartbeat(end_point).await {
        Ok(()) => debug!(end_point = %end_point, "💓 Heartbeat sent"),
        Err(e) => {
            warn!(end_point = %end_point, error = %e, "⚠️ Heartbeat failed, re-registering");
            if let Err(e) = backend.register(end_point).await {
                warn!(end_point = %end_point, error = %e, "❌ Failed to re-register end point");
            }
        }
    }
}

impl Drop for ServiceRegistrar {
    fn drop(&mut self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let end_points: Vec<ServiceEndPoint> = lock(&self.end_points).drain().collect();
        if end_points.is_empty() {
            return;
        }
        // Drop 是同步的，只能尽力在后台注销
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let backend = self.backend.clone();
                handle.spawn(async move {
                    for end_point in end_points {
                        if let Err(e) = backend.unregister(&end_point).await {
                            warn!(
                                end_point = %end_point,
                                error = %e,
                                "⚠️ Failed to unregister end point (from Drop)"
                            );
                        }
                    }
                });
            }
            Err(_) => warn!(
                count = end_points.len(),
                "Runtime not available, end points left registered until their TTL expires"
            ),
        }
    }
}
