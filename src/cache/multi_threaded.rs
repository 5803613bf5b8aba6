//! 线程安全客户端的实例缓存
//!
//! 每个端点只创建一个实例，所有签出共享它。实例在引用计数归零
//! 且端点已被驱逐（或空闲超时）后才销毁。

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::OnceCell;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::scheduler::IdleSweep;
use super::{
    destroy_instance, next_cache_id, protocol_error, EvictionScheduler, Lease, ServiceCache,
    ServiceCachingPolicy, ServiceHandle,
};
use crate::client::ServiceFactory;
use crate::discovery::{EndPointKey, ServiceEndPoint};
use crate::error::{PoolError, Result};
use crate::metrics::{InstanceGauge, MetricsSink, ScopedMetrics};
use crate::utils::{lock, read, write};

struct EntryState {
    handles: HashSet<u64>,
    evicted: bool,
    destroyed: bool,
    last_used: Instant,
}

/// 单个端点的共享实例
pub(crate) struct Entry<S> {
    end_point: ServiceEndPoint,
    instance: OnceCell<Arc<S>>,
    state: Mutex<EntryState>,
}

impl<S> Entry<S> {
    fn new(end_point: ServiceEndPoint) -> Self {
        Self {
            end_point,
            instance: OnceCell::new(),
            state: Mutex::new(EntryState {
                handles: HashSet::new(),
                evicted: false,
                destroyed: false,
                last_used: Instant::now(),
            }),
        }
    }

    /// 标记为已驱逐，没有引用时返回需要销毁的实例
    fn mark_evicted(&self) -> Option<Arc<S>> {
        let mut state = lock(&self.state);
        state.evicted = true;
        self.take_if_unreferenced(&mut state)
    }

    fn take_if_unreferenced(&self, state: &mut EntryState) -> Option<Arc<S>> {
        if state.handles.is_empty() && state.evicted && !state.destroyed {
            let instance = self.instance.get().cloned();
            if instance.is_some() {
                state.destroyed = true;
            }
            return instance;
        }
        None
    }
}

/// 线程安全客户端的实例缓存
pub struct MultiThreadedServiceCache<S> {
    id: u64,
    factory: Arc<dyn ServiceFactory<Service = S>>,
    policy: ServiceCachingPolicy,
    entries: RwLock<HashMap<EndPointKey, Arc<Entry<S>>>>,
    closed: AtomicBool,
    next_handle_id: AtomicU64,
    metrics: ScopedMetrics,
    instances: InstanceGauge,
    scheduler: EvictionScheduler,
    registration: Mutex<Option<u64>>,
}

impl<S> MultiThreadedServiceCache<S>
where
    S: Send + Sync + 'static,
{
    /// 创建缓存并注册到回收调度器
    pub fn new(
        factory: Arc<dyn ServiceFactory<Service = S>>,
        policy: ServiceCachingPolicy,
        metrics: Arc<dyn MetricsSink>,
        scheduler: EvictionScheduler,
    ) -> Result<Arc<Self>> {
        policy.validate()?;
        let metrics = ScopedMetrics::new(format!("{}.cache", factory.service_name()), metrics);
        let instances = InstanceGauge::new("instances", Arc::new(metrics.clone()));
        let cache = Arc::new(Self {
            id: next_cache_id(),
            factory,
            policy,
            entries: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            next_handle_id: AtomicU64::new(1),
            metrics,
            instances,
            scheduler,
            registration: Mutex::new(None),
        });

        if cache.policy.max_idle_time().is_some() {
            let target: Weak<dyn IdleSweep> = Arc::downgrade(&cache) as Weak<dyn IdleSweep>;
            let id = cache
                .scheduler
                .register(target, cache.policy.eviction_interval());
            *lock(&cache.registration) = Some(id);
        }
        Ok(cache)
    }

    /// 端点共享实例上未归还的句柄数
    pub fn num_references(&self, end_point: &ServiceEndPoint) -> usize {
        read(&self.entries)
            .get(&end_point.key())
            .map(|entry| lock(&entry.state).handles.len())
            .unwrap_or(0)
    }

    fn entry_for(&self, end_point: &ServiceEndPoint) -> Arc<Entry<S>> {
        let key = end_point.key();
        if let Some(entry) = read(&self.entries).get(&key) {
            return entry.clone();
        }
        write(&self.entries)
            .entry(key)
            .or_insert_with(|| Arc::new(Entry::new(end_point.clone())))
            .clone()
    }

    /// 从映射中移除（仅当仍是同一个条目）
    fn detach(&self, entry: &Arc<Entry<S>>) {
        let mut entries = write(&self.entries);
        let key = entry.end_point.key();
        if entries.get(&key).is_some_and(|e| Arc::ptr_eq(e, entry)) {
            entries.remove(&key);
        }
    }

    fn destroy(&self, end_point: &ServiceEndPoint, service: Arc<S>) {
        destroy_instance(self.factory.as_ref(), &self.metrics, end_point, service);
        self.instances.release();
    }

    fn release_handle(&self, entry: &Entry<S>, id: u64) -> bool {
        let mut state = lock(&entry.state);
        let removed = state.handles.remove(&id);
        state.last_used = Instant::now();
        removed
    }

    fn return_handle(&self, handle: ServiceHandle<S>, invalidate: bool) -> Result<()> {
        if handle.cache_id() != self.id {
            return Err(protocol_error(&handle, "handle belongs to another cache"));
        }
        let Lease::Shared(entry) = handle.lease() else {
            return Err(protocol_error(&handle, "handle was not issued by this cache"));
        };
        let entry = entry.clone();

        if invalidate {
            // 共享实例不可用时整个端点条目作废，后续签出会创建新实例
            self.detach(&entry);
            lock(&entry.state).evicted = true;
        }

        let to_destroy = {
            let mut state = lock(&entry.state);
            if !state.handles.remove(&handle.id()) {
                return Err(protocol_error(&handle, "unknown or already checked-in handle"));
            }
            state.last_used = Instant::now();
            entry.take_if_unreferenced(&mut state)
        };
        if let Some(instance) = to_destroy {
            self.destroy(&entry.end_point, instance);
        }
        Ok(())
    }
}

#[async_trait]
impl<S> ServiceCache<S> for MultiThreadedServiceCache<S>
where
    S: Send + Sync + 'static,
{
    async fn check_out(&self, end_point: &ServiceEndPoint) -> Result<ServiceHandle<S>> {
        loop {
            if self.is_closed() {
                return Err(PoolError::closed("service cache"));
            }
            let entry = self.entry_for(end_point);
            let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);
            {
                let mut state = lock(&entry.state);
                if state.evicted {
                    continue;
                }
                // 先登记引用，防止创建期间被空闲回收
                state.handles.insert(id);
            }

            let created = AtomicBool::new(false);
            let result = entry
                .instance
                .get_or_try_init(|| async {
                    let service = self.factory.create(end_point).await?;
                    created.store(true, Ordering::Relaxed);
                    Ok::<_, anyhow::Error>(Arc::new(service))
                })
                .await;

            let instance = match result {
                Ok(instance) => instance.clone(),
                Err(error) => {
                    self.release_handle(&entry, id);
                    return Err(PoolError::ServiceCreation {
                        end_point: end_point.clone(),
                        error,
                    });
                }
            };

            if created.load(Ordering::Relaxed) {
                self.instances.acquire();
                self.metrics.mark_meter("creations", 1);
                self.metrics.mark_meter("check-out-misses", 1);
                debug!(end_point = %end_point, "Shared service instance created");
            } else {
                self.metrics.mark_meter("check-out-hits", 1);
            }

            let handle = ServiceHandle::new(
                end_point.clone(),
                instance,
                id,
                self.id,
                Lease::Shared(entry.clone()),
            );
            if self.is_closed() {
                if let Err(e) = self.check_in(handle) {
                    warn!(end_point = %end_point, error = %e, "Failed to release instance created during close");
                }
                return Err(PoolError::closed("service cache"));
            }
            return Ok(handle);
        }
    }

    fn check_in(&self, handle: ServiceHandle<S>) -> Result<()> {
        self.return_handle(handle, false)
    }

    fn discard(&self, handle: ServiceHandle<S>) -> Result<()> {
        self.return_handle(handle, true)
    }

    fn evict(&self, end_point: &ServiceEndPoint) {
        let Some(entry) = write(&self.entries).remove(&end_point.key()) else {
            return;
        };
        if let Some(instance) = entry.mark_evicted() {
            self.destroy(&entry.end_point, instance);
        }
        debug!(end_point = %end_point, "End point evicted from cache");
    }

    fn evict_idle(&self) -> usize {
        let Some(max_idle) = self.policy.max_idle_time() else {
            return 0;
        };
        let entries: Vec<Arc<Entry<S>>> = read(&self.entries).values().cloned().collect();
        let now = Instant::now();
        let mut evicted = 0;

        for entry in entries {
            let expired = {
                let state = lock(&entry.state);
                state.handles.is_empty()
                    && !state.evicted
                    && entry.instance.initialized()
                    && now.duration_since(state.last_used) >= max_idle
            };
            if !expired {
                continue;
            }
            self.detach(&entry);
            if let Some(instance) = entry.mark_evicted() {
                self.destroy(&entry.end_point, instance);
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.metrics.mark_meter("idle-evictions", evicted as u64);
        }
        evicted
    }

    fn num_idle_instances(&self, end_point: &ServiceEndPoint) -> usize {
        read(&self.entries)
            .get(&end_point.key())
            .map(|entry| {
                let state = lock(&entry.state);
                usize::from(state.handles.is_empty() && entry.instance.initialized())
            })
            .unwrap_or(0)
    }

    fn num_active_instances(&self, end_point: &ServiceEndPoint) -> usize {
        read(&self.entries)
            .get(&end_point.key())
            .map(|entry| {
                let state = lock(&entry.state);
                usize::from(!state.handles.is_empty() && entry.instance.initialized())
            })
            .unwrap_or(0)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = lock(&self.registration).take() {
            self.scheduler.unregister(id);
        }
        let entries: Vec<Arc<Entry<S>>> =
            write(&self.entries).drain().map(|(_, entry)| entry).collect();
        for entry in entries {
            if let Some(instance) = entry.mark_evicted() {
                self.destroy(&entry.end_point, instance);
            }
        }
        info!(service = %self.factory.service_name(), "Service cache closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<S> IdleSweep for MultiThreadedServiceCache<S>
where
    S: Send + Sync + 'static,
{
    fn sweep_idle(&self) -> usize {
        self.evict_idle()
    }
}

impl<S> Drop for MultiThreadedServiceCache<S> {
    fn drop(&mut self) {
        let registration = self
            .registration
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(id) = registration {
            self.scheduler.unregister(id);
        }
    }
}
