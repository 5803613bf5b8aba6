//! 非线程安全客户端的实例缓存
//!
//! 每个端点一个槽位，槽位内的状态由各自的互斥锁保护，锁不会跨越 `.await`。
//! 空闲实例按后进先出复用，使较旧的实例更容易因空闲超时被回收。

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::scheduler::IdleSweep;
use super::{
    destroy_instance, next_cache_id, protocol_error, EvictionScheduler, ExhaustionAction, Lease,
    ServiceCache, ServiceCachingPolicy, ServiceHandle,
};
use crate::client::ServiceFactory;
use crate::discovery::{EndPointKey, ServiceEndPoint};
use crate::error::{PoolError, Result};
use crate::metrics::{InstanceGauge, MetricsSink, ScopedMetrics};
use crate::utils::{lock, read, write};

struct IdleInstance<S> {
    id: u64,
    end_point: ServiceEndPoint,
    service: Arc<S>,
    since: Instant,
}

struct SlotState<S> {
    idle: VecDeque<IdleInstance<S>>,
    in_use: HashSet<u64>,
    /// 空闲 + 使用中 + 正在创建
    total: usize,
    evicted: bool,
}

/// 单个端点的实例槽位
pub(crate) struct Slot<S> {
    state: Mutex<SlotState<S>>,
    available: Notify,
}

impl<S> Slot<S> {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                idle: VecDeque::new(),
                in_use: HashSet::new(),
                total: 0,
                evicted: false,
            }),
            available: Notify::new(),
        }
    }
}

/// 创建实例期间占用的容量，创建失败或签出被取消时归还
struct Reservation<'a, S> {
    slot: &'a Slot<S>,
    armed: bool,
}

impl<S> Reservation<'_, S> {
    fn commit(mut self, id: u64) {
        lock(&self.slot.state).in_use.insert(id);
        self.armed = false;
    }
}

impl<S> Drop for Reservation<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            lock(&self.slot.state).total -= 1;
            self.slot.available.notify_waiters();
        }
    }
}

enum Decision<S> {
    Reuse(IdleInstance<S>),
    Create,
    Wait,
    Exhausted,
    Retry,
}

/// 非线程安全客户端的实例缓存
pub struct SingleThreadedServiceCache<S> {
    id: u64,
    factory: Arc<dyn ServiceFactory<Service = S>>,
    policy: ServiceCachingPolicy,
    slots: RwLock<HashMap<EndPointKey, Arc<Slot<S>>>>,
    closed: AtomicBool,
    next_instance_id: AtomicU64,
    metrics: ScopedMetrics,
    instances: InstanceGauge,
    scheduler: EvictionScheduler,
    registration: Mutex<Option<u64>>,
}

impl<S> SingleThreadedServiceCache<S>
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
            slots: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
            next_instance_id: AtomicU64::new(1),
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

    pub fn policy(&self) -> &ServiceCachingPolicy {
        &self.policy
    }

    fn slot_for(&self, key: &EndPointKey) -> Arc<Slot<S>> {
        if let Some(slot) = read(&self.slots).get(key) {
            return slot.clone();
        }
        write(&self.slots)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    fn existing_slot(&self, end_point: &ServiceEndPoint) -> Option<Arc<Slot<S>>> {
        read(&self.slots).get(&end_point.key()).cloned()
    }

    fn destroy(&self, end_point: &ServiceEndPoint, service: Arc<S>) {
        destroy_instance(self.factory.as_ref(), &self.metrics, end_point, service);
        self.instances.release();
    }

    fn decide(&self, slot: &Slot<S>) -> Decision<S> {
        let mut state = lock(&slot.state);
        if state.evicted {
            return Decision::Retry;
        }
        if let Some(idle) = state.idle.pop_back() {
            state.in_use.insert(idle.id);
            return Decision::Reuse(idle);
        }
        if state.total < self.policy.max_instances_per_end_point {
            state.total += 1;
            return Decision::Create;
        }
        match self.policy.exhaustion_action {
            ExhaustionAction::Grow => {
                state.total += 1;
                Decision::Create
            }
            ExhaustionAction::Block => Decision::Wait,
            ExhaustionAction::Fail => Decision::Exhausted,
        }
    }

    async fn create(
        &self,
        end_point: &ServiceEndPoint,
        slot: &Arc<Slot<S>>,
    ) -> Result<ServiceHandle<S>> {
        let reservation = Reservation {
            slot: slot.as_ref(),
            armed: true,
        };
        let service = match self.factory.create(end_point).await {
            Ok(service) => Arc::new(service),
            Err(error) => {
                return Err(PoolError::ServiceCreation {
                    end_point: end_point.clone(),
                    error,
                });
            }
        };

        let id = self.next_instance_id.fetch_add(1, Ordering::Relaxed);
        reservation.commit(id);
        self.instances.acquire();
        self.metrics.mark_meter("creations", 1);
        debug!(end_point = %end_point, instance = id, "Service instance created");

        let handle = ServiceHandle::new(
            end_point.clone(),
            service,
            id,
            self.id,
            Lease::Exclusive(slot.clone()),
        );
        if self.is_closed() {
            // 关闭期间创建的实例直接销毁
            if let Err(e) = self.discard(handle) {
                warn!(end_point = %end_point, error = %e, "Failed to discard instance created during close");
            }
            return Err(PoolError::closed("service cache"));
        }
        Ok(handle)
    }

    /// 把句柄从槽位中移除，返回是否需要销毁实例
    fn release(&self, handle: &ServiceHandle<S>, slot: &Slot<S>, destroy: bool) -> Result<bool> {
        let mut state = lock(&slot.state);
        if !state.in_use.remove(&handle.id()) {
            return Err(protocol_error(handle, "unknown or already checked-in handle"));
        }
        let surplus = state.total > self.policy.max_instances_per_end_point;
        if destroy || surplus || state.evicted || self.is_closed() {
            state.total -= 1;
            return Ok(true);
        }
        state.idle.push_back(IdleInstance {
            id: handle.id(),
            end_point: handle.end_point().clone(),
            service: handle.service().clone(),
            since: Instant::now(),
        });
        Ok(false)
    }

    fn return_handle(&self, handle: ServiceHandle<S>, destroy: bool) -> Result<()> {
        if handle.cache_id() != self.id {
            return Err(protocol_error(&handle, "handle belongs to another cache"));
        }
        let Lease::Exclusive(slot) = handle.lease() else {
            return Err(protocol_error(&handle, "handle was not issued by this cache"));
        };
        let slot = slot.clone();

        let destroyed = self.release(&handle, &slot, destroy)?;
        if destroyed {
            let end_point = handle.end_point().clone();
            self.destroy(&end_point, handle.into_instance());
        }
        slot.available.notify_waiters();
        Ok(())
    }
}

#[async_trait]
impl<S> ServiceCache<S> for SingleThreadedServiceCache<S>
where
    S: Send + Sync + 'static,
{
    async fn check_out(&self, end_point: &ServiceEndPoint) -> Result<ServiceHandle<S>> {
        let key = end_point.key();
        let deadline = self.policy.block_timeout().map(|timeout| Instant::now() + timeout);

        loop {
            if self.is_closed() {
                return Err(PoolError::closed("service cache"));
            }
            let slot = self.slot_for(&key);

            // 先登记等待，再检查状态，避免错过两者之间的归还通知
            let notified = slot.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.decide(&slot) {
                Decision::Retry => continue,
                Decision::Reuse(idle) => {
                    self.metrics.mark_meter("check-out-hits", 1);
                    return Ok(ServiceHandle::new(
                        end_point.clone(),
                        idle.service,
                        idle.id,
                        self.id,
                        Lease::Exclusive(slot.clone()),
                    ));
                }
                Decision::Create => {
                    self.metrics.mark_meter("check-out-misses", 1);
                    return self.create(end_point, &slot).await;
                }
                Decision::Exhausted => {
                    self.metrics.mark_meter("exhausted", 1);
                    return Err(PoolError::NoCachedInstancesAvailable {
                        end_point: end_point.clone(),
                    });
                }
                Decision::Wait => match deadline {
                    Some(deadline) => {
                        if tokio::time::timeout_at(deadline, notified).await.is_err() {
                            self.metrics.mark_meter("exhausted", 1);
                            return Err(PoolError::NoCachedInstancesAvailable {
                                end_point: end_point.clone(),
                            });
                        }
                    }
                    None => notified.await,
                },
            }
        }
    }

    fn check_in(&self, handle: ServiceHandle<S>) -> Result<()> {
        self.return_handle(handle, false)
    }

    fn discard(&self, handle: ServiceHandle<S>) -> Result<()> {
        self.return_handle(handle, true)
    }

    fn evict(&self, end_point: &ServiceEndPoint) {
        let Some(slot) = write(&self.slots).remove(&end_point.key()) else {
            return;
        };
        let idle: Vec<IdleInstance<S>> = {
            let mut state = lock(&slot.state);
            state.evicted = true;
            let idle = state.idle.len();
            state.total -= idle;
            state.idle.drain(..).collect()
        };
        for instance in idle {
            self.destroy(&instance.end_point, instance.service);
        }
        slot.available.notify_waiters();
        debug!(end_point = %end_point, "End point evicted from cache");
    }

    fn evict_idle(&self) -> usize {
        let Some(max_idle) = self.policy.max_idle_time() else {
            return 0;
        };
        let slots: Vec<(EndPointKey, Arc<Slot<S>>)> = read(&self.slots)
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        let now = Instant::now();
        let mut evicted = 0;
        let mut empty = Vec::new();

        for (key, slot) in slots {
            let expired: Vec<IdleInstance<S>> = {
                let mut state = lock(&slot.state);
                let (expired, kept): (VecDeque<_>, VecDeque<_>) = state
                    .idle
                    .drain(..)
                    .partition(|idle| now.duration_since(idle.since) >= max_idle);
                state.idle = kept;
                state.total -= expired.len();
                if state.total == 0 {
                    empty.push((key, slot.clone()));
                }
                expired.into_iter().collect()
            };
            evicted += expired.len();
            for instance in expired {
                self.destroy(&instance.end_point, instance.service);
            }
        }

        // 回收完全空闲的槽位，槽位可能在此期间又被使用，需要再次确认
        if !empty.is_empty() {
            let mut slots = write(&self.slots);
            for (key, slot) in empty {
                let still_current = slots.get(&key).is_some_and(|s| Arc::ptr_eq(s, &slot));
                if !still_current {
                    continue;
                }
                let mut state = lock(&slot.state);
                if state.total == 0 {
                    state.evicted = true;
                    drop(state);
                    slots.remove(&key);
                    slot.available.notify_waiters();
                }
            }
        }

        if evicted > 0 {
            self.metrics.mark_meter("idle-evictions", evicted as u64);
        }
        evicted
    }

    fn num_idle_instances(&self, end_point: &ServiceEndPoint) -> usize {
        self.existing_slot(end_point)
            .map(|slot| lock(&slot.state).idle.len())
            .unwrap_or(0)
    }

    fn num_active_instances(&self, end_point: &ServiceEndPoint) -> usize {
        self.existing_slot(end_point)
            .map(|slot| lock(&slot.state).in_use.len())
            .unwrap_or(0)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = lock(&self.registration).take() {
            self.scheduler.unregister(id);
        }
        let slots: Vec<Arc<Slot<S>>> = write(&self.slots).drain().map(|(_, slot)| slot).collect();
        for slot in slots {
            let idle: Vec<IdleInstance<S>> = {
                let mut state = lock(&slot.state);
                state.evicted = true;
                let idle = state.idle.len();
                state.total -= idle;
                state.idle.drain(..).collect()
            };
            for instance in idle {
                self.destroy(&instance.end_point, instance.service);
            }
            slot.available.notify_waiters();
        }
        info!(service = %self.factory.service_name(), "Service cache closed");
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl<S> IdleSweep for SingleThreadedServiceCache<S>
where
    S: Send + Sync + 'static,
{
    fn sweep_idle(&self) -> usize {
        self.evict_idle()
    }
}

impl<S> Drop for SingleThreadedServiceCache<S> {
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
