//! 主机发现
//!
//! 维护某个 `(ensemble, service_type)` 的端点快照，并把变化通知给监听器。
//!
//! - 快照采用写时复制，`hosts()` 从不等待网络 I/O
//! - 注册中心连接中断时保留最后一次的快照
//! - 重新连接或 watch 丢失后全量拉取，与快照比较并补发增删事件
//! - 监听器在独立任务中回调，不阻塞 watch 处理

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backend::{RegistryBackend, RegistryEvent};
use super::{DiscoveryConfig, EndPointKey, ServiceEndPoint};
use crate::retry::{ExponentialBackoffRetry, RetryPolicy};
use crate::utils::{lock, read, write};

/// 端点变化监听器
///
/// 回调在发现模块的分发任务中执行，不应长时间阻塞
pub trait HostDiscoveryListener: Send + Sync {
    fn on_end_point_added(&self, end_point: &ServiceEndPoint);

    fn on_end_point_removed(&self, end_point: &ServiceEndPoint);
}

/// 主机发现 trait
#[async_trait]
pub trait HostDiscovery: Send + Sync {
    /// 当前端点快照
    fn hosts(&self) -> Vec<ServiceEndPoint>;

    /// 快照中是否包含该端点（比较全部字段）
    fn contains(&self, end_point: &ServiceEndPoint) -> bool {
        self.hosts().iter().any(|host| host == end_point)
    }

    fn add_listener(&self, listener: Arc<dyn HostDiscoveryListener>);

    /// 按指针移除监听器
    fn remove_listener(&self, listener: &Arc<dyn HostDiscoveryListener>);

    /// 释放注册中心订阅，之后 `hosts()` 返回冻结的快照
    async fn close(&self);
}

type Snapshot = Arc<HashMap<EndPointKey, ServiceEndPoint>>;

enum ListenerEvent {
    Added(ServiceEndPoint),
    Removed(ServiceEndPoint),
}

#[derive(Default)]
struct Listeners {
    inner: RwLock<Vec<Arc<dyn HostDiscoveryListener>>>,
}

impl Listeners {
    fn add(&self, listener: Arc<dyn HostDiscoveryListener>) {
        write(&self.inner).push(listener);
    }

    fn remove(&self, listener: &Arc<dyn HostDiscoveryListener>) {
        write(&self.inner).retain(|l| !Arc::ptr_eq(l, listener));
    }

    fn dispatch(&self, event: &ListenerEvent) {
        let listeners = read(&self.inner).clone();
        for listener in listeners {
            let result = catch_unwind(AssertUnwindSafe(|| match event {
                ListenerEvent::Added(end_point) => listener.on_end_point_added(end_point),
                ListenerEvent::Removed(end_point) => listener.on_end_point_removed(end_point),
            }));
            if result.is_err() {
                warn!("Host discovery listener panicked");
            }
        }
    }
}

/// 快照与事件派发的共享状态
struct DiscoveryState {
    ensemble: Option<String>,
    service_type: String,
    snapshot: RwLock<Snapshot>,
    listeners: Arc<Listeners>,
    events: mpsc::UnboundedSender<ListenerEvent>,
    connected: AtomicBool,
}

impl DiscoveryState {
    fn matches(&self, end_point: &ServiceEndPoint) -> bool {
        end_point.ensemble_name() == self.ensemble.as_deref()
            && end_point.service_type() == self.service_type
    }

    fn snapshot(&self) -> Snapshot {
        read(&self.snapshot).clone()
    }

    fn emit(&self, events: Vec<ListenerEvent>) {
        for event in events {
            // 分发任务退出（已关闭）时丢弃事件
            let _ = self.events.send(event);
        }
    }

    fn apply_put(&self, end_point: ServiceEndPoint) {
        if !self.matches(&end_point) {
            return;
        }
        let key = end_point.key();
        let mut events = Vec::new();
        {
            let mut snapshot = write(&self.snapshot);
            match snapshot.get(&key) {
                Some(existing) if *existing == end_point => return,
                Some(existing) => events.push(ListenerEvent::Removed(existing.clone())),
                None => {}
            }
            let mut next = HashMap::clone(&snapshot);
            next.insert(key, end_point.clone());
            *snapshot = Arc::new(next);
        }
        info!(end_point = %end_point, "End point added");
        events.push(ListenerEvent::Added(end_point));
        self.emit(events);
    }

    fn apply_delete(&self, key: &EndPointKey) {
        let removed = {
            let mut snapshot = write(&self.snapshot);
            if !snapshot.contains_key(key) {
                return;
            }
            let mut next = HashMap::clone(&snapshot);
            let removed = next.remove(key);
            *snapshot = Arc::new(next);
            removed
        };
        if let Some(end_point) = removed {
            info!(end_point = %end_point, "End point removed");
            self.emit(vec![ListenerEvent::Removed(end_point)]);
        }
    }

    /// 用全量数据替换快照，并补发差异事件（先删后增）
    fn reconcile(&self, end_points: Vec<ServiceEndPoint>) {
        let fresh: HashMap<EndPointKey, ServiceEndPoint> = end_points
            .into_iter()
            .filter(|ep| self.matches(ep))
            .map(|ep| (ep.key(), ep))
            .collect();

        let mut removed = Vec::new();
        let mut added = Vec::new();
        {
            let mut snapshot = write(&self.snapshot);
            for (key, old) in snapshot.iter() {
                if fresh.get(key) != Some(old) {
                    removed.push(ListenerEvent::Removed(old.clone()));
                }
            }
            for (key, new) in fresh.iter() {
                if snapshot.get(key) != Some(new) {
                    added.push(ListenerEvent::Added(new.clone()));
                }
            }
            *snapshot = Arc::new(fresh);
        }

        if !removed.is_empty() || !added.is_empty() {
            info!(
                service_type = %self.service_type,
                added = added.len(),
                removed = removed.len(),
                "Host snapshot reconciled"
            );
        }
        removed.extend(added);
        self.emit(removed);
    }
}

/// 基于注册中心的主机发现
pub struct RegistryHostDiscovery {
    state: Arc<DiscoveryState>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl RegistryHostDiscovery {
    /// 建立订阅并拉取初始快照
    ///
    /// 注册中心暂时不可用时不会失败：快照为空，后台任务按退避策略重试
    pub async fn start(backend: Arc<dyn RegistryBackend>, config: &DiscoveryConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<ListenerEvent>();
        let listeners = Arc::new(Listeners::default());
        let state = Arc::new(DiscoveryState {
            ensemble: config.ensemble.clone(),
            service_type: config.service_type.clone(),
            snapshot: RwLock::new(Arc::new(HashMap::new())),
            listeners: listeners.clone(),
            events: tx,
            connected: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();

        let dispatcher = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => match event {
                            Some(event) => listeners.dispatch(&event),
                            None => break,
                        },
                    }
                }
            })
        };

        let initial = match establish(&state, backend.as_ref()).await {
            Ok(rx) => Some(rx),
            Err(e) => {
                warn!(
                    service_type = %config.service_type,
                    error = %e,
                    "Registry unavailable at startup, will keep retrying"
                );
                None
            }
        };

        let watcher = tokio::spawn(watch_loop(
            state.clone(),
            backend,
            initial,
            WatchSettings::from_config(config),
            cancel.clone(),
        ));

        info!(
            service_type = %config.service_type,
            ensemble = ?config.ensemble,
            hosts = state.snapshot().len(),
            "✅ Host discovery started"
        );

        Self {
            state,
            cancel,
            tasks: Mutex::new(vec![dispatcher, watcher]),
            closed: AtomicBool::new(false),
        }
    }

    /// 当前是否与注册中心保持连接
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    pub fn service_type(&self) -> &str {
        &self.state.service_type
    }
}

#[async_trait]
impl HostDiscovery for RegistryHostDiscovery {
    fn hosts(&self) -> Vec<ServiceEndPoint> {
        self.state.snapshot().values().cloned().collect()
    }

    fn contains(&self, end_point: &ServiceEndPoint) -> bool {
        self.state.snapshot().get(&end_point.key()) == Some(end_point)
    }

    fn add_listener(&self, listener: Arc<dyn HostDiscoveryListener>) {
        self.state.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn HostDiscoveryListener>) {
        self.state.listeners.remove(listener);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.state.connected.store(false, Ordering::Release);
        info!(service_type = %self.state.service_type, "Host discovery closed");
    }
}

impl Drop for RegistryHostDiscovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct WatchSettings {
    resync_interval: Option<Duration>,
    backoff: ExponentialBackoffRetry,
}

impl WatchSettings {
    fn from_config(config: &DiscoveryConfig) -> Self {
        Self {
            resync_interval: config.resync_interval(),
            backoff: ExponentialBackoffRetry::new(
                usize::MAX,
                config.reconnect_base_delay(),
                config.reconnect_max_delay(),
            ),
        }
    }
}

/// 先订阅再全量拉取，保证两者之间的变更不会丢失
async fn establish(
    state: &DiscoveryState,
    backend: &dyn RegistryBackend,
) -> Result<mpsc::Receiver<RegistryEvent>, crate::error::RegistryError> {
    let rx = backend
        .watch(state.ensemble.as_deref(), &state.service_type)
        .await?;
    let end_points = backend
        .list(state.ensemble.as_deref(), &state.service_type)
        .await?;
    state.reconcile(end_points);
    state.connected.store(true, Ordering::Release);
    Ok(rx)
}

async fn next_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn watch_loop(
    state: Arc<DiscoveryState>,
    backend: Arc<dyn RegistryBackend>,
    mut receiver: Option<mpsc::Receiver<RegistryEvent>>,
    settings: WatchSettings,
    cancel: CancellationToken,
) {
    let mut resync = settings.resync_interval.map(|period| {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });
    let mut failures = 0usize;

    loop {
        let mut rx = match receiver.take() {
            Some(rx) => rx,
            None => match establish(&state, backend.as_ref()).await {
                Ok(rx) => {
                    if failures > 0 {
                        info!(service_type = %state.service_type, "Registry watch re-established");
                    }
                    failures = 0;
                    rx
                }
                Err(e) => {
                    failures += 1;
                    state.connected.store(false, Ordering::Release);
                    let delay = settings.backoff.backoff_duration(failures);
                    warn!(
                        service_type = %state.service_type,
                        error = %e,
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        "Failed to watch registry, serving last known hosts"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            },
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = next_tick(&mut resync) => {
                    if !state.connected.load(Ordering::Acquire) {
                        continue;
                    }
                    match backend.list(state.ensemble.as_deref(), &state.service_type).await {
                        Ok(end_points) => state.reconcile(end_points),
                        Err(e) => warn!(
                            service_type = %state.service_type,
                            error = %e,
                            "Periodic resync failed"
                        ),
                    }
                }
                event = rx.recv() => match event {
                    Some(RegistryEvent::Put(end_point)) => state.apply_put(end_point),
                    Some(RegistryEvent::Delete(key)) => state.apply_delete(&key),
                    Some(RegistryEvent::Disconnected) => {
                        state.connected.store(false, Ordering::Release);
                        warn!(
                            service_type = %state.service_type,
                            "Registry connection lost, serving last known hosts"
                        );
                    }
                    Some(RegistryEvent::Reconnected) => {
                        match backend.list(state.ensemble.as_deref(), &state.service_type).await {
                            Ok(end_points) => {
                                state.reconcile(end_points);
                                state.connected.store(true, Ordering::Release);
                                info!(service_type = %state.service_type, "Registry reconnected");
                            }
                            Err(e) => {
                                warn!(
                                    service_type = %state.service_type,
                                    error = %e,
                                    "Resync after reconnect failed, re-establishing watch"
                                );
                                break;
                            }
                        }
                    }
                    None => {
                        debug!(service_type = %state.service_type, "Registry watch closed");
                        break;
                    }
                },
            }
        }
    }
}

/// 固定端点集合
///
/// 不连接注册中心，端点集合在构造后不再变化
pub struct FixedHostDiscovery {
    hosts: Vec<ServiceEndPoint>,
    listeners: Listeners,
}

impl FixedHostDiscovery {
    pub fn new(hosts: impl IntoIterator<Item = ServiceEndPoint>) -> Self {
        let mut unique: Vec<ServiceEndPoint> = Vec::new();
        for host in hosts {
            if !unique.contains(&host) {
                unique.push(host);
            }
        }
        Self {
            hosts: unique,
            listeners: Listeners::default(),
        }
    }
}

#[async_trait]
impl HostDiscovery for FixedHostDiscovery {
    fn hosts(&self) -> Vec<ServiceEndPoint> {
        self.hosts.clone()
    }

    fn add_listener(&self, listener: Arc<dyn HostDiscoveryListener>) {
        self.listeners.add(listener);
    }

    fn remove_listener(&self, listener: &Arc<dyn HostDiscoveryListener>) {
        self.listeners.remove(listener);
    }

    async fn close(&self) {}
}
