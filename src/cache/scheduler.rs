//! 空闲实例回收调度器
//!
//! 一个后台任务按各缓存自己的间隔调用空闲回收。缓存只以弱引用注册，
//! 缓存被释放后注册自动失效。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::utils::lock;

/// 可被调度器回收空闲实例的对象
pub(crate) trait IdleSweep: Send + Sync {
    /// 执行一次回收，返回销毁的实例数
    fn sweep_idle(&self) -> usize;
}

struct Registration {
    id: u64,
    target: Weak<dyn IdleSweep>,
    interval: Duration,
    next_run: Instant,
}

#[derive(Default)]
struct Shared {
    registrations: Mutex<Vec<Registration>>,
    changed: Notify,
    next_id: AtomicU64,
}

struct Handle {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// 回收调度器
///
/// 克隆得到的调度器共享同一个后台任务，最后一个克隆释放时任务退出
#[derive(Clone)]
pub struct EvictionScheduler {
    handle: Arc<Handle>,
}

impl EvictionScheduler {
    /// 创建调度器并启动后台任务（需要在 tokio 运行时中调用）
    pub fn new() -> Self {
        let shared = Arc::new(Shared::default());
        let cancel = CancellationToken::new();
        tokio::spawn(run(shared.clone(), cancel.clone()));
        Self {
            handle: Arc::new(Handle { shared, cancel }),
        }
    }

    /// 注册回收目标，返回注册编号
    pub(crate) fn register(&self, target: Weak<dyn IdleSweep>, interval: Duration) -> u64 {
        let shared = &self.handle.shared;
        let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
        let interval = interval.max(Duration::from_millis(1));
        lock(&shared.registrations).push(Registration {
            id,
            target,
            interval,
            next_run: Instant::now() + interval,
        });
        shared.changed.notify_one();
        id
    }

    /// 取消注册
    pub(crate) fn unregister(&self, id: u64) {
        let shared = &self.handle.shared;
        lock(&shared.registrations).retain(|r| r.id != id);
        shared.changed.notify_one();
    }

    /// 当前有效的注册数量
    pub fn num_registrations(&self) -> usize {
        let mut registrations = lock(&self.handle.shared.registrations);
        registrations.retain(|r| r.target.strong_count() > 0);
        registrations.len()
    }

    /// 停止后台任务
    pub fn shutdown(&self) {
        self.handle.cancel.cancel();
    }
}

impl Default for EvictionScheduler {
    fn default() -> Self {
        Self::new()
    }
}

async fn run(shared: Arc<Shared>, cancel: CancellationToken) {
    loop {
        let next_run = {
            let mut registrations = lock(&shared.registrations);
            registrations.retain(|r| r.target.strong_count() > 0);
            registrations.iter().map(|r| r.next_run).min()
        };

        let sleep = async {
            match next_run {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = shared.changed.notified() => continue,
            _ = sleep => {}
        }

        let now = Instant::now();
        let due: Vec<Arc<dyn IdleSweep>> = {
            let mut registrations = lock(&shared.registrations);
            registrations
                .iter_mut()
                .filter(|r| r.next_run <= now)
                .filter_map(|r| {
                    r.next_run = now + r.interval;
                    r.target.upgrade()
                })
                .collect()
        };

        for target in due {
            let evicted = target.sweep_idle();
            if evicted > 0 {
                debug!(evicted, "Idle instances evicted");
            }
        }
    }
    debug!("Eviction scheduler stopped");
}
