//! 异步服务池
//!
//! 把 [`ServicePool`] 调用提交到后台任务执行，立即返回可等待、可取消的
//! [`CallHandle`]。并发执行的调用数由信号量限制。
//!
//! 取消语义：
//! - 调用开始前取消：不会签出实例，句柄返回 `Cancelled`
//! - 调用开始后取消：调用照常执行完毕并归还实例，只是结果不再交付，
//!   句柄同样返回 `Cancelled`

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use super::ServicePool;
use crate::discovery::ServiceEndPoint;
use crate::error::{PoolError, Result};
use crate::partition::PartitionContext;

/// 调用阶段：只会从 `PENDING` 迁移到 `STARTED` 或 `CANCELLED` 之一
const PENDING: u8 = 0;
const STARTED: u8 = 1;
const CANCELLED: u8 = 2;

enum CallState<R> {
    Running(JoinHandle<Result<R>>),
    Rejected(Option<PoolError>),
}

/// 异步调用句柄
///
/// 直接 `.await` 获取结果。丢弃句柄不会中断已开始的调用
pub struct CallHandle<R> {
    state: CallState<R>,
    cancel: CancellationToken,
    phase: Arc<AtomicU8>,
}

impl<R> CallHandle<R> {
    fn rejected(error: PoolError) -> Self {
        Self {
            state: CallState::Rejected(Some(error)),
            cancel: CancellationToken::new(),
            phase: Arc::new(AtomicU8::new(PENDING)),
        }
    }

    /// 取消调用
    ///
    /// 返回 `true` 表示调用尚未开始，不会再执行
    pub fn cancel(&self) -> bool {
        let prevented = match self.phase.compare_exchange(
            PENDING,
            CANCELLED,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => true,
            Err(phase) => phase == CANCELLED,
        };
        self.cancel.cancel();
        prevented
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 调用是否已经开始（拿到执行许可）
    pub fn is_started(&self) -> bool {
        self.phase.load(Ordering::SeqCst) == STARTED
    }

    /// 后台任务是否已结束
    pub fn is_finished(&self) -> bool {
        match &self.state {
            CallState::Running(task) => task.is_finished(),
            CallState::Rejected(_) => true,
        }
    }
}

impl<R> Future for CallHandle<R> {
    type Output = Result<R>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        match &mut this.state {
            CallState::Rejected(error) => {
                let error = error.take().unwrap_or_else(|| {
                    PoolError::TaskFailed("call handle polled after completion".to_string())
                });
                Poll::Ready(Err(error))
            }
            CallState::Running(task) => match Pin::new(task).poll(cx) {
                Poll::Pending => Poll::Pending,
                Poll::Ready(_) if this.cancel.is_cancelled() => Poll::Ready(Err(PoolError::Cancelled)),
                Poll::Ready(Ok(result)) => Poll::Ready(result),
                Poll::Ready(Err(join_error)) if join_error.is_cancelled() => {
                    Poll::Ready(Err(PoolError::Cancelled))
                }
                Poll::Ready(Err(join_error)) => {
                    Poll::Ready(Err(PoolError::TaskFailed(join_error.to_string())))
                }
            },
        }
    }
}

/// 异步服务池
pub struct AsyncServicePool<S>
where
    S: Send + Sync + 'static,
{
    pool: ServicePool<S>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl<S> AsyncServicePool<S>
where
    S: Send + Sync + 'static,
{
    /// 包装服务池，`max_concurrency` 为同时执行的调用上限
    ///
    /// 关闭异步服务池时会同时关闭被包装的服务池
    pub fn new(pool: ServicePool<S>, max_concurrency: usize) -> Result<Self> {
        if max_concurrency == 0 {
            return Err(PoolError::config("max_concurrency must be at least 1"));
        }
        Ok(Self {
            pool,
            permits: Arc::new(Semaphore::new(max_concurrency)),
            tracker: TaskTracker::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// 被包装的服务池
    pub fn pool(&self) -> &ServicePool<S> {
        &self.pool
    }

    /// 正在执行或排队的调用数
    pub fn num_pending_calls(&self) -> usize {
        self.tracker.len()
    }

    /// 空闲的执行许可数
    pub fn available_workers(&self) -> usize {
        self.permits.available_permits()
    }

    /// 在后台执行 [`ServicePool::execute`]
    pub fn execute<R, F, Fut>(&self, context: PartitionContext, operation: F) -> CallHandle<R>
    where
        R: Send + 'static,
        F: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let pool = self.pool.clone();
        self.submit(move || async move { pool.execute(&context, operation).await })
    }

    /// 在后台执行 [`ServicePool::execute_on_end_point`]
    pub fn execute_on_end_point<R, F, Fut>(
        &self,
        end_point: ServiceEndPoint,
        operation: F,
    ) -> CallHandle<R>
    where
        R: Send + 'static,
        F: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let pool = self.pool.clone();
        self.submit(move || async move { pool.execute_on_end_point(&end_point, operation).await })
    }

    /// 对每个当前可用端点各执行一次操作
    pub fn execute_on_all<R, F, Fut>(&self, operation: F) -> Vec<(ServiceEndPoint, CallHandle<R>)>
    where
        R: Send + 'static,
        F: Fn(Arc<S>) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let end_points = self.pool.valid_end_points();
        debug!(
            service = %self.pool.service_name(),
            end_points = end_points.len(),
            "Executing on all end points"
        );
        end_points
            .into_iter()
            .map(|end_point| {
                let handle = self.execute_on_end_point(end_point.clone(), operation.clone());
                (end_point, handle)
            })
            .collect()
    }

    fn submit<R, C, Fut>(&self, call: C) -> CallHandle<R>
    where
        R: Send + 'static,
        C: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        if self.closed.load(Ordering::Acquire) {
            return CallHandle::rejected(PoolError::closed(format!(
                "async service pool {}",
                self.pool.service_name()
            )));
        }

        let cancel = CancellationToken::new();
        let phase = Arc::new(AtomicU8::new(PENDING));
        let permits = self.permits.clone();
        let token = cancel.clone();
        let task_phase = phase.clone();

        let task = self.tracker.spawn(async move {
            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(PoolError::Cancelled),
                permit = permits.acquire_owned() => permit
                    .map_err(|_| PoolError::closed("async service pool"))?,
            };
            if task_phase
                .compare_exchange(PENDING, STARTED, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                return Err(PoolError::Cancelled);
            }
            // 开始后不再响应取消，保证实例被归还
            let result = call().await;
            drop(permit);
            result
        });

        CallHandle {
            state: CallState::Running(task),
            cancel,
            phase,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 停止接受新调用，等待已提交的调用完成后关闭服务池
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tracker.close();
        self.tracker.wait().await;
        self.pool.close().await;
        info!(service = %self.pool.service_name(), "Async service pool closed");
    }
}
