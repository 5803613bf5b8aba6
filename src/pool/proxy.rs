//! 服务池代理
//!
//! 把服务池和一个默认分区上下文绑在一起，调用方只需要提供操作本身

use std::future::Future;
use std::sync::Arc;

use super::ServicePool;
use crate::error::Result;
use crate::partition::PartitionContext;
use crate::retry::RetryPolicy;

/// 绑定默认分区上下文的服务池代理
pub struct ServicePoolProxy<S>
where
    S: Send + Sync + 'static,
{
    pool: ServicePool<S>,
    context: PartitionContext,
}

impl<S> Clone for ServicePoolProxy<S>
where
    S: Send + Sync + 'static,
{
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            context: self.context.clone(),
        }
    }
}

impl<S> ServicePoolProxy<S>
where
    S: Send + Sync + 'static,
{
    pub fn new(pool: ServicePool<S>, context: PartitionContext) -> Self {
        Self { pool, context }
    }

    /// 所属服务池
    pub fn pool(&self) -> &ServicePool<S> {
        &self.pool
    }

    /// 默认分区上下文
    pub fn context(&self) -> &PartitionContext {
        &self.context
    }

    /// 同一服务池上换一个分区上下文
    pub fn with_context(&self, context: PartitionContext) -> Self {
        Self {
            pool: self.pool.clone(),
            context,
        }
    }

    /// 用默认分区上下文执行操作
    pub async fn call<R, F, Fut>(&self, operation: F) -> Result<R>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        self.pool.execute(&self.context, operation).await
    }

    /// 用默认分区上下文和指定重试策略执行操作
    pub async fn call_with<R, F, Fut>(&self, retry: &dyn RetryPolicy, operation: F) -> Result<R>
    where
        F: Fn(Arc<S>) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        self.pool.execute_with(retry, &self.context, operation).await
    }
}
