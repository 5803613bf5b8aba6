//! 服务客户端工厂
//!
//! 应用通过实现 [`ServiceFactory`] 告诉服务池如何为某个端点创建、
//! 销毁和检查客户端实例，以及哪些错误值得换一个端点重试

use std::sync::Arc;

use async_trait::async_trait;

use crate::discovery::ServiceEndPoint;
use crate::pool::ServicePoolBuilder;

/// 服务客户端工厂
#[async_trait]
pub trait ServiceFactory: Send + Sync + 'static {
    /// 客户端实例类型
    type Service: Send + Sync + 'static;

    /// 逻辑服务名称，同时用作服务发现的服务类型
    fn service_name(&self) -> &str;

    /// 为端点创建一个客户端实例
    async fn create(&self, end_point: &ServiceEndPoint) -> anyhow::Result<Self::Service>;

    /// 销毁客户端实例
    ///
    /// 实例可能仍被其他地方持有，这里只需要做资源清理
    fn destroy(&self, _end_point: &ServiceEndPoint, _service: Arc<Self::Service>) {}

    /// 检查端点是否健康
    ///
    /// 由服务池的后台健康检查对坏端点调用，不参与调用本身的重试
    async fn is_healthy(&self, _end_point: &ServiceEndPoint) -> bool {
        true
    }

    /// 错误是否值得换一个端点重试
    fn is_retriable_exception(&self, error: &anyhow::Error) -> bool;

    /// 出错的实例是否必须销毁而不是放回缓存
    fn invalidates_instance(&self, _error: &anyhow::Error) -> bool {
        false
    }

    /// 创建的实例是否线程安全
    ///
    /// 线程安全的实例在每个端点只创建一个并被所有调用共享
    fn is_multi_threaded(&self) -> bool {
        false
    }

    /// 调整服务池配置（如负载均衡算法、分区过滤器）
    fn configure(
        &self,
        builder: ServicePoolBuilder<Self::Service>,
    ) -> ServicePoolBuilder<Self::Service>
    where
        Self: Sized,
    {
        builder
    }
}
