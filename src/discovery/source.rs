//! 主机发现来源
//!
//! 构建服务池时可以按顺序配置多个来源，例如先查静态端点列表，
//! 再回落到注册中心。第一个认识该服务的来源提供主机发现。

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::backend::RegistryBackend;
use super::{DiscoveryConfig, FixedHostDiscovery, HostDiscovery, RegistryHostDiscovery};
use crate::error::Result;

/// 主机发现来源
#[async_trait]
pub trait HostDiscoverySource: Send + Sync {
    /// 为某个服务组下的某类服务创建主机发现
    ///
    /// 不认识该服务时返回 `Ok(None)`。返回的实例由调用方负责关闭
    async fn for_service(
        &self,
        ensemble: Option<&str>,
        service_type: &str,
    ) -> Result<Option<Arc<dyn HostDiscovery>>>;
}

/// 静态端点列表作为来源：只提供服务组和服务类型都匹配的端点
#[async_trait]
impl HostDiscoverySource for FixedHostDiscovery {
    async fn for_service(
        &self,
        ensemble: Option<&str>,
        service_type: &str,
    ) -> Result<Option<Arc<dyn HostDiscovery>>> {
        let matching: Vec<_> = self
            .hosts()
            .into_iter()
            .filter(|ep| ep.service_type() == service_type && ep.ensemble_name() == ensemble)
            .collect();
        if matching.is_empty() {
            return Ok(None);
        }
        debug!(
            service_type = %service_type,
            hosts = matching.len(),
            "Static host list answers for service"
        );
        Ok(Some(Arc::new(FixedHostDiscovery::new(matching))))
    }
}

/// 注册中心作为来源，认识任意服务
///
/// 命名空间、重连退避等设置取自模板配置，服务类型和服务组按请求替换
pub struct RegistryDiscoverySource {
    backend: Arc<dyn RegistryBackend>,
    template: DiscoveryConfig,
}

impl RegistryDiscoverySource {
    pub fn new(backend: Arc<dyn RegistryBackend>, template: DiscoveryConfig) -> Self {
        Self { backend, template }
    }
}

#[async_trait]
impl HostDiscoverySource for RegistryDiscoverySource {
    async fn for_service(
        &self,
        ensemble: Option<&str>,
        service_type: &str,
    ) -> Result<Option<Arc<dyn HostDiscovery>>> {
        let mut config = self.template.clone();
        config.service_type = service_type.to_string();
        config.ensemble = ensemble.map(str::to_string);
        config.validate()?;
        let discovery = RegistryHostDiscovery::start(self.backend.clone(), &config).await;
        Ok(Some(Arc::new(discovery)))
    }
}

/// 依次询问来源，返回第一个给出的主机发现
pub(crate) async fn resolve(
    sources: &[Arc<dyn HostDiscoverySource>],
    ensemble: Option<&str>,
    service_type: &str,
) -> Result<Option<Arc<dyn HostDiscovery>>> {
    for (index, source) in sources.iter().enumerate() {
        if let Some(discovery) = source.for_service(ensemble, service_type).await? {
            debug!(service_type = %service_type, source = index, "Host discovery source selected");
            return Ok(Some(discovery));
        }
    }
    Ok(None)
}
