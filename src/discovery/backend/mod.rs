//! 注册中心后端抽象和实现
//!
//! 每个端点在注册中心中是一个节点：
//!
//! ```text
//! /{namespace}/services/{service_type}/{ensemble | ~}/{id}  ->  端点 JSON
//! ```
//!
//! 没有服务组的端点使用 `~` 占位

pub mod memory;

#[cfg(feature = "etcd")]
pub mod etcd;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::discovery::{EndPointKey, ServiceEndPoint};
use crate::error::RegistryError;

/// 节点路径中表示“无服务组”的占位符
const NO_ENSEMBLE: &str = "~";

/// watch 通道容量
pub(crate) const WATCH_CHANNEL_CAPACITY: usize = 256;

/// 注册中心推送的变更事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    /// 节点新增或数据变化
    Put(ServiceEndPoint),
    /// 节点删除
    Delete(EndPointKey),
    /// 与注册中心的连接中断，之后的变更可能丢失
    Disconnected,
    /// 连接恢复，订阅方需要重新拉取全量数据
    Reconnected,
}

/// 注册中心后端 trait
///
/// 注意：由于需要动态分发（dyn），使用 async-trait
#[async_trait]
pub trait RegistryBackend: Send + Sync {
    /// 列出某个服务组下某类服务的全部端点
    ///
    /// 数据格式错误的节点会被跳过
    async fn list(
        &self,
        ensemble: Option<&str>,
        service_type: &str,
    ) -> Result<Vec<ServiceEndPoint>, RegistryError>;

    /// 订阅某个服务组下某类服务的变更
    ///
    /// 通道关闭表示订阅失效，调用方需要重新订阅
    async fn watch(
        &self,
        ensemble: Option<&str>,
        service_type: &str,
    ) -> Result<mpsc::Receiver<RegistryEvent>, RegistryError>;

    /// 注册端点（已存在时覆盖）
    async fn register(&self, end_point: &ServiceEndPoint) -> Result<(), RegistryError>;

    /// 注销端点
    async fn unregister(&self, end_point: &ServiceEndPoint) -> Result<(), RegistryError>;

    /// 发送心跳
    ///
    /// 默认实现是重新注册（适用于基于 TTL 的后端）
    async fn heartbeat(&self, end_point: &ServiceEndPoint) -> Result<(), RegistryError> {
        self.register(end_point).await
    }
}

/// 某类服务的节点前缀（以 `/` 结尾）
pub fn service_prefix(namespace: &str, ensemble: Option<&str>, service_type: &str) -> String {
    format!(
        "/{}/services/{}/{}/",
        namespace,
        service_type,
        ensemble.unwrap_or(NO_ENSEMBLE)
    )
}

/// 端点节点路径
pub fn node_path(namespace: &str, key: &EndPointKey) -> String {
    format!(
        "{}{}",
        service_prefix(namespace, key.ensemble_name(), key.service_type()),
        key.id()
    )
}

/// 从节点路径还原端点身份
pub fn parse_node_path(namespace: &str, path: &str) -> Option<EndPointKey> {
    let rest = path.strip_prefix('/')?.strip_prefix(namespace)?;
    let rest = rest.strip_prefix("/services/")?;
    let mut parts = rest.splitn(3, '/');
    let service_type = parts.next().filter(|s| !s.is_empty())?;
    let ensemble = parts.next().filter(|s| !s.is_empty())?;
    let id = parts.next().filter(|s| !s.is_empty() && !s.contains('/'))?;
    let ensemble = (ensemble != NO_ENSEMBLE).then(|| ensemble.to_string());
    Some(EndPointKey::new(ensemble, service_type, id))
}

/// 解码节点数据
///
/// 数据无法解析、或与节点路径不一致时记录警告并返回 `None`
pub(crate) fn decode_node(namespace: &str, path: &str, data: &[u8]) -> Option<ServiceEndPoint> {
    let json = match std::str::from_utf8(data) {
        Ok(json) => json,
        Err(e) => {
            warn!(node = %path, error = %e, "Skipping registry node with non utf-8 data");
            return None;
        }
    };

    let end_point = match ServiceEndPoint::from_json(json) {
        Ok(end_point) => end_point,
        Err(e) => {
            warn!(node = %path, error = %e, "Skipping malformed registry node");
            return None;
        }
    };

    match parse_node_path(namespace, path) {
        Some(key) if key == end_point.key() => Some(end_point),
        _ => {
            warn!(
                node = %path,
                end_point = %end_point,
                "Skipping registry node whose data does not match its path"
            );
            None
        }
    }
}
