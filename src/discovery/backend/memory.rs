//! 进程内注册中心
//!
//! 行为与真实注册中心一致（watch 推送、连接中断 / 恢复），
//! 用于测试和单进程部署

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use super::{
    decode_node, node_path, parse_node_path, service_prefix, RegistryBackend, RegistryEvent,
    WATCH_CHANNEL_CAPACITY,
};
use crate::discovery::ServiceEndPoint;
use crate::error::RegistryError;
use crate::utils::lock;

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<RegistryEvent>,
}

struct MemoryState {
    nodes: BTreeMap<String, String>,
    watchers: Vec<Watcher>,
    connected: bool,
}

impl MemoryState {
    /// 向匹配前缀的订阅方推送事件
    ///
    /// 通道已满的订阅方会被丢弃，它会看到通道关闭并重新订阅
    fn notify(&mut self, path: &str, event: &RegistryEvent) {
        self.watchers.retain(|watcher| {
            if !path.starts_with(&watcher.prefix) {
                return !watcher.tx.is_closed();
            }
            match watcher.tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(prefix = %watcher.prefix, "Watch channel full, dropping watcher");
                    false
                }
                Err(TrySendError::Closed(_)) => false,
            }
        });
    }

    fn broadcast(&mut self, event: RegistryEvent) {
        self.watchers
            .retain(|watcher| watcher.tx.try_send(event.clone()).is_ok());
    }
}

/// 进程内注册中心
pub struct InMemoryRegistry {
    namespace: String,
    state: Mutex<MemoryState>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::with_namespace("flare")
    }

    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            state: Mutex::new(MemoryState {
                nodes: BTreeMap::new(),
                watchers: Vec::new(),
                connected: true,
            }),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// 直接写入原始节点数据（不做校验）
    ///
    /// 模拟其它进程对注册中心的修改，连接中断期间写入的数据不会推送，
    /// 只能在恢复后通过全量拉取看到
    pub fn put_node(&self, path: impl Into<String>, data: impl Into<String>) {
        let path = path.into();
        let data = data.into();
        let mut state = lock(&self.state);
        state.nodes.insert(path.clone(), data.clone());
        if !state.connected {
            return;
        }
        if let Some(end_point) = decode_node(&self.namespace, &path, data.as_bytes()) {
            state.notify(&path, &RegistryEvent::Put(end_point));
        }
    }

    /// 直接删除节点
    pub fn remove_node(&self, path: &str) -> bool {
        let mut state = lock(&self.state);
        if state.nodes.remove(path).is_none() {
            return false;
        }
        if state.connected {
            if let Some(key) = parse_node_path(&self.namespace, path) {
                state.notify(path, &RegistryEvent::Delete(key));
            }
        }
        true
    }

    /// 模拟连接中断 / 恢复
    pub fn set_connected(&self, connected: bool) {
        let mut state = lock(&self.state);
        if state.connected == connected {
            return;
        }
        state.connected = connected;
        if connected {
            info!(namespace = %self.namespace, "In-memory registry reconnected");
            state.broadcast(RegistryEvent::Reconnected);
        } else {
            warn!(namespace = %self.namespace, "In-memory registry disconnected");
            state.broadcast(RegistryEvent::Disconnected);
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state).connected
    }

    /// 关闭所有订阅通道，模拟 watch 丢失
    pub fn drop_watchers(&self) {
        lock(&self.state).watchers.clear();
    }

    /// 当前存活的订阅数量
    pub fn watcher_count(&self) -> usize {
        let mut state = lock(&self.state);
        state.watchers.retain(|watcher| !watcher.tx.is_closed());
        state.watchers.len()
    }

    pub fn node_count(&self) -> usize {
        lock(&self.state).nodes.len()
    }

    fn ensure_connected(&self, state: &MemoryState) -> Result<(), RegistryError> {
        if state.connected {
            Ok(())
        } else {
            Err(RegistryError::Unavailable(format!(
                "in-memory registry {} is disconnected",
                self.namespace
            )))
        }
    }
}

impl Default for InMemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RegistryBackend for InMemoryRegistry {
    async fn list(
        &self,
        ensemble: Option<&str>,
        service_type: &str,
    ) -> Result<Vec<ServiceEndPoint>, RegistryError> {
        let state = lock(&self.state);
        self.ensure_connected(&state)?;
        let prefix = service_prefix(&self.namespace, ensemble, service_type);
        Ok(state
            .nodes
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, data)| decode_node(&self.namespace, path, data.as_bytes()))
            .collect())
    }

    async fn watch(
        &self,
        ensemble: Option<&str>,
        service_type: &str,
    ) -> Result<mpsc::Receiver<RegistryEvent>, RegistryError> {
        let mut state = lock(&self.state);
        self.ensure_connected(&state)?;
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let prefix = service_prefix(&self.namespace, ensemble, service_type);
        debug!(prefix = %prefix, "Watch established");
        state.watchers.push(Watcher { prefix, tx });
        Ok(rx)
    }

    async fn register(&self, end_point: &ServiceEndPoint) -> Result<(), RegistryError> {
        {
            let state = lock(&self.state);
            self.ensure_connected(&state)?;
        }
        let mut extras = Map::new();
        extras.insert(
            "registration-time".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        let path = node_path(&self.namespace, &end_point.key());
        self.put_node(path, end_point.to_json_with_extras(extras));
        Ok(())
    }

    async fn unregister(&self, end_point: &ServiceEndPoint) -> Result<(), RegistryError> {
        {
            let state = lock(&self.state);
            self.ensure_connected(&state)?;
        }
        self.remove_node(&node_path(&self.namespace, &end_point.key()));
        Ok(())
    }

    /// 进程内注册中心没有 TTL，心跳只校验连接状态
    async fn heartbeat(&self, end_point: &ServiceEndPoint) -> Result<(), RegistryError> {
        let state = lock(&self.state);
        self.ensure_connected(&state)?;
        let path = node_path(&self.namespace, &end_point.key());
        if state.nodes.contains_key(&path) {
            Ok(())
        } else {
            Err(RegistryError::InvalidNode(format!("{} is not registered", path)))
        }
    }
}
