//! etcd 注册中心后端
//!
//! 端点节点绑定 lease 实现 TTL，心跳通过 lease keep-alive 续期

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use etcd_client::{Client, EventType, GetOptions, PutOptions, WatchOptions};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    decode_node, node_path, parse_node_path, service_prefix, RegistryBackend, RegistryEvent,
    WATCH_CHANNEL_CAPACITY,
};
use crate::discovery::{DiscoveryConfig, ServiceEndPoint};
use crate::error::RegistryError;
use crate::utils::lock;

fn registry_error(e: etcd_client::Error) -> RegistryError {
    match e {
        etcd_client::Error::TransportError(_) | etcd_client::Error::GRpcStatus(_) => {
            RegistryError::Unavailable(e.to_string())
        }
        other => RegistryError::Backend(other.to_string()),
    }
}

/// etcd 注册中心后端
pub struct EtcdRegistry {
    client: Client,
    namespace: String,
    ttl_secs: i64,
    /// 节点路径 -> lease id
    leases: Mutex<HashMap<String, i64>>,
}

impl EtcdRegistry {
    /// 连接 etcd
    pub async fn connect(config: &DiscoveryConfig) -> Result<Self, RegistryError> {
        if config.endpoints.is_empty() {
            return Err(RegistryError::Backend("etcd endpoints not configured".to_string()));
        }
        let client = Client::connect(&config.endpoints, None)
            .await
            .map_err(registry_error)?;
        info!(endpoints = ?config.endpoints, namespace = %config.namespace, "✅ Connected to etcd");
        Ok(Self {
            client,
            namespace: config.namespace.clone(),
            ttl_secs: config.ttl_secs.max(1) as i64,
            leases: Mutex::new(HashMap::new()),
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn put_with_lease(&self, end_point: &ServiceEndPoint) -> Result<(), RegistryError> {
        let mut client = self.client.clone();
        let lease = client
            .lease_grant(self.ttl_secs, None)
            .await
            .map_err(registry_error)?;

        let mut extras = Map::new();
        extras.insert(
            "registration-time".to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
        let path = node_path(&self.namespace, &end_point.key());
        client
            .put(
                path.clone(),
                end_point.to_json_with_extras(extras),
                Some(PutOptions::new().with_lease(lease.id())),
            )
            .await
            .map_err(registry_error)?;

        if let Some(previous) = lock(&self.leases).insert(path, lease.id()) {
            // 旧 lease 到期后自动失效，这里尽量提前回收
            if let Err(e) = client.lease_revoke(previous).await {
                debug!(lease = previous, error = %e, "Failed to revoke previous lease");
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RegistryBackend for EtcdRegistry {
    async fn list(
        &self,
        ensemble: Option<&str>,
        service_type: &str,
    ) -> Result<Vec<ServiceEndPoint>, RegistryError> {
        let prefix = service_prefix(&self.namespace, ensemble, service_type);
        let mut client = self.client.clone();
        let resp = client
            .get(prefix, Some(GetOptions::new().with_prefix()))
            .await
            .map_err(registry_error)?;

        Ok(resp
            .kvs()
            .iter()
            .filter_map(|kv| {
                let path = String::from_utf8_lossy(kv.key());
                decode_node(&self.namespace, &path, kv.value())
            })
            .collect())
    }

    async fn watch(
        &self,
        ensemble: Option<&str>,
        service_type: &str,
    ) -> Result<mpsc::Receiver<RegistryEvent>, RegistryError> {
        let prefix = service_prefix(&self.namespace, ensemble, service_type);
        let mut client = self.client.clone();
        let (watcher, mut stream) = client
            .watch(prefix.clone(), Some(WatchOptions::new().with_prefix()))
            .await
            .map_err(registry_error)?;

        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let namespace = self.namespace.clone();

        tokio::spawn(async move {
            // watcher 必须存活，否则 etcd 会取消订阅
            let _watcher = watcher;
            loop {
                let resp = match stream.message().await {
                    Ok(Some(resp)) => resp,
                    Ok(None) => {
                        debug!(prefix = %prefix, "etcd watch stream ended");
                        break;
                    }
                    Err(e) => {
                        warn!(prefix = %prefix, error = %e, "etcd watch stream failed");
                        let _ = tx.send(RegistryEvent::Disconnected).await;
                        break;
                    }
                };
                if resp.canceled() {
                    warn!(prefix = %prefix, "etcd watch canceled by server");
                    break;
                }

                for event in resp.events() {
                    let Some(kv) = event.kv() else { continue };
                    let path = String::from_utf8_lossy(kv.key()).into_owned();
                    let event = match event.event_type() {
                        EventType::Put => decode_node(&namespace, &path, kv.value())
                            .map(RegistryEvent::Put),
                        EventType::Delete => {
                            parse_node_path(&namespace, &path).map(RegistryEvent::Delete)
                        }
                    };
                    if let Some(event) = event {
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn register(&self, end_point: &ServiceEndPoint) -> Result<(), RegistryError> {
        self.put_with_lease(end_point).await?;
        info!(end_point = %end_point, "✅ End point registered in etcd");
        Ok(())
    }

    async fn unregister(&self, end_point: &ServiceEndPoint) -> Result<(), RegistryError> {
        let path = node_path(&self.namespace, &end_point.key());
        let mut client = self.client.clone();
        client
            .delete(path.clone(), None)
            .await
            .map_err(registry_error)?;
        let lease = lock(&self.leases).remove(&path);
        if let Some(lease) = lease {
            if let Err(e) = client.lease_revoke(lease).await {
                debug!(lease, error = %e, "Failed to revoke lease");
            }
        }
        info!(end_point = %end_point, "End point unregistered from etcd");
        Ok(())
    }

    async fn heartbeat(&self, end_point: &ServiceEndPoint) -> Result<(), RegistryError> {
        let path = node_path(&self.namespace, &end_point.key());
        let lease = lock(&self.leases).get(&path).copied();
        let Some(lease) = lease else {
            return self.put_with_lease(end_point).await;
        };

        let mut client = self.client.clone();
        let (mut keeper, mut stream) = client
            .lease_keep_alive(lease)
            .await
            .map_err(registry_error)?;
        keeper.keep_alive().await.map_err(registry_error)?;
        match stream.message().await.map_err(registry_error)? {
            Some(resp) if resp.ttl() > 0 => Ok(()),
            _ => {
                // lease 已过期，节点已被 etcd 删除，重新注册
                warn!(end_point = %end_point, "etcd lease expired, re-registering");
                self.put_with_lease(end_point).await
            }
        }
    }
}
