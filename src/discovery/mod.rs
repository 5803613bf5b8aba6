//! 服务发现模块
//!
//! 端点定义、注册中心后端抽象（进程内 / etcd）、主机发现、发现来源和服务注册。

pub mod backend;
pub mod config;
pub mod endpoint;
pub mod factory;
pub mod host_discovery;
pub mod source;

pub use backend::memory::InMemoryRegistry;
pub use backend::{RegistryBackend, RegistryEvent};
pub use config::{BackendType, DiscoveryConfig};
pub use endpoint::{EndPointKey, ServiceEndPoint, ServiceEndPointBuilder};
pub use factory::{DiscoveryFactory, ServiceRegistrar};
pub use host_discovery::{
    FixedHostDiscovery, HostDiscovery, HostDiscoveryListener, RegistryHostDiscovery,
};
pub use source::{HostDiscoverySource, RegistryDiscoverySource};

#[cfg(feature = "etcd")]
pub use backend::etcd::EtcdRegistry;
