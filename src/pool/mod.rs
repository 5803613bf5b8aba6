//! 服务池模块
//!
//! - [`ServicePool`]：带故障转移的同步调用入口
//! - [`AsyncServicePool`]：后台执行、可取消的调用
//! - [`ServicePoolProxy`]：绑定默认分区上下文的代理
//! - [`ServicePoolBuilder`]：从各组件或配置文件组装服务池

pub mod async_pool;
pub mod builder;
pub mod proxy;
pub mod service_pool;

pub use async_pool::{AsyncServicePool, CallHandle};
pub use builder::ServicePoolBuilder;
pub use proxy::ServicePoolProxy;
pub use service_pool::{PoolOptions, ServicePool};
