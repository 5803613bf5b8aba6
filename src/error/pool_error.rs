//! 服务池统一错误类型

use std::fmt;

use thiserror::Error;

use super::code::ErrorCode;
use crate::discovery::ServiceEndPoint;

/// 服务池统一错误类型
#[derive(Error, Debug)]
pub enum PoolError {
    /// 服务发现 / 分区过滤 / 负载均衡没有给出任何候选端点
    #[error("没有可用的服务端点: {service}")]
    NoSuitableHostsAvailable { service: String },

    /// 端点的实例缓存已满（FAIL 策略）或等待超时（BLOCK 策略）
    #[error("端点 {end_point} 没有可用的缓存实例")]
    NoCachedInstancesAvailable { end_point: ServiceEndPoint },

    /// 服务工厂创建客户端实例失败
    #[error("为端点 {end_point} 创建服务实例失败: {error}")]
    ServiceCreation {
        end_point: ServiceEndPoint,
        #[source]
        error: anyhow::Error,
    },

    /// 用户操作失败
    #[error("端点 {end_point} 上的服务调用失败: {error}")]
    ServiceCallFailure {
        end_point: ServiceEndPoint,
        retriable: bool,
        #[source]
        error: anyhow::Error,
    },

    /// 所有候选端点都已尝试或重试次数耗尽
    #[error("服务 {service} 的调用在 {} 个端点上均失败: {}", .failures.len(), FailureList(.failures))]
    Exhausted {
        service: String,
        failures: Vec<EndPointFailure>,
    },

    /// 重复归还或归还未知句柄（编程错误）
    #[error("实例归还协议错误: {0}")]
    CheckInProtocol(String),

    /// 组件已关闭
    #[error("{0} 已关闭")]
    Closed(String),

    /// 异步调用在开始执行前被取消
    #[error("调用已取消")]
    Cancelled,

    /// 异步任务异常退出
    #[error("异步任务失败: {0}")]
    TaskFailed(String),

    /// 端点校验失败
    #[error("端点无效: {0}")]
    InvalidEndPoint(#[from] EndPointError),

    /// 注册中心错误
    #[error("注册中心错误: {0}")]
    Registry(#[from] RegistryError),

    /// 配置错误
    #[error("配置错误: {0}")]
    Config(String),
}

impl PoolError {
    /// 创建配置错误
    pub fn config(msg: impl Into<String>) -> Self {
        PoolError::Config(msg.into())
    }

    /// 创建已关闭错误
    pub fn closed(component: impl Into<String>) -> Self {
        PoolError::Closed(component.into())
    }

    /// 获取错误代码
    pub fn code(&self) -> ErrorCode {
        match self {
            PoolError::NoSuitableHostsAvailable { .. } => ErrorCode::NoSuitableHostsAvailable,
            PoolError::NoCachedInstancesAvailable { .. } => ErrorCode::NoCachedInstancesAvailable,
            PoolError::ServiceCreation { .. } => ErrorCode::ServiceCreationFailed,
            PoolError::ServiceCallFailure { .. } => ErrorCode::ServiceCallFailure,
            PoolError::Exhausted { failures, .. } => {
                let all_exhausted = !failures.is_empty()
                    && failures
                        .iter()
                        .all(|f| f.kind == FailureKind::CacheExhausted);
                if all_exhausted {
                    ErrorCode::NoCachedInstancesAvailable
                } else {
                    ErrorCode::RetriesExhausted
                }
            }
            PoolError::CheckInProtocol(_) => ErrorCode::CheckInProtocolError,
            PoolError::Closed(_) => ErrorCode::Closed,
            PoolError::Cancelled => ErrorCode::Cancelled,
            PoolError::TaskFailed(_) => ErrorCode::TaskFailed,
            PoolError::InvalidEndPoint(_) => ErrorCode::InvalidEndPoint,
            PoolError::Registry(_) => ErrorCode::RegistryUnavailable,
            PoolError::Config(_) => ErrorCode::ConfigurationError,
        }
    }

    /// 按端点列出的失败明细（仅 `Exhausted` 有）
    pub fn failures(&self) -> &[EndPointFailure] {
        match self {
            PoolError::Exhausted { failures, .. } => failures,
            _ => &[],
        }
    }

    /// 判断是否为可重试的错误
    pub fn is_retryable(&self) -> bool {
        match self {
            PoolError::ServiceCallFailure { retriable, .. } => *retriable,
            other => other.code().is_retryable(),
        }
    }
}

/// 单个端点的失败类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 缓存耗尽，端点本身不被标记为坏端点
    CacheExhausted,
    /// 实例创建失败
    CreationFailed,
    /// 用户操作失败
    ServiceCall,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::CacheExhausted => write!(f, "cache-exhausted"),
            FailureKind::CreationFailed => write!(f, "creation-failed"),
            FailureKind::ServiceCall => write!(f, "service-call"),
        }
    }
}

/// 单个端点的失败记录
#[derive(Debug, Clone)]
pub struct EndPointFailure {
    pub end_point: ServiceEndPoint,
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for EndPointFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.end_point, self.kind, self.message)
    }
}

struct FailureList<'a>(&'a [EndPointFailure]);

impl fmt::Display for FailureList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

/// 端点构建 / 解码错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndPointError {
    #[error("缺少必填字段: {0}")]
    MissingField(&'static str),

    #[error("字段 {field} 含有非法字符: {value:?}")]
    InvalidCharacters { field: &'static str, value: String },

    #[error("JSON 解析失败: {0}")]
    Json(String),
}

/// 注册中心错误
#[derive(Error, Debug, Clone)]
pub enum RegistryError {
    /// 注册中心不可达（连接中断等）
    #[error("注册中心不可用: {0}")]
    Unavailable(String),

    /// 注册中心返回的节点数据无效
    #[error("节点数据无效: {0}")]
    InvalidNode(String),

    /// 后端内部错误
    #[error("后端错误: {0}")]
    Backend(String),
}
