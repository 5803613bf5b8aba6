//! 错误代码和错误类别定义

use serde::{Deserialize, Serialize};
use std::fmt;

/// 错误代码枚举
///
/// 错误代码按类别分组，每个类别占用1000个代码范围：
/// - 1000-1999: 服务发现相关错误
/// - 2000-2999: 实例缓存相关错误
/// - 3000-3999: 服务调用相关错误
/// - 4000-4999: 生命周期相关错误
/// - 9000-9999: 通用错误
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum ErrorCode {
    // ============================================================
    // 服务发现相关错误 (1000-1999)
    // ============================================================
    NoSuitableHostsAvailable = 1000,
    RegistryUnavailable = 1001,
    InvalidEndPoint = 1002,

    // ============================================================
    // 实例缓存相关错误 (2000-2999)
    // ============================================================
    NoCachedInstancesAvailable = 2000,
    ServiceCreationFailed = 2001,
    CheckInProtocolError = 2002,

    // ============================================================
    // 服务调用相关错误 (3000-3999)
    // ============================================================
    ServiceCallFailure = 3000,
    RetriesExhausted = 3001,

    // ============================================================
    // 生命周期相关错误 (4000-4999)
    // ============================================================
    Closed = 4000,
    Cancelled = 4001,
    TaskFailed = 4002,

    // ============================================================
    // 通用错误 (9000-9999)
    // ============================================================
    ConfigurationError = 9000,
    SerializationError = 9001,
}

impl ErrorCode {
    /// 获取错误代码的数值
    pub fn as_u32(&self) -> u32 {
        *self as u32
    }

    /// 获取错误代码的字符串表示
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoSuitableHostsAvailable => "NO_SUITABLE_HOSTS_AVAILABLE",
            ErrorCode::RegistryUnavailable => "REGISTRY_UNAVAILABLE",
            ErrorCode::InvalidEndPoint => "INVALID_END_POINT",
            ErrorCode::NoCachedInstancesAvailable => "NO_CACHED_INSTANCES_AVAILABLE",
            ErrorCode::ServiceCreationFailed => "SERVICE_CREATION_FAILED",
            ErrorCode::CheckInProtocolError => "CHECK_IN_PROTOCOL_ERROR",
            ErrorCode::ServiceCallFailure => "SERVICE_CALL_FAILURE",
            ErrorCode::RetriesExhausted => "RETRIES_EXHAUSTED",
            ErrorCode::Closed => "CLOSED",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::TaskFailed => "TASK_FAILED",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
            ErrorCode::SerializationError => "SERIALIZATION_ERROR",
        }
    }

    /// 获取错误代码的类别
    pub fn category(&self) -> ErrorCategory {
        match self.as_u32() {
            1000..=1999 => ErrorCategory::Discovery,
            2000..=2999 => ErrorCategory::Cache,
            3000..=3999 => ErrorCategory::Call,
            4000..=4999 => ErrorCategory::Lifecycle,
            _ => ErrorCategory::General,
        }
    }

    /// 判断是否可以换一个端点重试
    ///
    /// 缓存耗尽不代表端点不健康，所以也属于可重试错误
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::NoCachedInstancesAvailable | ErrorCode::RegistryUnavailable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    Discovery,
    Cache,
    Call,
    Lifecycle,
    General,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Discovery => write!(f, "DISCOVERY"),
            ErrorCategory::Cache => write!(f, "CACHE"),
            ErrorCategory::Call => write!(f, "CALL"),
            ErrorCategory::Lifecycle => write!(f, "LIFECYCLE"),
            ErrorCategory::General => write!(f, "GENERAL"),
        }
    }
}
