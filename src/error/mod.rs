//! 服务池错误处理模块
//!
//! 提供统一的错误类型、错误代码分类和结果类型别名

pub mod code;
pub mod pool_error;

// 重新导出公共类型
pub use code::{ErrorCategory, ErrorCode};
pub use pool_error::{EndPointError, EndPointFailure, FailureKind, PoolError, RegistryError};

/// 结果类型别名
pub type Result<T> = std::result::Result<T, PoolError>;
