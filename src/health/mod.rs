//! 健康检查模块
//!
//! 根据服务池缓存的有效 / 坏端点数量给出健康结论，不会直接访问下游服务，
//! 频繁调用也不会给依赖方带来压力

use std::fmt;

use serde::Serialize;

/// 健康状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// 服务池健康摘要
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolHealth {
    pub valid: usize,
    pub bad: usize,
    pub status: HealthStatus,
    pub message: String,
}

impl PoolHealth {
    /// 至少有一个有效端点时视为健康
    pub fn from_counts(valid: usize, bad: usize) -> Self {
        if valid == 0 && bad == 0 {
            return Self {
                valid,
                bad,
                status: HealthStatus::Unhealthy,
                message: "No end points.".to_string(),
            };
        }

        let message = format!("{} healthy instances; {} unhealthy instances", valid, bad);
        let status = if valid == 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Healthy
        };
        Self {
            valid,
            bad,
            status,
            message,
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}
