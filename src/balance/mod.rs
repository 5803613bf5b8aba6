//! 负载均衡模块
//!
//! 从候选端点中排除坏端点和本次调用已尝试过的端点后选出一个

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::discovery::ServiceEndPoint;

/// 负载均衡算法
///
/// 绝不能返回 `excluded` 中的端点，即使它是唯一的候选
pub trait LoadBalanceAlgorithm: Send + Sync {
    fn choose(
        &self,
        candidates: &[ServiceEndPoint],
        excluded: &HashSet<ServiceEndPoint>,
    ) -> Option<ServiceEndPoint>;
}

fn eligible<'a>(
    candidates: &'a [ServiceEndPoint],
    excluded: &HashSet<ServiceEndPoint>,
) -> Vec<&'a ServiceEndPoint> {
    candidates
        .iter()
        .filter(|end_point| !excluded.contains(*end_point))
        .collect()
}

/// 均匀随机选择（默认）
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomAlgorithm;

impl LoadBalanceAlgorithm for RandomAlgorithm {
    fn choose(
        &self,
        candidates: &[ServiceEndPoint],
        excluded: &HashSet<ServiceEndPoint>,
    ) -> Option<ServiceEndPoint> {
        let eligible = eligible(candidates, excluded);
        if eligible.is_empty() {
            return None;
        }
        let index = rand::thread_rng().gen_range(0..eligible.len());
        Some(eligible[index].clone())
    }
}

/// 轮询选择
///
/// 候选端点按身份排序后轮询，不依赖服务发现返回的顺序
#[derive(Debug, Default)]
pub struct RoundRobinAlgorithm {
    next: AtomicUsize,
}

impl RoundRobinAlgorithm {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalanceAlgorithm for RoundRobinAlgorithm {
    fn choose(
        &self,
        candidates: &[ServiceEndPoint],
        excluded: &HashSet<ServiceEndPoint>,
    ) -> Option<ServiceEndPoint> {
        let mut eligible = eligible(candidates, excluded);
        if eligible.is_empty() {
            return None;
        }
        eligible.sort_by_key(|end_point| end_point.key());
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        Some(eligible[index % eligible.len()].clone())
    }
}

/// 负载均衡策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceStrategy {
    /// 随机（Random）
    #[default]
    Random,
    /// 轮询（Round Robin）
    RoundRobin,
}

impl LoadBalanceStrategy {
    /// 构建对应的算法实例
    pub fn build(&self) -> Arc<dyn LoadBalanceAlgorithm> {
        match self {
            LoadBalanceStrategy::Random => Arc::new(RandomAlgorithm),
            LoadBalanceStrategy::RoundRobin => Arc::new(RoundRobinAlgorithm::new()),
        }
    }
}

impl std::str::FromStr for LoadBalanceStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random" => Ok(LoadBalanceStrategy::Random),
            "round_robin" | "round-robin" | "roundrobin" => Ok(LoadBalanceStrategy::RoundRobin),
            _ => Err(format!("Unknown load balance strategy: {}", s)),
        }
    }
}
