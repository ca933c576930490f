//! 路由策略
//!
//! 所有策略先按容量和任务类型过滤候选节点，再做各自的选择。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rand::Rng;
use tracing::debug;

use jobflow_core::SchedulerResult;
use jobflow_domain::entities::{JobRunInfo, RouteStrategy, WorkerInfo};
use jobflow_domain::repositories::RouteSelector;

fn suitable<'a>(run: &JobRunInfo, workers: &'a [WorkerInfo]) -> Vec<&'a WorkerInfo> {
    workers
        .iter()
        .filter(|worker| worker.can_accept(&run.job_type))
        .collect()
}

/// 选择首个可用节点（默认策略）
pub struct FirstAvailableStrategy;

impl FirstAvailableStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FirstAvailableStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteSelector for FirstAvailableStrategy {
    async fn select(
        &self,
        run: &JobRunInfo,
        workers: &[WorkerInfo],
    ) -> SchedulerResult<Option<String>> {
        let candidates = suitable(run, workers);
        if candidates.is_empty() {
            debug!("没有支持任务类型 {} 的可用节点", run.job_type);
            return Ok(None);
        }
        Ok(Some(candidates[0].address.clone()))
    }

    fn name(&self) -> &str {
        "FirstAvailable"
    }
}

pub struct RoundRobinStrategy {
    counter: AtomicUsize,
}

impl RoundRobinStrategy {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobinStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteSelector for RoundRobinStrategy {
    async fn select(
        &self,
        run: &JobRunInfo,
        workers: &[WorkerInfo],
    ) -> SchedulerResult<Option<String>> {
        let candidates = suitable(run, workers);
        if candidates.is_empty() {
            debug!("没有支持任务类型 {} 的可用节点", run.job_type);
            return Ok(None);
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        let selected = candidates[index];
        debug!(
            "轮询策略选择节点: {} (索引: {}/{})",
            selected.address,
            index,
            candidates.len()
        );
        Ok(Some(selected.address.clone()))
    }

    fn name(&self) -> &str {
        "RoundRobin"
    }
}

pub struct RandomStrategy;

impl RandomStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RandomStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouteSelector for RandomStrategy {
    async fn select(
        &self,
        run: &JobRunInfo,
        workers: &[WorkerInfo],
    ) -> SchedulerResult<Option<String>> {
        let candidates = suitable(run, workers);
        if candidates.is_empty() {
            debug!("没有支持任务类型 {} 的可用节点", run.job_type);
            return Ok(None);
        }
        let index = rand::rng().random_range(0..candidates.len());
        Ok(Some(candidates[index].address.clone()))
    }

    fn name(&self) -> &str {
        "Random"
    }
}

/// 路由策略注册表，按实例上的策略字段取selector
///
/// Split策略的扇出在引擎里处理，单个分片仍用默认selector选节点。
pub struct SelectorRegistry {
    first: Arc<dyn RouteSelector>,
    round_robin: Arc<dyn RouteSelector>,
    random: Arc<dyn RouteSelector>,
}

impl SelectorRegistry {
    pub fn new() -> Self {
        Self {
            first: Arc::new(FirstAvailableStrategy::new()),
            round_robin: Arc::new(RoundRobinStrategy::new()),
            random: Arc::new(RandomStrategy::new()),
        }
    }

    pub fn for_strategy(&self, strategy: RouteStrategy) -> Arc<dyn RouteSelector> {
        match strategy {
            RouteStrategy::First | RouteStrategy::Split => self.first.clone(),
            RouteStrategy::RoundRobin => self.round_robin.clone(),
            RouteStrategy::Random => self.random.clone(),
        }
    }
}

impl Default for SelectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_domain::entities::{BlockStrategy, JobStatus};

    fn run() -> JobRunInfo {
        JobRunInfo {
            run_id: 1,
            job_id: 1,
            workflow_run_id: 0,
            bucket_id: 0,
            namespace_id: 1,
            job_name: "t".to_string(),
            job_type: "shell".to_string(),
            params: String::new(),
            route_strategy: RouteStrategy::First,
            block_strategy: BlockStrategy::Parallel,
            timeout_seconds: 60,
            max_retry_times: 0,
            retry_count: 0,
            retry_interval_seconds: 0,
            priority: 0,
            trigger_time: 0,
            status: JobStatus::Waiting,
            split_spec: None,
            worker_address: None,
            parent_run_ids: Vec::new(),
        }
    }

    fn workers() -> Vec<WorkerInfo> {
        vec![
            WorkerInfo {
                address: "w1:18200".to_string(),
                capacity: 5,
                running_jobs: 0,
                supported_job_types: Vec::new(),
            },
            WorkerInfo {
                address: "w2:18200".to_string(),
                capacity: 5,
                running_jobs: 0,
                supported_job_types: Vec::new(),
            },
        ]
    }

    #[tokio::test]
    async fn first_available_picks_head() {
        let strategy = FirstAvailableStrategy::new();
        let selected = strategy.select(&run(), &workers()).await.unwrap();
        assert_eq!(selected.as_deref(), Some("w1:18200"));
    }

    #[tokio::test]
    async fn round_robin_cycles() {
        let strategy = RoundRobinStrategy::new();
        let a = strategy.select(&run(), &workers()).await.unwrap();
        let b = strategy.select(&run(), &workers()).await.unwrap();
        let c = strategy.select(&run(), &workers()).await.unwrap();
        assert_eq!(a.as_deref(), Some("w1:18200"));
        assert_eq!(b.as_deref(), Some("w2:18200"));
        assert_eq!(c.as_deref(), Some("w1:18200"));
    }

    #[tokio::test]
    async fn full_workers_are_skipped() {
        let strategy = FirstAvailableStrategy::new();
        let mut pool = workers();
        pool[0].running_jobs = 5;
        let selected = strategy.select(&run(), &pool).await.unwrap();
        assert_eq!(selected.as_deref(), Some("w2:18200"));
        pool[1].running_jobs = 5;
        assert_eq!(strategy.select(&run(), &pool).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unsupported_job_type_yields_none() {
        let strategy = RandomStrategy::new();
        let mut pool = workers();
        pool[0].supported_job_types = vec!["sql".to_string()];
        pool[1].supported_job_types = vec!["sql".to_string()];
        assert_eq!(strategy.select(&run(), &pool).await.unwrap(), None);
    }
}
