//! 端口的内存实现
//!
//! 单机模式和测试共用。跨进程部署时由外部实现替换，
//! 调度核心对此无感知。

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use jobflow_core::{SchedulerError, SchedulerResult};

use crate::entities::{JobDefinition, JobRunInfo, JobStatus, WorkerInfo, WorkflowStatus};
use crate::messages::{ExecutorMessage, SchedulerMessage};
use crate::repositories::{
    CallbackResolver, ExecutorGateway, JobRunStore, JobsPage, LeaseBackend, MembershipView,
    WorkflowStore,
};

/// 内存任务存储
#[derive(Default)]
pub struct MemoryJobStore {
    definitions: RwLock<HashMap<i64, JobDefinition>>,
    runs: RwLock<HashMap<i64, JobRunInfo>>,
    /// 测试用：让所有加载失败
    fail_loads: AtomicBool,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_definition(&self, definition: JobDefinition) {
        self.definitions
            .write()
            .await
            .insert(definition.id, definition);
    }

    pub async fn insert_run(&self, run: JobRunInfo) {
        self.runs.write().await.insert(run.run_id, run);
    }

    pub async fn get_run(&self, run_id: i64) -> Option<JobRunInfo> {
        self.runs.read().await.get(&run_id).cloned()
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    fn check_available(&self) -> SchedulerResult<()> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(SchedulerError::load_failed("存储不可用"));
        }
        Ok(())
    }

    fn page_of(runs: Vec<JobRunInfo>, floor: i64) -> JobsPage {
        let new_max_id = runs
            .iter()
            .map(|r| r.run_id)
            .max()
            .unwrap_or(floor)
            .max(floor);
        JobsPage { runs, new_max_id }
    }
}

#[async_trait]
impl JobRunStore for MemoryJobStore {
    async fn load_waiting(&self, buckets: &[i32]) -> SchedulerResult<JobsPage> {
        self.check_available()?;
        let runs = self.runs.read().await;
        let matched: Vec<JobRunInfo> = runs
            .values()
            .filter(|r| r.status == JobStatus::Waiting && buckets.contains(&r.bucket_id))
            .cloned()
            .collect();
        Ok(Self::page_of(matched, 0))
    }

    async fn load_new_since(&self, max_id: i64, buckets: &[i32]) -> SchedulerResult<JobsPage> {
        self.check_available()?;
        let runs = self.runs.read().await;
        let matched: Vec<JobRunInfo> = runs
            .values()
            .filter(|r| {
                r.run_id > max_id
                    && r.status == JobStatus::Waiting
                    && buckets.contains(&r.bucket_id)
            })
            .cloned()
            .collect();
        Ok(Self::page_of(matched, max_id))
    }

    async fn load_definition(&self, job_id: i64) -> SchedulerResult<Option<JobDefinition>> {
        self.check_available()?;
        Ok(self.definitions.read().await.get(&job_id).cloned())
    }

    async fn update_run_status(
        &self,
        run_id: i64,
        status: JobStatus,
        message: &str,
    ) -> SchedulerResult<()> {
        let mut runs = self.runs.write().await;
        if let Some(run) = runs.get_mut(&run_id) {
            run.status = status;
            debug!("实例 {run_id} 状态回写为 {}: {message}", status.as_str());
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryWorkflowStore {
    statuses: RwLock<HashMap<i64, (WorkflowStatus, String)>>,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_status(&self, workflow_run_id: i64) -> Option<(WorkflowStatus, String)> {
        self.statuses.read().await.get(&workflow_run_id).cloned()
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn update_workflow_status(
        &self,
        workflow_run_id: i64,
        status: WorkflowStatus,
        message: &str,
    ) -> SchedulerResult<()> {
        self.statuses
            .write()
            .await
            .insert(workflow_run_id, (status, message.to_string()));
        Ok(())
    }
}

/// 静态成员视图
#[derive(Default)]
pub struct StaticMembership {
    schedulers: RwLock<Vec<String>>,
    workers: RwLock<Vec<WorkerInfo>>,
}

impl StaticMembership {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_schedulers(&self, schedulers: Vec<String>) {
        *self.schedulers.write().await = schedulers;
    }

    pub async fn set_workers(&self, workers: Vec<WorkerInfo>) {
        *self.workers.write().await = workers;
    }
}

#[async_trait]
impl MembershipView for StaticMembership {
    async fn alive_schedulers(&self) -> SchedulerResult<Vec<String>> {
        Ok(self.schedulers.read().await.clone())
    }

    async fn alive_workers(&self) -> SchedulerResult<Vec<WorkerInfo>> {
        Ok(self.workers.read().await.clone())
    }
}

struct LeaseEntry {
    owner: String,
    expires_at: Instant,
}

/// 内存租约后端，CAS语义与外部存储实现保持一致
#[derive(Default)]
pub struct MemoryLeaseBackend {
    leases: Mutex<HashMap<i32, LeaseEntry>>,
}

impl MemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn current_owner(&self, bucket_id: i32) -> Option<String> {
        let leases = self.leases.lock().await;
        leases.get(&bucket_id).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.owner.clone())
            } else {
                None
            }
        })
    }

    /// 测试用：立刻让租约过期
    pub async fn force_expire(&self, bucket_id: i32) {
        let mut leases = self.leases.lock().await;
        if let Some(entry) = leases.get_mut(&bucket_id) {
            entry.expires_at = Instant::now() - Duration::from_secs(1);
        }
    }
}

#[async_trait]
impl LeaseBackend for MemoryLeaseBackend {
    async fn try_acquire(
        &self,
        bucket_id: i32,
        owner: &str,
        ttl: Duration,
    ) -> SchedulerResult<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        match leases.get(&bucket_id) {
            Some(entry) if entry.expires_at > now && entry.owner != owner => Ok(false),
            _ => {
                leases.insert(
                    bucket_id,
                    LeaseEntry {
                        owner: owner.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn renew(&self, bucket_id: i32, owner: &str, ttl: Duration) -> SchedulerResult<bool> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        match leases.get_mut(&bucket_id) {
            Some(entry) if entry.owner == owner && entry.expires_at > now => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, bucket_id: i32, owner: &str) -> SchedulerResult<()> {
        let mut leases = self.leases.lock().await;
        if let Some(entry) = leases.get(&bucket_id) {
            if entry.owner == owner {
                leases.remove(&bucket_id);
            }
        }
        Ok(())
    }
}

/// 进程内执行器网关，按地址把消息投递到工作节点信道
#[derive(Default)]
pub struct ChannelGateway {
    workers: RwLock<HashMap<String, mpsc::UnboundedSender<ExecutorMessage>>>,
}

impl ChannelGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register_worker(
        &self,
        address: &str,
        sender: mpsc::UnboundedSender<ExecutorMessage>,
    ) {
        self.workers
            .write()
            .await
            .insert(address.to_string(), sender);
    }
}

#[async_trait]
impl ExecutorGateway for ChannelGateway {
    async fn send(&self, worker_address: &str, message: ExecutorMessage) -> SchedulerResult<()> {
        // 与跨节点编码保持相同的约束
        if message.is_local_only() {
            return Err(SchedulerError::protocol(format!(
                "本地消息不允许跨节点发送: {}",
                message.name()
            )));
        }
        let workers = self.workers.read().await;
        let sender = workers.get(worker_address).ok_or_else(|| {
            SchedulerError::coordination(format!("未知的工作节点地址: {worker_address}"))
        })?;
        sender.send(message).map_err(|_| {
            SchedulerError::coordination(format!("工作节点信道已关闭: {worker_address}"))
        })
    }
}

/// 进程内回调解析器
#[derive(Default)]
pub struct ChannelResolver {
    endpoints: RwLock<HashMap<String, mpsc::UnboundedSender<SchedulerMessage>>>,
}

impl ChannelResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, address: &str, sender: mpsc::UnboundedSender<SchedulerMessage>) {
        self.endpoints
            .write()
            .await
            .insert(address.to_string(), sender);
    }
}

#[async_trait]
impl CallbackResolver for ChannelResolver {
    async fn deliver(
        &self,
        callback_address: &str,
        message: SchedulerMessage,
    ) -> SchedulerResult<()> {
        let endpoints = self.endpoints.read().await;
        let sender = endpoints.get(callback_address).ok_or_else(|| {
            SchedulerError::protocol(format!("无法解析回调地址: {callback_address}"))
        })?;
        sender.send(message).map_err(|_| {
            SchedulerError::coordination(format!("回调信道已关闭: {callback_address}"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lease_cas_blocks_second_owner() {
        let backend = MemoryLeaseBackend::new();
        let ttl = Duration::from_secs(30);
        assert!(backend.try_acquire(1, "node-a", ttl).await.unwrap());
        assert!(!backend.try_acquire(1, "node-b", ttl).await.unwrap());
        // 同一owner重复获取是幂等的
        assert!(backend.try_acquire(1, "node-a", ttl).await.unwrap());
        assert_eq!(backend.current_owner(1).await.as_deref(), Some("node-a"));
    }

    #[tokio::test]
    async fn expired_lease_can_be_taken_over() {
        let backend = MemoryLeaseBackend::new();
        let ttl = Duration::from_secs(30);
        assert!(backend.try_acquire(1, "node-a", ttl).await.unwrap());
        backend.force_expire(1).await;
        assert!(!backend.renew(1, "node-a", ttl).await.unwrap());
        assert!(backend.try_acquire(1, "node-b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn release_only_affects_own_lease() {
        let backend = MemoryLeaseBackend::new();
        let ttl = Duration::from_secs(30);
        assert!(backend.try_acquire(1, "node-a", ttl).await.unwrap());
        backend.release(1, "node-b").await.unwrap();
        assert_eq!(backend.current_owner(1).await.as_deref(), Some("node-a"));
        backend.release(1, "node-a").await.unwrap();
        assert_eq!(backend.current_owner(1).await, None);
    }

    #[tokio::test]
    async fn store_filters_by_bucket_and_status() {
        let store = MemoryJobStore::new();
        let mut run = crate::test_support::sample_run(1, 0);
        run.bucket_id = 5;
        store.insert_run(run.clone()).await;
        let mut other = crate::test_support::sample_run(2, 0);
        other.bucket_id = 9;
        store.insert_run(other).await;

        let page = store.load_waiting(&[5]).await.unwrap();
        assert_eq!(page.runs.len(), 1);
        assert_eq!(page.runs[0].run_id, 1);
    }

    #[tokio::test]
    async fn incremental_load_respects_max_id() {
        let store = MemoryJobStore::new();
        for id in 1..=4 {
            let mut run = crate::test_support::sample_run(id, 0);
            run.bucket_id = 0;
            store.insert_run(run).await;
        }
        let page = store.load_new_since(2, &[0]).await.unwrap();
        let mut ids: Vec<i64> = page.runs.iter().map(|r| r.run_id).collect();
        ids.sort_unstable();
        assert_eq!(ids, vec![3, 4]);
        assert_eq!(page.new_max_id, 4);
    }

    #[tokio::test]
    async fn failing_store_reports_load_failed() {
        let store = MemoryJobStore::new();
        store.set_fail_loads(true);
        let err = store.load_waiting(&[0]).await.unwrap_err();
        assert!(matches!(err, SchedulerError::LoadFailed(_)));
    }

    #[tokio::test]
    async fn resolver_rejects_unknown_address() {
        let resolver = ChannelResolver::new();
        let err = resolver
            .deliver("nowhere:0", SchedulerMessage::TimerFired)
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Protocol(_)));
    }

    #[tokio::test]
    async fn gateway_refuses_local_only_messages() {
        let gateway = ChannelGateway::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        gateway.register_worker("w1:18200", tx).await;
        let err = gateway
            .send("w1:18200", ExecutorMessage::ExecutionTimeout { run_id: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::Protocol(_)));
    }
}
