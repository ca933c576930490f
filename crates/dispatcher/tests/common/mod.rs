//! 测试共用的构造器与记录用mock

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use jobflow_core::{SchedulerError, SchedulerResult};
use jobflow_domain::entities::{
    BlockStrategy, JobDefinition, JobRunInfo, JobStatus, RouteStrategy, WorkerInfo,
};
use jobflow_domain::memory::MemoryJobStore;
use jobflow_domain::messages::ExecutorMessage;
use jobflow_domain::repositories::{ExecutorGateway, JobRunStore, JobsPage};

pub fn sample_run(run_id: i64, bucket_id: i32) -> JobRunInfo {
    JobRunInfo {
        run_id,
        job_id: run_id,
        workflow_run_id: 0,
        bucket_id,
        namespace_id: 1,
        job_name: format!("job-{run_id}"),
        job_type: "echo".to_string(),
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

pub fn worker(address: &str) -> WorkerInfo {
    WorkerInfo {
        address: address.to_string(),
        capacity: 10,
        running_jobs: 0,
        supported_job_types: Vec::new(),
    }
}

/// 首次状态回写被人为拖慢的存储，用来检验回写的先后次序
#[allow(dead_code)]
pub struct StaggeredStore {
    inner: MemoryJobStore,
    stall_first: AtomicBool,
}

#[allow(dead_code)]
impl StaggeredStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryJobStore::new(),
            stall_first: AtomicBool::new(true),
        }
    }

    pub async fn insert_run(&self, run: JobRunInfo) {
        self.inner.insert_run(run).await;
    }

    pub async fn get_run(&self, run_id: i64) -> Option<JobRunInfo> {
        self.inner.get_run(run_id).await
    }
}

#[async_trait]
impl JobRunStore for StaggeredStore {
    async fn load_waiting(&self, buckets: &[i32]) -> SchedulerResult<JobsPage> {
        self.inner.load_waiting(buckets).await
    }

    async fn load_new_since(&self, max_id: i64, buckets: &[i32]) -> SchedulerResult<JobsPage> {
        self.inner.load_new_since(max_id, buckets).await
    }

    async fn load_definition(&self, job_id: i64) -> SchedulerResult<Option<JobDefinition>> {
        self.inner.load_definition(job_id).await
    }

    async fn update_run_status(
        &self,
        run_id: i64,
        status: JobStatus,
        message: &str,
    ) -> SchedulerResult<()> {
        if self.stall_first.swap(false, Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.inner.update_run_status(run_id, status, message).await
    }
}

/// 记录全部投递的执行器网关
#[derive(Default)]
pub struct RecordingGateway {
    sent: Mutex<Vec<(String, ExecutorMessage)>>,
    fail: AtomicBool,
}

impl RecordingGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, ExecutorMessage)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait]
impl ExecutorGateway for RecordingGateway {
    async fn send(&self, worker_address: &str, message: ExecutorMessage) -> SchedulerResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SchedulerError::coordination("网关不可用"));
        }
        self.sent
            .lock()
            .unwrap()
            .push((worker_address.to_string(), message));
        Ok(())
    }
}
