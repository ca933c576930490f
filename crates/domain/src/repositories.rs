//! 外部协作端口
//!
//! 调度核心只通过这些trait访问外部世界，实现以 `Arc<dyn T>` 注入。
//! 内存实现见 [`crate::memory`]。

use std::time::Duration;

use async_trait::async_trait;

use jobflow_core::SchedulerResult;

use crate::entities::{JobDefinition, JobRunInfo, JobStatus, WorkerInfo, WorkflowStatus};
use crate::messages::{ExecutorMessage, SchedulerMessage};

/// 一次加载的结果页
#[derive(Debug, Clone)]
pub struct JobsPage {
    pub runs: Vec<JobRunInfo>,
    /// 本页覆盖到的最大实例id，作为下次增量加载的起点
    pub new_max_id: i64,
}

/// 执行实例与任务定义的读取/回写
///
/// 状态回写是fire-and-forget语义：失败只记录日志，不阻塞内存推进。
#[async_trait]
pub trait JobRunStore: Send + Sync {
    /// 加载指定分桶内所有WAITING状态的实例
    async fn load_waiting(&self, buckets: &[i32]) -> SchedulerResult<JobsPage>;

    /// 加载id大于max_id且属于指定分桶的实例
    async fn load_new_since(&self, max_id: i64, buckets: &[i32]) -> SchedulerResult<JobsPage>;

    async fn load_definition(&self, job_id: i64) -> SchedulerResult<Option<JobDefinition>>;

    async fn update_run_status(
        &self,
        run_id: i64,
        status: JobStatus,
        message: &str,
    ) -> SchedulerResult<()>;
}

#[async_trait]
pub trait WorkflowStore: Send + Sync {
    async fn update_workflow_status(
        &self,
        workflow_run_id: i64,
        status: WorkflowStatus,
        message: &str,
    ) -> SchedulerResult<()>;
}

/// 分桶租约仲裁，唯一的所有权权威
///
/// 三个操作都是CAS语义：只有owner匹配（或桶无主/已过期）才成功。
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// 尝试获取租约，返回是否成功
    async fn try_acquire(&self, bucket_id: i32, owner: &str, ttl: Duration)
        -> SchedulerResult<bool>;

    /// 续期，owner不匹配或租约已丢失时返回false
    async fn renew(&self, bucket_id: i32, owner: &str, ttl: Duration) -> SchedulerResult<bool>;

    /// 释放自己持有的租约，幂等
    async fn release(&self, bucket_id: i32, owner: &str) -> SchedulerResult<()>;
}

/// 集群成员视图
#[async_trait]
pub trait MembershipView: Send + Sync {
    /// 存活的调度节点地址，用于一致性哈希分桶
    async fn alive_schedulers(&self) -> SchedulerResult<Vec<String>>;

    /// 存活的工作节点及其容量
    async fn alive_workers(&self) -> SchedulerResult<Vec<WorkerInfo>>;
}

/// 向工作节点投递执行器消息
#[async_trait]
pub trait ExecutorGateway: Send + Sync {
    async fn send(&self, worker_address: &str, message: ExecutorMessage) -> SchedulerResult<()>;
}

/// 按回调地址解析并投递调度器消息
///
/// 地址是不透明字符串，解析失败是正常的可失败路径。
#[async_trait]
pub trait CallbackResolver: Send + Sync {
    async fn deliver(
        &self,
        callback_address: &str,
        message: SchedulerMessage,
    ) -> SchedulerResult<()>;
}

/// 路由策略：从可用节点中为实例挑选一个目标
#[async_trait]
pub trait RouteSelector: Send + Sync {
    async fn select(
        &self,
        run: &JobRunInfo,
        workers: &[WorkerInfo],
    ) -> SchedulerResult<Option<String>>;

    fn name(&self) -> &str;
}
