//! 调度器与执行器之间的封闭消息集合
//!
//! 两个union都是封闭的：新增消息必须同时在codec登记manifest标签，
//! 本地消息（携带运行时句柄或仅在节点内有意义）禁止跨节点编码。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::entities::{JobRunInfo, JobStatus, RouteStrategy, WorkflowStatus};

/// 任务加载的来源，用于日志与加载失败后的差异化处理
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LoadSource {
    /// 节点启动后的首次全量加载
    Init,
    /// 获得新分桶后的补载
    Bucket,
    /// 基于全局max_id的增量加载
    Incremental,
    /// 手动重跑触发的加载
    Rerun,
}

impl LoadSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoadSource::Init => "init",
            LoadSource::Bucket => "bucket",
            LoadSource::Incremental => "incremental",
            LoadSource::Rerun => "rerun",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RefreshOp {
    Update,
    Delete,
}

/// 调度器收到的全部消息
#[derive(Debug, Clone)]
pub enum SchedulerMessage {
    /// 注册/更新一个执行实例；run为None时表示触发内存中已有的实例
    RegisterJob {
        run_id: i64,
        job_id: i64,
        trigger_time: i64,
        priority: i32,
        run: Option<JobRunInfo>,
    },
    /// 执行实例结束（成功/失败/取消），worker_address为空表示来自本地看门狗
    JobCompleted {
        run_id: i64,
        workflow_run_id: i64,
        status: JobStatus,
        message: String,
        worker_address: String,
    },
    /// 单个分片结束
    SplitCompleted {
        run_id: i64,
        split_start: i64,
        split_end: i64,
        status: JobStatus,
        message: String,
        worker_address: String,
    },
    WorkflowCompleted {
        workflow_run_id: i64,
        status: WorkflowStatus,
        message: String,
    },
    /// 触发扫描定时器
    TimerFired,
    /// 启动初始扫描
    StartScan,
    BucketAcquired {
        bucket_id: i32,
    },
    /// 分桶所有权丢失，必须在处理下一条消息前清空该桶的本地状态
    BucketLost {
        bucket_id: i32,
    },
    RenewBuckets,
    /// 后台加载完成，消息路径上不做任何阻塞IO
    JobsLoaded {
        runs: Vec<JobRunInfo>,
        new_max_id: i64,
        source: LoadSource,
    },
    JobsLoadFailed {
        reason: String,
        source: LoadSource,
    },

    // ---- 以下为本地消息，禁止跨节点编码 ----
    /// 分片失败后的退避重试（仅限拥有该实例的节点）
    RetrySplit {
        run_id: i64,
        split_start: i64,
        split_end: i64,
        retry_count: i32,
    },
    /// 全局最大实例id推进，触发增量加载
    GlobalMaxIdChanged {
        max_id: i64,
    },
    CancelWorkflow {
        workflow_run_id: i64,
        reason: String,
    },
    CancelJob {
        run_id: i64,
        reason: String,
    },
    /// 新建实例批次（含工作流依赖边 parent_run -> child_run）
    NewJobsCreated {
        runs: Vec<JobRunInfo>,
        edges: Vec<(i64, i64)>,
        max_id: i64,
    },
    /// 任务定义变更，刷新或删除内存中的实例
    RefreshJobInfo {
        job_id: i64,
        op: RefreshOp,
    },
    /// 分片路由表更新，携带活动信道句柄，天然不可序列化
    ShardingReceiversUpdated {
        receivers: HashMap<i32, mpsc::UnboundedSender<SchedulerMessage>>,
    },
}

impl SchedulerMessage {
    /// 本地消息跨节点编码时直接报协议错误
    pub fn is_local_only(&self) -> bool {
        matches!(
            self,
            SchedulerMessage::RetrySplit { .. }
                | SchedulerMessage::GlobalMaxIdChanged { .. }
                | SchedulerMessage::CancelWorkflow { .. }
                | SchedulerMessage::CancelJob { .. }
                | SchedulerMessage::NewJobsCreated { .. }
                | SchedulerMessage::RefreshJobInfo { .. }
                | SchedulerMessage::ShardingReceiversUpdated { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            SchedulerMessage::RegisterJob { .. } => "RegisterJob",
            SchedulerMessage::JobCompleted { .. } => "JobCompleted",
            SchedulerMessage::SplitCompleted { .. } => "SplitCompleted",
            SchedulerMessage::WorkflowCompleted { .. } => "WorkflowCompleted",
            SchedulerMessage::TimerFired => "TimerFired",
            SchedulerMessage::StartScan => "StartScan",
            SchedulerMessage::BucketAcquired { .. } => "BucketAcquired",
            SchedulerMessage::BucketLost { .. } => "BucketLost",
            SchedulerMessage::RenewBuckets => "RenewBuckets",
            SchedulerMessage::JobsLoaded { .. } => "JobsLoaded",
            SchedulerMessage::JobsLoadFailed { .. } => "JobsLoadFailed",
            SchedulerMessage::RetrySplit { .. } => "RetrySplit",
            SchedulerMessage::GlobalMaxIdChanged { .. } => "GlobalMaxIdChanged",
            SchedulerMessage::CancelWorkflow { .. } => "CancelWorkflow",
            SchedulerMessage::CancelJob { .. } => "CancelJob",
            SchedulerMessage::NewJobsCreated { .. } => "NewJobsCreated",
            SchedulerMessage::RefreshJobInfo { .. } => "RefreshJobInfo",
            SchedulerMessage::ShardingReceiversUpdated { .. } => "ShardingReceiversUpdated",
        }
    }
}

/// 执行器收到的全部消息
#[derive(Debug, Clone)]
pub enum ExecutorMessage {
    ExecuteJob {
        run_id: i64,
        job_id: i64,
        workflow_run_id: i64,
        namespace_id: i64,
        job_name: String,
        job_type: String,
        params: String,
        route_strategy: RouteStrategy,
        timeout_seconds: i64,
        retry_count: i32,
        max_retry_times: i32,
        retry_interval_seconds: i64,
        priority: i32,
        trigger_time: i64,
        /// 分片执行时的子区间，整任务执行时为空
        split_start: Option<i64>,
        split_end: Option<i64>,
        /// 回调地址为不透明字符串，解析是独立的可失败步骤
        callback_address: String,
    },
    CancelJob {
        run_id: i64,
        reason: String,
    },
    QueryStatus {
        run_id: i64,
        callback_address: String,
    },
    /// 执行器自身的超时定时器，仅在节点内流转
    ExecutionTimeout {
        run_id: i64,
    },
}

impl ExecutorMessage {
    pub fn is_local_only(&self) -> bool {
        matches!(self, ExecutorMessage::ExecutionTimeout { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ExecutorMessage::ExecuteJob { .. } => "ExecuteJob",
            ExecutorMessage::CancelJob { .. } => "CancelJob",
            ExecutorMessage::QueryStatus { .. } => "QueryStatus",
            ExecutorMessage::ExecutionTimeout { .. } => "ExecutionTimeout",
        }
    }
}
