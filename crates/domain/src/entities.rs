//! 核心实体定义
//!
//! 实体全部为纯数据结构，由调度引擎在单线程内独占修改，
//! 持久化和传输时通过serde序列化。

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use jobflow_core::{SchedulerError, SchedulerResult};

/// 任务定义，对调度核心只读
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: i64,
    pub namespace_id: i64,
    pub name: String,
    pub job_type: String,
    /// 任务参数，对核心不透明的JSON字符串
    #[serde(default)]
    pub params: String,
    /// cron表达式（秒级，7字段），空串表示仅手动/依赖触发
    #[serde(default)]
    pub cron_expression: String,
    #[serde(default)]
    pub route_strategy: RouteStrategy,
    #[serde(default)]
    pub block_strategy: BlockStrategy,
    pub timeout_seconds: i64,
    pub max_retry_times: i32,
    pub retry_interval_seconds: i64,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub split_spec: Option<SplitSpec>,
}

impl JobDefinition {
    /// 计算给定时刻之后的下一次触发时间（epoch毫秒）
    pub fn next_trigger_after(&self, after: DateTime<Utc>) -> SchedulerResult<Option<i64>> {
        if self.cron_expression.is_empty() {
            return Ok(None);
        }
        let schedule = cron::Schedule::from_str(&self.cron_expression).map_err(|e| {
            SchedulerError::validation(format!(
                "无效的cron表达式 {}: {e}",
                self.cron_expression
            ))
        })?;
        Ok(schedule.after(&after).next().map(|t| t.timestamp_millis()))
    }
}

/// 任务执行实例
///
/// 任务定义的字段在创建时冗余到实例上，调度期间不再回查定义。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRunInfo {
    pub run_id: i64,
    pub job_id: i64,
    /// 所属工作流执行实例，0表示独立任务
    #[serde(default)]
    pub workflow_run_id: i64,
    pub bucket_id: i32,
    #[serde(default)]
    pub namespace_id: i64,
    pub job_name: String,
    pub job_type: String,
    #[serde(default)]
    pub params: String,
    #[serde(default)]
    pub route_strategy: RouteStrategy,
    #[serde(default)]
    pub block_strategy: BlockStrategy,
    pub timeout_seconds: i64,
    pub max_retry_times: i32,
    #[serde(default)]
    pub retry_count: i32,
    pub retry_interval_seconds: i64,
    #[serde(default)]
    pub priority: i32,
    /// 计划触发时间（epoch毫秒）
    pub trigger_time: i64,
    pub status: JobStatus,
    #[serde(default)]
    pub split_spec: Option<SplitSpec>,
    /// 当前执行所在的工作节点地址
    #[serde(default)]
    pub worker_address: Option<String>,
    /// 工作流内的前置执行实例
    #[serde(default)]
    pub parent_run_ids: Vec<i64>,
}

impl JobRunInfo {
    pub fn from_definition(
        definition: &JobDefinition,
        run_id: i64,
        workflow_run_id: i64,
        trigger_time: i64,
        bucket_count: u32,
    ) -> Self {
        Self {
            run_id,
            job_id: definition.id,
            workflow_run_id,
            bucket_id: bucket_of(trigger_time, bucket_count),
            namespace_id: definition.namespace_id,
            job_name: definition.name.clone(),
            job_type: definition.job_type.clone(),
            params: definition.params.clone(),
            route_strategy: definition.route_strategy,
            block_strategy: definition.block_strategy,
            timeout_seconds: definition.timeout_seconds,
            max_retry_times: definition.max_retry_times,
            retry_count: 0,
            retry_interval_seconds: definition.retry_interval_seconds,
            priority: definition.priority,
            trigger_time,
            status: JobStatus::Waiting,
            split_spec: definition.split_spec,
            worker_address: None,
            parent_run_ids: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 从最新的任务定义刷新冗余字段，只影响尚未进入执行的字段
    pub fn refresh_from(&mut self, definition: &JobDefinition) {
        self.job_name = definition.name.clone();
        self.job_type = definition.job_type.clone();
        self.params = definition.params.clone();
        self.route_strategy = definition.route_strategy;
        self.block_strategy = definition.block_strategy;
        self.timeout_seconds = definition.timeout_seconds;
        self.max_retry_times = definition.max_retry_times;
        self.retry_interval_seconds = definition.retry_interval_seconds;
        self.priority = definition.priority;
        self.split_spec = definition.split_spec;
    }
}

/// 按触发时间映射分桶，同一集群内映射必须一致
pub fn bucket_of(trigger_time: i64, bucket_count: u32) -> i32 {
    debug_assert!(bucket_count > 0);
    (trigger_time.rem_euclid(bucket_count as i64)) as i32
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum JobStatus {
    #[serde(rename = "WAITING")]
    Waiting,
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "WAITING",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    /// 终态集合固定为 SUCCESS / FAILED / CANCELLED，超时不是终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum WorkflowStatus {
    #[serde(rename = "PENDING")]
    Pending,
    #[serde(rename = "SUCCESS")]
    Success,
    #[serde(rename = "FAILED")]
    Failed,
    #[serde(rename = "CANCELLED")]
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "PENDING",
            WorkflowStatus::Success => "SUCCESS",
            WorkflowStatus::Failed => "FAILED",
            WorkflowStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, WorkflowStatus::Pending)
    }
}

/// 同一任务已有实例在执行时，新触发的处理策略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum BlockStrategy {
    /// 并行执行，互不影响
    #[serde(rename = "PARALLEL")]
    #[default]
    Parallel,
    /// 丢弃新触发
    #[serde(rename = "DISCARD")]
    Discard,
    /// 新触发排队等待当前实例结束
    #[serde(rename = "SERIAL")]
    Serial,
    /// 取消执行中的实例，改跑新触发
    #[serde(rename = "COVER_EARLY")]
    CoverEarly,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum RouteStrategy {
    /// 选择首个可用节点
    #[serde(rename = "FIRST")]
    #[default]
    First,
    #[serde(rename = "ROUND_ROBIN")]
    RoundRobin,
    #[serde(rename = "RANDOM")]
    Random,
    /// 按分片范围扇出到多个节点
    #[serde(rename = "SPLIT")]
    Split,
}

/// 分片定义：把 [start, end) 按chunk切为互不重叠的子区间
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SplitSpec {
    pub start: i64,
    pub end: i64,
    pub chunk: i64,
}

impl SplitSpec {
    pub fn is_valid(&self) -> bool {
        self.start < self.end && self.chunk > 0
    }

    /// 切分出的子区间按起点升序，首尾相接且覆盖整个范围
    pub fn chunks(&self) -> Vec<(i64, i64)> {
        if !self.is_valid() {
            return Vec::new();
        }
        let mut ranges = Vec::new();
        let mut cursor = self.start;
        while cursor < self.end {
            let upper = (cursor + self.chunk).min(self.end);
            ranges.push((cursor, upper));
            cursor = upper;
        }
        ranges
    }
}

/// 工作节点视图，由成员关系端口提供
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub address: String,
    /// 可同时执行的任务数上限
    pub capacity: i32,
    #[serde(default)]
    pub running_jobs: i32,
    /// 支持的任务类型，空表示全部支持
    #[serde(default)]
    pub supported_job_types: Vec<String>,
}

impl WorkerInfo {
    pub fn can_accept(&self, job_type: &str) -> bool {
        if self.running_jobs >= self.capacity {
            return false;
        }
        self.supported_job_types.is_empty()
            || self.supported_job_types.iter().any(|t| t == job_type)
    }
}
