//! 运行时配置
//!
//! 配置从TOML文件加载，并允许通过 `JOBFLOW_` 前缀的环境变量覆盖，
//! 例如 `JOBFLOW_BUCKET__COUNT=128` 覆盖 `[bucket] count`。

use serde::{Deserialize, Serialize};

use crate::errors::SchedulerError;
use crate::SchedulerResult;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub bucket: BucketConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// 本节点地址，作为租约owner和回调地址使用
    #[serde(default = "default_node_address")]
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// 全局分桶总数，集群内所有节点必须一致
    #[serde(default = "default_bucket_count")]
    pub count: u32,
    /// 租约有效期（秒）
    #[serde(default = "default_lease_ttl")]
    pub lease_ttl_seconds: u64,
    /// 租约续期周期（秒），必须小于租约有效期
    #[serde(default = "default_renew_interval")]
    pub renew_interval_seconds: u64,
    /// 一致性哈希环上每个节点的虚拟节点数
    #[serde(default = "default_virtual_nodes")]
    pub virtual_nodes: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// 触发扫描周期（毫秒）
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,
    /// 内存中允许缓存的最大执行实例数，超出部分延后加载
    #[serde(default = "default_max_pending")]
    pub max_pending_runs: usize,
    /// 看门狗在任务超时之外额外等待的宽限期（秒）
    #[serde(default = "default_dispatch_grace")]
    pub dispatch_grace_seconds: u64,
    /// 单个分片的最大重试次数
    #[serde(default = "default_max_split_retry")]
    pub max_split_retry: i32,
    /// 分片重试的初始退避（毫秒），按次数指数增长
    #[serde(default = "default_split_backoff")]
    pub split_backoff_ms: u64,
    /// 分片重试退避上限（毫秒）
    #[serde(default = "default_split_backoff_max")]
    pub split_backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// 工作节点地址
    #[serde(default = "default_worker_address")]
    pub address: String,
    /// 未指定超时的任务使用的默认超时（秒）
    #[serde(default = "default_job_timeout")]
    pub default_timeout_seconds: u64,
}

/// 工作流中任务终态失败后对其余成员的处理策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// 只取消失败任务的（传递）下游，独立分支继续执行
    #[default]
    CancelDependents,
    /// 立即取消工作流中所有尚未开始的成员
    CancelWorkflow,
}

fn default_node_address() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}:18100")
}

fn default_worker_address() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{host}:18200")
}

fn default_bucket_count() -> u32 {
    64
}
fn default_lease_ttl() -> u64 {
    30
}
fn default_renew_interval() -> u64 {
    10
}
fn default_virtual_nodes() -> u32 {
    160
}
fn default_scan_interval() -> u64 {
    1000
}
fn default_max_pending() -> usize {
    10_000
}
fn default_dispatch_grace() -> u64 {
    5
}
fn default_max_split_retry() -> i32 {
    3
}
fn default_split_backoff() -> u64 {
    500
}
fn default_split_backoff_max() -> u64 {
    30_000
}
fn default_job_timeout() -> u64 {
    300
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            address: default_node_address(),
        }
    }
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            count: default_bucket_count(),
            lease_ttl_seconds: default_lease_ttl(),
            renew_interval_seconds: default_renew_interval(),
            virtual_nodes: default_virtual_nodes(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scan_interval_ms: default_scan_interval(),
            max_pending_runs: default_max_pending(),
            dispatch_grace_seconds: default_dispatch_grace(),
            max_split_retry: default_max_split_retry(),
            split_backoff_ms: default_split_backoff(),
            split_backoff_max_ms: default_split_backoff_max(),
        }
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            address: default_worker_address(),
            default_timeout_seconds: default_job_timeout(),
        }
    }
}

impl AppConfig {
    /// 加载配置：TOML文件（可选存在） + `JOBFLOW_` 环境变量覆盖
    pub fn load(config_path: &str) -> SchedulerResult<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("JOBFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| SchedulerError::Configuration(format!("配置构建失败: {e}")))?;

        let app_config: AppConfig = settings
            .try_deserialize()
            .map_err(|e| SchedulerError::Configuration(format!("配置解析失败: {e}")))?;

        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.node.address.is_empty() {
            return Err(SchedulerError::config_error("node.address 不能为空"));
        }
        if self.bucket.count == 0 {
            return Err(SchedulerError::config_error("bucket.count 必须大于0"));
        }
        if self.bucket.renew_interval_seconds >= self.bucket.lease_ttl_seconds {
            return Err(SchedulerError::config_error(
                "bucket.renew_interval_seconds 必须小于 bucket.lease_ttl_seconds",
            ));
        }
        if self.bucket.virtual_nodes == 0 {
            return Err(SchedulerError::config_error("bucket.virtual_nodes 必须大于0"));
        }
        if self.engine.scan_interval_ms == 0 {
            return Err(SchedulerError::config_error("engine.scan_interval_ms 必须大于0"));
        }
        if self.engine.max_pending_runs == 0 {
            return Err(SchedulerError::config_error("engine.max_pending_runs 必须大于0"));
        }
        if self.engine.split_backoff_ms > self.engine.split_backoff_max_ms {
            return Err(SchedulerError::config_error(
                "engine.split_backoff_ms 不能大于 engine.split_backoff_max_ms",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.bucket.count, 64);
        assert_eq!(config.bucket.virtual_nodes, 160);
        assert_eq!(config.workflow.failure_policy, FailurePolicy::CancelDependents);
    }

    #[test]
    fn renew_interval_must_be_below_ttl() {
        let mut config = AppConfig::default();
        config.bucket.renew_interval_seconds = config.bucket.lease_ttl_seconds;
        assert!(config.validate().is_err());
    }

    #[test]
    fn failure_policy_parses_from_snake_case() {
        let policy: FailurePolicy = serde_json::from_str("\"cancel_workflow\"").unwrap();
        assert_eq!(policy, FailurePolicy::CancelWorkflow);
    }

    #[test]
    fn zero_bucket_count_rejected() {
        let mut config = AppConfig::default();
        config.bucket.count = 0;
        assert!(config.validate().is_err());
    }
}
