use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SchedulerError {
    #[error("协议错误: {0}")]
    Protocol(String),
    #[error("未知消息标签: tag={0}")]
    UnknownManifest(u8),
    #[error("数据序列化错误: {0}")]
    Serialization(String),
    #[error("检测到循环依赖，参与循环的节点: {nodes:?}")]
    CycleDetected { nodes: Vec<i64> },
    #[error("数据验证失败: {0}")]
    Validation(String),
    #[error("任务不存在: id={id}")]
    JobNotFound { id: i64 },
    #[error("任务执行实例不存在: id={id}")]
    JobRunNotFound { id: i64 },
    #[error("任务执行失败: {0}")]
    ExecutionFailed(String),
    #[error("操作超时: {0}")]
    Timeout(String),
    #[error("分桶协调失败: {0}")]
    Coordination(String),
    #[error("任务加载失败: {0}")]
    LoadFailed(String),
    #[error("配置错误: {0}")]
    Configuration(String),
    #[error("系统内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn protocol<S: Into<String>>(msg: S) -> Self {
        Self::Protocol(msg.into())
    }
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Self::Validation(msg.into())
    }
    pub fn job_not_found(id: i64) -> Self {
        Self::JobNotFound { id }
    }
    pub fn job_run_not_found(id: i64) -> Self {
        Self::JobRunNotFound { id }
    }
    pub fn execution_failed<S: Into<String>>(msg: S) -> Self {
        Self::ExecutionFailed(msg.into())
    }
    pub fn coordination<S: Into<String>>(msg: S) -> Self {
        Self::Coordination(msg.into())
    }
    pub fn load_failed<S: Into<String>>(msg: S) -> Self {
        Self::LoadFailed(msg.into())
    }
    pub fn config_error<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// 致命错误不应重试，通常意味着部署或代码缺陷
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Configuration(_)
                | SchedulerError::Internal(_)
                | SchedulerError::Protocol(_)
                | SchedulerError::UnknownManifest(_)
        )
    }

    /// 可重试错误由调用方按各自的退避策略处理
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SchedulerError::ExecutionFailed(_)
                | SchedulerError::Timeout(_)
                | SchedulerError::Coordination(_)
                | SchedulerError::LoadFailed(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

impl From<anyhow::Error> for SchedulerError {
    fn from(err: anyhow::Error) -> Self {
        SchedulerError::Internal(err.to_string())
    }
}
