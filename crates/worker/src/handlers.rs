//! 任务处理器
//!
//! 处理器按任务类型注册，执行器收到 `ExecuteJob` 后按类型分发。
//! 返回值作为执行结果消息回传给调度器。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use jobflow_core::SchedulerResult;

/// 一次执行的上下文，分片执行时携带子区间
#[derive(Debug, Clone)]
pub struct JobContext {
    pub run_id: i64,
    pub job_id: i64,
    pub job_name: String,
    pub job_type: String,
    pub params: String,
    pub retry_count: i32,
    pub split_start: Option<i64>,
    pub split_end: Option<i64>,
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn execute(&self, ctx: &JobContext) -> SchedulerResult<String>;

    fn name(&self) -> &str;
}

/// 原样回显参数，用于连通性验证
pub struct EchoHandler;

#[async_trait]
impl JobHandler for EchoHandler {
    async fn execute(&self, ctx: &JobContext) -> SchedulerResult<String> {
        debug!("echo处理器执行实例 {}", ctx.run_id);
        match (ctx.split_start, ctx.split_end) {
            (Some(start), Some(end)) => Ok(format!("echo[{start},{end}): {}", ctx.params)),
            _ => Ok(format!("echo: {}", ctx.params)),
        }
    }

    fn name(&self) -> &str {
        "echo"
    }
}

/// 按任务类型索引的处理器注册表
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// 注册内置处理器
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("echo", Arc::new(EchoHandler));
        registry
    }

    pub fn register(&mut self, job_type: &str, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job_type.to_string(), handler);
    }

    pub fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type).cloned()
    }

    pub fn supported_types(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> JobContext {
        JobContext {
            run_id: 1,
            job_id: 1,
            job_name: "t".to_string(),
            job_type: "echo".to_string(),
            params: "hello".to_string(),
            retry_count: 0,
            split_start: None,
            split_end: None,
        }
    }

    #[tokio::test]
    async fn echo_returns_params() {
        let handler = EchoHandler;
        let result = handler.execute(&ctx()).await.unwrap();
        assert_eq!(result, "echo: hello");
    }

    #[tokio::test]
    async fn echo_includes_split_range() {
        let mut context = ctx();
        context.split_start = Some(0);
        context.split_end = Some(10);
        let result = EchoHandler.execute(&context).await.unwrap();
        assert_eq!(result, "echo[0,10): hello");
    }

    #[test]
    fn registry_resolves_by_type() {
        let registry = HandlerRegistry::with_builtins();
        assert!(registry.get("echo").is_some());
        assert!(registry.get("shell").is_none());
        assert_eq!(registry.supported_types(), vec!["echo".to_string()]);
    }
}
