//! 任务执行器运行时
//!
//! 单循环消费执行器消息，任务在独立task中运行，完成事件回流到
//! 循环后统一投递回调。处理器panic被捕获并转为失败结果，
//! 不会带崩整个工作节点。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use jobflow_core::config::WorkerConfig;
use jobflow_domain::entities::JobStatus;
use jobflow_domain::messages::{ExecutorMessage, SchedulerMessage};
use jobflow_domain::repositories::CallbackResolver;

use crate::handlers::{HandlerRegistry, JobContext};

/// 同一实例的不同分片可以同时在一个节点上执行
type RunKey = (i64, Option<(i64, i64)>);

struct RunningJob {
    handle: JoinHandle<()>,
    workflow_run_id: i64,
    callback_address: String,
}

enum WorkerEvent {
    Finished {
        key: RunKey,
        status: JobStatus,
        message: String,
    },
}

pub struct WorkerRuntime {
    address: String,
    config: WorkerConfig,
    registry: Arc<HandlerRegistry>,
    resolver: Arc<dyn CallbackResolver>,
    running: HashMap<RunKey, RunningJob>,
    /// 最近完成的非分片实例，用于QueryStatus补发丢失的回调
    recent: HashMap<i64, (i64, JobStatus, String)>,
    event_tx: mpsc::UnboundedSender<WorkerEvent>,
    event_rx: Option<mpsc::UnboundedReceiver<WorkerEvent>>,
}

impl WorkerRuntime {
    pub fn new(
        config: WorkerConfig,
        registry: Arc<HandlerRegistry>,
        resolver: Arc<dyn CallbackResolver>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            address: config.address.clone(),
            config,
            registry,
            resolver,
            running: HashMap::new(),
            recent: HashMap::new(),
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub async fn run(mut self, mut commands: mpsc::UnboundedReceiver<ExecutorMessage>) {
        let Some(mut events) = self.event_rx.take() else {
            return;
        };
        loop {
            tokio::select! {
                maybe = commands.recv() => match maybe {
                    Some(message) => self.handle_command(message).await,
                    None => {
                        info!("执行器信道关闭，停止工作节点");
                        return;
                    }
                },
                Some(event) = events.recv() => self.handle_event(event).await,
            }
        }
    }

    async fn handle_command(&mut self, message: ExecutorMessage) {
        match message {
            ExecutorMessage::ExecuteJob {
                run_id,
                job_id,
                workflow_run_id,
                job_name,
                job_type,
                params,
                timeout_seconds,
                retry_count,
                split_start,
                split_end,
                callback_address,
                ..
            } => {
                let key = (run_id, split_start.zip(split_end));
                if self.running.contains_key(&key) {
                    debug!("实例 {run_id} 已在执行，忽略重复派发");
                    return;
                }
                let Some(handler) = self.registry.get(&job_type) else {
                    warn!("不支持的任务类型: {job_type}");
                    self.deliver(
                        key,
                        workflow_run_id,
                        &callback_address,
                        JobStatus::Failed,
                        &format!("不支持的任务类型: {job_type}"),
                    )
                    .await;
                    return;
                };
                let ctx = JobContext {
                    run_id,
                    job_id,
                    job_name,
                    job_type,
                    params,
                    retry_count,
                    split_start,
                    split_end,
                };
                let timeout = if timeout_seconds > 0 {
                    timeout_seconds as u64
                } else {
                    self.config.default_timeout_seconds
                };
                debug!("开始执行实例 {run_id}，超时 {timeout}s");
                let event_tx = self.event_tx.clone();
                let handle = tokio::spawn(async move {
                    let work =
                        std::panic::AssertUnwindSafe(handler.execute(&ctx)).catch_unwind();
                    let outcome =
                        tokio::time::timeout(Duration::from_secs(timeout), work).await;
                    let (status, message) = match outcome {
                        Err(_) => (JobStatus::Failed, "执行超时".to_string()),
                        Ok(Err(_)) => (JobStatus::Failed, "任务处理器panic".to_string()),
                        Ok(Ok(Ok(result))) => (JobStatus::Success, result),
                        Ok(Ok(Err(e))) => (JobStatus::Failed, e.to_string()),
                    };
                    let _ = event_tx.send(WorkerEvent::Finished {
                        key,
                        status,
                        message,
                    });
                });
                self.running.insert(
                    key,
                    RunningJob {
                        handle,
                        workflow_run_id,
                        callback_address,
                    },
                );
            }
            ExecutorMessage::CancelJob { run_id, reason } => {
                self.cancel_run(run_id, JobStatus::Cancelled, &reason).await;
            }
            ExecutorMessage::ExecutionTimeout { run_id } => {
                self.cancel_run(run_id, JobStatus::Failed, "执行超时").await;
            }
            ExecutorMessage::QueryStatus {
                run_id,
                callback_address,
            } => {
                // 执行中回报RUNNING，调度器据此区分"执行中"与"失联"
                if let Some(job) = self
                    .running
                    .iter()
                    .find(|(&(id, _), _)| id == run_id)
                    .map(|(_, job)| job)
                {
                    let report = SchedulerMessage::JobCompleted {
                        run_id,
                        workflow_run_id: job.workflow_run_id,
                        status: JobStatus::Running,
                        message: "仍在执行".to_string(),
                        worker_address: self.address.clone(),
                    };
                    if let Err(e) = self.resolver.deliver(&callback_address, report).await {
                        warn!("实例 {run_id} 状态回报投递失败: {e}");
                    }
                    return;
                }
                // 补发丢失的完成回调
                if let Some((workflow_run_id, status, message)) =
                    self.recent.get(&run_id).cloned()
                {
                    let completed = SchedulerMessage::JobCompleted {
                        run_id,
                        workflow_run_id,
                        status,
                        message,
                        worker_address: self.address.clone(),
                    };
                    if let Err(e) = self.resolver.deliver(&callback_address, completed).await {
                        warn!("补发实例 {run_id} 完成回调失败: {e}");
                    }
                } else {
                    debug!("查询的实例 {run_id} 不在本节点记录中");
                }
            }
        }
    }

    /// 终止一个实例的所有在途执行（含全部分片）并回调结果
    async fn cancel_run(&mut self, run_id: i64, status: JobStatus, message: &str) {
        let keys: Vec<RunKey> = self
            .running
            .keys()
            .filter(|&&(id, _)| id == run_id)
            .copied()
            .collect();
        if keys.is_empty() {
            debug!("取消的实例 {run_id} 不在执行中");
            return;
        }
        for key in keys {
            if let Some(job) = self.running.remove(&key) {
                job.handle.abort();
                info!("实例 {run_id} 被终止: {message}");
                self.deliver(key, job.workflow_run_id, &job.callback_address, status, message)
                    .await;
            }
        }
    }

    async fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Finished {
                key,
                status,
                message,
            } => {
                // 已被取消的任务其完成事件晚到，丢弃
                let Some(job) = self.running.remove(&key) else {
                    return;
                };
                self.deliver(key, job.workflow_run_id, &job.callback_address, status, &message)
                    .await;
            }
        }
    }

    async fn deliver(
        &mut self,
        key: RunKey,
        workflow_run_id: i64,
        callback_address: &str,
        status: JobStatus,
        message: &str,
    ) {
        let (run_id, split) = key;
        if split.is_none() {
            if self.recent.len() >= 1024 {
                self.recent.clear();
            }
            self.recent
                .insert(run_id, (workflow_run_id, status, message.to_string()));
        }
        let callback = match split {
            Some((split_start, split_end)) => SchedulerMessage::SplitCompleted {
                run_id,
                split_start,
                split_end,
                status,
                message: message.to_string(),
                worker_address: self.address.clone(),
            },
            None => SchedulerMessage::JobCompleted {
                run_id,
                workflow_run_id,
                status,
                message: message.to_string(),
                worker_address: self.address.clone(),
            },
        };
        if let Err(e) = self.resolver.deliver(callback_address, callback).await {
            warn!("实例 {run_id} 完成回调投递失败: {e}");
        }
    }
}
