//! 单进程装配
//!
//! 调度引擎、工作流编排器、分桶协调器和工作节点运行时在同一进程内
//! 通过信道互联，端口一律使用内存实现。跨进程部署时替换端口实现，
//! 装配方式不变。

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tracing::info;

use jobflow_core::config::AppConfig;
use jobflow_dispatcher::{BucketCoordinator, TriggerEngine, WorkflowOrchestrator};
use jobflow_domain::entities::WorkerInfo;
use jobflow_domain::memory::{
    ChannelGateway, ChannelResolver, MemoryJobStore, MemoryLeaseBackend, MemoryWorkflowStore,
    StaticMembership,
};
use jobflow_domain::messages::SchedulerMessage;
use jobflow_worker::{HandlerRegistry, WorkerRuntime};

pub struct Application {
    config: AppConfig,
}

impl Application {
    pub fn new(config: AppConfig) -> Self {
        Self { config }
    }

    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let node_address = self.config.node.address.clone();
        let worker_address = self.config.worker.address.clone();

        let store = Arc::new(MemoryJobStore::new());
        let workflow_store = Arc::new(MemoryWorkflowStore::new());
        let lease_backend = Arc::new(MemoryLeaseBackend::new());
        let membership = Arc::new(StaticMembership::new());
        let gateway = Arc::new(ChannelGateway::new());
        let resolver = Arc::new(ChannelResolver::new());

        let registry = Arc::new(HandlerRegistry::with_builtins());
        membership.set_schedulers(vec![node_address.clone()]).await;
        membership
            .set_workers(vec![WorkerInfo {
                address: worker_address.clone(),
                capacity: 16,
                running_jobs: 0,
                supported_job_types: registry.supported_types(),
            }])
            .await;

        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (workflow_tx, workflow_rx) = mpsc::unbounded_channel();
        let (worker_tx, worker_rx) = mpsc::unbounded_channel();
        gateway.register_worker(&worker_address, worker_tx).await;
        resolver.register(&node_address, engine_tx.clone()).await;

        let engine = TriggerEngine::new(
            node_address.clone(),
            self.config.engine.clone(),
            store.clone(),
            gateway.clone(),
            membership.clone(),
            engine_tx.clone(),
            workflow_tx,
        );
        let orchestrator = WorkflowOrchestrator::new(
            store,
            workflow_store,
            engine_tx.clone(),
            self.config.workflow.failure_policy,
        );
        let worker = WorkerRuntime::new(self.config.worker.clone(), registry, resolver);
        let coordinator = BucketCoordinator::new(
            node_address.clone(),
            self.config.bucket.clone(),
            lease_backend,
            membership,
            engine_tx.clone(),
        );

        tokio::spawn(engine.run(engine_rx));
        tokio::spawn(orchestrator.run(workflow_rx));
        tokio::spawn(worker.run(worker_rx));
        let coordinator_handle = tokio::spawn(coordinator.run(shutdown.clone()));

        engine_tx
            .send(SchedulerMessage::StartScan)
            .map_err(|_| anyhow::anyhow!("触发引擎信道已关闭"))?;
        info!("调度节点 {node_address} 已启动，工作节点 {worker_address}");

        // 等待停机信号，协调器负责在退出前释放全部租约
        let mut shutdown = shutdown;
        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }
        let _ = coordinator_handle.await;
        info!("分桶租约已释放");
        Ok(())
    }
}
