//! 工作流编排
//!
//! 一个工作流实例的成员批次整体准入：依赖图校验失败则整批拒绝，
//! 不会出现部分成员注册、部分被丢弃的中间态。
//! 准入后成员按依赖门控释放给触发引擎，全部父节点SUCCESS的成员
//! 才会被注册；失败按工作流的失败策略向下游传播。
//! 每个工作流实例只发布一次 `WorkflowCompleted`。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use jobflow_core::config::FailurePolicy;
use jobflow_domain::dag::DagGraph;
use jobflow_domain::entities::{JobRunInfo, JobStatus, WorkflowStatus};
use jobflow_domain::messages::SchedulerMessage;
use jobflow_domain::repositories::{JobRunStore, WorkflowStore};

struct WorkflowState {
    dag: DagGraph,
    members: HashMap<i64, JobRunInfo>,
    statuses: HashMap<i64, JobStatus>,
    /// 已注册给触发引擎的成员，取消时要走引擎的取消路径
    released: HashSet<i64>,
    failure_policy: FailurePolicy,
}

impl WorkflowState {
    fn all_terminal(&self) -> bool {
        self.statuses.values().all(|s| s.is_terminal())
    }

    fn final_status(&self) -> WorkflowStatus {
        if self.statuses.values().any(|&s| s == JobStatus::Failed) {
            WorkflowStatus::Failed
        } else if self.statuses.values().any(|&s| s == JobStatus::Cancelled) {
            WorkflowStatus::Cancelled
        } else {
            WorkflowStatus::Success
        }
    }
}

pub struct WorkflowOrchestrator {
    store: Arc<dyn JobRunStore>,
    workflow_store: Arc<dyn WorkflowStore>,
    engine_tx: mpsc::UnboundedSender<SchedulerMessage>,
    failure_policy: FailurePolicy,
    workflows: HashMap<i64, WorkflowState>,
}

impl WorkflowOrchestrator {
    pub fn new(
        store: Arc<dyn JobRunStore>,
        workflow_store: Arc<dyn WorkflowStore>,
        engine_tx: mpsc::UnboundedSender<SchedulerMessage>,
        failure_policy: FailurePolicy,
    ) -> Self {
        Self {
            store,
            workflow_store,
            engine_tx,
            failure_policy,
            workflows: HashMap::new(),
        }
    }

    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SchedulerMessage>) {
        while let Some(message) = rx.recv().await {
            self.handle_message(message).await;
        }
        info!("工作流编排器信道关闭，退出");
    }

    pub async fn handle_message(&mut self, message: SchedulerMessage) {
        match message {
            SchedulerMessage::NewJobsCreated { runs, edges, .. } => {
                self.handle_new_jobs(runs, edges).await;
            }
            SchedulerMessage::JobCompleted {
                run_id,
                workflow_run_id,
                status,
                message,
                ..
            } => {
                self.handle_member_completed(workflow_run_id, run_id, status, &message)
                    .await;
            }
            SchedulerMessage::CancelWorkflow {
                workflow_run_id,
                reason,
            } => {
                self.handle_cancel_workflow(workflow_run_id, &reason).await;
            }
            other => {
                debug!("编排器忽略消息 {}", other.name());
            }
        }
    }

    pub fn active_count(&self) -> usize {
        self.workflows.len()
    }

    pub fn member_status(&self, workflow_run_id: i64, run_id: i64) -> Option<JobStatus> {
        self.workflows
            .get(&workflow_run_id)
            .and_then(|w| w.statuses.get(&run_id))
            .copied()
    }

    // ---- 批次准入 ----

    async fn handle_new_jobs(&mut self, runs: Vec<JobRunInfo>, edges: Vec<(i64, i64)>) {
        let mut batches: HashMap<i64, Vec<JobRunInfo>> = HashMap::new();
        for run in runs {
            if run.workflow_run_id == 0 {
                debug!("编排器收到独立实例 {}，转回触发引擎", run.run_id);
                let forwarded = SchedulerMessage::RegisterJob {
                    run_id: run.run_id,
                    job_id: run.job_id,
                    trigger_time: run.trigger_time,
                    priority: run.priority,
                    run: Some(run),
                };
                self.send_engine(forwarded);
                continue;
            }
            batches.entry(run.workflow_run_id).or_default().push(run);
        }
        for (workflow_run_id, members) in batches {
            self.admit_workflow(workflow_run_id, members, &edges).await;
        }
    }

    /// 整批准入：任何一条边不合法就拒绝整个工作流
    async fn admit_workflow(
        &mut self,
        workflow_run_id: i64,
        members: Vec<JobRunInfo>,
        edges: &[(i64, i64)],
    ) {
        if self.workflows.contains_key(&workflow_run_id) {
            warn!("工作流 {workflow_run_id} 已在编排中，忽略重复批次");
            return;
        }
        let member_ids: HashSet<i64> = members.iter().map(|r| r.run_id).collect();
        // 显式边与成员自带的父实例列表等价，并集去重后构图
        let mut edge_set: HashSet<(i64, i64)> = HashSet::new();
        for &(parent, child) in edges {
            if member_ids.contains(&parent) && member_ids.contains(&child) {
                edge_set.insert((parent, child));
            }
        }
        for run in &members {
            for &parent in &run.parent_run_ids {
                if member_ids.contains(&parent) {
                    edge_set.insert((parent, run.run_id));
                }
            }
        }
        let mut dag = DagGraph::new();
        for &id in &member_ids {
            dag.add_node(id);
        }
        for &(parent, child) in &edge_set {
            if let Err(e) = dag.try_add_edge(parent, child) {
                warn!("工作流 {workflow_run_id} 依赖图非法，整批拒绝: {e}");
                self.reject_workflow(workflow_run_id, members, &e.to_string())
                    .await;
                return;
            }
        }

        let statuses: HashMap<i64, JobStatus> =
            member_ids.iter().map(|&id| (id, JobStatus::Waiting)).collect();
        let members: HashMap<i64, JobRunInfo> =
            members.into_iter().map(|r| (r.run_id, r)).collect();
        let mut state = WorkflowState {
            dag,
            members,
            statuses,
            released: HashSet::new(),
            failure_policy: self.failure_policy,
        };
        info!(
            "工作流 {workflow_run_id} 准入: {} 个成员, {} 条依赖边",
            state.members.len(),
            state.dag.edge_count()
        );
        self.release_ready(workflow_run_id, &mut state);
        self.workflows.insert(workflow_run_id, state);
    }

    async fn reject_workflow(
        &mut self,
        workflow_run_id: i64,
        members: Vec<JobRunInfo>,
        reason: &str,
    ) {
        for run in &members {
            self.persist_member(run.run_id, JobStatus::Cancelled, reason);
        }
        if let Err(e) = self
            .workflow_store
            .update_workflow_status(workflow_run_id, WorkflowStatus::Failed, reason)
            .await
        {
            warn!("工作流 {workflow_run_id} 状态回写失败: {e}");
        }
        self.send_engine(SchedulerMessage::WorkflowCompleted {
            workflow_run_id,
            status: WorkflowStatus::Failed,
            message: reason.to_string(),
        });
    }

    // ---- 依赖门控 ----

    /// 释放全部父节点都已SUCCESS的待触发成员
    fn release_ready(&self, workflow_run_id: i64, state: &mut WorkflowState) {
        let done: HashSet<i64> = state
            .statuses
            .iter()
            .filter(|(_, &s)| s == JobStatus::Success)
            .map(|(&id, _)| id)
            .collect();
        let ready: Vec<i64> = state
            .dag
            .ready_nodes(&done)
            .into_iter()
            .filter(|id| {
                !state.released.contains(id)
                    && state.statuses.get(id) == Some(&JobStatus::Waiting)
            })
            .collect();
        for run_id in ready {
            let Some(run) = state.members.get(&run_id) else {
                continue;
            };
            debug!("工作流 {workflow_run_id} 释放成员 {run_id}");
            state.released.insert(run_id);
            self.send_engine(SchedulerMessage::RegisterJob {
                run_id,
                job_id: run.job_id,
                trigger_time: run.trigger_time,
                priority: run.priority,
                run: Some(run.clone()),
            });
        }
    }

    async fn handle_member_completed(
        &mut self,
        workflow_run_id: i64,
        run_id: i64,
        status: JobStatus,
        message: &str,
    ) {
        let Some(mut state) = self.workflows.remove(&workflow_run_id) else {
            debug!("未知工作流 {workflow_run_id} 的成员完成消息，忽略");
            return;
        };
        if !state.statuses.contains_key(&run_id) {
            warn!("工作流 {workflow_run_id} 不包含成员 {run_id}，忽略");
            self.workflows.insert(workflow_run_id, state);
            return;
        }
        if state
            .statuses
            .get(&run_id)
            .map(|s| s.is_terminal())
            .unwrap_or(false)
        {
            // 迟到的重复完成
            self.workflows.insert(workflow_run_id, state);
            return;
        }
        state.statuses.insert(run_id, status);

        match status {
            JobStatus::Success => {
                self.release_ready(workflow_run_id, &mut state);
            }
            JobStatus::Failed | JobStatus::Cancelled => {
                self.propagate_failure(workflow_run_id, &mut state, run_id, status)
                    .await;
            }
            JobStatus::Waiting | JobStatus::Running => {
                warn!("成员完成消息携带非终态 {}，忽略", status.as_str());
            }
        }

        if state.all_terminal() {
            self.finalize(workflow_run_id, state, message).await;
        } else {
            self.workflows.insert(workflow_run_id, state);
        }
    }

    /// 失败传播：CancelDependents 只取消传递下游，CancelWorkflow 取消全部未完成成员
    async fn propagate_failure(
        &mut self,
        workflow_run_id: i64,
        state: &mut WorkflowState,
        failed_run_id: i64,
        status: JobStatus,
    ) {
        let targets: Vec<i64> = match state.failure_policy {
            FailurePolicy::CancelDependents => state.dag.descendants(failed_run_id),
            FailurePolicy::CancelWorkflow => state
                .statuses
                .iter()
                .filter(|(_, s)| !s.is_terminal())
                .map(|(&id, _)| id)
                .collect(),
        };
        info!(
            "工作流 {workflow_run_id} 成员 {failed_run_id} {}，按策略取消 {} 个成员",
            status.as_str(),
            targets.len()
        );
        let reason = format!("上游实例 {failed_run_id} {}", status.as_str());
        for target in targets {
            let terminal = state
                .statuses
                .get(&target)
                .map(|s| s.is_terminal())
                .unwrap_or(true);
            if terminal {
                continue;
            }
            if state.released.contains(&target) {
                // 已在引擎手里的成员走标准取消路径，等完成消息回流
                self.send_engine(SchedulerMessage::CancelJob {
                    run_id: target,
                    reason: reason.clone(),
                });
            } else {
                // 从未释放的成员由编排器直接置终态
                state.statuses.insert(target, JobStatus::Cancelled);
                self.persist_member(target, JobStatus::Cancelled, &reason);
            }
        }
    }

    async fn handle_cancel_workflow(&mut self, workflow_run_id: i64, reason: &str) {
        let Some(mut state) = self.workflows.remove(&workflow_run_id) else {
            debug!("取消请求的工作流 {workflow_run_id} 不在编排中");
            return;
        };
        info!("取消工作流 {workflow_run_id}: {reason}");
        let pending: Vec<i64> = state
            .statuses
            .iter()
            .filter(|(_, s)| !s.is_terminal())
            .map(|(&id, _)| id)
            .collect();
        for run_id in pending {
            if state.released.contains(&run_id) {
                // 触发引擎已在取消它本地的实例，等完成消息回流
                continue;
            }
            state.statuses.insert(run_id, JobStatus::Cancelled);
            self.persist_member(run_id, JobStatus::Cancelled, reason);
        }
        if state.all_terminal() {
            self.finalize(workflow_run_id, state, reason).await;
        } else {
            self.workflows.insert(workflow_run_id, state);
        }
    }

    /// 唯一的完成出口，一个工作流实例只会走到这里一次
    async fn finalize(&mut self, workflow_run_id: i64, state: WorkflowState, message: &str) {
        let status = state.final_status();
        info!(
            "工作流 {workflow_run_id} 完成，终态 {:?}: {message}",
            status
        );
        if let Err(e) = self
            .workflow_store
            .update_workflow_status(workflow_run_id, status, message)
            .await
        {
            warn!("工作流 {workflow_run_id} 状态回写失败: {e}");
        }
        self.send_engine(SchedulerMessage::WorkflowCompleted {
            workflow_run_id,
            status,
            message: message.to_string(),
        });
    }

    /// 未释放成员的状态回写，fire-and-forget
    fn persist_member(&self, run_id: i64, status: JobStatus, message: &str) {
        let store = self.store.clone();
        let message = message.to_string();
        tokio::spawn(async move {
            if let Err(e) = store.update_run_status(run_id, status, &message).await {
                warn!("实例 {run_id} 状态回写失败: {e}");
            }
        });
    }

    fn send_engine(&self, message: SchedulerMessage) {
        if self.engine_tx.send(message).is_err() {
            warn!("触发引擎信道已关闭，消息丢弃");
        }
    }
}
