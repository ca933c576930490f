//! 调度触发引擎
//!
//! 单线程独占全部可变状态：实例表、索引、触发队列、分片跟踪、看门狗。
//! 外界只通过消息信道交互，消息路径上没有任何阻塞IO：
//! 加载走后台任务，结果以 `JobsLoaded` / `JobsLoadFailed` 回流。
//!
//! `BucketLost` 是硬停止：在处理下一条消息之前，该桶的实例
//! 必须全部从内存清除，之后不再为其派发或注册。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use jobflow_core::config::EngineConfig;
use jobflow_domain::entities::{JobRunInfo, JobStatus, RouteStrategy};
use jobflow_domain::messages::{ExecutorMessage, LoadSource, RefreshOp, SchedulerMessage};
use jobflow_domain::repositories::{ExecutorGateway, JobRunStore, MembershipView};

use crate::splits::{SplitOutcome, SplitTracker};
use crate::strategies::SelectorRegistry;
use crate::trigger_queue::TriggerQueue;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub struct TriggerEngine {
    node_address: String,
    config: EngineConfig,
    store: Arc<dyn JobRunStore>,
    gateway: Arc<dyn ExecutorGateway>,
    membership: Arc<dyn MembershipView>,
    selectors: SelectorRegistry,
    /// 自环信道：后台任务和看门狗把结果送回消息循环
    tx: mpsc::UnboundedSender<SchedulerMessage>,
    workflow_tx: mpsc::UnboundedSender<SchedulerMessage>,
    /// 状态回写队列，由专职任务按提交顺序串行落库
    persist_tx: mpsc::UnboundedSender<(i64, JobStatus, String)>,

    runs: HashMap<i64, JobRunInfo>,
    bucket_runs: HashMap<i32, HashSet<i64>>,
    workflow_runs: HashMap<i64, HashSet<i64>>,
    running_by_job: HashMap<i64, HashSet<i64>>,
    queue: TriggerQueue,
    splits: SplitTracker,
    watchdogs: HashMap<i64, JoinHandle<()>>,
    owned_buckets: HashSet<i32>,
    /// 分桶到对端调度节点信道的路由表
    peers: HashMap<i32, mpsc::UnboundedSender<SchedulerMessage>>,
    last_max_id: i64,
    scan_started: bool,
    init_loaded: bool,
    load_in_flight: bool,
}

impl TriggerEngine {
    pub fn new(
        node_address: String,
        config: EngineConfig,
        store: Arc<dyn JobRunStore>,
        gateway: Arc<dyn ExecutorGateway>,
        membership: Arc<dyn MembershipView>,
        tx: mpsc::UnboundedSender<SchedulerMessage>,
        workflow_tx: mpsc::UnboundedSender<SchedulerMessage>,
    ) -> Self {
        let splits = SplitTracker::new(
            config.max_split_retry,
            config.split_backoff_ms,
            config.split_backoff_max_ms,
        );
        let (persist_tx, mut persist_rx) = mpsc::unbounded_channel::<(i64, JobStatus, String)>();
        {
            // 同一实例的RUNNING和终态不允许乱序落库，全部回写走单队列
            let store = store.clone();
            tokio::spawn(async move {
                while let Some((run_id, status, message)) = persist_rx.recv().await {
                    if let Err(e) = store.update_run_status(run_id, status, &message).await {
                        warn!("实例 {run_id} 状态回写失败: {e}");
                    }
                }
            });
        }
        Self {
            node_address,
            config,
            store,
            gateway,
            membership,
            selectors: SelectorRegistry::new(),
            tx,
            workflow_tx,
            persist_tx,
            runs: HashMap::new(),
            bucket_runs: HashMap::new(),
            workflow_runs: HashMap::new(),
            running_by_job: HashMap::new(),
            queue: TriggerQueue::new(),
            splits,
            watchdogs: HashMap::new(),
            owned_buckets: HashSet::new(),
            peers: HashMap::new(),
            last_max_id: 0,
            scan_started: false,
            init_loaded: false,
            load_in_flight: false,
        }
    }

    /// 消息循环，信道关闭即退出
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SchedulerMessage>) {
        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.scan_interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(message) => self.handle_message(message).await,
                    None => {
                        info!("触发引擎信道关闭，停止调度");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    self.handle_message(SchedulerMessage::TimerFired).await;
                }
            }
        }
    }

    pub async fn handle_message(&mut self, message: SchedulerMessage) {
        match message {
            SchedulerMessage::StartScan => self.handle_start_scan(),
            SchedulerMessage::TimerFired => self.handle_timer_fired().await,
            SchedulerMessage::RegisterJob {
                run_id,
                trigger_time,
                priority,
                run,
                ..
            } => self.handle_register(run_id, trigger_time, priority, run),
            SchedulerMessage::JobCompleted {
                run_id,
                status,
                message,
                ..
            } => self.handle_job_completed(run_id, status, &message).await,
            SchedulerMessage::SplitCompleted {
                run_id,
                split_start,
                split_end,
                status,
                message,
                ..
            } => {
                let outcome =
                    self.splits
                        .record(run_id, split_start, split_end, status, &message);
                self.apply_split_outcome(run_id, outcome).await;
            }
            SchedulerMessage::RetrySplit {
                run_id,
                split_start,
                split_end,
                retry_count,
            } => {
                self.handle_retry_split(run_id, split_start, split_end, retry_count)
                    .await;
            }
            SchedulerMessage::JobsLoaded {
                runs,
                new_max_id,
                source,
            } => self.handle_jobs_loaded(runs, new_max_id, source).await,
            SchedulerMessage::JobsLoadFailed { reason, source } => {
                self.handle_jobs_load_failed(&reason, source);
            }
            SchedulerMessage::BucketAcquired { bucket_id } => {
                self.owned_buckets.insert(bucket_id);
                info!("获得分桶 {bucket_id}，补载其待触发实例");
                self.spawn_load(LoadSource::Bucket, vec![bucket_id], None);
            }
            SchedulerMessage::BucketLost { bucket_id } => self.handle_bucket_lost(bucket_id),
            SchedulerMessage::GlobalMaxIdChanged { max_id } => {
                if max_id > self.last_max_id {
                    let buckets: Vec<i32> = self.owned_buckets.iter().copied().collect();
                    self.spawn_load(LoadSource::Incremental, buckets, Some(self.last_max_id));
                }
            }
            SchedulerMessage::NewJobsCreated {
                runs,
                edges,
                max_id,
            } => self.handle_new_jobs(runs, edges, max_id),
            SchedulerMessage::RefreshJobInfo { job_id, op } => {
                self.handle_refresh(job_id, op);
            }
            SchedulerMessage::CancelJob { run_id, reason } => {
                self.handle_cancel_job(run_id, &reason).await;
            }
            SchedulerMessage::CancelWorkflow {
                workflow_run_id,
                reason,
            } => self.handle_cancel_workflow(workflow_run_id, &reason).await,
            SchedulerMessage::WorkflowCompleted {
                workflow_run_id, ..
            } => {
                self.workflow_runs.remove(&workflow_run_id);
                debug!("工作流 {workflow_run_id} 结束，清理索引");
            }
            SchedulerMessage::RenewBuckets => {
                // 租约续期由分桶协调器的循环负责
                debug!("收到RenewBuckets，由协调器处理");
            }
            SchedulerMessage::ShardingReceiversUpdated { receivers } => {
                info!("更新分桶路由表: {} 条", receivers.len());
                self.peers = receivers;
            }
        }
    }

    // ---- 测试与运维用的只读视图 ----

    pub fn run_snapshot(&self, run_id: i64) -> Option<&JobRunInfo> {
        self.runs.get(&run_id)
    }

    pub fn owned_buckets(&self) -> &HashSet<i32> {
        &self.owned_buckets
    }

    pub fn pending_count(&self) -> usize {
        self.runs.len()
    }

    pub fn last_max_id(&self) -> i64 {
        self.last_max_id
    }

    // ---- 扫描与加载 ----

    fn handle_start_scan(&mut self) {
        self.scan_started = true;
        let buckets: Vec<i32> = self.owned_buckets.iter().copied().collect();
        info!("启动初始扫描，分桶: {buckets:?}");
        self.spawn_load(LoadSource::Init, buckets, None);
    }

    /// 后台加载；init/incremental同一时刻只允许一个在途
    fn spawn_load(&mut self, source: LoadSource, buckets: Vec<i32>, since: Option<i64>) {
        let exclusive = matches!(source, LoadSource::Init | LoadSource::Incremental);
        if exclusive {
            if self.load_in_flight {
                debug!("已有加载在途，跳过 source={}", source.as_str());
                return;
            }
            self.load_in_flight = true;
        }
        let store = self.store.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = match since {
                None => store.load_waiting(&buckets).await,
                Some(max_id) => store.load_new_since(max_id, &buckets).await,
            };
            let message = match result {
                Ok(page) => SchedulerMessage::JobsLoaded {
                    runs: page.runs,
                    new_max_id: page.new_max_id,
                    source,
                },
                Err(e) => SchedulerMessage::JobsLoadFailed {
                    reason: e.to_string(),
                    source,
                },
            };
            let _ = tx.send(message);
        });
    }

    async fn handle_jobs_loaded(
        &mut self,
        runs: Vec<JobRunInfo>,
        new_max_id: i64,
        source: LoadSource,
    ) {
        if matches!(source, LoadSource::Init | LoadSource::Incremental) {
            self.load_in_flight = false;
        }
        if source == LoadSource::Init {
            self.init_loaded = true;
        }
        let total = runs.len();
        for run in runs {
            self.adopt_run(run);
        }
        self.last_max_id = self.last_max_id.max(new_max_id);
        info!(
            "加载完成 source={} 实例数={total} max_id={}",
            source.as_str(),
            self.last_max_id
        );
    }

    /// 加载失败保留上一份有效缓存，init失败由下一次扫描tick重试
    fn handle_jobs_load_failed(&mut self, reason: &str, source: LoadSource) {
        if matches!(source, LoadSource::Init | LoadSource::Incremental) {
            self.load_in_flight = false;
        }
        error!(
            "任务加载失败 source={}，保留现有缓存: {reason}",
            source.as_str()
        );
    }

    fn adopt_run(&mut self, run: JobRunInfo) {
        // 所有权检查是唯一入口：失主后回流的后台加载结果在这里被丢弃
        if !self.owned_buckets.contains(&run.bucket_id) {
            debug!(
                "实例 {} 属于未持有的分桶 {}，丢弃",
                run.run_id, run.bucket_id
            );
            return;
        }
        if run.status != JobStatus::Waiting {
            debug!(
                "跳过非WAITING实例 {} (状态: {})",
                run.run_id,
                run.status.as_str()
            );
            return;
        }
        if let Some(existing) = self.runs.get_mut(&run.run_id) {
            // 只允许覆盖仍在等待的实例，执行中的状态以本地为准
            if existing.status == JobStatus::Waiting {
                let trigger_time = run.trigger_time;
                let priority = run.priority;
                *existing = run;
                self.queue.push(existing.run_id, trigger_time, priority);
            }
            return;
        }
        if self.runs.len() >= self.config.max_pending_runs {
            warn!(
                "内存实例数已达上限 {}，丢弃实例 {}，等待后续加载",
                self.config.max_pending_runs, run.run_id
            );
            return;
        }
        self.bucket_runs
            .entry(run.bucket_id)
            .or_default()
            .insert(run.run_id);
        if run.workflow_run_id != 0 {
            self.workflow_runs
                .entry(run.workflow_run_id)
                .or_default()
                .insert(run.run_id);
        }
        self.queue.push(run.run_id, run.trigger_time, run.priority);
        self.runs.insert(run.run_id, run);
    }

    // ---- 触发与派发 ----

    async fn handle_timer_fired(&mut self) {
        if self.scan_started && !self.init_loaded && !self.load_in_flight {
            let buckets: Vec<i32> = self.owned_buckets.iter().copied().collect();
            self.spawn_load(LoadSource::Init, buckets, None);
        }
        let now = now_ms();
        let due = self.queue.pop_due(now);
        for entry in due {
            let snapshot = match self.runs.get(&entry.run_id) {
                Some(run) if run.status == JobStatus::Waiting && run.trigger_time <= now => {
                    run.clone()
                }
                // 惰性删除：改期、取消或已清除的条目在这里丢弃
                _ => continue,
            };
            self.gate_and_dispatch(snapshot).await;
        }
    }

    async fn gate_and_dispatch(&mut self, run: JobRunInfo) {
        let running_ids: Vec<i64> = self
            .running_by_job
            .get(&run.job_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        if !running_ids.is_empty() {
            use jobflow_domain::entities::BlockStrategy;
            match run.block_strategy {
                BlockStrategy::Parallel => {}
                BlockStrategy::Discard => {
                    info!("任务 {} 已有实例在执行，丢弃实例 {}", run.job_id, run.run_id);
                    self.finish_run(run.run_id, JobStatus::Cancelled, "阻塞策略DISCARD丢弃")
                        .await;
                    return;
                }
                BlockStrategy::Serial => {
                    let delay = now_ms() + self.config.scan_interval_ms as i64;
                    if let Some(stored) = self.runs.get_mut(&run.run_id) {
                        stored.trigger_time = delay;
                        self.queue.push(run.run_id, delay, run.priority);
                    }
                    return;
                }
                BlockStrategy::CoverEarly => {
                    info!(
                        "任务 {} 按COVER_EARLY取消 {} 个执行中实例",
                        run.job_id,
                        running_ids.len()
                    );
                    for run_id in running_ids {
                        self.handle_cancel_job(run_id, "阻塞策略COVER_EARLY取消").await;
                    }
                }
            }
        }
        self.dispatch(run).await;
    }

    async fn dispatch(&mut self, run: JobRunInfo) {
        let workers = match self.membership.alive_workers().await {
            Ok(workers) => workers,
            Err(e) => {
                warn!("获取工作节点视图失败，实例 {} 延后: {e}", run.run_id);
                self.requeue_later(run.run_id);
                return;
            }
        };

        if run.split_spec.is_some() && run.route_strategy == RouteStrategy::Split {
            self.dispatch_split(run, &workers).await;
            return;
        }

        let selector = self.selectors.for_strategy(run.route_strategy);
        match selector.select(&run, &workers).await {
            Ok(Some(address)) => {
                let message = self.execute_message(&run, None, run.retry_count);
                if let Err(e) = self.gateway.send(&address, message).await {
                    warn!("实例 {} 投递到 {address} 失败: {e}", run.run_id);
                    self.fail_run(run.run_id, &format!("投递失败: {e}")).await;
                    return;
                }
                debug!("实例 {} 派发到 {address}", run.run_id);
                self.set_running(run.run_id, Some(address));
            }
            Ok(None) => {
                debug!("实例 {} 暂无可用节点，延后重试", run.run_id);
                self.requeue_later(run.run_id);
            }
            Err(e) => {
                warn!("实例 {} 路由失败: {e}", run.run_id);
                self.requeue_later(run.run_id);
            }
        }
    }

    async fn dispatch_split(
        &mut self,
        run: JobRunInfo,
        workers: &[jobflow_domain::entities::WorkerInfo],
    ) {
        let chunks = self.splits.begin(&run);
        if chunks.is_empty() {
            self.finish_run(run.run_id, JobStatus::Failed, "分片定义无效")
                .await;
            return;
        }
        info!("实例 {} 扇出 {} 个分片", run.run_id, chunks.len());
        self.set_running(run.run_id, None);
        for (split_start, split_end) in chunks {
            self.dispatch_split_chunk(&run, split_start, split_end, 0, workers)
                .await;
        }
    }

    async fn dispatch_split_chunk(
        &mut self,
        run: &JobRunInfo,
        split_start: i64,
        split_end: i64,
        retry_count: i32,
        workers: &[jobflow_domain::entities::WorkerInfo],
    ) {
        let selector = self.selectors.for_strategy(RouteStrategy::First);
        let failure = match selector.select(run, workers).await {
            Ok(Some(address)) => {
                let message =
                    self.execute_message(run, Some((split_start, split_end)), retry_count);
                match self.gateway.send(&address, message).await {
                    Ok(()) => None,
                    Err(e) => Some(format!("投递失败: {e}")),
                }
            }
            Ok(None) => Some("无可用节点".to_string()),
            Err(e) => Some(format!("路由失败: {e}")),
        };
        if let Some(reason) = failure {
            warn!(
                "实例 {} 分片 [{split_start}, {split_end}) 派发失败: {reason}",
                run.run_id
            );
            let outcome =
                self.splits
                    .record(run.run_id, split_start, split_end, JobStatus::Failed, &reason);
            self.apply_split_outcome(run.run_id, outcome).await;
        }
    }

    async fn handle_retry_split(
        &mut self,
        run_id: i64,
        split_start: i64,
        split_end: i64,
        retry_count: i32,
    ) {
        if !self.splits.has_range(run_id, split_start, split_end) {
            debug!("分片重试目标已不存在: {run_id} [{split_start}, {split_end})");
            return;
        }
        let Some(run) = self.runs.get(&run_id).cloned() else {
            self.splits.forget(run_id);
            return;
        };
        let workers = match self.membership.alive_workers().await {
            Ok(workers) => workers,
            Err(e) => {
                warn!("分片重试获取节点视图失败: {e}");
                let outcome = self.splits.record(
                    run_id,
                    split_start,
                    split_end,
                    JobStatus::Failed,
                    &format!("节点视图不可用: {e}"),
                );
                self.apply_split_outcome(run_id, outcome).await;
                return;
            }
        };
        self.dispatch_split_chunk(&run, split_start, split_end, retry_count, &workers)
            .await;
    }

    async fn apply_split_outcome(&mut self, run_id: i64, outcome: SplitOutcome) {
        match outcome {
            SplitOutcome::Retry {
                split_start,
                split_end,
                retry_count,
                backoff_ms,
            } => {
                debug!(
                    "实例 {run_id} 分片 [{split_start}, {split_end}) 第{retry_count}次重试，退避{backoff_ms}ms"
                );
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    let _ = tx.send(SchedulerMessage::RetrySplit {
                        run_id,
                        split_start,
                        split_end,
                        retry_count,
                    });
                });
            }
            SplitOutcome::Resolved { status, message } => {
                // 分片自带重试预算，归约结果即父实例终态
                self.finish_run(run_id, status, &message).await;
            }
            SplitOutcome::Pending | SplitOutcome::Ignored => {}
        }
    }

    fn execute_message(
        &self,
        run: &JobRunInfo,
        split: Option<(i64, i64)>,
        retry_count: i32,
    ) -> ExecutorMessage {
        ExecutorMessage::ExecuteJob {
            run_id: run.run_id,
            job_id: run.job_id,
            workflow_run_id: run.workflow_run_id,
            namespace_id: run.namespace_id,
            job_name: run.job_name.clone(),
            job_type: run.job_type.clone(),
            params: run.params.clone(),
            route_strategy: run.route_strategy,
            timeout_seconds: run.timeout_seconds,
            retry_count,
            max_retry_times: run.max_retry_times,
            retry_interval_seconds: run.retry_interval_seconds,
            priority: run.priority,
            trigger_time: run.trigger_time,
            split_start: split.map(|(s, _)| s),
            split_end: split.map(|(_, e)| e),
            callback_address: self.node_address.clone(),
        }
    }

    fn set_running(&mut self, run_id: i64, worker_address: Option<String>) {
        let Some(run) = self.runs.get_mut(&run_id) else {
            return;
        };
        run.status = JobStatus::Running;
        run.worker_address = worker_address;
        let job_id = run.job_id;
        let workflow_run_id = run.workflow_run_id;
        let timeout = run.timeout_seconds.max(1) as u64 + self.config.dispatch_grace_seconds;
        self.running_by_job.entry(job_id).or_default().insert(run_id);
        self.persist_status(run_id, JobStatus::Running, "");
        self.arm_watchdog(run_id, workflow_run_id, timeout);
    }

    /// 看门狗：工作节点彻底失联时的兜底，触发后按可重试失败处理
    fn arm_watchdog(&mut self, run_id: i64, workflow_run_id: i64, timeout_seconds: u64) {
        self.disarm_watchdog(run_id);
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(timeout_seconds)).await;
            let _ = tx.send(SchedulerMessage::JobCompleted {
                run_id,
                workflow_run_id,
                status: JobStatus::Failed,
                message: "执行超时，看门狗触发".to_string(),
                worker_address: String::new(),
            });
        });
        self.watchdogs.insert(run_id, handle);
    }

    fn disarm_watchdog(&mut self, run_id: i64) {
        if let Some(handle) = self.watchdogs.remove(&run_id) {
            handle.abort();
        }
    }

    fn requeue_later(&mut self, run_id: i64) {
        let delay = now_ms() + self.config.scan_interval_ms as i64;
        if let Some(run) = self.runs.get_mut(&run_id) {
            run.trigger_time = delay;
            let priority = run.priority;
            self.queue.push(run_id, delay, priority);
        }
    }

    // ---- 完成、重试与取消 ----

    async fn handle_job_completed(&mut self, run_id: i64, status: JobStatus, message: &str) {
        if status.is_terminal() {
            self.disarm_watchdog(run_id);
        }
        if !self.runs.contains_key(&run_id) {
            debug!("收到未知实例 {run_id} 的完成消息，忽略");
            return;
        }
        match status {
            JobStatus::Success => self.finish_run(run_id, JobStatus::Success, message).await,
            JobStatus::Cancelled => {
                self.finish_run(run_id, JobStatus::Cancelled, message).await
            }
            JobStatus::Failed => self.fail_run(run_id, message).await,
            JobStatus::Running => {
                // 存活回报而非完成，看门狗保持原样
                debug!("实例 {run_id} 回报仍在执行");
            }
            JobStatus::Waiting => {
                warn!("完成消息携带非终态 {}，忽略", status.as_str());
            }
        }
    }

    /// 失败处理：预算内原地重试，耗尽则终态FAILED
    async fn fail_run(&mut self, run_id: i64, message: &str) {
        let retry = {
            let Some(run) = self.runs.get_mut(&run_id) else {
                return;
            };
            if run.is_terminal() {
                return;
            }
            if run.retry_count < run.max_retry_times {
                run.retry_count += 1;
                run.status = JobStatus::Waiting;
                run.trigger_time = now_ms() + run.retry_interval_seconds.max(0) * 1000;
                run.worker_address = None;
                Some((run.job_id, run.trigger_time, run.priority, run.retry_count))
            } else {
                None
            }
        };
        match retry {
            Some((job_id, trigger_time, priority, retry_count)) => {
                if let Some(set) = self.running_by_job.get_mut(&job_id) {
                    set.remove(&run_id);
                }
                self.splits.forget(run_id);
                self.queue.push(run_id, trigger_time, priority);
                self.persist_status(run_id, JobStatus::Waiting, message);
                info!(
                    "实例 {run_id} 失败进入第{retry_count}次重试: {message}"
                );
            }
            None => {
                self.finish_run(run_id, JobStatus::Failed, message).await;
            }
        }
    }

    async fn finish_run(&mut self, run_id: i64, status: JobStatus, message: &str) {
        self.disarm_watchdog(run_id);
        self.splits.forget(run_id);
        let Some(run) = self.runs.remove(&run_id) else {
            return;
        };
        if let Some(set) = self.running_by_job.get_mut(&run.job_id) {
            set.remove(&run_id);
        }
        if let Some(set) = self.bucket_runs.get_mut(&run.bucket_id) {
            set.remove(&run_id);
        }
        if let Some(set) = self.workflow_runs.get_mut(&run.workflow_run_id) {
            set.remove(&run_id);
        }
        self.persist_status(run_id, status, message);
        info!(
            "实例 {run_id} 到达终态 {}: {message}",
            status.as_str()
        );
        if run.workflow_run_id != 0 {
            let forwarded = SchedulerMessage::JobCompleted {
                run_id,
                workflow_run_id: run.workflow_run_id,
                status,
                message: message.to_string(),
                worker_address: run.worker_address.unwrap_or_default(),
            };
            if self.workflow_tx.send(forwarded).is_err() {
                warn!("工作流编排器信道已关闭");
            }
        }
    }

    async fn handle_cancel_job(&mut self, run_id: i64, reason: &str) {
        enum Action {
            CancelWaiting,
            CancelRunningSplit,
            ForwardToWorker(String),
            Ignore,
        }
        let action = match self.runs.get(&run_id) {
            None => Action::Ignore,
            Some(run) if run.status == JobStatus::Waiting => Action::CancelWaiting,
            Some(run) if run.status == JobStatus::Running => match &run.worker_address {
                Some(address) => Action::ForwardToWorker(address.clone()),
                None => Action::CancelRunningSplit,
            },
            // 终态取消是幂等的空操作
            Some(_) => Action::Ignore,
        };
        match action {
            Action::CancelWaiting | Action::CancelRunningSplit => {
                self.finish_run(run_id, JobStatus::Cancelled, reason).await;
            }
            Action::ForwardToWorker(address) => {
                // 尽力转发，实例保持RUNNING直到工作节点确认
                let gateway = self.gateway.clone();
                let reason = reason.to_string();
                tokio::spawn(async move {
                    if let Err(e) = gateway
                        .send(
                            &address,
                            ExecutorMessage::CancelJob {
                                run_id,
                                reason,
                            },
                        )
                        .await
                    {
                        warn!("取消指令投递到 {address} 失败: {e}");
                    }
                });
            }
            Action::Ignore => {
                debug!("取消请求对实例 {run_id} 无效（不存在或已终态）");
            }
        }
    }

    async fn handle_cancel_workflow(&mut self, workflow_run_id: i64, reason: &str) {
        let ids: Vec<i64> = self
            .workflow_runs
            .get(&workflow_run_id)
            .map(|s| s.iter().copied().collect())
            .unwrap_or_default();
        info!(
            "取消工作流 {workflow_run_id} 的 {} 个本地实例: {reason}",
            ids.len()
        );
        for run_id in ids {
            self.handle_cancel_job(run_id, reason).await;
        }
        let forwarded = SchedulerMessage::CancelWorkflow {
            workflow_run_id,
            reason: reason.to_string(),
        };
        if self.workflow_tx.send(forwarded).is_err() {
            warn!("工作流编排器信道已关闭");
        }
    }

    // ---- 注册、新建与定义刷新 ----

    fn handle_register(
        &mut self,
        run_id: i64,
        trigger_time: i64,
        priority: i32,
        run: Option<JobRunInfo>,
    ) {
        match run {
            Some(run) => {
                let bucket_id = run.bucket_id;
                if self.owned_buckets.contains(&bucket_id) {
                    self.adopt_run(run);
                } else if let Some(peer) = self.peers.get(&bucket_id) {
                    debug!("实例 {run_id} 属于分桶 {bucket_id}，转发给对端");
                    let forwarded = SchedulerMessage::RegisterJob {
                        run_id,
                        job_id: run.job_id,
                        trigger_time,
                        priority,
                        run: Some(run),
                    };
                    if peer.send(forwarded).is_err() {
                        warn!("对端信道已关闭，实例 {run_id} 丢弃，等待属主加载");
                    }
                } else {
                    // 实例已持久化，真正的属主会在补载时收编它
                    debug!("分桶 {bucket_id} 未持有且无路由，实例 {run_id} 不收编");
                }
            }
            None => {
                // 触发内存中已有的实例
                if let Some(existing) = self.runs.get_mut(&run_id) {
                    if existing.status == JobStatus::Waiting {
                        existing.trigger_time = trigger_time;
                        self.queue.push(run_id, trigger_time, priority);
                    }
                } else {
                    debug!("注册的实例 {run_id} 不在内存中，等待加载");
                }
            }
        }
    }

    fn handle_new_jobs(&mut self, runs: Vec<JobRunInfo>, edges: Vec<(i64, i64)>, max_id: i64) {
        self.last_max_id = self.last_max_id.max(max_id);
        let (workflow_members, standalone): (Vec<JobRunInfo>, Vec<JobRunInfo>) =
            runs.into_iter().partition(|r| r.workflow_run_id != 0);
        for run in standalone {
            self.adopt_run(run);
        }
        if !workflow_members.is_empty() {
            // 工作流成员先交编排器做DAG校验和依赖门控
            let forwarded = SchedulerMessage::NewJobsCreated {
                runs: workflow_members,
                edges,
                max_id,
            };
            if self.workflow_tx.send(forwarded).is_err() {
                warn!("工作流编排器信道已关闭，批次丢弃");
            }
        }
    }

    fn handle_refresh(&mut self, job_id: i64, op: RefreshOp) {
        let affected: Vec<JobRunInfo> = self
            .runs
            .values()
            .filter(|r| r.job_id == job_id && r.status == JobStatus::Waiting)
            .cloned()
            .collect();
        match op {
            RefreshOp::Delete => {
                info!(
                    "任务 {job_id} 定义已删除，取消 {} 个待触发实例",
                    affected.len()
                );
                let tx = self.tx.clone();
                for run in affected {
                    // 走标准取消路径，保持单点状态变更
                    let _ = tx.send(SchedulerMessage::CancelJob {
                        run_id: run.run_id,
                        reason: "任务定义已删除".to_string(),
                    });
                }
            }
            RefreshOp::Update => {
                if affected.is_empty() {
                    return;
                }
                let store = self.store.clone();
                let tx = self.tx.clone();
                tokio::spawn(async move {
                    match store.load_definition(job_id).await {
                        Ok(Some(definition)) => {
                            for mut run in affected {
                                run.refresh_from(&definition);
                                let _ = tx.send(SchedulerMessage::RegisterJob {
                                    run_id: run.run_id,
                                    job_id,
                                    trigger_time: run.trigger_time,
                                    priority: run.priority,
                                    run: Some(run),
                                });
                            }
                        }
                        Ok(None) => {
                            warn!("刷新任务 {job_id} 时定义已不存在");
                        }
                        Err(e) => {
                            warn!("刷新任务 {job_id} 定义失败: {e}");
                        }
                    }
                });
            }
        }
    }

    // ---- 分桶事件 ----

    /// 硬停止：立刻清除该桶的全部本地状态
    fn handle_bucket_lost(&mut self, bucket_id: i32) {
        self.owned_buckets.remove(&bucket_id);
        let Some(ids) = self.bucket_runs.remove(&bucket_id) else {
            return;
        };
        let count = ids.len();
        for run_id in ids {
            self.disarm_watchdog(run_id);
            self.splits.forget(run_id);
            if let Some(run) = self.runs.remove(&run_id) {
                if let Some(set) = self.running_by_job.get_mut(&run.job_id) {
                    set.remove(&run_id);
                }
                if let Some(set) = self.workflow_runs.get_mut(&run.workflow_run_id) {
                    set.remove(&run_id);
                }
                if run.workflow_run_id != 0 {
                    // 成员随分桶移交后不再有完成消息回流，按失败上报让编排器收尾
                    let notice = SchedulerMessage::JobCompleted {
                        run_id,
                        workflow_run_id: run.workflow_run_id,
                        status: JobStatus::Failed,
                        message: "分桶所有权丢失".to_string(),
                        worker_address: String::new(),
                    };
                    if self.workflow_tx.send(notice).is_err() {
                        warn!("工作流编排器信道已关闭");
                    }
                }
            }
        }
        warn!("分桶 {bucket_id} 所有权丢失，清除 {count} 个本地实例");
    }

    /// 状态回写入队即返回，落库失败只记日志不阻塞消息循环
    fn persist_status(&self, run_id: i64, status: JobStatus, message: &str) {
        if self
            .persist_tx
            .send((run_id, status, message.to_string()))
            .is_err()
        {
            warn!("状态回写信道已关闭，实例 {run_id} 的 {} 未落库", status.as_str());
        }
    }
}
