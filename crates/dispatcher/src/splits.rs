//! 分片执行跟踪
//!
//! 一个带分片定义的实例扇出为互不重叠的 [start, end) 子区间，
//! 每个分片独立重试。归约按区间键聚合，与完成消息的到达顺序无关：
//! 全部成功则父实例成功，任何分片耗尽重试则父实例失败。

use std::collections::HashMap;

use tracing::{debug, warn};

use jobflow_domain::entities::{JobRunInfo, JobStatus};

#[derive(Debug, Clone)]
struct SplitState {
    status: JobStatus,
    retry_count: i32,
    message: String,
}

#[derive(Debug)]
struct SplitProgress {
    states: HashMap<(i64, i64), SplitState>,
}

/// 分片完成记录的处理结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    /// 未知实例或未知区间，忽略
    Ignored,
    /// 该分片需要重试
    Retry {
        split_start: i64,
        split_end: i64,
        retry_count: i32,
        backoff_ms: u64,
    },
    /// 还有分片未到终态
    Pending,
    /// 所有分片到达终态，父实例结果确定
    Resolved { status: JobStatus, message: String },
}

pub struct SplitTracker {
    active: HashMap<i64, SplitProgress>,
    max_split_retry: i32,
    backoff_ms: u64,
    backoff_max_ms: u64,
}

impl SplitTracker {
    pub fn new(max_split_retry: i32, backoff_ms: u64, backoff_max_ms: u64) -> Self {
        Self {
            active: HashMap::new(),
            max_split_retry,
            backoff_ms,
            backoff_max_ms,
        }
    }

    /// 开始跟踪一个实例的分片，返回扇出的区间列表
    pub fn begin(&mut self, run: &JobRunInfo) -> Vec<(i64, i64)> {
        let Some(spec) = run.split_spec else {
            return Vec::new();
        };
        let chunks = spec.chunks();
        if chunks.is_empty() {
            warn!("实例 {} 的分片定义无效: {spec:?}", run.run_id);
            return Vec::new();
        }
        let states = chunks
            .iter()
            .map(|&range| {
                (
                    range,
                    SplitState {
                        status: JobStatus::Running,
                        retry_count: 0,
                        message: String::new(),
                    },
                )
            })
            .collect();
        self.active.insert(run.run_id, SplitProgress { states });
        chunks
    }

    pub fn is_tracking(&self, run_id: i64) -> bool {
        self.active.contains_key(&run_id)
    }

    /// 记录一个分片的完成，必要时给出重试或父实例结果
    pub fn record(
        &mut self,
        run_id: i64,
        split_start: i64,
        split_end: i64,
        status: JobStatus,
        message: &str,
    ) -> SplitOutcome {
        let Some(progress) = self.active.get_mut(&run_id) else {
            debug!("收到未跟踪实例 {run_id} 的分片完成，忽略");
            return SplitOutcome::Ignored;
        };
        let Some(state) = progress.states.get_mut(&(split_start, split_end)) else {
            warn!("实例 {run_id} 收到未知分片区间 [{split_start}, {split_end})，忽略");
            return SplitOutcome::Ignored;
        };
        if state.status.is_terminal() {
            // 迟到的重复完成
            return SplitOutcome::Ignored;
        }

        match status {
            JobStatus::Failed if state.retry_count < self.max_split_retry => {
                state.retry_count += 1;
                state.message = message.to_string();
                let shift = (state.retry_count - 1).clamp(0, 20) as u32;
                let backoff_ms = self
                    .backoff_ms
                    .saturating_mul(1u64 << shift)
                    .min(self.backoff_max_ms);
                return SplitOutcome::Retry {
                    split_start,
                    split_end,
                    retry_count: state.retry_count,
                    backoff_ms,
                };
            }
            _ => {
                state.status = status;
                state.message = message.to_string();
            }
        }

        if progress.states.values().any(|s| !s.status.is_terminal()) {
            return SplitOutcome::Pending;
        }

        // 所有分片到终态：顺序无关的合取归约
        let failed: Vec<String> = progress
            .states
            .iter()
            .filter(|(_, s)| s.status != JobStatus::Success)
            .map(|(range, s)| format!("[{}, {}): {}", range.0, range.1, s.message))
            .collect();
        self.active.remove(&run_id);
        if failed.is_empty() {
            SplitOutcome::Resolved {
                status: JobStatus::Success,
                message: String::new(),
            }
        } else {
            SplitOutcome::Resolved {
                status: JobStatus::Failed,
                message: format!("分片失败: {}", failed.join("; ")),
            }
        }
    }

    /// 实例被取消或分桶丢失时停止跟踪
    pub fn forget(&mut self, run_id: i64) {
        self.active.remove(&run_id);
    }

    /// 分片重试的目标区间校验：实例仍在跟踪且区间存在
    pub fn has_range(&self, run_id: i64, split_start: i64, split_end: i64) -> bool {
        self.active
            .get(&run_id)
            .map(|p| p.states.contains_key(&(split_start, split_end)))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_domain::entities::{BlockStrategy, RouteStrategy, SplitSpec};

    fn split_run(run_id: i64) -> JobRunInfo {
        JobRunInfo {
            run_id,
            job_id: 1,
            workflow_run_id: 0,
            bucket_id: 0,
            namespace_id: 1,
            job_name: "split".to_string(),
            job_type: "echo".to_string(),
            params: String::new(),
            route_strategy: RouteStrategy::Split,
            block_strategy: BlockStrategy::Parallel,
            timeout_seconds: 60,
            max_retry_times: 0,
            retry_count: 0,
            retry_interval_seconds: 0,
            priority: 0,
            trigger_time: 0,
            status: JobStatus::Running,
            split_spec: Some(SplitSpec {
                start: 0,
                end: 30,
                chunk: 10,
            }),
            worker_address: None,
            parent_run_ids: Vec::new(),
        }
    }

    #[test]
    fn all_success_resolves_success_in_any_order() {
        // 两种到达顺序必须得到相同的结果
        for order in [vec![(0, 10), (10, 20), (20, 30)], vec![(20, 30), (0, 10), (10, 20)]] {
            let mut tracker = SplitTracker::new(3, 100, 1000);
            let chunks = tracker.begin(&split_run(1));
            assert_eq!(chunks.len(), 3);
            let mut last = SplitOutcome::Pending;
            for (s, e) in order {
                last = tracker.record(1, s, e, JobStatus::Success, "");
            }
            assert_eq!(
                last,
                SplitOutcome::Resolved {
                    status: JobStatus::Success,
                    message: String::new()
                }
            );
        }
    }

    #[test]
    fn failed_split_retries_with_growing_backoff() {
        let mut tracker = SplitTracker::new(2, 100, 1000);
        tracker.begin(&split_run(1));
        let first = tracker.record(1, 0, 10, JobStatus::Failed, "瞬时错误");
        match first {
            SplitOutcome::Retry {
                retry_count,
                backoff_ms,
                ..
            } => {
                assert_eq!(retry_count, 1);
                assert_eq!(backoff_ms, 100);
            }
            other => panic!("预期重试，实际: {other:?}"),
        }
        let second = tracker.record(1, 0, 10, JobStatus::Failed, "瞬时错误");
        match second {
            SplitOutcome::Retry {
                retry_count,
                backoff_ms,
                ..
            } => {
                assert_eq!(retry_count, 2);
                assert_eq!(backoff_ms, 200);
            }
            other => panic!("预期重试，实际: {other:?}"),
        }
    }

    #[test]
    fn exhausted_split_fails_parent() {
        let mut tracker = SplitTracker::new(0, 100, 1000);
        tracker.begin(&split_run(1));
        assert_eq!(
            tracker.record(1, 0, 10, JobStatus::Success, ""),
            SplitOutcome::Pending
        );
        assert_eq!(
            tracker.record(1, 10, 20, JobStatus::Success, ""),
            SplitOutcome::Pending
        );
        match tracker.record(1, 20, 30, JobStatus::Failed, "数据缺失") {
            SplitOutcome::Resolved { status, message } => {
                assert_eq!(status, JobStatus::Failed);
                assert!(message.contains("[20, 30)"));
                assert!(message.contains("数据缺失"));
            }
            other => panic!("预期归约完成，实际: {other:?}"),
        }
        assert!(!tracker.is_tracking(1));
    }

    #[test]
    fn unknown_range_and_run_ignored() {
        let mut tracker = SplitTracker::new(3, 100, 1000);
        tracker.begin(&split_run(1));
        assert_eq!(
            tracker.record(1, 5, 7, JobStatus::Success, ""),
            SplitOutcome::Ignored
        );
        assert_eq!(
            tracker.record(99, 0, 10, JobStatus::Success, ""),
            SplitOutcome::Ignored
        );
    }

    #[test]
    fn backoff_is_capped() {
        let mut tracker = SplitTracker::new(20, 100, 1000);
        tracker.begin(&split_run(1));
        let mut backoff = 0;
        for _ in 0..8 {
            if let SplitOutcome::Retry { backoff_ms, .. } =
                tracker.record(1, 0, 10, JobStatus::Failed, "e")
            {
                backoff = backoff_ms;
            }
        }
        assert_eq!(backoff, 1000);
    }
}
